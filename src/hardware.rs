//! Hardware profiles and the compatibility matcher.
//!
//! A [`HardwareProfile`] describes both what a test *requires* and what an
//! environment *offers*. Every optional dimension carries an explicit
//! [`Requirement::Any`] sentinel instead of relying on absence, so a profile
//! deserialized from TOML or JSON never matches ambiguously.
//!
//! # Matching Rules
//!
//! | Field | Rule |
//! |-------|------|
//! | `architecture` | Must be equal |
//! | `memory_mb` | Capability must be >= requirement |
//! | `peripherals` | Requirement must be a subset of capability |
//! | `virtualization` | Must be equal unless the requirement is `any` |
//! | `cpu_model` / `storage` | Must be equal unless the requirement is `any` |
//! | `emulator` | Preference only, used when selecting a template |
//!
//! # Example
//!
//! ```
//! use kdispatch::hardware::{Architecture, HardwareProfile, Virtualization, matches};
//!
//! let requirement = HardwareProfile::new(Architecture::Aarch64, 512)
//!     .with_peripheral("uart0");
//! let capability = HardwareProfile::new(Architecture::Aarch64, 2048)
//!     .with_peripheral("uart0")
//!     .with_peripheral("eth0")
//!     .with_virtualization(Virtualization::Virtual);
//!
//! assert!(matches(&requirement, &capability));
//! ```

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// CPU architecture of a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    X86_64,
    I686,
    Aarch64,
    Arm,
    Riscv64,
    Mips,
    Powerpc64,
    /// Any other architecture, compared by name.
    #[serde(untagged)]
    Other(String),
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Architecture::X86_64 => "x86_64",
            Architecture::I686 => "i686",
            Architecture::Aarch64 => "aarch64",
            Architecture::Arm => "arm",
            Architecture::Riscv64 => "riscv64",
            Architecture::Mips => "mips",
            Architecture::Powerpc64 => "powerpc64",
            Architecture::Other(name) => name,
        };
        f.write_str(name)
    }
}

/// Storage backing of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Ram,
    Virtio,
    Sata,
    Nvme,
    Emmc,
    Sd,
    Nand,
}

/// Whether a target must be virtualized, physical, or either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Virtualization {
    /// No preference. Only meaningful on a requirement.
    #[default]
    Any,
    Virtual,
    Physical,
}

/// A value that is either unconstrained or pinned to one option.
///
/// Serialized as the string `"any"` or as the bare value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Requirement<T> {
    #[default]
    Any,
    Exactly(T),
}

impl<T: PartialEq> Requirement<T> {
    /// Returns `true` if `offered` satisfies this requirement.
    ///
    /// An `Any` capability does not satisfy a pinned requirement: the
    /// environment has to state what it is.
    pub fn is_satisfied_by(&self, offered: &Requirement<T>) -> bool {
        match (self, offered) {
            (Requirement::Any, _) => true,
            (Requirement::Exactly(want), Requirement::Exactly(have)) => want == have,
            (Requirement::Exactly(_), Requirement::Any) => false,
        }
    }

    /// Returns the pinned value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Requirement::Any => None,
            Requirement::Exactly(v) => Some(v),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum AnyKeyword {
    Any,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RequirementRepr<T> {
    Keyword(AnyKeyword),
    Value(T),
}

impl<T: Serialize> Serialize for Requirement<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Requirement::Any => serializer.serialize_str("any"),
            Requirement::Exactly(value) => value.serialize(serializer),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Requirement<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RequirementRepr::<T>::deserialize(deserializer)? {
            RequirementRepr::Keyword(AnyKeyword::Any) => Requirement::Any,
            RequirementRepr::Value(value) => Requirement::Exactly(value),
        })
    }
}

/// Hardware description used both as a test requirement and an
/// environment capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub architecture: Architecture,

    #[serde(default)]
    pub cpu_model: Requirement<String>,

    /// Memory in MB. Minimum on a requirement, amount on a capability.
    pub memory_mb: u64,

    #[serde(default)]
    pub storage: Requirement<StorageType>,

    #[serde(default)]
    pub peripherals: BTreeSet<String>,

    #[serde(default)]
    pub virtualization: Virtualization,

    /// Preferred emulator (e.g. `qemu-system-aarch64`, `renode`).
    #[serde(default)]
    pub emulator: Requirement<String>,
}

impl HardwareProfile {
    /// Creates a profile with only architecture and memory pinned.
    pub fn new(architecture: Architecture, memory_mb: u64) -> Self {
        Self {
            architecture,
            cpu_model: Requirement::Any,
            memory_mb,
            storage: Requirement::Any,
            peripherals: BTreeSet::new(),
            virtualization: Virtualization::Any,
            emulator: Requirement::Any,
        }
    }

    pub fn with_cpu_model(mut self, model: impl Into<String>) -> Self {
        self.cpu_model = Requirement::Exactly(model.into());
        self
    }

    pub fn with_storage(mut self, storage: StorageType) -> Self {
        self.storage = Requirement::Exactly(storage);
        self
    }

    pub fn with_peripheral(mut self, peripheral: impl Into<String>) -> Self {
        self.peripherals.insert(peripheral.into());
        self
    }

    pub fn with_virtualization(mut self, virtualization: Virtualization) -> Self {
        self.virtualization = virtualization;
        self
    }

    pub fn with_emulator(mut self, emulator: impl Into<String>) -> Self {
        self.emulator = Requirement::Exactly(emulator.into());
        self
    }
}

/// Decides whether `capability` satisfies `requirement`.
///
/// Pure, deterministic and total.
pub fn matches(requirement: &HardwareProfile, capability: &HardwareProfile) -> bool {
    requirement.architecture == capability.architecture
        && capability.memory_mb >= requirement.memory_mb
        && requirement.peripherals.is_subset(&capability.peripherals)
        && virtualization_matches(requirement.virtualization, capability.virtualization)
        && requirement.cpu_model.is_satisfied_by(&capability.cpu_model)
        && requirement.storage.is_satisfied_by(&capability.storage)
}

fn virtualization_matches(required: Virtualization, offered: Virtualization) -> bool {
    required == Virtualization::Any || required == offered
}

/// A named environment descriptor from the pool catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentTemplate {
    /// Template name, referenced by a plan's `environment_preference`.
    pub name: String,

    /// Number of environments provisioned from this template at startup.
    #[serde(default)]
    pub prewarm: usize,

    /// The capability every environment built from this template offers.
    pub profile: HardwareProfile,
}

/// Picks the catalog template to provision for `requirement`.
///
/// Among matching templates the order of preference is: the template named
/// by `preference`, then a template running the requested emulator, then
/// the one with the least memory (tightest fit), then catalog order.
pub fn select_template<'a>(
    requirement: &HardwareProfile,
    catalog: &'a [EnvironmentTemplate],
    preference: Option<&str>,
) -> Option<&'a EnvironmentTemplate> {
    catalog
        .iter()
        .enumerate()
        .filter(|(_, t)| matches(requirement, &t.profile))
        .min_by_key(|(idx, t)| {
            let preferred = preference.is_some_and(|p| p == t.name);
            let emulator = requirement
                .emulator
                .value()
                .is_some_and(|e| t.profile.emulator.value() == Some(e));
            (!preferred, !emulator, t.profile.memory_mb, *idx)
        })
        .map(|(_, t)| t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qemu_arm64() -> HardwareProfile {
        HardwareProfile::new(Architecture::Aarch64, 2048)
            .with_cpu_model("cortex-a57")
            .with_storage(StorageType::Virtio)
            .with_peripheral("uart0")
            .with_peripheral("virtio-net")
            .with_virtualization(Virtualization::Virtual)
            .with_emulator("qemu-system-aarch64")
    }

    #[test]
    fn test_architecture_must_match() {
        let req = HardwareProfile::new(Architecture::X86_64, 128);
        assert!(!matches(&req, &qemu_arm64()));
    }

    #[test]
    fn test_memory_is_a_minimum() {
        let cap = qemu_arm64();
        assert!(matches(&HardwareProfile::new(Architecture::Aarch64, 2048), &cap));
        assert!(matches(&HardwareProfile::new(Architecture::Aarch64, 1), &cap));
        assert!(!matches(&HardwareProfile::new(Architecture::Aarch64, 4096), &cap));
    }

    #[test]
    fn test_peripherals_subset() {
        let cap = qemu_arm64();
        let ok = HardwareProfile::new(Architecture::Aarch64, 512).with_peripheral("uart0");
        let missing = ok.clone().with_peripheral("can0");
        assert!(matches(&ok, &cap));
        assert!(!matches(&missing, &cap));
    }

    #[test]
    fn test_virtualization_any_is_explicit() {
        let cap = qemu_arm64();
        let any = HardwareProfile::new(Architecture::Aarch64, 512);
        let physical = any.clone().with_virtualization(Virtualization::Physical);
        let virt = any.clone().with_virtualization(Virtualization::Virtual);
        assert!(matches(&any, &cap));
        assert!(matches(&virt, &cap));
        assert!(!matches(&physical, &cap));
    }

    #[test]
    fn test_pinned_requirement_needs_pinned_capability() {
        let cap = HardwareProfile::new(Architecture::Aarch64, 512);
        let req = HardwareProfile::new(Architecture::Aarch64, 512).with_cpu_model("cortex-a53");
        assert!(!matches(&req, &cap));
        assert!(matches(&cap, &cap));
    }

    #[test]
    fn test_emulator_is_not_a_filter() {
        let req = HardwareProfile::new(Architecture::Aarch64, 512).with_emulator("renode");
        assert!(matches(&req, &qemu_arm64()));
    }

    #[test]
    fn test_profile_from_toml() {
        let profile: HardwareProfile = toml::from_str(
            r#"
            architecture = "riscv64"
            memory_mb = 1024
            cpu_model = "any"
            storage = "virtio"
            peripherals = ["uart0"]
            virtualization = "virtual"
            "#,
        )
        .unwrap();
        assert_eq!(profile.architecture, Architecture::Riscv64);
        assert_eq!(profile.cpu_model, Requirement::Any);
        assert_eq!(profile.storage, Requirement::Exactly(StorageType::Virtio));
        assert_eq!(profile.emulator, Requirement::Any);
    }

    #[test]
    fn test_unknown_architecture_round_trips_by_name() {
        let arch: Architecture = serde_json::from_str("\"loongarch64\"").unwrap();
        assert_eq!(arch, Architecture::Other("loongarch64".to_string()));
        assert_eq!(arch.to_string(), "loongarch64");
    }

    #[test]
    fn test_select_template_preference_order() {
        let small = EnvironmentTemplate {
            name: "small".into(),
            prewarm: 0,
            profile: HardwareProfile::new(Architecture::Aarch64, 1024),
        };
        let big = EnvironmentTemplate {
            name: "big".into(),
            prewarm: 0,
            profile: HardwareProfile::new(Architecture::Aarch64, 8192).with_emulator("renode"),
        };
        let catalog = vec![big.clone(), small.clone()];
        let req = HardwareProfile::new(Architecture::Aarch64, 512);

        assert_eq!(select_template(&req, &catalog, None).unwrap().name, "small");
        assert_eq!(select_template(&req, &catalog, Some("big")).unwrap().name, "big");

        let wants_renode = req.clone().with_emulator("renode");
        assert_eq!(select_template(&wants_renode, &catalog, None).unwrap().name, "big");

        let x86 = HardwareProfile::new(Architecture::X86_64, 512);
        assert!(select_template(&x86, &catalog, None).is_none());
    }
}
