//! Configuration loading and schema definitions for kdispatch.
//!
//! This module provides types and functions for loading kdispatch
//! configuration from TOML files or strings. The configuration file format
//! is described in the README.

pub mod schema;

pub use schema::*;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::model::TestCase;
use crate::store::PlanSubmission;

/// Loads kdispatch configuration from a TOML file and validates it.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the schema or fails [`validate`]
///
/// # Example
///
/// ```no_run
/// use kdispatch::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("kdispatch.toml"))?;
/// println!("Max concurrent: {}", config.dispatch.max_concurrent);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    validate(&config).with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}

/// Loads kdispatch configuration from a TOML string.
///
/// # Example
///
/// ```
/// use kdispatch::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [dispatch]
///     max_concurrent = 2
///
///     [provider]
///     type = "local"
/// "#)?;
///
/// assert_eq!(config.dispatch.max_concurrent, 2);
/// assert_eq!(config.effective_parallelism(), 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;
    validate(&config)?;
    Ok(config)
}

/// Checks constraints the schema cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.dispatch.max_concurrent == 0 {
        bail!("dispatch.max_concurrent must be at least 1");
    }
    if config.pool.max_environments == 0 {
        bail!("pool.max_environments must be at least 1");
    }
    if config.dispatch.poll_interval_ms == 0 {
        bail!("dispatch.poll_interval_ms must be at least 1");
    }

    let mut names = HashSet::new();
    for template in &config.pool.catalog {
        if template.name.trim().is_empty() {
            bail!("pool.catalog entries need a name");
        }
        if !names.insert(template.name.as_str()) {
            bail!("pool.catalog lists template '{}' twice", template.name);
        }
    }

    let prewarm: usize = config.pool.catalog.iter().map(|t| t.prewarm).sum();
    if prewarm > config.pool.max_environments {
        bail!(
            "pool.catalog prewarms {} environments but pool.max_environments is {}",
            prewarm,
            config.pool.max_environments
        );
    }

    if let ProviderConfig::Command(cmd) = &config.provider {
        for (field, template) in [
            ("create_command", &cmd.create_command),
            ("exec_command", &cmd.exec_command),
            ("destroy_command", &cmd.destroy_command),
        ] {
            if template.trim().is_empty() {
                bail!("provider.{} must not be empty", field);
            }
        }
        if !cmd.exec_command.contains("{command}") {
            bail!("provider.exec_command must contain the {{command}} placeholder");
        }
    }

    Ok(())
}

impl StoreConfig {
    /// Resolved state directory, or `None` for the memory store.
    pub fn resolved_path(&self) -> Result<Option<PathBuf>> {
        match self {
            StoreConfig::Memory => Ok(None),
            StoreConfig::Json { path } => {
                let expanded = shellexpand::full(path)
                    .with_context(|| format!("Failed to expand store path: {}", path))?;
                Ok(Some(PathBuf::from(expanded.as_ref())))
            }
        }
    }
}

/// Reads a [`PlanFile`] and turns it into a submission.
///
/// `script_file` entries are read relative to the plan file's directory.
pub fn load_plan(path: &Path) -> Result<PlanSubmission> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file: {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_plan(&content, base)
        .with_context(|| format!("Invalid plan file: {}", path.display()))
}

fn parse_plan(content: &str, base: &Path) -> Result<PlanSubmission> {
    let file: PlanFile = toml::from_str(content).context("Failed to parse plan")?;
    if file.test_cases.is_empty() {
        bail!("plan '{}' has no [[test_case]] entries", file.id);
    }

    let mut cases = Vec::with_capacity(file.test_cases.len());
    for tc in file.test_cases {
        let script = match (tc.script, &tc.script_file) {
            (Some(script), None) => script,
            (None, Some(script_file)) => {
                let script_path = base.join(script_file);
                std::fs::read_to_string(&script_path).with_context(|| {
                    format!("Failed to read script file: {}", script_path.display())
                })?
            }
            _ => bail!(
                "test case '{}' needs exactly one of script and script_file",
                tc.id
            ),
        };
        cases.push(TestCase {
            name: tc.name.unwrap_or_else(|| tc.id.clone()),
            id: tc.id,
            test_type: tc.test_type,
            target_subsystem: tc.target_subsystem,
            script,
            hardware: tc.hardware,
            estimated_duration_secs: tc.estimated_duration_secs,
            metadata: Default::default(),
        });
    }

    let mut submission = PlanSubmission::new(file.id, cases, file.priority).with_config(file.config);
    if let Some(name) = file.name {
        submission = submission.with_name(name);
    }
    if let Some(who) = file.created_by {
        submission = submission.with_created_by(who);
    }
    if !file.auto_start {
        submission = submission.held();
    }
    Ok(submission)
}
