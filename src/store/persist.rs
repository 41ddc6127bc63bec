//! Durable storage for plans, records, test cases and environments.
//!
//! The scheduler only needs keyed put/delete/load-all of JSON documents, so
//! [`Persistence`] is deliberately narrow. Two implementations ship:
//!
//! | Backend | Durability | Use Case |
//! |---------|------------|----------|
//! | [`MemoryPersistence`] | Process lifetime (clones share state) | Tests, dry runs |
//! | [`JsonDirPersistence`] | One file per entity under a directory | Default service mode |
//!
//! # On-Disk Layout
//!
//! ```text
//! {root}/
//! ├── plans/{id}.json
//! ├── cases/{id}.json
//! ├── records/{id}.json
//! └── environments/{id}.json
//! ```
//!
//! Ids may contain `/` (record ids do); file names escape it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::StoreError;

/// Kind of persisted entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Plan,
    TestCase,
    Record,
    Environment,
}

impl EntityKind {
    fn dir_name(&self) -> &'static str {
        match self {
            EntityKind::Plan => "plans",
            EntityKind::TestCase => "cases",
            EntityKind::Record => "records",
            EntityKind::Environment => "environments",
        }
    }
}

/// Keyed JSON document storage.
///
/// Implementations must be safe to call from multiple tasks; writes to
/// different keys must not block each other for long.
pub trait Persistence: Send + Sync {
    /// Inserts or replaces the document stored under `(kind, id)`.
    fn put(&self, kind: EntityKind, id: &str, value: serde_json::Value) -> Result<(), StoreError>;

    /// Removes a document. Removing a missing document is not an error.
    fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError>;

    /// Loads every document of one kind.
    fn load_all(&self, kind: EntityKind) -> Result<Vec<serde_json::Value>, StoreError>;
}

/// Serializes and stores a typed entity.
pub fn put_entity<T: Serialize>(
    persistence: &dyn Persistence,
    kind: EntityKind,
    id: &str,
    entity: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(entity)?;
    persistence.put(kind, id, value)
}

/// Loads and deserializes every entity of one kind.
///
/// Documents that no longer parse are skipped with a warning rather than
/// failing the whole load.
pub fn load_entities<T: DeserializeOwned>(
    persistence: &dyn Persistence,
    kind: EntityKind,
) -> Result<Vec<T>, StoreError> {
    let mut out = Vec::new();
    for value in persistence.load_all(kind)? {
        match serde_json::from_value(value) {
            Ok(entity) => out.push(entity),
            Err(e) => tracing::warn!("Skipping unreadable {} document: {}", kind.dir_name(), e),
        }
    }
    Ok(out)
}

/// In-memory persistence. Clones share the same storage, which lets tests
/// simulate a process restart by building a new store over a clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersistence {
    documents: Arc<Mutex<HashMap<(EntityKind, String), serde_json::Value>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents of one kind.
    pub fn count(&self, kind: EntityKind) -> usize {
        let documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        documents.keys().filter(|(k, _)| *k == kind).count()
    }
}

impl Persistence for MemoryPersistence {
    fn put(&self, kind: EntityKind, id: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        documents.insert((kind, id.to_string()), value);
        Ok(())
    }

    fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        documents.remove(&(kind, id.to_string()));
        Ok(())
    }

    fn load_all(&self, kind: EntityKind) -> Result<Vec<serde_json::Value>, StoreError> {
        let documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
        Ok(documents
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, v)| v.clone())
            .collect())
    }
}

/// Persistence backed by one JSON file per entity.
///
/// Writes go to a temporary file in the same directory and are renamed
/// into place, so a crash never leaves a half-written document.
#[derive(Debug, Clone)]
pub struct JsonDirPersistence {
    root: PathBuf,
}

impl JsonDirPersistence {
    /// Opens (creating if needed) a state directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for kind in [
            EntityKind::Plan,
            EntityKind::TestCase,
            EntityKind::Record,
            EntityKind::Environment,
        ] {
            fs::create_dir_all(root.join(kind.dir_name()))?;
        }
        tracing::debug!("Opened state directory {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, kind: EntityKind, id: &str) -> PathBuf {
        self.root
            .join(kind.dir_name())
            .join(format!("{}.json", escape_id(id)))
    }
}

impl Persistence for JsonDirPersistence {
    fn put(&self, kind: EntityKind, id: &str, value: serde_json::Value) -> Result<(), StoreError> {
        let path = self.path_for(kind, id);
        let dir = path.parent().unwrap_or(&self.root);
        let contents = serde_json::to_vec_pretty(&value)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, &contents)?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(kind, id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_all(&self, kind: EntityKind) -> Result<Vec<serde_json::Value>, StoreError> {
        let dir = self.root.join(kind.dir_name());
        let mut out = Vec::new();
        if !dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            match serde_json::from_str(&contents) {
                Ok(value) => out.push(value),
                Err(e) => tracing::warn!("Failed to parse {}: {}", path.display(), e),
            }
        }
        Ok(out)
    }
}

/// Makes an id safe to use as a file name.
pub(crate) fn escape_id(id: &str) -> String {
    id.chars()
        .map(|c| match c {
            '/' => "%2F".to_string(),
            '\\' => "%5C".to_string(),
            '%' => "%25".to_string(),
            c => c.to_string(),
        })
        .collect()
}
