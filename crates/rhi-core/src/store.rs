//! Hierarchical configuration store.
//!
//! Host install paths, plugin registrations, command registrations and the
//! bundled-package marker all live in a hive/key/value tree. [`ConfigStore`]
//! is the seam; [`JsonStore`] keeps the tree in a JSON file, or only in
//! memory for tests, and on Windows `RegistryStore` reads and writes the
//! system registry. Key paths use `\` separators and compare
//! case-insensitively, as do value names.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

#[cfg(windows)]
mod registry;

#[cfg(windows)]
pub use registry::RegistryStore;

/// Top-level partition of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hive {
    CurrentUser,
    LocalMachine,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Value {name} under {key} is not a {expected}")]
    WrongType {
        key: String,
        name: String,
        expected: &'static str,
    },

    #[error("Store lock poisoned")]
    Lock,
}

/// Read/write access to the configuration tree.
pub trait ConfigStore: Send + Sync {
    fn read_string(&self, hive: Hive, key: &str, name: &str) -> Result<Option<String>, StoreError>;

    fn read_u32(&self, hive: Hive, key: &str, name: &str) -> Result<Option<u32>, StoreError>;

    /// Names of the immediate children of `key`.
    fn subkeys(&self, hive: Hive, key: &str) -> Result<Vec<String>, StoreError>;

    /// Create `key` if needed and set a string value.
    fn write_string(&self, hive: Hive, key: &str, name: &str, value: &str) -> Result<(), StoreError>;

    /// Create `key` if needed and set a 32-bit value.
    fn write_u32(&self, hive: Hive, key: &str, name: &str, value: u32) -> Result<(), StoreError>;

    /// Remove a value. Missing keys and values are not an error.
    fn delete_value(&self, hive: Hive, key: &str, name: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum Value {
    Dword(u32),
    String(String),
}

type Values = BTreeMap<String, Value>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tree {
    #[serde(rename = "HKEY_CURRENT_USER", default)]
    current_user: BTreeMap<String, Values>,
    #[serde(rename = "HKEY_LOCAL_MACHINE", default)]
    local_machine: BTreeMap<String, Values>,
}

impl Tree {
    fn hive(&self, hive: Hive) -> &BTreeMap<String, Values> {
        match hive {
            Hive::CurrentUser => &self.current_user,
            Hive::LocalMachine => &self.local_machine,
        }
    }

    fn hive_mut(&mut self, hive: Hive) -> &mut BTreeMap<String, Values> {
        match hive {
            Hive::CurrentUser => &mut self.current_user,
            Hive::LocalMachine => &mut self.local_machine,
        }
    }

    fn value(&self, hive: Hive, key: &str, name: &str) -> Option<&Value> {
        let key = normalize(key);
        let (_, values) = self
            .hive(hive)
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))?;
        values
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    fn values_mut(&mut self, hive: Hive, key: &str) -> &mut Values {
        let key = normalize(key);
        let map = self.hive_mut(hive);
        let existing = map
            .keys()
            .find(|k| k.eq_ignore_ascii_case(key))
            .cloned()
            .unwrap_or_else(|| key.to_string());
        map.entry(existing).or_default()
    }

    fn set(&mut self, hive: Hive, key: &str, name: &str, value: Value) {
        let values = self.values_mut(hive, key);
        let existing = values
            .keys()
            .find(|n| n.eq_ignore_ascii_case(name))
            .cloned()
            .unwrap_or_else(|| name.to_string());
        values.insert(existing, value);
    }
}

fn normalize(key: &str) -> &str {
    key.trim_matches('\\')
}

/// [`ConfigStore`] persisted as pretty-printed JSON.
#[derive(Debug)]
pub struct JsonStore {
    path: Option<PathBuf>,
    tree: Mutex<Tree>,
}

impl JsonStore {
    /// Open (or start) a file-backed store.
    ///
    /// Every read and every change goes back to the file, so several
    /// processes can share one store as long as they take turns.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let tree = load(path)?;
        tracing::debug!("Configuration store at {}", path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            tree: Mutex::new(tree),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            tree: Mutex::new(Tree::default()),
        }
    }

    /// Lock the tree, refreshed from the file when there is one.
    fn lock(&self) -> Result<MutexGuard<'_, Tree>, StoreError> {
        let mut tree = self.tree.lock().map_err(|_| StoreError::Lock)?;
        if let Some(path) = &self.path {
            *tree = load(path)?;
        }
        Ok(tree)
    }

    fn persist(&self, tree: &Tree) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(tree).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        let mut staging = path.as_os_str().to_owned();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);
        std::fs::write(&staging, text)?;
        std::fs::rename(&staging, path)?;
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut Tree)) -> Result<(), StoreError> {
        let mut tree = self.lock()?;
        f(&mut tree);
        self.persist(&tree)
    }
}

fn load(path: &Path) -> Result<Tree, StoreError> {
    if !path.is_file() {
        return Ok(Tree::default());
    }
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

impl ConfigStore for JsonStore {
    fn read_string(&self, hive: Hive, key: &str, name: &str) -> Result<Option<String>, StoreError> {
        let tree = self.lock()?;
        match tree.value(hive, key, name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Dword(_)) => Err(StoreError::WrongType {
                key: key.to_string(),
                name: name.to_string(),
                expected: "string",
            }),
        }
    }

    fn read_u32(&self, hive: Hive, key: &str, name: &str) -> Result<Option<u32>, StoreError> {
        let tree = self.lock()?;
        match tree.value(hive, key, name) {
            None => Ok(None),
            Some(Value::Dword(v)) => Ok(Some(*v)),
            Some(Value::String(_)) => Err(StoreError::WrongType {
                key: key.to_string(),
                name: name.to_string(),
                expected: "32-bit value",
            }),
        }
    }

    fn subkeys(&self, hive: Hive, key: &str) -> Result<Vec<String>, StoreError> {
        let tree = self.lock()?;
        let prefix = format!("{}\\", normalize(key).to_ascii_lowercase());
        let mut children: Vec<String> = Vec::new();
        for path in tree.hive(hive).keys() {
            let lower = path.to_ascii_lowercase();
            if !lower.starts_with(&prefix) {
                continue;
            }
            let Some(child) = path[prefix.len()..].split('\\').next() else {
                continue;
            };
            if !child.is_empty() && !children.iter().any(|c| c.eq_ignore_ascii_case(child)) {
                children.push(child.to_string());
            }
        }
        Ok(children)
    }

    fn write_string(&self, hive: Hive, key: &str, name: &str, value: &str) -> Result<(), StoreError> {
        self.update(|tree| tree.set(hive, key, name, Value::String(value.to_string())))
    }

    fn write_u32(&self, hive: Hive, key: &str, name: &str, value: u32) -> Result<(), StoreError> {
        self.update(|tree| tree.set(hive, key, name, Value::Dword(value)))
    }

    fn delete_value(&self, hive: Hive, key: &str, name: &str) -> Result<(), StoreError> {
        self.update(|tree| {
            let values = tree.values_mut(hive, key);
            values.retain(|n, _| !n.eq_ignore_ascii_case(name));
        })
    }
}
