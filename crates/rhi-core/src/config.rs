//! Engine configuration.
//!
//! Loaded from a TOML file named by `--config` or `$RHIEXEC_CONFIG`; every
//! field has a default so an absent file is equivalent to an empty one.
//!
//! ```toml
//! keep_versions = 2
//! store_path = "/var/lib/rhiexec/registry.json"
//!
//! [layout]
//! roaming = "/home/me/.rhino/roaming"
//! local = "/home/me/.rhino/local"
//! all_users = "/opt/rhino"
//!
//! [probe]
//! timeout_secs = 600
//! x64 = "/opt/rhiexec/bin/rhiexec"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::layout::{self, Layout};
#[cfg(windows)]
use crate::store::RegistryStore;
use crate::store::{ConfigStore, JsonStore, StoreError};

const STORE_FILE: &str = "registry.json";

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "RHIEXEC_CONFIG";

/// Errors raised while loading configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Everything the engine needs to know about its surroundings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub layout: Layout,
    /// Overrides `<local>/temp`.
    pub temp_root: Option<PathBuf>,
    /// Previously installed versions kept beside the current one.
    pub keep_versions: usize,
    pub probe: ProbeConfig,
    /// JSON file backing the configuration store. Unset means the system
    /// registry on Windows.
    pub store_path: Option<PathBuf>,
}

/// How probe child processes are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub timeout_secs: u64,
    /// 32-bit probe executable; defaults to the current executable.
    pub x86: Option<PathBuf>,
    /// 64-bit probe executable; defaults to the current executable.
    pub x64: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            layout: Layout::default(),
            temp_root: None,
            keep_versions: 2,
            probe: ProbeConfig::default(),
            store_path: None,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            x86: None,
            x64: None,
        }
    }
}

impl EngineConfig {
    /// Load from `explicit`, else `$RHIEXEC_CONFIG`, else defaults.
    ///
    /// `RHIEXEC_HOME` replaces the layout from any source and keeps the
    /// configuration store in a file under it.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        if let Some(home) = layout::try_rhiexec_home() {
            tracing::debug!("RHIEXEC_HOME set; roots under {}", home.display());
            config.layout = Layout::under(&home);
            if config.store_path.is_none() {
                config.store_path = Some(config.layout.roaming.join(STORE_FILE));
            }
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// A self-contained configuration rooted at `home`, with an in-tree store.
    pub fn under(home: &Path) -> Self {
        Self {
            layout: Layout::under(home),
            store_path: Some(home.join(STORE_FILE)),
            ..Self::default()
        }
    }

    pub fn temp_root(&self) -> PathBuf {
        self.temp_root
            .clone()
            .unwrap_or_else(|| self.layout.temp_root())
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| self.layout.roaming.join(STORE_FILE))
    }

    /// Open the configuration store: the JSON file when `store_path` is
    /// set, otherwise the system registry on Windows and
    /// `<roaming>/registry.json` elsewhere.
    pub fn open_store(&self) -> Result<Arc<dyn ConfigStore>, StoreError> {
        if let Some(path) = &self.store_path {
            return Ok(Arc::new(JsonStore::open(path)?));
        }
        #[cfg(windows)]
        let store: Arc<dyn ConfigStore> = Arc::new(RegistryStore::new());
        #[cfg(not(windows))]
        let store: Arc<dyn ConfigStore> = Arc::new(JsonStore::open(&self.store_path())?);
        Ok(store)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Hive;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rhiexec.toml");
        std::fs::write(
            &path,
            "keep_versions = 5\n[probe]\ntimeout_secs = 3\n",
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.keep_versions, 5);
        assert_eq!(config.probe_timeout(), Duration::from_secs(3));
        assert!(config.probe.x64.is_none());
        assert!(config.temp_root().ends_with("temp"));
    }

    #[test]
    fn test_bad_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rhiexec.toml");
        std::fs::write(&path, "keep_versions = \"many\"").unwrap();
        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_under_home_places_store_in_tree() {
        let config = EngineConfig::under(Path::new("/h"));
        assert_eq!(config.store_path(), Path::new("/h/registry.json"));
        assert_eq!(config.temp_root(), Path::new("/h/local/temp"));
    }

    #[test]
    fn test_explicit_store_path_opens_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::under(dir.path());
        let store = config.open_store().unwrap();
        store
            .write_u32(Hive::CurrentUser, r"Software\Test", "Marker", 201_301_015)
            .unwrap();

        let file = JsonStore::open(&dir.path().join("registry.json")).unwrap();
        assert_eq!(
            file.read_u32(Hive::CurrentUser, r"Software\Test", "Marker").unwrap(),
            Some(201_301_015)
        );
    }
}
