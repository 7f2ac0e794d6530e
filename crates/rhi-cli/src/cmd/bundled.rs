//! Install the packages shipped with a host.
//!
//! A host calls this on start-up with its SDK service release. Packages are
//! installed once per release and locale: the release is stored as a marker
//! in the current user's hive, and a later call with the same or an older
//! release does nothing.

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use rhi_core::{ConfigStore, EngineConfig, Hive};
use rhi_schema::Phase;

use crate::GlobalArgs;

const MARKER_VALUE: &str = "packages installed for";
const LOCK_FILE: &str = "rhiexec.lock";
/// A lock older than this was left behind by a crashed run.
const STALE_LOCK: Duration = Duration::from_secs(24 * 60 * 60);
/// Releases up to this one installed localization into the local profile.
const LOCAL_LOCALIZATION_LAST_RELEASE: u32 = 201_207_195;

pub fn marker_key(locale: &str) -> String {
    format!(r"Software\McNeel\Rhinoceros\5.0\Install\rhiexec\{locale}")
}

/// Exclusive marker file, removed on drop.
#[derive(Debug)]
pub struct InstallLock {
    path: PathBuf,
}

impl InstallLock {
    /// Take the lock, or `None` if another run holds it.
    pub fn acquire(path: &Path) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if is_stale(path) {
            tracing::warn!("Removing stale lock {}", path.display());
            std::fs::remove_file(path)?;
        }
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(Some(Self {
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::debug!("Could not remove lock {}: {e}", self.path.display());
        }
    }
}

fn is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK)
}

/// Packages for `locale` and for every locale, `UI*` first, then
/// `LOCALIZATION*`, then the rest.
pub fn find_packages(folder: &Path, locale: &str) -> Result<Vec<PathBuf>> {
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::new()
    };
    let base = Pattern::escape(&folder.display().to_string());
    let mut packages = Vec::new();
    for suffix in [Pattern::escape(&format!("({locale}).rhi")), "(any).rhi".to_string()] {
        let pattern = format!("{base}/*{suffix}");
        let mut matches: Vec<PathBuf> = glob::glob_with(&pattern, options)
            .with_context(|| format!("bad package pattern {pattern}"))?
            .filter_map(Result::ok)
            .collect();
        matches.sort();
        packages.extend(matches);
    }
    packages.sort_by_key(|p| install_rank(p));
    Ok(packages)
}

fn install_rank(path: &Path) -> u8 {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_uppercase())
        .unwrap_or_default();
    if name.starts_with("UI") {
        0
    } else if name.starts_with("LOCALIZATION") {
        1
    } else {
        2
    }
}

/// Run `rhiexec install <package>` as a child and decode its exit code.
fn install_child(exe: &Path, passthrough: &[OsString], package: &Path) -> Phase {
    tracing::info!("Installing package '{}'", package.display());
    let status = Command::new(exe)
        .args(passthrough)
        .arg("install")
        .arg(package)
        .stdin(Stdio::null())
        .status();
    match status {
        Ok(status) => {
            let phase = status.code().map_or(Phase::Unknown, Phase::from_exit_code);
            tracing::info!("'{}' finished: {phase}", package.display());
            phase
        }
        Err(e) => {
            tracing::error!("Could not launch {}: {e}", exe.display());
            Phase::Unknown
        }
    }
}

/// Delete localization left in the local profile by early releases.
fn remove_local_localization(config: &EngineConfig, marker: u32) {
    if marker == 0 || marker > LOCAL_LOCALIZATION_LAST_RELEASE {
        return;
    }
    let folder = config.layout.local.join("Localization");
    if folder.is_dir() {
        match std::fs::remove_dir_all(&folder) {
            Ok(()) => tracing::info!("Removed {}", folder.display()),
            Err(e) => tracing::debug!("Could not remove {}: {e}", folder.display()),
        }
    }
}

pub fn install_bundled(
    folder: &Path,
    sdk_version: u32,
    global: &GlobalArgs,
    config: &EngineConfig,
) -> Result<Phase> {
    let lock_path = config.layout.local.join(LOCK_FILE);
    let Some(_lock) = InstallLock::acquire(&lock_path)
        .with_context(|| format!("taking lock {}", lock_path.display()))?
    else {
        tracing::warn!("Another installer is already installing packages");
        return Ok(Phase::AlreadyRunning);
    };

    let store: Arc<dyn ConfigStore> = config
        .open_store()
        .context("opening configuration store")?;
    let key = marker_key(&global.locale);
    let marker = match store.read_u32(Hive::CurrentUser, &key, MARKER_VALUE) {
        Ok(value) => value.unwrap_or(0),
        Err(e) => {
            tracing::debug!("Ignoring unreadable marker: {e}");
            0
        }
    };

    remove_local_localization(config, marker);

    if marker >= sdk_version {
        tracing::info!("Packages already installed for service release {sdk_version}");
        return Ok(Phase::Complete);
    }

    let packages = find_packages(folder, &global.locale)?;
    tracing::info!("{} bundled packages in {}", packages.len(), folder.display());

    let exe = std::env::current_exe().context("locating rhiexec")?;
    let passthrough = global.passthrough();
    let mut failed = false;
    for package in &packages {
        let phase = install_child(&exe, &passthrough, package);
        if !matches!(phase, Phase::Complete | Phase::AlreadyInstalled) {
            failed = true;
        }
    }

    if failed {
        tracing::warn!("Some packages failed; service release {sdk_version} not recorded");
        return Ok(Phase::InstallFailed);
    }
    store
        .write_u32(Hive::CurrentUser, &key, MARKER_VALUE, sdk_version)
        .context("saving installed service release")?;
    Ok(Phase::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_packages_order_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "Tutorial(en-US).rhi",
            "Localization(en-US).rhi",
            "UI(any).rhi",
            "Help(de-DE).rhi",
            "Media(ANY).rhi",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let names: Vec<String> = find_packages(dir.path(), "en-US")
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            [
                "UI(any).rhi",
                "Localization(en-US).rhi",
                "Tutorial(en-US).rhi",
                "Media(ANY).rhi",
            ]
        );
    }

    #[test]
    fn test_lock_is_exclusive_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join(LOCK_FILE);

        let first = InstallLock::acquire(&path).unwrap();
        assert!(first.is_some());
        assert!(InstallLock::acquire(&path).unwrap().is_none());
        drop(first);
        assert!(!path.exists());
        assert!(InstallLock::acquire(&path).unwrap().is_some());
    }

    #[test]
    fn test_local_localization_cleanup_window() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::under(dir.path());
        let folder = config.layout.local.join("Localization");

        std::fs::create_dir_all(&folder).unwrap();
        remove_local_localization(&config, 0);
        assert!(folder.exists());
        remove_local_localization(&config, 201_301_015);
        assert!(folder.exists());
        remove_local_localization(&config, 201_207_195);
        assert!(!folder.exists());
    }
}
