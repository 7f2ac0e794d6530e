//! All-or-nothing file installation.
//!
//! Files are copied in archive order. An existing file is renamed to
//! `<name>.rhibak` before it is overwritten, so a failed install can put the
//! destination back exactly as it was. Dropping an open [`Transaction`]
//! rolls it back.

use std::ffi::OsString;
use std::fs::{self, File, FileTimes};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rhi_schema::{
    InstallRecord, MANIFEST_FILE_NAME, ManifestError, XmlElement, XmlError, append_install_record,
};

use crate::archive::{ArchiveError, Package};
use crate::handlers::ContentHandler;
use crate::reporter::EventSink;

const BACKUP_SUFFIX: &str = ".rhibak";

#[derive(thiserror::Error, Debug)]
pub enum InstallError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error("Install failed and was rolled back: {}", failures.join("; "))]
    Failed { failures: Vec<String> },

    #[error("{context}: {message}")]
    Context {
        context: &'static str,
        message: String,
    },
}

impl InstallError {
    /// Create an error with context for better debugging.
    pub fn context(ctx: &'static str, msg: impl std::fmt::Display) -> Self {
        Self::Context {
            context: ctx,
            message: msg.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Committed,
    RolledBack,
}

/// Backups and new files of one install, undone unless committed.
#[derive(Debug)]
pub struct Transaction {
    destination: PathBuf,
    created_destination: bool,
    /// `(original, backup)` pairs.
    backups: Vec<(PathBuf, PathBuf)>,
    created: Vec<PathBuf>,
    state: State,
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

impl Transaction {
    /// Start a transaction, creating `destination` if needed.
    pub fn begin(destination: &Path) -> io::Result<Self> {
        let created_destination = !destination.exists();
        fs::create_dir_all(destination)?;
        Ok(Self {
            destination: destination.to_path_buf(),
            created_destination,
            backups: Vec::new(),
            created: Vec::new(),
            state: State::Open,
        })
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Move an existing file aside so it can be restored.
    pub fn backup(&mut self, path: &Path) -> io::Result<()> {
        let backup = backup_path(path);
        if backup.exists() {
            fs::remove_file(&backup)?;
        }
        fs::rename(path, &backup)?;
        self.backups.push((path.to_path_buf(), backup));
        Ok(())
    }

    /// Record a file that did not exist before this install.
    pub fn record_created(&mut self, path: &Path) {
        self.created.push(path.to_path_buf());
    }

    /// Keep the new files and delete the backups.
    pub fn commit(mut self) {
        for (_, backup) in &self.backups {
            if let Err(e) = fs::remove_file(backup) {
                tracing::warn!("Could not delete backup {}: {e}", backup.display());
            }
        }
        self.state = State::Committed;
    }

    /// Restore every backup and remove every new file. Errors are logged
    /// and returned; the rest of the rollback still runs.
    pub fn rollback(mut self) -> Vec<io::Error> {
        self.undo()
    }

    fn undo(&mut self) -> Vec<io::Error> {
        let mut errors = Vec::new();
        for path in self.created.iter().rev() {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::error!("Could not remove {}: {e}", path.display());
                    errors.push(e);
                }
            }
        }
        for (original, backup) in self.backups.iter().rev() {
            match fs::remove_file(original) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Could not remove {}: {e}", original.display()),
            }
            if let Err(e) = fs::rename(backup, original) {
                tracing::error!(
                    "Could not restore {} from {}: {e}",
                    original.display(),
                    backup.display()
                );
                errors.push(e);
            }
        }
        if self.created_destination {
            remove_empty_dirs(&self.destination);
        }
        self.state = State::RolledBack;
        errors
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == State::Open {
            tracing::warn!(
                "Install into {} abandoned; rolling back",
                self.destination.display()
            );
            self.undo();
        }
    }
}

/// Remove `root` and any folders under it that are now empty.
fn remove_empty_dirs(root: &Path) {
    let mut dirs: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir())
        .map(walkdir::DirEntry::into_path)
        .collect();
    // Deepest first.
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        let _ = fs::remove_dir(dir);
    }
}

/// Give a freshly written file one timestamp for created, modified and
/// accessed, so later "has the user edited this?" checks see no edit.
fn sync_times(path: &Path) -> io::Result<()> {
    let now = SystemTime::now();
    let times = FileTimes::new().set_accessed(now).set_modified(now);
    #[cfg(windows)]
    let times = std::os::windows::fs::FileTimesExt::set_created(times, now);
    File::options().write(true).open(path)?.set_times(times)
}

/// Copy every file of `package` into `destination`, then write the install
/// manifest.
///
/// On any failure the destination is rolled back and
/// [`InstallError::Failed`] lists what went wrong.
pub fn install(
    package: &mut Package,
    destination: &Path,
    handler: &dyn ContentHandler,
    events: &EventSink,
) -> Result<InstallRecord, InstallError> {
    let mut tx = Transaction::begin(destination)?;
    let mut failures: Vec<String> = Vec::new();
    let mut manifest_key: Option<String> = None;
    let mut record = InstallRecord {
        install_folder: destination.to_path_buf(),
        installed_files: Vec::new(),
    };

    let entries = package.entries().to_vec();
    for entry in entries {
        if entry.is_manifest() {
            manifest_key = Some(entry.key);
            continue;
        }
        let Some(relative) = entry.relative_path() else {
            failures.push(format!("{}: path escapes destination", entry.key));
            continue;
        };
        let target = destination.join(relative);
        record.installed_files.push(target.clone());

        if target.exists() {
            if !handler.should_replace_file(&target) {
                events.debug(format!("Keeping existing file {}", target.display()));
                continue;
            }
            if let Err(e) = tx.backup(&target) {
                failures.push(format!("{}: backup failed: {e}", target.display()));
                continue;
            }
        }
        tx.record_created(&target);

        match package.copy_entry_to(&entry.key, &target) {
            Ok(bytes) => {
                events.debug(format!("Installed {} ({bytes} bytes)", target.display()));
                if let Err(e) = sync_times(&target) {
                    events.debug(format!("Could not set times on {}: {e}", target.display()));
                }
            }
            Err(e) => failures.push(format!("{}: {e}", target.display())),
        }
    }

    if failures.is_empty() {
        if let Err(e) = write_manifest(package, manifest_key.as_deref(), handler, &record, &mut tx) {
            failures.push(format!("{MANIFEST_FILE_NAME}: {e}"));
        }
    }

    if failures.is_empty() {
        tx.commit();
        events.info(format!(
            "Installed {} files into {}",
            record.installed_files.len(),
            destination.display()
        ));
        return Ok(record);
    }

    for failure in &failures {
        events.error(failure.clone());
    }
    events.warn(format!("Rolling back install into {}", destination.display()));
    let restore_errors = tx.rollback();
    if !restore_errors.is_empty() {
        events.error(format!("{} files could not be restored", restore_errors.len()));
    }
    Err(InstallError::Failed { failures })
}

/// The archive's own manifest with the install record appended, or the
/// handler's synthesized one.
fn write_manifest(
    package: &mut Package,
    manifest_key: Option<&str>,
    handler: &dyn ContentHandler,
    record: &InstallRecord,
    tx: &mut Transaction,
) -> Result<(), InstallError> {
    let mut root = match manifest_key {
        Some(key) => XmlElement::parse(package.read_entry_to_string(key)?.trim_start_matches('\u{feff}'))?,
        None => handler.manifest().to_element(),
    };
    append_install_record(&mut root, record);

    let path = tx.destination().join(MANIFEST_FILE_NAME);
    if path.exists() {
        tx.backup(&path)?;
    }
    tx.record_created(&path);
    root.write_file(&path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::write_zip;
    use crate::handlers::{AssetHandler, AssetKind};
    use rhi_schema::Manifest;

    const MANIFEST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<RhinoInstaller Version="1.0.1">
  <Package>
    <Version>1.0.0.0</Version>
    <ContentType>Localization</ContentType>
    <Title>Deutsch</Title>
    <ID>2c6d7a3e-5f1b-4e8c-9a0d-1b2c3d4e5f60</ID>
    <OS>any</OS>
    <Locale>de-DE</Locale>
    <RhinoPlatform>Rhino5_win64</RhinoPlatform>
  </Package>
</RhinoInstaller>"#;

    fn package(dir: &Path, files: &[(&str, &[u8])]) -> Package {
        let path = dir.join("pkg.rhi");
        write_zip(&path, files);
        Package::open(&path).unwrap()
    }

    #[test]
    fn test_install_writes_files_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut pkg = package(
            dir.path(),
            &[
                ("package.xml", MANIFEST.as_bytes()),
                ("strings.xml", b"<s/>"),
                ("models/sample.3dm", b"3dm"),
            ],
        );
        let dest = dir.path().join("out");
        let (events, _rx) = EventSink::channel();
        let handler = AssetHandler::new(AssetKind::Localization);

        let record = install(&mut pkg, &dest, &handler, &events).unwrap();
        assert_eq!(
            record.installed_files,
            [dest.join("strings.xml"), dest.join("models").join("sample.3dm")]
        );
        let written = Manifest::read_from_folder(&dest).unwrap();
        assert_eq!(written.title, "Deutsch");
        assert_eq!(written.install_record.unwrap().installed_files.len(), 2);
        assert!(!dest.join("strings.xml.rhibak").exists());
    }

    #[test]
    fn test_failed_install_restores_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("a.txt"), b"old a").unwrap();

        // `sub` is a file, so the last entry cannot be written after `a.txt`
        // was already replaced.
        fs::write(dest.join("sub"), b"not a folder").unwrap();
        let mut pkg = package(
            dir.path(),
            &[("a.txt", b"new a"), ("c.txt", b"new c"), ("sub/b.txt", b"new b")],
        );
        let (events, _rx) = EventSink::channel();
        let handler = AssetHandler::new(AssetKind::HelpMedia);

        let err = install(&mut pkg, &dest, &handler, &events).unwrap_err();
        assert!(matches!(err, InstallError::Failed { .. }));
        assert_eq!(fs::read(dest.join("a.txt")).unwrap(), b"old a");
        assert!(!dest.join("c.txt").exists());
        assert!(!dest.join("a.txt.rhibak").exists());
        assert!(!dest.join(MANIFEST_FILE_NAME).exists());
    }

    fn payload_tree(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        walkdir::WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .map(Result::unwrap)
            .filter(|e| e.file_type().is_file() && e.file_name() != MANIFEST_FILE_NAME)
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_path_buf();
                (rel, fs::read(e.path()).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_clean_installs_are_identical() {
        let dir = tempfile::tempdir().unwrap();
        let files: &[(&str, &[u8])] = &[
            ("package.xml", MANIFEST.as_bytes()),
            ("strings.xml", b"<s/>"),
            ("models/sample.3dm", b"3dm"),
            ("models/deep/readme.txt", b"hello"),
        ];
        let handler = AssetHandler::new(AssetKind::Localization);
        let (events, _rx) = EventSink::channel();

        let first = dir.path().join("first");
        let second = dir.path().join("second");
        install(&mut package(dir.path(), files), &first, &handler, &events).unwrap();
        install(&mut package(dir.path(), files), &second, &handler, &events).unwrap();

        let tree = payload_tree(&first);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree, payload_tree(&second));
    }

    #[test]
    fn test_dropped_transaction_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("fresh");
        {
            let mut tx = Transaction::begin(&dest).unwrap();
            let file = dest.join("new.txt");
            fs::write(&file, b"x").unwrap();
            tx.record_created(&file);
        }
        assert!(!dest.exists());
    }

    #[test]
    fn test_rollback_keeps_backup_when_original_cannot_be_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        let original = dest.join("default.rui");
        fs::write(&original, b"old").unwrap();

        let mut tx = Transaction::begin(&dest).unwrap();
        tx.backup(&original).unwrap();
        fs::create_dir_all(original.join("nested")).unwrap();

        let errors = tx.rollback();
        assert_eq!(errors.len(), 1);
        assert!(original.is_dir());
        assert_eq!(fs::read(backup_path(&original)).unwrap(), b"old");
    }

    #[test]
    fn test_backup_path_appends_suffix() {
        assert_eq!(
            backup_path(Path::new("/a/default.rui")),
            Path::new("/a/default.rui.rhibak")
        );
    }
}
