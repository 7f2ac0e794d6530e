//! Package archive access.
//!
//! A `.rhi` package is a ZIP archive. [`Package`] opens it with a short
//! retry loop (scanners and indexers briefly hold exclusive locks on fresh
//! downloads), lists entries in archive order and extracts individual
//! entries on demand.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::RegexBuilder;
use rhi_schema::MANIFEST_FILE_NAME;
use zip::ZipArchive;
use zip::result::ZipError;

const OPEN_ATTEMPTS: u32 = 3;
const RETRY_STEP: Duration = Duration::from_millis(500);

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("Package not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid archive: {0}")]
    Archive(#[from] ZipError),

    #[error("Invalid entry pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Entry not in package: {0}")]
    MissingEntry(String),

    #[error("Entry escapes destination folder: {0}")]
    UnsafePath(String),

    #[error("{context}: {message}")]
    Context {
        context: &'static str,
        message: String,
    },
}

impl ArchiveError {
    /// Create an error with context for better debugging.
    pub fn context(ctx: &'static str, msg: impl std::fmt::Display) -> Self {
        Self::Context {
            context: ctx,
            message: msg.to_string(),
        }
    }
}

/// One file inside the archive, addressed by its stored name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileEntry {
    pub key: String,
}

impl FileEntry {
    /// Last path component of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit(['/', '\\']).next().unwrap_or(&self.key)
    }

    /// Key as a relative path, or `None` if it would escape its folder.
    pub fn relative_path(&self) -> Option<PathBuf> {
        let mut out = PathBuf::new();
        for part in self.key.split(['/', '\\']) {
            match part {
                "" | "." => {}
                ".." => return None,
                p if p.contains(':') => return None,
                p => out.push(p),
            }
        }
        (!out.as_os_str().is_empty()).then_some(out)
    }

    /// Whether this is the package manifest at the archive root.
    pub fn is_manifest(&self) -> bool {
        self.key.eq_ignore_ascii_case(MANIFEST_FILE_NAME)
    }
}

/// An opened package archive.
pub struct Package {
    path: PathBuf,
    archive: ZipArchive<File>,
    entries: OnceLock<Vec<FileEntry>>,
    destination: Option<PathBuf>,
    extracted: HashSet<String>,
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("path", &self.path)
            .field("destination", &self.destination)
            .finish_non_exhaustive()
    }
}

impl Package {
    /// Open an archive, retrying while the file is locked.
    ///
    /// A missing file fails immediately with [`ArchiveError::NotFound`]. An
    /// archive that keeps failing with I/O errors surfaces
    /// [`ArchiveError::Io`] after the last attempt.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        Self::open_with_backoff(path, RETRY_STEP)
    }

    pub(crate) fn open_with_backoff(path: &Path, step: Duration) -> Result<Self, ArchiveError> {
        if !path.is_file() {
            return Err(ArchiveError::NotFound(path.to_path_buf()));
        }

        let archive = with_retries(path, step, || {
            let file = File::open(path)?;
            ZipArchive::new(file).map_err(|e| match e {
                ZipError::Io(e) => ArchiveError::Io(e),
                other => ArchiveError::Archive(other),
            })
        })?;
        tracing::debug!("Opened package {} ({} entries)", path.display(), archive.len());
        Ok(Self {
            path: path.to_path_buf(),
            archive,
            entries: OnceLock::new(),
            destination: None,
            extracted: HashSet::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File entries in archive order. Directory entries are excluded.
    pub fn entries(&self) -> &[FileEntry] {
        self.entries.get_or_init(|| {
            (0..self.archive.len())
                .filter_map(|i| self.archive.name_for_index(i))
                .filter(|name| !name.ends_with('/'))
                .map(|name| FileEntry {
                    key: name.to_string(),
                })
                .collect()
        })
    }

    /// First entry whose key matches `pattern`, case-insensitively.
    pub fn find_first(&self, pattern: &str) -> Result<Option<FileEntry>, ArchiveError> {
        Ok(self.find_all(pattern)?.into_iter().next())
    }

    /// Every entry whose key matches `pattern`, case-insensitively.
    pub fn find_all(&self, pattern: &str) -> Result<Vec<FileEntry>, ArchiveError> {
        let rx = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(self
            .entries()
            .iter()
            .filter(|e| rx.is_match(&e.key))
            .cloned()
            .collect())
    }

    /// Whether any entry has this file name, ignoring case and folder.
    pub fn contains_file_named(&self, name: &str) -> bool {
        self.entries()
            .iter()
            .any(|e| e.file_name().eq_ignore_ascii_case(name))
    }

    /// The root manifest entry, if the package has one.
    pub fn manifest_entry(&self) -> Option<FileEntry> {
        self.entries().iter().find(|e| e.is_manifest()).cloned()
    }

    /// Folder that [`Package::materialize`] extracts into.
    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    /// Set the extraction folder. Only the first call has effect.
    pub fn set_destination(&mut self, folder: &Path) -> Result<(), ArchiveError> {
        if let Some(existing) = &self.destination {
            return Err(ArchiveError::context(
                "destination already set",
                existing.display(),
            ));
        }
        self.destination = Some(folder.to_path_buf());
        Ok(())
    }

    /// Extract `key` into the destination folder on first access and return
    /// its absolute path. Later calls return the same path without
    /// extracting again.
    pub fn materialize(&mut self, key: &str) -> Result<PathBuf, ArchiveError> {
        let destination = self
            .destination
            .clone()
            .ok_or_else(|| ArchiveError::context("materialize", "no destination folder set"))?;
        let entry = FileEntry {
            key: key.to_string(),
        };
        let relative = entry
            .relative_path()
            .ok_or_else(|| ArchiveError::UnsafePath(key.to_string()))?;
        let target = destination.join(relative);

        if self.extracted.contains(key) && target.is_file() {
            return Ok(target);
        }
        self.copy_entry_to(key, &target)?;
        self.extracted.insert(key.to_string());
        Ok(target)
    }

    /// Write the bytes of `key` to `target`, creating parent folders.
    pub fn copy_entry_to(&mut self, key: &str, target: &Path) -> Result<u64, ArchiveError> {
        let mut file = match self.archive.by_name(key) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => return Err(ArchiveError::MissingEntry(key.to_string())),
            Err(e) => return Err(e.into()),
        };
        if file.enclosed_name().is_none() {
            return Err(ArchiveError::UnsafePath(key.to_string()));
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(target)?;
        Ok(io::copy(&mut file, &mut out)?)
    }

    /// Read an entry as UTF-8 text.
    pub fn read_entry_to_string(&mut self, key: &str) -> Result<String, ArchiveError> {
        let mut file = match self.archive.by_name(key) {
            Ok(file) => file,
            Err(ZipError::FileNotFound) => return Err(ArchiveError::MissingEntry(key.to_string())),
            Err(e) => return Err(e.into()),
        };
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        Ok(text)
    }
}

/// Run `open` up to [`OPEN_ATTEMPTS`] times, sleeping `step * attempt`
/// after each I/O failure. Other errors end the loop at once.
fn with_retries<T>(
    path: &Path,
    step: Duration,
    mut open: impl FnMut() -> Result<T, ArchiveError>,
) -> Result<T, ArchiveError> {
    let mut attempt = 1;
    loop {
        let err = match open() {
            Ok(value) => return Ok(value),
            Err(ArchiveError::Io(e)) => e,
            Err(other) => return Err(other),
        };
        if attempt >= OPEN_ATTEMPTS {
            return Err(ArchiveError::Io(io::Error::new(
                err.kind(),
                format!(
                    "tried to open '{}' {OPEN_ATTEMPTS} times: {err}",
                    path.display()
                ),
            )));
        }
        tracing::warn!(attempt, "Could not open {}: {err}; retrying", path.display());
        std::thread::sleep(step * attempt);
        attempt += 1;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    pub(crate) fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, data) in files {
            if name.ends_with('/') {
                zip.add_directory(*name, SimpleFileOptions::default()).unwrap();
            } else {
                zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                zip.write_all(data).unwrap();
            }
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_entries_keep_archive_order_and_skip_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.rhi");
        write_zip(
            &path,
            &[
                ("z.txt", b"z"),
                ("sub/", b""),
                ("sub/A.RHP", b"a"),
                ("package.xml", b"<x/>"),
            ],
        );
        let pkg = Package::open(&path).unwrap();
        let keys: Vec<_> = pkg.entries().iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, ["z.txt", "sub/A.RHP", "package.xml"]);

        assert_eq!(pkg.find_first(r".*rhp$").unwrap().unwrap().key, "sub/A.RHP");
        assert_eq!(pkg.find_all(r"\.TXT$").unwrap().len(), 1);
        assert!(pkg.contains_file_named("a.rhp"));
        assert!(pkg.manifest_entry().is_some());
        assert!(pkg.find_first("(").is_err());
    }

    #[test]
    fn test_materialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.rhi");
        write_zip(&path, &[("data/readme.txt", b"hello")]);
        let out = dir.path().join("out");

        let mut pkg = Package::open(&path).unwrap();
        assert!(pkg.materialize("data/readme.txt").is_err());
        pkg.set_destination(&out).unwrap();
        assert!(pkg.set_destination(&out).is_err());

        let first = pkg.materialize("data/readme.txt").unwrap();
        assert_eq!(std::fs::read(&first).unwrap(), b"hello");
        std::fs::write(&first, b"changed").unwrap();
        let second = pkg.materialize("data/readme.txt").unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second).unwrap(), b"changed");
        assert!(matches!(
            pkg.materialize("missing.txt"),
            Err(ArchiveError::MissingEntry(_))
        ));
    }

    #[test]
    fn test_missing_and_corrupt_archives() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Package::open(&dir.path().join("nope.rhi")),
            Err(ArchiveError::NotFound(_))
        ));
        let bad = dir.path().join("bad.rhi");
        std::fs::write(&bad, b"not a zip").unwrap();
        assert!(Package::open_with_backoff(&bad, Duration::ZERO).is_err());
    }

    #[test]
    fn test_open_retries_io_errors_with_growing_delay() {
        let step = Duration::from_millis(20);
        let mut calls = 0;
        let started = std::time::Instant::now();
        let value = with_retries(Path::new("busy.rhi"), step, || {
            calls += 1;
            if calls < 3 {
                Err(ArchiveError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "locked")))
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(value, 3);
        assert!(started.elapsed() >= step * 3);

        let mut calls = 0;
        let err = with_retries(Path::new("busy.rhi"), Duration::ZERO, || -> Result<(), _> {
            calls += 1;
            Err(ArchiveError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "locked")))
        })
        .unwrap_err();
        assert_eq!(calls, OPEN_ATTEMPTS);
        assert!(matches!(&err, ArchiveError::Io(e) if e.kind() == io::ErrorKind::PermissionDenied));
        assert!(err.to_string().contains("3 times"));

        let mut calls = 0;
        let err = with_retries(Path::new("bad.rhi"), Duration::ZERO, || -> Result<(), _> {
            calls += 1;
            Err(ArchiveError::Archive(ZipError::InvalidArchive("bad".into())))
        })
        .unwrap_err();
        assert_eq!(calls, 1);
        assert!(matches!(err, ArchiveError::Archive(_)));
    }

    #[test]
    fn test_relative_path_rejects_escape() {
        let entry = |k: &str| FileEntry { key: k.to_string() };
        assert_eq!(entry("a/b.txt").relative_path(), Some(PathBuf::from("a").join("b.txt")));
        assert_eq!(entry("../evil").relative_path(), None);
        assert_eq!(entry("C:/evil").relative_path(), None);
        assert_eq!(entry("b/").file_name(), "");
    }
}
