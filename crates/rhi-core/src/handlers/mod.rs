//! Content handlers.
//!
//! Each package content type has its own install policy: where files go,
//! how "already installed" is decided, which hosts can use it, and what to
//! register afterwards. The set of policies is fixed, so [`Handler`] is a
//! closed enum over the concrete handlers and [`HandlerSet`] selects the
//! first one, in priority order, that recognizes a package.

pub mod asset;
pub mod plugin;
pub mod python;

use std::fmt;
use std::path::{Path, PathBuf};

use rhi_schema::{
    ContentType, HostDescriptor, HostError, InstallRoot, InstallUser, Manifest, ManifestError,
    PackageInstallState, PackageVersion,
};
use uuid::Uuid;

use crate::archive::{ArchiveError, Package};
use crate::layout::Layout;
use crate::probe::ProbeRunner;
use crate::reporter::EventSink;
use crate::store::{ConfigStore, StoreError};

pub use asset::{AssetHandler, AssetKind};
pub use plugin::PluginHandler;
pub use python::PythonPluginHandler;

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("Package is not compatible with any inspectable host: {0}")]
    PackageNotCompatible(PathBuf),

    #[error("All plug-ins in a package must share one GUID; found {first} and {second}")]
    GuidMismatch { first: Uuid, second: Uuid },

    #[error("Manifest not found in package {0}")]
    ManifestNotFound(PathBuf),

    #[error("Invalid manifest: {0}")]
    ManifestInvalid(String),

    #[error("Unexpected macro in path: {0}")]
    UnexpectedMacro(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{context}: {message}")]
    Context {
        context: &'static str,
        message: String,
    },
}

impl HandlerError {
    /// Create an error with context for better debugging.
    pub fn context(ctx: &'static str, msg: impl fmt::Display) -> Self {
        Self::Context {
            context: ctx,
            message: msg.to_string(),
        }
    }
}

/// Collaborators a handler may use.
#[derive(Clone, Copy)]
pub struct HandlerContext<'a> {
    pub layout: &'a Layout,
    pub store: &'a dyn ConfigStore,
    pub probe: &'a dyn ProbeRunner,
    pub events: &'a EventSink,
}

impl fmt::Debug for HandlerContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// Install policy for one content type.
pub trait ContentHandler {
    fn content_type(&self) -> ContentType;

    /// Whether this handler understands the package. May extract files
    /// into the package's temp destination to decide.
    fn recognizes_payload(&mut self, package: &mut Package, cx: &HandlerContext<'_>) -> bool;

    /// Load everything needed for the later steps.
    fn initialize(&mut self, package: &mut Package, cx: &HandlerContext<'_>) -> Result<(), HandlerError>;

    /// Package metadata; written as the install manifest when the archive
    /// does not carry one.
    fn manifest(&self) -> Manifest;

    fn install_root(&self) -> InstallRoot;

    /// Destination folder under `root`.
    fn install_folder(&self, root: &Path) -> Result<PathBuf, HandlerError>;

    /// How the candidate compares with what is already installed for `user`.
    fn install_state(
        &self,
        cx: &HandlerContext<'_>,
        user: InstallUser,
    ) -> Result<PackageInstallState, HandlerError>;

    fn is_compatible(&self, host: &HostDescriptor) -> bool;

    fn before_install(
        &self,
        _destination: &Path,
        _hosts: &[HostDescriptor],
        _user: InstallUser,
        _cx: &HandlerContext<'_>,
    ) -> bool {
        true
    }

    /// Asked before overwriting an existing file; `false` keeps it.
    fn should_replace_file(&self, _path: &Path) -> bool {
        true
    }

    fn after_install(
        &self,
        _package: &Package,
        _destination: &Path,
        _hosts: &[HostDescriptor],
        _user: InstallUser,
        _cx: &HandlerContext<'_>,
    ) -> bool {
        true
    }

    fn describe(&self) -> String {
        let manifest = self.manifest();
        format!(
            "{} package '{}' {} {{{}}}",
            self.content_type(),
            manifest.title,
            manifest.version,
            manifest.id
        )
    }
}

/// The fixed family of handlers.
#[derive(Debug, Clone)]
pub enum Handler {
    Asset(AssetHandler),
    Plugin(PluginHandler),
    Python(PythonPluginHandler),
}

macro_rules! dispatch {
    ($self:ident, $h:ident => $e:expr) => {
        match $self {
            Handler::Asset($h) => $e,
            Handler::Plugin($h) => $e,
            Handler::Python($h) => $e,
        }
    };
}

impl ContentHandler for Handler {
    fn content_type(&self) -> ContentType {
        dispatch!(self, h => h.content_type())
    }
    fn recognizes_payload(&mut self, package: &mut Package, cx: &HandlerContext<'_>) -> bool {
        dispatch!(self, h => h.recognizes_payload(package, cx))
    }
    fn initialize(&mut self, package: &mut Package, cx: &HandlerContext<'_>) -> Result<(), HandlerError> {
        dispatch!(self, h => h.initialize(package, cx))
    }
    fn manifest(&self) -> Manifest {
        dispatch!(self, h => h.manifest())
    }
    fn install_root(&self) -> InstallRoot {
        dispatch!(self, h => h.install_root())
    }
    fn install_folder(&self, root: &Path) -> Result<PathBuf, HandlerError> {
        dispatch!(self, h => h.install_folder(root))
    }
    fn install_state(
        &self,
        cx: &HandlerContext<'_>,
        user: InstallUser,
    ) -> Result<PackageInstallState, HandlerError> {
        dispatch!(self, h => h.install_state(cx, user))
    }
    fn is_compatible(&self, host: &HostDescriptor) -> bool {
        dispatch!(self, h => h.is_compatible(host))
    }
    fn before_install(
        &self,
        destination: &Path,
        hosts: &[HostDescriptor],
        user: InstallUser,
        cx: &HandlerContext<'_>,
    ) -> bool {
        dispatch!(self, h => h.before_install(destination, hosts, user, cx))
    }
    fn should_replace_file(&self, path: &Path) -> bool {
        dispatch!(self, h => h.should_replace_file(path))
    }
    fn after_install(
        &self,
        package: &Package,
        destination: &Path,
        hosts: &[HostDescriptor],
        user: InstallUser,
        cx: &HandlerContext<'_>,
    ) -> bool {
        dispatch!(self, h => h.after_install(package, destination, hosts, user, cx))
    }
    fn describe(&self) -> String {
        dispatch!(self, h => h.describe())
    }
}

/// Handlers in selection priority order.
#[derive(Debug, Clone)]
pub struct HandlerSet {
    handlers: Vec<Handler>,
}

impl HandlerSet {
    pub fn new(handlers: Vec<Handler>) -> Self {
        Self { handlers }
    }

    /// Platform-specific content first, then compiled plugins, then
    /// interpreted plugins.
    pub fn standard() -> Self {
        let mut handlers: Vec<Handler> = AssetKind::ALL
            .into_iter()
            .map(|kind| Handler::Asset(AssetHandler::new(kind)))
            .collect();
        handlers.push(Handler::Plugin(PluginHandler::default()));
        handlers.push(Handler::Python(PythonPluginHandler::default()));
        Self { handlers }
    }

    pub fn content_types(&self) -> Vec<ContentType> {
        self.handlers.iter().map(ContentHandler::content_type).collect()
    }

    /// The first handler that recognizes `package`.
    pub fn select(self, package: &mut Package, cx: &HandlerContext<'_>) -> Option<Handler> {
        self.handlers.into_iter().find_map(|mut handler| {
            let recognized = handler.recognizes_payload(package, cx);
            cx.events.debug(format!(
                "{} handler {} the package",
                handler.content_type(),
                if recognized { "recognizes" } else { "does not recognize" }
            ));
            recognized.then_some(handler)
        })
    }
}

impl Default for HandlerSet {
    fn default() -> Self {
        Self::standard()
    }
}

/// Characters that cannot appear in a folder name.
fn is_invalid_path_char(c: char) -> bool {
    c.is_control() || matches!(c, '"' | '<' | '>' | '|' | ':' | '*' | '?' | '/' | '\\')
}

fn sanitize(value: &str) -> String {
    value.chars().filter(|c| !is_invalid_path_char(*c)).collect()
}

/// Expand an install-folder template against a manifest.
///
/// Templates use `/` separators and the macros `$(PACKAGE_LANG)`,
/// `$(PACKAGE_TITLE)`, `$(PACKAGE_ID)` and `$(PACKAGE_VERSION)`.
pub fn expand_folder(root: &Path, template: &str, manifest: &Manifest) -> Result<PathBuf, HandlerError> {
    let expanded = template
        .replace("$(PACKAGE_LANG)", &sanitize(manifest.locale_name()))
        .replace("$(PACKAGE_TITLE)", &sanitize(&manifest.title))
        .replace(
            "$(PACKAGE_ID)",
            &sanitize(&manifest.id.to_string().to_uppercase()),
        )
        .replace("$(PACKAGE_VERSION)", &manifest.version.to_string());

    if expanded.contains("$(") {
        return Err(HandlerError::UnexpectedMacro(expanded));
    }
    Ok(expanded
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |path, part| path.join(part)))
}

/// Versioned subfolders of `parent`, oldest first.
pub fn installed_versions(parent: &Path) -> Vec<(PackageVersion, PathBuf)> {
    let mut versions: Vec<_> = walkdir::WalkDir::new(parent)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir())
        .filter_map(|e| {
            let version = e.file_name().to_str()?.parse::<PackageVersion>().ok()?;
            Some((version, e.into_path()))
        })
        .collect();
    versions.sort();
    versions
}

/// Install state for packages whose folder ends in the version number:
/// the newest sibling version decides.
pub fn versioned_install_state(
    folder: &Path,
    candidate: PackageVersion,
    user: InstallUser,
) -> PackageInstallState {
    let newest = folder
        .parent()
        .and_then(|parent| installed_versions(parent).pop())
        .map(|(version, _)| version);
    PackageInstallState::compare(newest, candidate, user)
}

/// Remove a folder tree, logging instead of failing.
fn remove_legacy_folder(folder: &Path, destination: &Path, cx: &HandlerContext<'_>) {
    if !folder.is_dir() || destination.starts_with(folder) {
        return;
    }
    match std::fs::remove_dir_all(folder) {
        Ok(()) => cx.events.info(format!("Deleted legacy folder {}", folder.display())),
        Err(e) => cx
            .events
            .debug(format!("Could not delete legacy folder {}: {e}", folder.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhi_schema::{HostPlatform, OsPlatform};

    fn manifest() -> Manifest {
        Manifest {
            version: PackageVersion::new(1, 2, 0, 0),
            content_type: ContentType::Tutorial,
            title: "Intro: Part <1>".into(),
            id: Uuid::parse_str("8f2a6c1e-0b4d-4c3a-9e77-2f5c6d7e8a90").unwrap(),
            os: OsPlatform::Any,
            locale: Some("en-US".into()),
            platforms: vec![HostPlatform::Host5Win64],
            ..Manifest::default()
        }
    }

    #[test]
    fn test_expand_folder_substitutes_and_sanitizes() {
        let path = expand_folder(
            Path::new("/root"),
            "Tutorials/$(PACKAGE_LANG)/$(PACKAGE_TITLE) {$(PACKAGE_ID)}/$(PACKAGE_VERSION)",
            &manifest(),
        )
        .unwrap();
        assert_eq!(
            path,
            Path::new("/root/Tutorials/en-US/Intro Part 1 {8F2A6C1E-0B4D-4C3A-9E77-2F5C6D7E8A90}/1.2.0.0")
        );
    }

    #[test]
    fn test_expand_folder_rejects_unknown_macro() {
        let err = expand_folder(Path::new("/root"), "X/$(PACKAGE_OWNER)", &manifest()).unwrap_err();
        assert!(matches!(err, HandlerError::UnexpectedMacro(_)));
    }

    #[test]
    fn test_installed_versions_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["1.10.0.0", "1.2.0.0", "notes", "2.0"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        std::fs::write(dir.path().join("3.0.0.0"), b"file, not folder").unwrap();

        let versions: Vec<_> = installed_versions(dir.path())
            .into_iter()
            .map(|(v, _)| v.to_string())
            .collect();
        assert_eq!(versions, ["1.2.0.0", "1.10.0.0", "2.0.0.0"]);

        let folder = dir.path().join("1.10.0.0");
        assert_eq!(
            versioned_install_state(&folder, PackageVersion::new(1, 10, 0, 0), InstallUser::CurrentUser),
            PackageInstallState::NewerCurrentUser
        );
        assert_eq!(
            versioned_install_state(&folder, PackageVersion::new(3, 0, 0, 0), InstallUser::CurrentUser),
            PackageInstallState::OlderCurrentUser
        );
    }

    #[test]
    fn test_standard_priority_order() {
        assert_eq!(
            HandlerSet::standard().content_types(),
            [
                ContentType::Tutorial,
                ContentType::Localization,
                ContentType::HelpMedia,
                ContentType::Help,
                ContentType::UserInterface,
                ContentType::Plugin,
                ContentType::Python,
            ]
        );
    }
}
