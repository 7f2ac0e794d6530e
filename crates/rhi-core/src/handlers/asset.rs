//! Manifest-driven content: tutorials, localization, help and UI files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use rhi_schema::{
    ContentType, HostDescriptor, InstallRoot, InstallUser, Manifest, PackageInstallState,
};

use super::{
    ContentHandler, HandlerContext, HandlerError, expand_folder, remove_legacy_folder,
    versioned_install_state,
};
use crate::archive::Package;

/// One kind of manifest-driven content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Tutorial,
    Localization,
    HelpMedia,
    Help,
    UserInterface,
}

impl AssetKind {
    /// Every kind, in selection priority order.
    pub const ALL: [Self; 5] = [
        Self::Tutorial,
        Self::Localization,
        Self::HelpMedia,
        Self::Help,
        Self::UserInterface,
    ];

    pub fn content_type(self) -> ContentType {
        match self {
            Self::Tutorial => ContentType::Tutorial,
            Self::Localization => ContentType::Localization,
            Self::HelpMedia => ContentType::HelpMedia,
            Self::Help => ContentType::Help,
            Self::UserInterface => ContentType::UserInterface,
        }
    }

    fn folder_template(self) -> &'static str {
        match self {
            Self::Tutorial => {
                "Tutorials/$(PACKAGE_LANG)/$(PACKAGE_TITLE) {$(PACKAGE_ID)}/$(PACKAGE_VERSION)"
            }
            Self::Localization => "Localization/$(PACKAGE_LANG)",
            Self::HelpMedia => "Localization/HelpMedia",
            Self::Help => "Localization/$(PACKAGE_LANG)/Help",
            Self::UserInterface => "UI",
        }
    }

    fn install_root(self) -> InstallRoot {
        match self {
            Self::Localization | Self::UserInterface => InstallRoot::CurrentUserRoaming,
            Self::Tutorial | Self::HelpMedia | Self::Help => InstallRoot::CurrentUserLocal,
        }
    }

    fn is_versioned(self) -> bool {
        self.folder_template().ends_with("$(PACKAGE_VERSION)")
    }
}

/// Handler for content described entirely by its `package.xml`.
#[derive(Debug, Clone)]
pub struct AssetHandler {
    kind: AssetKind,
    manifest: Option<Manifest>,
}

impl AssetHandler {
    pub fn new(kind: AssetKind) -> Self {
        Self {
            kind,
            manifest: None,
        }
    }

    pub fn kind(&self) -> AssetKind {
        self.kind
    }

    fn loaded(&self) -> Result<&Manifest, HandlerError> {
        self.manifest
            .as_ref()
            .ok_or_else(|| HandlerError::context("asset handler", "manifest not loaded"))
    }

    /// Extract and read the package's manifest if it declares this kind.
    fn load_manifest(&mut self, package: &mut Package, cx: &HandlerContext<'_>) -> Result<bool, HandlerError> {
        let Some(entry) = package.manifest_entry() else {
            return Ok(false);
        };
        let path = package.materialize(&entry.key)?;
        let mut manifest = Manifest::read_file(&path)?;
        if !manifest.is_valid(self.kind.content_type()) {
            cx.events.debug(format!(
                "{} is not a valid {} manifest",
                path.display(),
                self.kind.content_type()
            ));
            return Ok(false);
        }
        if let Some(folder) = path.parent() {
            manifest.package_path = folder.display().to_string();
        }
        self.manifest = Some(manifest);
        Ok(true)
    }
}

impl ContentHandler for AssetHandler {
    fn content_type(&self) -> ContentType {
        self.kind.content_type()
    }

    fn recognizes_payload(&mut self, package: &mut Package, cx: &HandlerContext<'_>) -> bool {
        match self.load_manifest(package, cx) {
            Ok(true) => {
                cx.events
                    .info(format!("Recognized payload as {} package", self.content_type()));
                true
            }
            Ok(false) => false,
            Err(e) => {
                cx.events.debug(format!(
                    "{} handler could not read manifest: {e}",
                    self.content_type()
                ));
                false
            }
        }
    }

    fn initialize(&mut self, package: &mut Package, cx: &HandlerContext<'_>) -> Result<(), HandlerError> {
        if self.manifest.is_some() {
            return Ok(());
        }
        if package.manifest_entry().is_none() {
            return Err(HandlerError::ManifestNotFound(package.path().to_path_buf()));
        }
        if !self.load_manifest(package, cx)? {
            return Err(HandlerError::ManifestInvalid(format!(
                "{} is not a valid {} package",
                package.path().display(),
                self.content_type()
            )));
        }
        Ok(())
    }

    fn manifest(&self) -> Manifest {
        self.manifest.clone().unwrap_or_default()
    }

    fn install_root(&self) -> InstallRoot {
        self.kind.install_root()
    }

    fn install_folder(&self, root: &Path) -> Result<PathBuf, HandlerError> {
        expand_folder(root, self.kind.folder_template(), self.loaded()?)
    }

    fn install_state(
        &self,
        cx: &HandlerContext<'_>,
        user: InstallUser,
    ) -> Result<PackageInstallState, HandlerError> {
        let candidate = self.loaded()?.version;
        let folder = self.install_folder(cx.layout.root_for(self.install_root(), user))?;
        if self.kind.is_versioned() {
            return Ok(versioned_install_state(&folder, candidate, user));
        }

        let installed = match Manifest::read_from_folder(&folder) {
            Ok(m) if m.is_valid(self.content_type()) => Some(m.version),
            Ok(_) => {
                cx.events
                    .debug(format!("Ignoring invalid manifest in {}", folder.display()));
                None
            }
            Err(_) => None,
        };
        Ok(PackageInstallState::compare(installed, candidate, user))
    }

    fn is_compatible(&self, host: &HostDescriptor) -> bool {
        let Some(manifest) = &self.manifest else {
            return false;
        };
        let compatible = manifest.supports(host.platform());
        log_compatibility(compatible, &manifest.title, host);
        compatible
    }

    fn before_install(
        &self,
        destination: &Path,
        _hosts: &[HostDescriptor],
        _user: InstallUser,
        cx: &HandlerContext<'_>,
    ) -> bool {
        let roaming = &cx.layout.roaming;
        match self.kind {
            AssetKind::Tutorial => remove_legacy_folder(&roaming.join("Tutorials"), destination, cx),
            AssetKind::HelpMedia => remove_legacy_folder(
                &roaming.join("Localization").join("HelpMedia"),
                destination,
                cx,
            ),
            AssetKind::Help => {
                let language = self
                    .manifest
                    .as_ref()
                    .map(|m| m.locale_name().split('-').next().unwrap_or_default().to_string())
                    .unwrap_or_default();
                if !language.is_empty() {
                    let legacy = roaming.join("Localization").join(language).join("Help");
                    remove_legacy_folder(&legacy, destination, cx);
                }
            }
            AssetKind::UserInterface => delete_toolbar_caches(destination, cx),
            AssetKind::Localization => {}
        }
        true
    }

    fn should_replace_file(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return true;
        };
        match self.kind {
            AssetKind::Localization if ext.eq_ignore_ascii_case("3dm") => {
                match file_times(path) {
                    Some((created, modified)) => replace_sample_model(created, modified),
                    None => true,
                }
            }
            AssetKind::UserInterface if ext.eq_ignore_ascii_case("rui") => {
                replace_workspace(path)
            }
            _ => true,
        }
    }
}

fn log_compatibility(compatible: bool, title: &str, host: &HostDescriptor) {
    if compatible {
        tracing::info!("Package '{title}' is compatible with host {}", host.version);
    } else {
        tracing::debug!("Package '{title}' NOT compatible with host {}", host.version);
    }
}

/// Toolbar cache files are rebuilt by the host; stale ones hide new UI.
fn delete_toolbar_caches(destination: &Path, cx: &HandlerContext<'_>) {
    let pattern = format!(
        "{}/*.tb",
        glob::Pattern::escape(&destination.to_string_lossy())
    );
    let Ok(paths) = glob::glob(&pattern) else {
        return;
    };
    for path in paths.filter_map(Result::ok) {
        if let Err(e) = std::fs::remove_file(&path) {
            cx.events
                .debug(format!("Could not delete {}: {e}; will retry next time", path.display()));
        }
    }
}

fn file_times(path: &Path) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let created = meta.created().unwrap_or(modified);
    Some((created.into(), modified.into()))
}

fn cutoff(year: i32, month: u32, day: u32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).single()
}

/// Sample models are replaced unless the user has edited them since they
/// were installed.
///
/// Installs before 2011-03-15 did not align the created and modified times,
/// so those files are always replaced.
pub fn replace_sample_model(created: DateTime<Utc>, modified: DateTime<Utc>) -> bool {
    if cutoff(2011, 3, 15).is_some_and(|c| created < c) {
        return true;
    }
    if created > modified {
        return true;
    }
    (modified - created).num_milliseconds() <= 3_000
}

/// Workspace files older than 2012-09-07 are replaced after saving a copy
/// beside them; newer ones belong to the user.
fn replace_workspace(path: &Path) -> bool {
    let Some((created, _)) = file_times(path) else {
        return true;
    };
    if !cutoff(2012, 9, 7).is_some_and(|c| created < c) {
        return false;
    }
    if let Some(folder) = path.parent() {
        let backup = folder.join("default (old 1).rui");
        if let Err(e) = std::fs::copy(path, &backup) {
            tracing::debug!("Could not save {}: {e}", backup.display());
        }
    }
    true
}
