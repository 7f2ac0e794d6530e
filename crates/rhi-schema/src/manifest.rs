//! Package manifest (`package.xml`).
//!
//! Every package carries one manifest. After installation the same file is
//! written into the destination folder with an [`InstallRecord`] appended,
//! which later runs read to decide whether a package is already installed
//! and which files belong to it.
//!
//! Content handlers may keep their own data inside the `<Package>` element.
//! Children this module does not know are preserved in [`Manifest::extra`]
//! and written back unchanged.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::xml::{XmlElement, XmlError};
use crate::{ContentType, HostPlatform, OsPlatform, PackageVersion, SCHEMA_VERSION};

/// File name of the manifest inside a package and inside an install folder.
pub const MANIFEST_FILE_NAME: &str = "package.xml";

const ROOT: &str = "RhinoInstaller";
const PACKAGE: &str = "Package";
const INSTALL_FOLDER: &str = "InstallFolder";
const INSTALLED_FILES: &str = "InstalledFiles";
const KNOWN_PACKAGE_FIELDS: [&str; 9] = [
    "Version",
    "ContentType",
    "PackagePath",
    "Title",
    "UpdateUrl",
    "ID",
    "OS",
    "Locale",
    "RhinoPlatform",
];

/// Errors raised while reading a manifest.
#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    /// No manifest file exists at the given location.
    #[error("Manifest not found: {0}")]
    NotFound(PathBuf),

    /// The document is not a manifest this build can read.
    #[error("Unsupported manifest: {0}")]
    Unsupported(String),

    /// The package author wrote an invalid value.
    #[error("Package authoring error: {0}")]
    Authoring(String),

    /// The `OS` field is not a known operating system.
    #[error("Invalid operating system '{0}'")]
    InvalidOperatingSystem(String),

    /// The XML could not be read or written.
    #[error(transparent)]
    Xml(#[from] XmlError),
}

/// Where a package was installed and what it installed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InstallRecord {
    /// Absolute destination folder.
    pub install_folder: PathBuf,
    /// Absolute paths of every file written by the install.
    pub installed_files: Vec<PathBuf>,
}

/// Typed package metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Value of the root `Version` attribute.
    pub schema_version: String,
    /// Package version.
    pub version: PackageVersion,
    /// Declared content type.
    pub content_type: ContentType,
    /// Folder the manifest was loaded from, if any.
    pub package_path: String,
    /// Display title.
    pub title: String,
    /// Where newer versions can be found.
    pub update_url: String,
    /// Package identity.
    pub id: Uuid,
    /// Bitness the package targets.
    pub os: OsPlatform,
    /// Locale name such as `en-US`, or `None` for locale-neutral content.
    pub locale: Option<String>,
    /// Host platforms the package supports.
    pub platforms: Vec<HostPlatform>,
    /// Handler-specific children of `<Package>`.
    pub extra: Vec<XmlElement>,
    /// Present once the package has been installed.
    pub install_record: Option<InstallRecord>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            version: PackageVersion::ZERO,
            content_type: ContentType::Unknown,
            package_path: String::new(),
            title: String::new(),
            update_url: String::new(),
            id: Uuid::nil(),
            os: OsPlatform::Unknown,
            locale: None,
            platforms: Vec::new(),
            extra: Vec::new(),
            install_record: None,
        }
    }
}

impl Manifest {
    /// Whether this manifest describes an installable package of `required`
    /// content.
    pub fn is_valid(&self, required: ContentType) -> bool {
        !self.title.is_empty()
            && !self.id.is_nil()
            && required != ContentType::Unknown
            && self.content_type == required
            && self.os != OsPlatform::Unknown
            && !self.version.is_zero()
            && !self.platforms.is_empty()
            && self.platforms.iter().all(|p| *p != HostPlatform::Unknown)
    }

    /// Whether `platform` is one of the declared host platforms.
    pub fn supports(&self, platform: HostPlatform) -> bool {
        self.platforms.contains(&platform)
    }

    /// Locale name, or an empty string for locale-neutral packages.
    pub fn locale_name(&self) -> &str {
        self.locale.as_deref().unwrap_or("")
    }

    /// Read `package.xml` from a folder.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::NotFound`] if the folder has no manifest and
    /// any error from [`Manifest::from_element`].
    pub fn read_from_folder(folder: &Path) -> Result<Self, ManifestError> {
        let path = folder.join(MANIFEST_FILE_NAME);
        let mut manifest = Self::read_file(&path)?;
        manifest.package_path = folder.display().to_string();
        Ok(manifest)
    }

    /// Read a manifest file.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::NotFound`] if the file does not exist and
    /// any error from [`Manifest::from_element`].
    pub fn read_file(path: &Path) -> Result<Self, ManifestError> {
        if !path.is_file() {
            return Err(ManifestError::NotFound(path.to_path_buf()));
        }
        let root = XmlElement::read_file(path)?;
        Self::from_element(&root)
    }

    /// Build a manifest from a parsed document root.
    ///
    /// # Errors
    ///
    /// * [`ManifestError::Unsupported`] when the root element is missing or
    ///   its `Version` attribute is not [`SCHEMA_VERSION`].
    /// * [`ManifestError::Authoring`] for a malformed GUID, version or host
    ///   platform.
    /// * [`ManifestError::InvalidOperatingSystem`] for an unknown `OS`.
    pub fn from_element(root: &XmlElement) -> Result<Self, ManifestError> {
        if root.name != ROOT {
            return Err(ManifestError::Unsupported(format!(
                "{ROOT} tag missing at document root"
            )));
        }
        let schema_version = root
            .attribute("Version")
            .ok_or_else(|| {
                ManifestError::Unsupported(format!("Version attribute of {ROOT} tag missing"))
            })?
            .to_string();
        if schema_version != SCHEMA_VERSION {
            return Err(ManifestError::Unsupported(format!(
                "{ROOT} version {schema_version} is not {SCHEMA_VERSION}"
            )));
        }

        let mut manifest = Self {
            schema_version,
            install_record: read_install_record(root),
            ..Self::default()
        };

        let Some(package) = root.child(PACKAGE) else {
            return Ok(manifest);
        };

        let version_text = package.child_text("Version").unwrap_or_default();
        manifest.version = version_text.parse().map_err(|_| {
            ManifestError::Authoring(format!("Version malformed: '{version_text}'"))
        })?;
        manifest.title = package.child_text("Title").unwrap_or_default().to_string();

        let id_text = package.child_text("ID").unwrap_or_default();
        manifest.id = Uuid::parse_str(id_text)
            .map_err(|_| ManifestError::Authoring(format!("GUID malformed: '{id_text}'")))?;

        manifest.update_url = package
            .child_text("UpdateUrl")
            .unwrap_or_default()
            .to_string();
        manifest.package_path = package
            .child_text("PackagePath")
            .unwrap_or_default()
            .to_string();

        let os_text = package.child_text("OS").unwrap_or_default();
        manifest.os = os_text
            .parse()
            .map_err(|_| ManifestError::InvalidOperatingSystem(os_text.to_string()))?;

        manifest.content_type = package
            .child_text("ContentType")
            .and_then(|t| t.parse().ok())
            .unwrap_or_default();

        for platform in package.children_named("RhinoPlatform") {
            let parsed: HostPlatform = platform.text.trim().parse().map_err(|_| {
                ManifestError::Authoring(format!("Unknown host platform '{}'", platform.text))
            })?;
            if parsed != HostPlatform::Unknown {
                manifest.platforms.push(parsed);
            }
        }

        manifest.locale = package
            .child_text("Locale")
            .filter(|l| {
                !l.is_empty()
                    && !l.eq_ignore_ascii_case("LocaleInvariant")
                    && !l.eq_ignore_ascii_case("Unknown")
            })
            .map(str::to_string);

        manifest.extra = package
            .children
            .iter()
            .filter(|c| !KNOWN_PACKAGE_FIELDS.contains(&c.name.as_str()))
            .cloned()
            .collect();

        Ok(manifest)
    }

    /// Build the document root for this manifest.
    pub fn to_element(&self) -> XmlElement {
        let mut root = XmlElement::new(ROOT).attr("Version", SCHEMA_VERSION);

        let mut package = XmlElement::new(PACKAGE);
        package.push(XmlElement::with_text("Version", self.version.to_string()));
        package.push(XmlElement::with_text(
            "ContentType",
            self.content_type.as_str(),
        ));
        package.push(XmlElement::with_text("PackagePath", &self.package_path));
        package.push(XmlElement::with_text("Title", &self.title));
        package.push(XmlElement::with_text("UpdateUrl", &self.update_url));
        package.push(XmlElement::with_text("ID", self.id.to_string()));
        package.push(XmlElement::with_text("OS", self.os.as_str()));
        if let Some(locale) = &self.locale {
            package.push(XmlElement::with_text("Locale", locale));
        }
        for platform in &self.platforms {
            package.push(XmlElement::with_text("RhinoPlatform", platform.as_str()));
        }
        for extra in &self.extra {
            package.push(extra.clone());
        }
        root.push(package);

        if let Some(record) = &self.install_record {
            root.push(XmlElement::with_text(
                INSTALL_FOLDER,
                record.install_folder.display().to_string(),
            ));
            let mut files = XmlElement::new(INSTALLED_FILES);
            for file in &record.installed_files {
                files.push(XmlElement::with_text("File", file.display().to_string()));
            }
            root.push(files);
        }

        root
    }

    /// Write this manifest to a file.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Xml`] if the file cannot be written.
    pub fn write_file(&self, path: &Path) -> Result<(), ManifestError> {
        self.to_element().write_file(path)?;
        Ok(())
    }
}

/// Append (or replace) the install record of an existing manifest document.
///
/// Unknown elements of the document are kept, so a manifest written by a
/// newer package format still round-trips.
pub fn append_install_record(root: &mut XmlElement, record: &InstallRecord) {
    root.remove_children(INSTALL_FOLDER);
    root.remove_children(INSTALLED_FILES);
    root.push(XmlElement::with_text(
        INSTALL_FOLDER,
        record.install_folder.display().to_string(),
    ));
    let mut files = XmlElement::new(INSTALLED_FILES);
    for file in &record.installed_files {
        files.push(XmlElement::with_text("File", file.display().to_string()));
    }
    root.push(files);
}

fn read_install_record(root: &XmlElement) -> Option<InstallRecord> {
    let folder = root.child_text(INSTALL_FOLDER)?;
    let installed_files = root
        .child(INSTALLED_FILES)
        .map(|files| {
            files
                .children_named("File")
                .map(|f| PathBuf::from(f.text.trim()))
                .collect()
        })
        .unwrap_or_default();
    Some(InstallRecord {
        install_folder: PathBuf::from(folder),
        installed_files,
    })
}
