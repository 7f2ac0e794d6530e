//! Facts about one compiled plugin binary, as reported by the plugin probe.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::host::HostError;
use crate::xml::XmlElement;
use crate::{HostDescriptor, HostPlatform, OsPlatform, PackageVersion, SCHEMA_VERSION};

const ROOT: &str = "PluginInfo";
const DESCRIPTOR_SUFFIX: &str = ".inspect.xml";

/// Metadata extracted from a plugin binary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PluginDescriptor {
    /// Path of the inspected binary.
    pub path: PathBuf,
    /// Plugin identity shared by every build of the plugin.
    pub id: Uuid,
    /// Display name.
    pub title: String,
    /// Plugin version.
    pub version: PackageVersion,
    /// Bitness of the binary.
    pub os: OsPlatform,
    /// Major version of the host the binary links against.
    pub host_major: u32,
    /// SDK version the plugin was built with, if reported.
    pub sdk_version: String,
    /// SDK service release the plugin was built with, if reported.
    pub sdk_service_release: String,
}

impl PluginDescriptor {
    /// Whether the probe filled in everything needed to install the plugin.
    pub fn is_valid(&self) -> bool {
        !self.id.is_nil()
            && !self.title.is_empty()
            && !self.version.is_zero()
            && self.platform().is_concrete()
    }

    /// Host platform this binary loads into.
    pub fn platform(&self) -> HostPlatform {
        HostPlatform::from_parts(self.os, self.host_major)
    }

    /// Whether this binary can be loaded by `host`.
    pub fn is_compatible(&self, host: &HostDescriptor) -> bool {
        self.platform() == host.platform()
    }

    /// Read the descriptor written beside a plugin binary.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Unsupported`] if the document is not a plugin
    /// descriptor or a field cannot be parsed.
    pub fn read_file(path: &Path) -> Result<Self, HostError> {
        let root = XmlElement::read_file(path)?;
        if root.name != ROOT || root.attribute("Version") != Some(SCHEMA_VERSION) {
            return Err(HostError::Unsupported(format!(
                "expected <{ROOT} Version=\"{SCHEMA_VERSION}\"> root"
            )));
        }
        let text = |name: &str| root.child_text(name).unwrap_or_default().to_string();
        let bad = |field: &str, value: &str| {
            HostError::Unsupported(format!("bad {field} '{value}' in plugin descriptor"))
        };

        let id_text = text("ID");
        let version_text = text("Version");
        let os_text = text("OSPlatform");
        let major_text = text("RhinoMajor");

        Ok(Self {
            path: PathBuf::from(text("Path")),
            id: Uuid::parse_str(&id_text).map_err(|_| bad("ID", &id_text))?,
            title: text("Title"),
            version: version_text
                .parse()
                .map_err(|_| bad("Version", &version_text))?,
            os: os_text.parse().map_err(|_| bad("OSPlatform", &os_text))?,
            host_major: major_text
                .parse()
                .map_err(|_| bad("RhinoMajor", &major_text))?,
            sdk_version: text("RhinoSdkVersion"),
            sdk_service_release: text("RhinoSdkServiceRelease"),
        })
    }

    /// Write this descriptor to a file.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Xml`] if the file cannot be written.
    pub fn write_file(&self, path: &Path) -> Result<(), HostError> {
        let mut root = XmlElement::new(ROOT).attr("Version", SCHEMA_VERSION);
        root.push(XmlElement::with_text("Path", self.path.display().to_string()));
        root.push(XmlElement::with_text("ID", self.id.to_string()));
        root.push(XmlElement::with_text("Title", &self.title));
        root.push(XmlElement::with_text("Version", self.version.to_string()));
        root.push(XmlElement::with_text("OSPlatform", self.os.as_str()));
        root.push(XmlElement::with_text(
            "RhinoMajor",
            self.host_major.to_string(),
        ));
        root.push(XmlElement::with_text("RhinoSdkVersion", &self.sdk_version));
        root.push(XmlElement::with_text(
            "RhinoSdkServiceRelease",
            &self.sdk_service_release,
        ));
        root.write_file(path)?;
        Ok(())
    }
}

/// Where the plugin probe writes its descriptor for `plugin`.
///
/// ```
/// use std::path::Path;
/// use rhi_schema::plugin_descriptor_path;
///
/// assert_eq!(
///     plugin_descriptor_path(Path::new("/tmp/Tool.rhp")),
///     Path::new("/tmp/Tool.rhp.inspect.xml")
/// );
/// ```
pub fn plugin_descriptor_path(plugin: &Path) -> PathBuf {
    let mut name = plugin.as_os_str().to_owned();
    name.push(DESCRIPTOR_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_round_trip_and_compatibility() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = PluginDescriptor {
            path: dir.path().join("Tool.rhp"),
            id: Uuid::parse_str("5b3c3f8a-1f0e-4a77-9d21-0d6c2b8e4f10").unwrap(),
            title: "Tool".into(),
            version: PackageVersion::new(1, 2, 0, 0),
            os: OsPlatform::X64,
            host_major: 5,
            sdk_version: "201107275".into(),
            sdk_service_release: "201107275".into(),
        };
        let path = plugin_descriptor_path(&plugin.path);
        plugin.write_file(&path).unwrap();
        let read = PluginDescriptor::read_file(&path).unwrap();
        assert_eq!(read, plugin);
        assert!(read.is_valid());

        let host = HostDescriptor {
            version: PackageVersion::new(5, 0, 0, 0),
            os: OsPlatform::X64,
            ..HostDescriptor::default()
        };
        assert!(read.is_compatible(&host));
        let x86_host = HostDescriptor {
            os: OsPlatform::X86,
            ..host
        };
        assert!(!read.is_compatible(&x86_host));
    }
}
