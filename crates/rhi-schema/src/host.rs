//! Facts about one installed host application.
//!
//! A [`HostDescriptor`] is produced by the host probe running in a child
//! process, written to a transient XML file, and read back by the engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::xml::{XmlElement, XmlError};
use crate::{HostPlatform, OsPlatform, PackageVersion, SCHEMA_VERSION};

const ROOT: &str = "RhinoExeInfo";
const PROBE_FILE_PREFIX: &str = "__~~RhinoInfo~~__";

/// Binding assemblies recorded for every host, by element-name prefix.
pub const BINDING_NAMES: [&str; 2] = ["RhinoDotNet", "RhinoCommon"];

/// Errors raised by host descriptor operations.
#[derive(thiserror::Error, Debug)]
pub enum HostError {
    /// The descriptor file is not one this build can read.
    #[error("Unsupported host descriptor: {0}")]
    Unsupported(String),

    /// The host version cannot be turned into a registry build date.
    #[error("Host version improperly formatted: {0}")]
    BadVersion(String),

    /// No plugin registration location exists for this host.
    #[error("Unsupported host platform: {0}")]
    UnsupportedPlatform(String),

    /// The XML could not be read or written.
    #[error(transparent)]
    Xml(#[from] XmlError),
}

/// One discovered host installation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HostDescriptor {
    /// File version of the host executable.
    pub version: PackageVersion,
    /// Edition string from the version resource (e.g. `Commercial`).
    pub edition: String,
    /// Absolute path of the host executable.
    pub exe_path: PathBuf,
    /// SDK version the host exposes to plugins.
    pub sdk_version: String,
    /// SDK service release the host exposes to plugins.
    pub sdk_service_release: String,
    /// Versions of the host's managed binding assemblies, by name.
    pub bindings: BTreeMap<String, String>,
    /// Bitness of the host.
    pub os: OsPlatform,
}

impl HostDescriptor {
    /// Whether every field needed for compatibility checks is populated.
    pub fn is_valid(&self) -> bool {
        !self.version.is_zero()
            && !self.sdk_version.is_empty()
            && !self.sdk_service_release.is_empty()
            && self.bindings.values().any(|v| !v.is_empty())
            && !self.exe_path.as_os_str().is_empty()
            && self.os.is_concrete()
    }

    /// The host's platform tuple.
    pub fn platform(&self) -> HostPlatform {
        HostPlatform::from_parts(self.os, self.version.major)
    }

    /// File name the probe writes this descriptor to.
    pub fn probe_file_name(&self) -> String {
        probe_file_name(&self.version.to_string())
    }

    /// Build date (`YYYY-MM-DD`) encoded in a version-4 host's version number.
    ///
    /// Version-4 hosts encode the build as `4.0.YYYY.MDD` or `4.0.YYYY.MMDD`.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::BadVersion`] if the revision is not three or four
    /// digits long.
    ///
    /// ```
    /// use rhi_schema::{HostDescriptor, PackageVersion};
    ///
    /// let host = HostDescriptor {
    ///     version: PackageVersion::new(4, 0, 2009, 1214),
    ///     ..HostDescriptor::default()
    /// };
    /// assert_eq!(host.build_date().unwrap(), "2009-12-14");
    /// ```
    pub fn build_date(&self) -> Result<String, HostError> {
        if self.version.is_zero() {
            return Err(HostError::BadVersion("version is unset".to_string()));
        }
        let revision = self.version.revision.to_string();
        let (month, day) = match revision.len() {
            3 => (format!("0{}", &revision[..1]), &revision[1..]),
            4 => (revision[..2].to_string(), &revision[2..]),
            _ => return Err(HostError::BadVersion(self.version.to_string())),
        };
        Ok(format!("{}-{month}-{day}", self.version.build))
    }

    /// Registry key under which plugins are registered for this host.
    ///
    /// `machine_wide` selects the machine hive; `engine_is_64_bit` reports
    /// whether the calling process is 64-bit, in which case 32-bit hosts
    /// live under the `Wow6432Node` view of the machine hive.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::UnsupportedPlatform`] for host/engine bitness
    /// combinations that cannot be registered and [`HostError::BadVersion`]
    /// for major versions other than 4 and 5.
    pub fn plugin_key(
        &self,
        machine_wide: bool,
        engine_is_64_bit: bool,
    ) -> Result<String, HostError> {
        let software = if machine_wide && engine_is_64_bit && self.os == OsPlatform::X86 {
            r"Software\Wow6432Node\McNeel\Rhinoceros"
        } else {
            r"Software\McNeel\Rhinoceros"
        };
        let unsupported = || HostError::UnsupportedPlatform(self.os.to_string());

        match (self.version.major, self.version.minor, self.os) {
            (4, 0, OsPlatform::X86) => Ok(format!(
                r"{software}\4.0\{}\Plug-ins",
                self.build_date()?
            )),
            (4, 0, _) => Err(unsupported()),
            (5, _, OsPlatform::X86) => Ok(format!(r"{software}\5.0\Plug-ins")),
            (5, _, OsPlatform::X64) if engine_is_64_bit => {
                Ok(format!(r"{software}\5.0x64\Plug-ins"))
            }
            (5, _, _) => Err(unsupported()),
            _ => Err(HostError::BadVersion(self.version.to_string())),
        }
    }

    /// Read a descriptor file written by the probe.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Unsupported`] if the root element is missing or
    /// its version is not this schema's, or if a field cannot be parsed.
    pub fn read_file(path: &Path) -> Result<Self, HostError> {
        let root = XmlElement::read_file(path)?;
        Self::from_element(&root)
    }

    /// Build a descriptor from a parsed document root.
    ///
    /// # Errors
    ///
    /// As [`HostDescriptor::read_file`].
    pub fn from_element(root: &XmlElement) -> Result<Self, HostError> {
        if root.name != ROOT || root.attribute("Version") != Some(SCHEMA_VERSION) {
            return Err(HostError::Unsupported(format!(
                "expected <{ROOT} Version=\"{SCHEMA_VERSION}\"> root"
            )));
        }
        let text = |name: &str| root.child_text(name).unwrap_or_default().to_string();

        let version_text = text("RhinoVersion");
        let version = version_text
            .parse()
            .map_err(|_| HostError::Unsupported(format!("bad RhinoVersion '{version_text}'")))?;
        let os_text = text("OSPlatform");
        let os = os_text
            .parse()
            .map_err(|_| HostError::Unsupported(format!("bad OSPlatform '{os_text}'")))?;

        let bindings = BINDING_NAMES
            .iter()
            .filter_map(|name| {
                let value = text(&format!("{name}Version"));
                (!value.is_empty()).then(|| ((*name).to_string(), value))
            })
            .collect();

        Ok(Self {
            version,
            edition: text("Edition"),
            exe_path: PathBuf::from(text("RhinoExePath")),
            sdk_version: text("RhinoSdkVersion"),
            sdk_service_release: text("RhinoSdkServiceRelease"),
            bindings,
            os,
        })
    }

    /// Build the document root for this descriptor.
    pub fn to_element(&self) -> XmlElement {
        let mut root = XmlElement::new(ROOT).attr("Version", SCHEMA_VERSION);
        root.push(XmlElement::with_text("RhinoVersion", self.version.to_string()));
        root.push(XmlElement::with_text("Edition", &self.edition));
        root.push(XmlElement::with_text(
            "RhinoExePath",
            self.exe_path.display().to_string(),
        ));
        root.push(XmlElement::with_text("RhinoSdkVersion", &self.sdk_version));
        root.push(XmlElement::with_text(
            "RhinoSdkServiceRelease",
            &self.sdk_service_release,
        ));
        for name in BINDING_NAMES {
            let value = self.bindings.get(name).map(String::as_str).unwrap_or_default();
            root.push(XmlElement::with_text(format!("{name}Version"), value));
        }
        root.push(XmlElement::with_text("OSPlatform", self.os.as_str()));
        root
    }

    /// Write this descriptor to a file.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Xml`] if the file cannot be written.
    pub fn write_file(&self, path: &Path) -> Result<(), HostError> {
        self.to_element().write_file(path)?;
        Ok(())
    }
}

/// Transient probe file name for a host version string.
pub fn probe_file_name(version: &str) -> String {
    format!("{PROBE_FILE_PREFIX}{version}.tmp.xml")
}

/// Whether a file name looks like a leftover probe result.
pub fn is_probe_file_name(name: &str) -> bool {
    name.starts_with(PROBE_FILE_PREFIX)
        && Path::new(name)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host5_x64() -> HostDescriptor {
        HostDescriptor {
            version: PackageVersion::new(5, 1, 20927, 2011),
            edition: "Commercial".into(),
            exe_path: PathBuf::from(r"C:\Program Files\Rhinoceros 5 (64-bit)\System\Rhino.exe"),
            sdk_version: "201107275".into(),
            sdk_service_release: "201209275".into(),
            bindings: BTreeMap::from([("RhinoDotNet".to_string(), "5.1.50000.0".to_string())]),
            os: OsPlatform::X64,
        }
    }

    #[test]
    fn test_validity_requires_every_field() {
        let host = host5_x64();
        assert!(host.is_valid());
        assert_eq!(host.platform(), HostPlatform::Host5Win64);

        let mut no_sdk = host.clone();
        no_sdk.sdk_service_release.clear();
        assert!(!no_sdk.is_valid());

        let mut no_bindings = host.clone();
        no_bindings.bindings.clear();
        assert!(!no_bindings.is_valid());

        let mut any_os = host;
        any_os.os = OsPlatform::Any;
        assert!(!any_os.is_valid());
    }

    #[test]
    fn test_descriptor_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let host = host5_x64();
        let path = dir.path().join(host.probe_file_name());
        host.write_file(&path).unwrap();
        assert_eq!(HostDescriptor::read_file(&path).unwrap(), host);
        assert!(is_probe_file_name(&host.probe_file_name()));
    }

    #[test]
    fn test_other_schema_version_is_unsupported() {
        let mut root = host5_x64().to_element();
        for (key, value) in &mut root.attributes {
            if key == "Version" {
                *value = "1.0.0".to_string();
            }
        }
        assert!(matches!(
            HostDescriptor::from_element(&root),
            Err(HostError::Unsupported(_))
        ));
    }

    #[test]
    fn test_build_date_formats() {
        let mut host = HostDescriptor {
            version: PackageVersion::new(4, 0, 2010, 401),
            ..HostDescriptor::default()
        };
        assert_eq!(host.build_date().unwrap(), "2010-04-01");
        host.version = PackageVersion::new(4, 0, 2010, 12);
        assert!(host.build_date().is_err());
    }

    #[test]
    fn test_plugin_keys() {
        let x64 = host5_x64();
        assert_eq!(
            x64.plugin_key(false, true).unwrap(),
            r"Software\McNeel\Rhinoceros\5.0x64\Plug-ins"
        );
        assert!(x64.plugin_key(false, false).is_err());

        let v4 = HostDescriptor {
            version: PackageVersion::new(4, 0, 2009, 1214),
            os: OsPlatform::X86,
            ..HostDescriptor::default()
        };
        assert_eq!(
            v4.plugin_key(true, true).unwrap(),
            r"Software\Wow6432Node\McNeel\Rhinoceros\4.0\2009-12-14\Plug-ins"
        );
        assert_eq!(
            v4.plugin_key(false, true).unwrap(),
            r"Software\McNeel\Rhinoceros\4.0\2009-12-14\Plug-ins"
        );
    }
}
