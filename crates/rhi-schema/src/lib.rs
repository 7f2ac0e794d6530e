//! Shared data model for the rhiexec package installer.
//!
//! Everything in this crate is plain data plus the XML formats that cross
//! process and version boundaries: the package manifest (`package.xml`), the
//! host descriptor written by the host probe, and the plugin descriptor
//! written by the plugin probe.

pub mod host;
pub mod manifest;
pub mod phase;
pub mod platform;
pub mod plugin;
pub mod version;
pub mod xml;

// Re-exports
pub use host::{HostDescriptor, HostError, is_probe_file_name, probe_file_name};
pub use manifest::{
    InstallRecord, MANIFEST_FILE_NAME, Manifest, ManifestError, append_install_record,
};
pub use phase::{PackageInstallState, Phase};
pub use platform::*;
pub use plugin::{PluginDescriptor, plugin_descriptor_path};
pub use version::{PackageVersion, VersionError};
pub use xml::{XmlElement, XmlError};

/// Schema version written into every XML document produced by this crate.
pub const SCHEMA_VERSION: &str = "1.0.1";
