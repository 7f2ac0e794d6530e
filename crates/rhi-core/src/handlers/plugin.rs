//! Compiled plugins (`.rhp`).
//!
//! A plugin package may bundle one binary per architecture. Every binary is
//! inspected out of process; all that inspect successfully must share one
//! GUID, and each compatible host gets the newest binary it can load.

use std::path::{Path, PathBuf};

use rhi_schema::{
    ContentType, HostDescriptor, HostPlatform, InstallRoot, InstallUser, Manifest, OsPlatform,
    PackageInstallState, PackageVersion, Phase, PluginDescriptor, plugin_descriptor_path,
};
use uuid::Uuid;

use super::{ContentHandler, HandlerContext, HandlerError, expand_folder, versioned_install_state};
use crate::archive::{FileEntry, Package};
use crate::probe::{ProbeArch, engine_is_64_bit};
use crate::store::Hive;

pub(crate) const RHP_PATTERN: &str = r".*rhp$";
const FOLDER_TEMPLATE: &str = "Plug-ins/$(PACKAGE_TITLE) {$(PACKAGE_ID)}/$(PACKAGE_VERSION)";

/// One inspected binary and the archive entry it came from.
#[derive(Debug, Clone)]
struct InspectedPlugin {
    entry: FileEntry,
    descriptor: PluginDescriptor,
}

#[derive(Debug, Clone, Default)]
pub struct PluginHandler {
    package_path: PathBuf,
    plugins: Vec<InspectedPlugin>,
}

impl PluginHandler {
    pub fn id(&self) -> Uuid {
        self.plugins
            .first()
            .map(|p| p.descriptor.id)
            .unwrap_or_else(Uuid::nil)
    }

    /// Highest version among the bundled binaries.
    pub fn version(&self) -> PackageVersion {
        self.plugins
            .iter()
            .map(|p| p.descriptor.version)
            .max()
            .unwrap_or_default()
    }

    pub fn title(&self) -> &str {
        self.plugins
            .first()
            .map(|p| p.descriptor.title.as_str())
            .unwrap_or_default()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &PluginDescriptor> {
        self.plugins.iter().map(|p| &p.descriptor)
    }

    /// Newest bundled binary `host` can load; the first wins a tie.
    fn newest_for(&self, host: &HostDescriptor) -> Option<&InspectedPlugin> {
        self.plugins
            .iter()
            .filter(|p| p.descriptor.is_compatible(host))
            .reduce(|best, p| {
                if p.descriptor.version > best.descriptor.version {
                    p
                } else {
                    best
                }
            })
    }

    fn register(
        &self,
        plugin: &PluginDescriptor,
        file: &Path,
        host: &HostDescriptor,
        user: InstallUser,
        cx: &HandlerContext<'_>,
    ) -> Result<(), HandlerError> {
        let machine_wide = user == InstallUser::AllUsers;
        let hive = if machine_wide {
            Hive::LocalMachine
        } else {
            Hive::CurrentUser
        };
        let key = format!(
            r"{}\{}",
            host.plugin_key(machine_wide, engine_is_64_bit())?,
            plugin.id.to_string().to_uppercase()
        );
        cx.events.info(format!("Registering plugin {} under {key}", file.display()));
        cx.store.write_string(hive, &key, "Name", &plugin.title)?;
        cx.store
            .write_string(hive, &key, "FileName", &file.display().to_string())?;
        // Forces the host to load the new binary instead of a cached state.
        cx.store.delete_value(hive, &key, "LoadMode")?;
        Ok(())
    }
}

/// Inspect one binary: 32-bit first, then 64-bit when the 32-bit probe
/// could not decide.
fn inspect(path: &Path, cx: &HandlerContext<'_>) -> Phase {
    cx.events
        .debug(format!("Executing 32-bit plugin inspector for '{}'", path.display()));
    let rc = cx.probe.inspect_plugin(path, ProbeArch::X86);
    match rc {
        Phase::Complete | Phase::NotCompatible => rc,
        _ if cx.probe.can_run_64_bit() => {
            cx.events
                .debug(format!("Executing 64-bit plugin inspector for '{}'", path.display()));
            cx.probe.inspect_plugin(path, ProbeArch::X64)
        }
        _ => rc,
    }
}

impl ContentHandler for PluginHandler {
    fn content_type(&self) -> ContentType {
        ContentType::Plugin
    }

    fn recognizes_payload(&mut self, package: &mut Package, cx: &HandlerContext<'_>) -> bool {
        match package.find_all(RHP_PATTERN) {
            Ok(files) => {
                cx.events.info(format!("Found {} plug-ins", files.len()));
                !files.is_empty()
            }
            Err(e) => {
                cx.events.debug(format!("Plugin scan failed: {e}"));
                false
            }
        }
    }

    fn initialize(&mut self, package: &mut Package, cx: &HandlerContext<'_>) -> Result<(), HandlerError> {
        self.package_path = package.path().to_path_buf();
        self.plugins.clear();

        for entry in package.find_all(RHP_PATTERN)? {
            let path = package.materialize(&entry.key)?;
            let rc = inspect(&path, cx);
            if rc != Phase::SUCCESS {
                cx.events
                    .debug(format!("Skipping {}: inspector returned {rc}", entry.key));
                continue;
            }
            let descriptor = match PluginDescriptor::read_file(&plugin_descriptor_path(&path)) {
                Ok(d) => d,
                Err(e) => {
                    cx.events
                        .warn(format!("Unreadable inspection result for {}: {e}", entry.key));
                    continue;
                }
            };
            if let Some(first) = self.plugins.first().map(|p| p.descriptor.id) {
                if descriptor.id != first {
                    cx.events.error(format!(
                        "Plug-in GUID mismatch: {} != {first}",
                        descriptor.id
                    ));
                    return Err(HandlerError::GuidMismatch {
                        first,
                        second: descriptor.id,
                    });
                }
            }
            self.plugins.push(InspectedPlugin { entry, descriptor });
        }

        if self.plugins.is_empty() {
            cx.events.error("Plug-in inspection failed");
            return Err(HandlerError::PackageNotCompatible(self.package_path.clone()));
        }
        cx.events.info(self.describe());
        Ok(())
    }

    fn manifest(&self) -> Manifest {
        let mut platforms: Vec<HostPlatform> = Vec::new();
        for platform in self.descriptors().map(PluginDescriptor::platform) {
            if !platforms.contains(&platform) {
                platforms.push(platform);
            }
        }
        let mut oses = self.descriptors().map(|d| d.os);
        let os = match oses.next() {
            Some(first) if oses.all(|o| o == first) => first,
            Some(_) => OsPlatform::Any,
            None => OsPlatform::Unknown,
        };
        Manifest {
            version: self.version(),
            content_type: ContentType::Plugin,
            package_path: self.package_path.display().to_string(),
            title: self.title().to_string(),
            id: self.id(),
            os,
            platforms,
            ..Manifest::default()
        }
    }

    fn install_root(&self) -> InstallRoot {
        InstallRoot::CurrentUserRoaming
    }

    fn install_folder(&self, root: &Path) -> Result<PathBuf, HandlerError> {
        expand_folder(root, FOLDER_TEMPLATE, &self.manifest())
    }

    fn install_state(
        &self,
        cx: &HandlerContext<'_>,
        user: InstallUser,
    ) -> Result<PackageInstallState, HandlerError> {
        let folder = self.install_folder(cx.layout.root_for(self.install_root(), user))?;
        Ok(versioned_install_state(&folder, self.version(), user))
    }

    fn is_compatible(&self, host: &HostDescriptor) -> bool {
        self.descriptors().any(|d| d.is_compatible(host))
    }

    fn after_install(
        &self,
        _package: &Package,
        destination: &Path,
        hosts: &[HostDescriptor],
        user: InstallUser,
        cx: &HandlerContext<'_>,
    ) -> bool {
        let mut ok = true;
        for host in hosts {
            let Some(plugin) = self.newest_for(host) else {
                continue;
            };
            let Some(relative) = plugin.entry.relative_path() else {
                ok = false;
                continue;
            };
            let file = destination.join(relative);
            if let Err(e) = self.register(&plugin.descriptor, &file, host, user, cx) {
                cx.events.error(format!(
                    "Plug-in registration failed for host {}: {e}",
                    host.exe_path.display()
                ));
                ok = false;
            }
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(os: OsPlatform, version: PackageVersion) -> PluginDescriptor {
        PluginDescriptor {
            id: Uuid::parse_str("5b3c3f8a-1f0e-4a77-9d21-0d6c2b8e4f10").unwrap(),
            title: "Tool".into(),
            version,
            os,
            host_major: 5,
            ..PluginDescriptor::default()
        }
    }

    fn handler(plugins: &[(&str, PluginDescriptor)]) -> PluginHandler {
        PluginHandler {
            package_path: PathBuf::from("tool.rhi"),
            plugins: plugins
                .iter()
                .map(|(key, d)| InspectedPlugin {
                    entry: FileEntry {
                        key: (*key).to_string(),
                    },
                    descriptor: d.clone(),
                })
                .collect(),
        }
    }

    fn host(os: OsPlatform) -> HostDescriptor {
        HostDescriptor {
            version: PackageVersion::new(5, 0, 0, 0),
            os,
            ..HostDescriptor::default()
        }
    }

    #[test]
    fn test_compatible_iff_some_binary_matches_platform() {
        let h = handler(&[("x64/Tool.rhp", descriptor(OsPlatform::X64, PackageVersion::new(1, 0, 0, 0)))]);
        assert!(h.is_compatible(&host(OsPlatform::X64)));
        assert!(!h.is_compatible(&host(OsPlatform::X86)));
    }

    #[test]
    fn test_identity_comes_from_binaries() {
        let h = handler(&[
            ("x86/Tool.rhp", descriptor(OsPlatform::X86, PackageVersion::new(1, 0, 0, 0))),
            ("x64/Tool.rhp", descriptor(OsPlatform::X64, PackageVersion::new(1, 2, 0, 0))),
        ]);
        let manifest = h.manifest();
        assert_eq!(manifest.version, PackageVersion::new(1, 2, 0, 0));
        assert_eq!(manifest.title, "Tool");
        assert_eq!(manifest.os, OsPlatform::Any);
        assert_eq!(manifest.platforms, [HostPlatform::Host5Win32, HostPlatform::Host5Win64]);
        assert_eq!(
            h.install_folder(Path::new("/r")).unwrap(),
            Path::new("/r/Plug-ins/Tool {5B3C3F8A-1F0E-4A77-9D21-0D6C2B8E4F10}/1.2.0.0")
        );
    }

    #[test]
    fn test_newest_compatible_binary_wins() {
        let h = handler(&[
            ("a/Tool.rhp", descriptor(OsPlatform::X64, PackageVersion::new(1, 0, 0, 0))),
            ("b/Tool.rhp", descriptor(OsPlatform::X64, PackageVersion::new(1, 1, 0, 0))),
            ("c/Tool.rhp", descriptor(OsPlatform::X86, PackageVersion::new(9, 0, 0, 0))),
        ]);
        let chosen = h.newest_for(&host(OsPlatform::X64)).unwrap();
        assert_eq!(chosen.entry.key, "b/Tool.rhp");
    }
}
