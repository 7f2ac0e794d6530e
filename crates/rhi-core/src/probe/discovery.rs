//! Host discovery: find install locations in the configuration store, probe
//! each executable out of process and read back the descriptors.

use std::path::{Path, PathBuf};

use rhi_schema::{HostDescriptor, Phase, is_probe_file_name};
use tokio_util::sync::CancellationToken;

use super::{ProbeArch, ProbeRunner};
use crate::reporter::EventSink;
use crate::store::{ConfigStore, Hive};

const INSTALL_PATH_VALUE: &str = "InstallPath";

/// Where to look for one host family.
struct Lookup {
    /// Parent key; with `per_build`, each subkey holds its own `Install`.
    key: &'static str,
    per_build: bool,
    exe: &'static str,
    /// Only present in the 64-bit view of the machine hive.
    wow64: bool,
}

const LOOKUPS: [Lookup; 5] = [
    Lookup {
        key: r"Software\McNeel\Rhinoceros\4.0",
        per_build: true,
        exe: "Rhino4.exe",
        wow64: false,
    },
    Lookup {
        key: r"Software\McNeel\Rhinoceros\5.0",
        per_build: false,
        exe: "Rhino4.exe",
        wow64: false,
    },
    Lookup {
        key: r"Software\Wow6432Node\McNeel\Rhinoceros\4.0",
        per_build: true,
        exe: "Rhino4.exe",
        wow64: true,
    },
    Lookup {
        key: r"Software\Wow6432Node\McNeel\Rhinoceros\5.0",
        per_build: false,
        exe: "Rhino4.exe",
        wow64: true,
    },
    Lookup {
        key: r"Software\McNeel\Rhinoceros\5.0x64",
        per_build: false,
        exe: "Rhino.exe",
        wow64: true,
    },
];

/// A host executable named by the configuration store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCandidate {
    pub exe: PathBuf,
    /// Key the install path was read from.
    pub key: String,
}

/// Host executables recorded in the machine hive, first occurrence wins.
///
/// The `Wow6432Node` and 64-bit-only keys are read only when `engine_64`.
pub fn registry_candidates(store: &dyn ConfigStore, engine_64: bool) -> Vec<HostCandidate> {
    let mut candidates: Vec<HostCandidate> = Vec::new();
    for lookup in LOOKUPS.iter().filter(|l| engine_64 || !l.wow64) {
        let install_keys = if lookup.per_build {
            match store.subkeys(Hive::LocalMachine, lookup.key) {
                Ok(builds) if !builds.is_empty() => builds
                    .iter()
                    .map(|b| format!(r"{}\{b}\Install", lookup.key))
                    .collect(),
                Ok(_) => {
                    tracing::debug!(r"REG: key not found: HKLM\{}", lookup.key);
                    Vec::new()
                }
                Err(e) => {
                    tracing::debug!(r"REG: HKLM\{}: {e}", lookup.key);
                    Vec::new()
                }
            }
        } else {
            vec![format!(r"{}\Install", lookup.key)]
        };

        for key in install_keys {
            match store.read_string(Hive::LocalMachine, &key, INSTALL_PATH_VALUE) {
                Ok(Some(install)) => {
                    let exe = Path::new(install.trim()).join("System").join(lookup.exe);
                    tracing::debug!(r"REG: HKLM\{key}\{INSTALL_PATH_VALUE} = {}", exe.display());
                    let seen = candidates.iter().any(|c| {
                        c.exe
                            .to_string_lossy()
                            .eq_ignore_ascii_case(&exe.to_string_lossy())
                    });
                    if !seen {
                        candidates.push(HostCandidate { exe, key });
                    }
                }
                Ok(None) => tracing::debug!(r"REG: HKLM\{key}\{INSTALL_PATH_VALUE} (not found)"),
                Err(e) => tracing::debug!(r"REG: HKLM\{key}: {e}"),
            }
        }
    }
    candidates
}

/// Delete leftover descriptor files from an earlier pass.
pub fn remove_probe_files(folder: &Path) {
    let Ok(entries) = std::fs::read_dir(folder) else {
        return;
    };
    for entry in entries.filter_map(Result::ok) {
        if entry.file_name().to_str().is_some_and(is_probe_file_name) {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::debug!("Could not delete {}: {e}", entry.path().display());
            }
        }
    }
}

/// Probe every candidate and return the valid hosts.
///
/// A missing executable is skipped without spawning anything. A probe that
/// fails or times out only loses that host. Cancellation stops launching
/// new probes; descriptors already written are still read.
pub fn discover_hosts(
    candidates: &[HostCandidate],
    runner: &dyn ProbeRunner,
    workdir: &Path,
    token: &CancellationToken,
    events: &EventSink,
) -> Vec<HostDescriptor> {
    remove_probe_files(workdir);

    for candidate in candidates {
        if token.is_cancelled() {
            break;
        }
        let exe = &candidate.exe;
        if !exe.is_file() {
            events.info(format!("Could not find host executable: {}", exe.display()));
            continue;
        }
        events.debug(format!("Host found here: {}", exe.display()));
        let rc = runner.inspect_host(exe, workdir, ProbeArch::X86);
        if rc != Phase::SUCCESS && runner.can_run_64_bit() {
            events.debug(format!("32-bit probe returned {rc}; retrying as 64-bit"));
            runner.inspect_host(exe, workdir, ProbeArch::X64);
        }
    }

    read_probe_files(workdir, events)
}

fn read_probe_files(workdir: &Path, events: &EventSink) -> Vec<HostDescriptor> {
    let mut files: Vec<PathBuf> = match std::fs::read_dir(workdir) {
        Ok(entries) => entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_str().is_some_and(is_probe_file_name))
            .map(|e| e.path())
            .collect(),
        Err(e) => {
            events.warn(format!("Cannot read {}: {e}", workdir.display()));
            return Vec::new();
        }
    };
    files.sort();

    files
        .iter()
        .filter_map(|path| match HostDescriptor::read_file(path) {
            Ok(host) if host.is_valid() => Some(host),
            Ok(host) => {
                events.debug(format!(
                    "Ignoring incomplete host descriptor {} for {}",
                    path.display(),
                    host.exe_path.display()
                ));
                None
            }
            Err(e) => {
                events.warn(format!("Unreadable host descriptor {}: {e}", path.display()));
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonStore;
    use rhi_schema::{OsPlatform, PackageVersion};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn set_install(store: &JsonStore, key: &str, path: &str) {
        store
            .write_string(Hive::LocalMachine, key, INSTALL_PATH_VALUE, path)
            .unwrap();
    }

    #[test]
    fn test_registry_candidates_respect_bitness_and_dedupe() {
        let store = JsonStore::in_memory();
        set_install(&store, r"Software\McNeel\Rhinoceros\4.0\2009-12-14\Install", "/r4");
        set_install(&store, r"Software\McNeel\Rhinoceros\5.0\Install", "/r5");
        set_install(&store, r"Software\Wow6432Node\McNeel\Rhinoceros\5.0\Install", "/R5");
        set_install(&store, r"Software\McNeel\Rhinoceros\5.0x64\Install", "/r5x64");

        let exes = |engine_64| -> Vec<PathBuf> {
            registry_candidates(&store, engine_64)
                .into_iter()
                .map(|c| c.exe)
                .collect()
        };
        let system = |root: &str, exe: &str| Path::new(root).join("System").join(exe);

        assert_eq!(
            exes(false),
            [system("/r4", "Rhino4.exe"), system("/r5", "Rhino4.exe")]
        );
        assert_eq!(
            exes(true),
            [
                system("/r4", "Rhino4.exe"),
                system("/r5", "Rhino4.exe"),
                system("/r5x64", "Rhino.exe"),
            ]
        );
    }

    /// Writes a descriptor for executables it knows and records each call.
    struct FakeRunner {
        hosts: Vec<HostDescriptor>,
        calls: Mutex<Vec<(PathBuf, ProbeArch)>>,
        x86_fails: bool,
    }

    impl ProbeRunner for FakeRunner {
        fn inspect_host(&self, exe: &Path, workdir: &Path, arch: ProbeArch) -> Phase {
            self.calls.lock().unwrap().push((exe.to_path_buf(), arch));
            if self.x86_fails && arch == ProbeArch::X86 {
                return Phase::Unknown;
            }
            match self.hosts.iter().find(|h| h.exe_path == exe) {
                Some(host) => {
                    host.write_file(&workdir.join(host.probe_file_name())).unwrap();
                    Phase::SUCCESS
                }
                None => Phase::NotCompatible,
            }
        }

        fn inspect_plugin(&self, _: &Path, _: ProbeArch) -> Phase {
            Phase::InspectFailed
        }

        fn can_run_64_bit(&self) -> bool {
            true
        }
    }

    fn host(exe: &Path) -> HostDescriptor {
        HostDescriptor {
            version: PackageVersion::new(5, 1, 20927, 2011),
            edition: "Commercial".into(),
            exe_path: exe.to_path_buf(),
            sdk_version: "201107275".into(),
            sdk_service_release: "201209275".into(),
            bindings: BTreeMap::from([("RhinoCommon".to_string(), "5.1.30000.14".to_string())]),
            os: OsPlatform::X64,
        }
    }

    #[test]
    fn test_discover_hosts_probes_existing_executables_only() {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path().join("work");
        std::fs::create_dir(&workdir).unwrap();
        std::fs::write(workdir.join("__~~RhinoInfo~~__stale.tmp.xml"), b"<junk/>").unwrap();

        let present = dir.path().join("Rhino.exe");
        std::fs::write(&present, b"MZ").unwrap();
        let missing = dir.path().join("gone").join("Rhino.exe");

        let runner = FakeRunner {
            hosts: vec![host(&present)],
            calls: Mutex::new(Vec::new()),
            x86_fails: true,
        };
        let candidates = [
            HostCandidate {
                exe: missing,
                key: "a".into(),
            },
            HostCandidate {
                exe: present.clone(),
                key: "b".into(),
            },
        ];
        let (events, _rx) = EventSink::channel();
        let hosts = discover_hosts(
            &candidates,
            &runner,
            &workdir,
            &CancellationToken::new(),
            &events,
        );

        assert_eq!(hosts, [host(&present)]);
        assert_eq!(
            *runner.calls.lock().unwrap(),
            [(present.clone(), ProbeArch::X86), (present, ProbeArch::X64)]
        );
    }

    #[test]
    fn test_cancelled_discovery_launches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("Rhino.exe");
        std::fs::write(&exe, b"MZ").unwrap();
        let runner = FakeRunner {
            hosts: vec![host(&exe)],
            calls: Mutex::new(Vec::new()),
            x86_fails: false,
        };
        let token = CancellationToken::new();
        token.cancel();
        let (events, _rx) = EventSink::channel();
        let hosts = discover_hosts(
            &[HostCandidate {
                exe,
                key: String::new(),
            }],
            &runner,
            dir.path(),
            &token,
            &events,
        );
        assert!(hosts.is_empty());
        assert!(runner.calls.lock().unwrap().is_empty());
    }
}
