//! End-to-end engine runs against packages built on the fly.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use rhi_core::{
    Collaborators, ConfigStore, Engine, EngineConfig, HandlerSet, Hive, JsonStore, NullReporter,
    ProbeArch, ProbeRunner, Reporter,
};
use rhi_schema::{
    HostDescriptor, InstallUser, Manifest, OsPlatform, PackageVersion, Phase, PluginDescriptor,
    plugin_descriptor_path,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use zip::write::SimpleFileOptions;

const LOCALE_ID: &str = "2c6d7a3e-5f1b-4e8c-9a0d-1b2c3d4e5f60";
const TUTORIAL_ID: &str = "8f2a6c1e-0b4d-4c3a-9e77-2f5c6d7e8a90";
const PLUGIN_ID: &str = "5a1f3c2e-7d4b-4e9a-8c6f-0b1d2e3f4a5b";
const PYTHON_ID: &str = "08f2b7b0-eaef-4932-a583-e61e68d610a3";
const COMMAND_LIST: &str =
    r"Software\McNeel\Rhinoceros\5.0\Plug-Ins\814d908a-e25c-493d-97e9-ee3861957f49\CommandList";

fn manifest(content_type: &str, title: &str, id: &str, version: &str, platform: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<RhinoInstaller Version="1.0.1">
  <Package>
    <Version>{version}</Version>
    <ContentType>{content_type}</ContentType>
    <Title>{title}</Title>
    <ID>{id}</ID>
    <OS>any</OS>
    <Locale>de-DE</Locale>
    <RhinoPlatform>{platform}</RhinoPlatform>
  </Package>
</RhinoInstaller>"#
    )
}

fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
    let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
    for (name, data) in files {
        zip.start_file(*name, SimpleFileOptions::default()).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

/// Probe double: answers from fixed descriptors instead of spawning.
#[derive(Default)]
struct ScriptedProbe {
    hosts: Vec<HostDescriptor>,
    /// Host executables whose probe never answers, as after a timeout.
    silent: Vec<PathBuf>,
    /// Plugin descriptors by binary file name.
    plugins: HashMap<String, PluginDescriptor>,
    plugin_calls: Mutex<Vec<String>>,
}

impl ProbeRunner for ScriptedProbe {
    fn inspect_host(&self, exe: &Path, workdir: &Path, _: ProbeArch) -> Phase {
        if self.silent.iter().any(|s| s == exe) {
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

    fn inspect_plugin(&self, plugin: &Path, _: ProbeArch) -> Phase {
        let name = plugin.file_name().unwrap().to_string_lossy().into_owned();
        self.plugin_calls.lock().unwrap().push(name.clone());
        match self.plugins.get(&name) {
            Some(descriptor) => {
                let descriptor = PluginDescriptor {
                    path: plugin.to_path_buf(),
                    ..descriptor.clone()
                };
                descriptor.write_file(&plugin_descriptor_path(plugin)).unwrap();
                Phase::SUCCESS
            }
            None => Phase::NotCompatible,
        }
    }

    fn can_run_64_bit(&self) -> bool {
        false
    }
}

struct Fixture {
    dir: TempDir,
    store: Arc<JsonStore>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            store: Arc::new(JsonStore::in_memory()),
        }
    }

    fn home(&self) -> &Path {
        self.dir.path()
    }

    /// Register a 32-bit host under the version 5 key.
    fn add_host(&self, install: &str, version: PackageVersion) -> HostDescriptor {
        self.add_host_at(r"Software\McNeel\Rhinoceros\5.0\Install", install, version)
    }

    fn add_host_at(&self, key: &str, install: &str, version: PackageVersion) -> HostDescriptor {
        let install = self.home().join(install);
        let exe = install.join("System").join("Rhino4.exe");
        std::fs::create_dir_all(exe.parent().unwrap()).unwrap();
        std::fs::write(&exe, b"MZ").unwrap();
        self.store
            .write_string(
                Hive::LocalMachine,
                key,
                "InstallPath",
                &install.display().to_string(),
            )
            .unwrap();
        HostDescriptor {
            version,
            edition: "Commercial".into(),
            exe_path: exe,
            sdk_version: "201107275".into(),
            sdk_service_release: "201209275".into(),
            bindings: BTreeMap::from([("RhinoCommon".to_string(), "5.1.30000.14".to_string())]),
            os: OsPlatform::X86,
        }
    }

    fn package(&self, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let path = self.home().join(name);
        write_zip(&path, files);
        path
    }

    fn engine(&self, probe: Arc<ScriptedProbe>) -> Engine {
        self.engine_reporting(probe, Arc::new(NullReporter))
    }

    fn engine_reporting(&self, probe: Arc<ScriptedProbe>, reporter: Arc<dyn Reporter>) -> Engine {
        Engine::new(
            Arc::new(EngineConfig::under(self.home())),
            Collaborators {
                store: self.store.clone(),
                probe,
                handlers: HandlerSet::standard(),
                reporter,
            },
        )
    }

    fn roaming(&self) -> PathBuf {
        self.home().join("roaming")
    }

    fn local(&self) -> PathBuf {
        self.home().join("local")
    }
}

fn probe_with(hosts: Vec<HostDescriptor>) -> Arc<ScriptedProbe> {
    Arc::new(ScriptedProbe {
        hosts,
        ..ScriptedProbe::default()
    })
}

fn localization_package(fx: &Fixture, version: &str, extra: &[(&str, &[u8])]) -> PathBuf {
    let xml = manifest("Localization", "Deutsch", LOCALE_ID, version, "Rhino5_win32");
    let mut files: Vec<(&str, &[u8])> = vec![("package.xml", xml.as_bytes())];
    files.extend_from_slice(extra);
    fx.package("de.rhi", &files)
}

#[tokio::test]
async fn test_localization_installs_then_reports_already_installed() {
    let fx = Fixture::new();
    let host = fx.add_host("Rhino5", PackageVersion::new(5, 1, 20927, 2011));
    let pkg = localization_package(&fx, "1.0.0.0", &[("strings/de.xml", b"<s/>")]);

    let mut engine = fx.engine(probe_with(vec![host.clone()]));
    assert_eq!(engine.run(&pkg).await, Phase::Complete);
    assert_eq!(engine.state().discovered_hosts, [host.clone()]);
    assert!(engine.state().compatible_host_found);

    let dest = fx.roaming().join("Localization").join("de-DE");
    let strings = dest.join("strings").join("de.xml");
    assert_eq!(std::fs::read(&strings).unwrap(), b"<s/>");
    let installed = Manifest::read_from_folder(&dest).unwrap();
    let record = installed.install_record.unwrap();
    assert_eq!(record.install_folder, dest);
    assert_eq!(record.installed_files, [strings.clone()]);
    assert!(!fx.local().join("temp").exists());

    let before = std::fs::metadata(&strings).unwrap().modified().unwrap();
    let mut again = fx.engine(probe_with(vec![host]));
    assert_eq!(again.run(&pkg).await, Phase::AlreadyInstalled);
    assert_eq!(std::fs::metadata(&strings).unwrap().modified().unwrap(), before);
}

#[tokio::test]
async fn test_failed_install_restores_destination() {
    let fx = Fixture::new();
    let host = fx.add_host("Rhino5", PackageVersion::new(5, 1, 20927, 2011));
    let dest = fx.roaming().join("Localization").join("de-DE");
    std::fs::create_dir_all(&dest).unwrap();
    std::fs::write(dest.join("keep.txt"), b"old").unwrap();
    // A file where the package needs a folder.
    std::fs::write(dest.join("sub"), b"in the way").unwrap();

    let pkg = localization_package(
        &fx,
        "1.0.0.0",
        &[("keep.txt", b"new"), ("sub/b.txt", b"b")],
    );
    let mut engine = fx.engine(probe_with(vec![host]));
    assert_eq!(engine.run(&pkg).await, Phase::InstallFailed);

    assert_eq!(std::fs::read(dest.join("keep.txt")).unwrap(), b"old");
    assert_eq!(std::fs::read(dest.join("sub")).unwrap(), b"in the way");
    assert!(!dest.join("package.xml").exists());
    assert!(!dest.join("keep.txt.rhibak").exists());
}

#[tokio::test]
async fn test_manifest_handler_wins_over_plugin_binaries() {
    let fx = Fixture::new();
    let host = fx.add_host("Rhino5", PackageVersion::new(5, 1, 20927, 2011));
    let xml = manifest("Tutorial", "Basics", TUTORIAL_ID, "2.0.0.0", "Rhino5_win32");
    let pkg = fx.package(
        "tutorial.rhi",
        &[("package.xml", xml.as_bytes()), ("bonus/Tool.rhp", b"MZ")],
    );

    let probe = probe_with(vec![host]);
    let mut engine = fx.engine(probe.clone());
    assert_eq!(engine.run(&pkg).await, Phase::Complete);

    let dest = fx
        .local()
        .join("Tutorials")
        .join("de-DE")
        .join(format!("Basics {{{}}}", TUTORIAL_ID.to_uppercase()))
        .join("2.0.0.0");
    assert!(dest.join("bonus").join("Tool.rhp").is_file());
    assert!(probe.plugin_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_prune_keeps_two_previous_versions() {
    let fx = Fixture::new();
    let host = fx.add_host("Rhino5", PackageVersion::new(5, 1, 20927, 2011));
    let parent = fx
        .local()
        .join("Tutorials")
        .join("de-DE")
        .join(format!("Basics {{{}}}", TUTORIAL_ID.to_uppercase()));
    for old in ["1.0.0.0", "2.0.0.0", "3.0.0.0"] {
        std::fs::create_dir_all(parent.join(old)).unwrap();
    }
    let xml = manifest("Tutorial", "Basics", TUTORIAL_ID, "4.0.0.0", "Rhino5_win32");
    let pkg = fx.package("tutorial.rhi", &[("package.xml", xml.as_bytes()), ("a.txt", b"a")]);

    let mut engine = fx.engine(probe_with(vec![host]));
    assert_eq!(engine.run(&pkg).await, Phase::Complete);

    assert!(!parent.join("1.0.0.0").exists());
    for kept in ["2.0.0.0", "3.0.0.0", "4.0.0.0"] {
        assert!(parent.join(kept).is_dir(), "{kept} should be kept");
    }
}

#[tokio::test]
async fn test_incompatible_package_writes_nothing() {
    let fx = Fixture::new();
    let host = fx.add_host("Rhino5", PackageVersion::new(5, 1, 20927, 2011));
    let xml = manifest("Localization", "Deutsch", LOCALE_ID, "1.0.0.0", "Rhino4_win32");
    let pkg = fx.package("de.rhi", &[("package.xml", xml.as_bytes())]);

    let mut engine = fx.engine(probe_with(vec![host]));
    assert_eq!(engine.run(&pkg).await, Phase::NotCompatible);
    assert_eq!(engine.state().discovered_hosts.len(), 1);
    assert!(!engine.state().compatible_host_found);
    assert!(!fx.roaming().join("Localization").exists());
}

#[tokio::test]
async fn test_silent_probe_only_loses_that_host() {
    let fx = Fixture::new();
    let hung = fx.add_host_at(
        r"Software\McNeel\Rhinoceros\4.0\2009-12-14\Install",
        "Hung",
        PackageVersion::new(4, 0, 2009, 1214),
    );
    let good = fx.add_host("Good", PackageVersion::new(5, 1, 20927, 2011));

    let probe = Arc::new(ScriptedProbe {
        hosts: vec![hung.clone(), good.clone()],
        silent: vec![hung.exe_path.clone()],
        ..ScriptedProbe::default()
    });
    let pkg = localization_package(&fx, "1.0.0.0", &[]);
    let mut engine = fx.engine(probe);
    assert_eq!(engine.initialize(&pkg).await.unwrap(), Phase::Initialized);
    assert_eq!(engine.state().discovered_hosts, [good]);
    engine.cleanup();
}

fn plugin(id: &str, title: &str, version: PackageVersion) -> PluginDescriptor {
    PluginDescriptor {
        path: PathBuf::new(),
        id: Uuid::parse_str(id).unwrap(),
        title: title.into(),
        version,
        os: OsPlatform::X86,
        host_major: 5,
        sdk_version: "201107275".into(),
        sdk_service_release: "201209275".into(),
    }
}

#[tokio::test]
async fn test_plugin_installs_and_registers_for_current_user() {
    let fx = Fixture::new();
    let host = fx.add_host("Rhino5", PackageVersion::new(5, 1, 20927, 2011));
    let pkg = fx.package("tool.rhi", &[("Tool.rhp", b"MZ"), ("Tool.tb", b"toolbar")]);

    let probe = Arc::new(ScriptedProbe {
        hosts: vec![host],
        plugins: HashMap::from([(
            "Tool.rhp".to_string(),
            plugin(PLUGIN_ID, "Tool", PackageVersion::new(1, 2, 0, 0)),
        )]),
        ..ScriptedProbe::default()
    });
    let mut engine = fx.engine(probe);
    assert_eq!(engine.run(&pkg).await, Phase::Complete);

    let dest = fx
        .roaming()
        .join("Plug-ins")
        .join(format!("Tool {{{}}}", PLUGIN_ID.to_uppercase()))
        .join("1.2.0.0");
    let binary = dest.join("Tool.rhp");
    assert!(binary.is_file());
    assert!(dest.join("Tool.tb").is_file());

    let key = format!(
        r"Software\McNeel\Rhinoceros\5.0\Plug-ins\{}",
        PLUGIN_ID.to_uppercase()
    );
    assert_eq!(
        fx.store.read_string(Hive::CurrentUser, &key, "Name").unwrap().as_deref(),
        Some("Tool")
    );
    assert_eq!(
        fx.store.read_string(Hive::CurrentUser, &key, "FileName").unwrap(),
        Some(binary.display().to_string())
    );
}

#[tokio::test]
async fn test_plugin_guid_mismatch_fails_initialization() {
    let fx = Fixture::new();
    let host = fx.add_host("Rhino5", PackageVersion::new(5, 1, 20927, 2011));
    let pkg = fx.package("tools.rhi", &[("x86/Tool.rhp", b"MZ"), ("x64/Other.rhp", b"MZ")]);

    let probe = Arc::new(ScriptedProbe {
        hosts: vec![host],
        plugins: HashMap::from([
            (
                "Tool.rhp".to_string(),
                plugin(PLUGIN_ID, "Tool", PackageVersion::new(1, 0, 0, 0)),
            ),
            (
                "Other.rhp".to_string(),
                plugin(TUTORIAL_ID, "Other", PackageVersion::new(1, 0, 0, 0)),
            ),
        ]),
        ..ScriptedProbe::default()
    });
    let mut engine = fx.engine(probe);
    assert_eq!(engine.run(&pkg).await, Phase::InitializationFailed);
    assert!(!fx.roaming().join("Plug-ins").exists());
}

#[tokio::test]
async fn test_all_users_targets_shared_root() {
    let fx = Fixture::new();
    let host = fx.add_host("Rhino5", PackageVersion::new(5, 1, 20927, 2011));
    let pkg = localization_package(&fx, "1.0.0.0", &[("a.txt", b"a")]);

    let mut engine = fx
        .engine(probe_with(vec![host]))
        .with_install_user(InstallUser::AllUsers);
    assert_eq!(engine.run(&pkg).await, Phase::Complete);
    assert!(fx
        .home()
        .join("all-users")
        .join("Localization")
        .join("de-DE")
        .join("a.txt")
        .is_file());
    assert!(!fx.roaming().join("Localization").exists());
}

#[tokio::test]
async fn test_canceled_token_stops_before_opening_package() {
    let fx = Fixture::new();
    let pkg = localization_package(&fx, "1.0.0.0", &[]);
    let mut engine = fx.engine(probe_with(Vec::new()));
    engine.cancellation_token().cancel();

    assert_eq!(engine.run(&pkg).await, Phase::Canceled);
    assert!(engine.state().discovered_hosts.is_empty());
    assert!(!fx.local().join("temp").exists());
}

fn python_package(fx: &Fixture) -> PathBuf {
    let descriptor = format!(
        "# generated\nid = \"{{{PYTHON_ID}}}\"\nversion = \"1.0.7.3\"\ntitle = \"CoolArch\"\n"
    );
    fx.package(
        "coolarch.rhi",
        &[
            ("CoolArch/__plugin__.py", descriptor.as_bytes()),
            ("CoolArch/Arc_cmd.py", b"def RunCommand(is_interactive): return 0"),
            ("CoolArch/Wall_cmd.py", b"def RunCommand(is_interactive): return 0"),
        ],
    )
}

fn python_destination(fx: &Fixture) -> PathBuf {
    fx.roaming()
        .join("Plug-ins")
        .join("PythonPlugins")
        .join(format!("CoolArch {{{}}}", PYTHON_ID.to_uppercase()))
        .join("1.0.7.3")
}

#[tokio::test]
async fn test_python_plugin_installs_and_registers_commands() {
    let fx = Fixture::new();
    let host = fx.add_host("Rhino5", PackageVersion::new(5, 1, 20927, 2011));
    let pkg = python_package(&fx);

    let mut engine = fx.engine(probe_with(vec![host.clone()]));
    assert_eq!(engine.run(&pkg).await, Phase::Complete);

    let dest = python_destination(&fx);
    assert!(dest.join("CoolArch").join("__plugin__.py").is_file());
    assert!(dest.join("CoolArch").join("Arc_cmd.py").is_file());
    for command in ["Arc", "Wall"] {
        assert_eq!(
            fx.store
                .read_string(Hive::CurrentUser, COMMAND_LIST, command)
                .unwrap(),
            Some(format!("66;{command}"))
        );
    }

    let mut again = fx.engine(probe_with(vec![host]));
    assert_eq!(again.run(&pkg).await, Phase::AlreadyInstalled);
}

/// Cancels the run as soon as the copied files are reported committed.
#[derive(Default)]
struct CancelAfterCopy {
    token: OnceLock<CancellationToken>,
    phases: Mutex<Vec<Phase>>,
}

impl Reporter for CancelAfterCopy {
    fn phase_changed(&self, phase: Phase, _: &str) {
        self.phases.lock().unwrap().push(phase);
    }
    fn info(&self, msg: &str) {
        if msg.starts_with("Installed ") {
            if let Some(token) = self.token.get() {
                token.cancel();
            }
        }
    }
    fn warning(&self, _: &str) {}
    fn error(&self, _: &str) {}
    fn host_discovered(&self, _: &HostDescriptor) {}
}

#[tokio::test]
async fn test_cancel_after_copy_still_registers() {
    let fx = Fixture::new();
    let host = fx.add_host("Rhino5", PackageVersion::new(5, 1, 20927, 2011));
    let pkg = python_package(&fx);

    let reporter = Arc::new(CancelAfterCopy::default());
    let mut engine = fx.engine_reporting(probe_with(vec![host]), reporter.clone());
    reporter.token.set(engine.cancellation_token()).unwrap();

    assert_eq!(engine.run(&pkg).await, Phase::Complete);
    assert!(engine.cancellation_token().is_cancelled());
    assert!(!reporter.phases.lock().unwrap().contains(&Phase::Canceled));
    assert!(python_destination(&fx).join("CoolArch").join("Arc_cmd.py").is_file());
    assert_eq!(
        fx.store
            .read_string(Hive::CurrentUser, COMMAND_LIST, "Arc")
            .unwrap()
            .as_deref(),
        Some("66;Arc")
    );
}
