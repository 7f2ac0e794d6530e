//! Python plugins.
//!
//! Identity comes from `__plugin__.py`, a short file of `key = "value"`
//! assignments. Every `<name>_cmd.py` file is a command, registered with
//! the host's script runner after install.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use rhi_schema::{
    ContentType, HostDescriptor, HostPlatform, InstallRoot, InstallUser, Manifest, OsPlatform,
    PackageInstallState, PackageVersion,
};
use uuid::Uuid;

use super::{ContentHandler, HandlerContext, HandlerError, expand_folder, versioned_install_state};
use crate::archive::Package;
use crate::store::Hive;

const DESCRIPTOR_FILE: &str = "__plugin__.py";
const FOLDER_TEMPLATE: &str =
    "Plug-ins/PythonPlugins/$(PACKAGE_TITLE) {$(PACKAGE_ID)}/$(PACKAGE_VERSION)";

/// Command lists of the script runner plugin, one per host bitness.
const COMMAND_LIST_KEYS: [&str; 2] = [
    r"Software\McNeel\Rhinoceros\5.0\Plug-Ins\814d908a-e25c-493d-97e9-ee3861957f49\CommandList",
    r"Software\McNeel\Rhinoceros\5.0x64\Plug-Ins\814d908a-e25c-493d-97e9-ee3861957f49\CommandList",
];

static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)#.*").expect("valid regex"));
static VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?im)version\s*=\s*"(\d+\.\d+\.\d+\.\d+)""#).expect("valid regex")
});
static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?im)title\s*=\s*"(.*)""#).expect("valid regex"));
static ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?im)id\s*=\s*"(.*)""#).expect("valid regex"));
static COMMAND_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(.*)_cmd\.py$").expect("valid regex"));

/// Fields parsed from `__plugin__.py`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PythonPluginInfo {
    pub id: Uuid,
    pub title: String,
    pub version: PackageVersion,
    pub commands: Vec<String>,
}

impl PythonPluginInfo {
    /// Parse descriptor text. Comments are stripped first; a `#` inside a
    /// quoted value is treated as a comment too.
    pub fn parse(text: &str) -> Self {
        let text = COMMENT.replace_all(text, "");
        let capture = |rx: &Regex| {
            rx.captures(&text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default()
        };
        Self {
            id: Uuid::parse_str(&capture(&ID)).unwrap_or_else(|_| Uuid::nil()),
            title: capture(&TITLE),
            version: capture(&VERSION).parse().unwrap_or_default(),
            commands: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.id.is_nil()
            && !self.title.is_empty()
            && !self.version.is_zero()
            && !self.commands.is_empty()
    }
}

/// Command name for a `<name>_cmd.py` file name.
pub fn command_name(file_name: &str) -> Option<&str> {
    COMMAND_FILE
        .captures(file_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

#[derive(Debug, Clone, Default)]
pub struct PythonPluginHandler {
    package_path: PathBuf,
    info: PythonPluginInfo,
}

impl PythonPluginHandler {
    pub fn info(&self) -> &PythonPluginInfo {
        &self.info
    }

    fn load(package: &mut Package) -> Result<PythonPluginInfo, HandlerError> {
        let entry = package
            .entries()
            .iter()
            .find(|e| e.file_name().eq_ignore_ascii_case(DESCRIPTOR_FILE))
            .cloned()
            .ok_or_else(|| HandlerError::ManifestNotFound(package.path().to_path_buf()))?;
        let mut info = PythonPluginInfo::parse(&package.read_entry_to_string(&entry.key)?);
        info.commands = package
            .entries()
            .iter()
            .filter_map(|e| command_name(e.file_name()).map(str::to_string))
            .collect();
        Ok(info)
    }
}

impl ContentHandler for PythonPluginHandler {
    fn content_type(&self) -> ContentType {
        ContentType::Python
    }

    fn recognizes_payload(&mut self, package: &mut Package, cx: &HandlerContext<'_>) -> bool {
        let recognized = package.contains_file_named(DESCRIPTOR_FILE);
        if recognized {
            cx.events.info("Recognized payload as Python plugin");
        }
        recognized
    }

    fn initialize(&mut self, package: &mut Package, cx: &HandlerContext<'_>) -> Result<(), HandlerError> {
        self.package_path = package.path().to_path_buf();
        self.info = Self::load(package)?;
        cx.events.info(self.describe());
        if !self.info.is_valid() {
            return Err(HandlerError::ManifestInvalid(format!(
                "{DESCRIPTOR_FILE} in {} needs id, title, version and at least one *_cmd.py",
                package.path().display()
            )));
        }
        Ok(())
    }

    fn manifest(&self) -> Manifest {
        Manifest {
            version: self.info.version,
            content_type: ContentType::Python,
            package_path: self.package_path.display().to_string(),
            title: self.info.title.clone(),
            id: self.info.id,
            os: OsPlatform::Any,
            platforms: vec![HostPlatform::Host5Win32, HostPlatform::Host5Win64],
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
        Ok(versioned_install_state(&folder, self.info.version, user))
    }

    fn is_compatible(&self, host: &HostDescriptor) -> bool {
        host.version.major == 5
    }

    fn after_install(
        &self,
        _package: &Package,
        destination: &Path,
        _hosts: &[HostDescriptor],
        _user: InstallUser,
        cx: &HandlerContext<'_>,
    ) -> bool {
        if self.info.commands.is_empty() {
            cx.events
                .error(format!("No files named *_cmd.py found in {}", destination.display()));
            return false;
        }
        let mut ok = true;
        for command in &self.info.commands {
            cx.events.info(format!("Registering command: {command}"));
            for key in COMMAND_LIST_KEYS {
                let value = format!("66;{command}");
                if let Err(e) = cx.store.write_string(Hive::CurrentUser, key, command, &value) {
                    cx.events.error(format!("Unable to write to {key}: {e}"));
                    ok = false;
                }
            }
        }
        ok
    }
}
