//! Install roots on disk.
//!
//! ```text
//! <roaming>/                 # CurrentUserRoaming
//! ├── Localization/<lang>/
//! ├── Plug-ins/<Title> {<ID>}/<version>/
//! └── UI/
//! <local>/                   # CurrentUserLocal
//! ├── Tutorials/<lang>/<Title> {<ID>}/<version>/
//! ├── Localization/HelpMedia/
//! ├── rhiexec.lock
//! └── temp/<run-uuid>/       # per-run scratch, wiped at start
//! <all-users>/               # AllUsers
//! ```

use std::path::{Path, PathBuf};

use rhi_schema::{InstallRoot, InstallUser};
use serde::{Deserialize, Serialize};

/// Environment variable that relocates every root under one directory.
pub const HOME_ENV: &str = "RHIEXEC_HOME";

const FAMILY_DIR: [&str; 3] = ["McNeel", "Rhinoceros", "5.0"];

/// Returns the override directory from `RHIEXEC_HOME`, if set.
pub fn try_rhiexec_home() -> Option<PathBuf> {
    std::env::var_os(HOME_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// The three install roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub roaming: PathBuf,
    pub local: PathBuf,
    pub all_users: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self::detect()
    }
}

impl Layout {
    /// Roots under `RHIEXEC_HOME` when set, otherwise the platform defaults.
    pub fn detect() -> Self {
        match try_rhiexec_home() {
            Some(home) => Self::under(&home),
            None => Self::platform_default(),
        }
    }

    /// All three roots as siblings under one directory.
    pub fn under(home: &Path) -> Self {
        Self {
            roaming: home.join("roaming"),
            local: home.join("local"),
            all_users: home.join("all-users"),
        }
    }

    fn platform_default() -> Self {
        let family = |base: PathBuf| FAMILY_DIR.iter().fold(base, |p, part| p.join(part));
        let fallback = std::env::temp_dir;
        Self {
            roaming: family(dirs::data_dir().unwrap_or_else(fallback)),
            local: family(dirs::data_local_dir().unwrap_or_else(fallback)),
            all_users: family(common_files_dir()),
        }
    }

    /// Directory for a handler's declared root.
    pub fn root(&self, root: InstallRoot) -> &Path {
        match root {
            InstallRoot::CurrentUserLocal => &self.local,
            InstallRoot::CurrentUserRoaming => &self.roaming,
            InstallRoot::AllUsers => &self.all_users,
        }
    }

    /// Directory an install actually targets: all users overrides the
    /// handler's own root.
    pub fn root_for(&self, handler_root: InstallRoot, user: InstallUser) -> &Path {
        match user {
            InstallUser::AllUsers => &self.all_users,
            InstallUser::CurrentUser => self.root(handler_root),
        }
    }

    /// Parent of every per-run temp folder, under the local root.
    pub fn temp_root(&self) -> PathBuf {
        self.local.join("temp")
    }
}

fn common_files_dir() -> PathBuf {
    std::env::var_os("CommonProgramFiles")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/usr/local/share"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_users_overrides_handler_root() {
        let layout = Layout::under(Path::new("/x"));
        assert_eq!(
            layout.root_for(InstallRoot::CurrentUserLocal, InstallUser::CurrentUser),
            Path::new("/x/local")
        );
        assert_eq!(
            layout.root_for(InstallRoot::CurrentUserLocal, InstallUser::AllUsers),
            Path::new("/x/all-users")
        );
    }

    #[test]
    fn test_temp_root_is_machine_local() {
        let layout = Layout::under(Path::new("/x"));
        assert_eq!(layout.temp_root(), Path::new("/x/local/temp"));
        assert!(!layout.temp_root().starts_with(&layout.roaming));
    }
}
