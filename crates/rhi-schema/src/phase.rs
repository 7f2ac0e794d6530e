//! Installer phases and install-state comparison results.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One state of the installer lifecycle.
///
/// The integer value of every variant is also the process exit code of
/// `rhiexec`. These numbers are shared with older and newer installer builds
/// that invoke each other, so they must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum Phase {
    /// Installation finished successfully.
    Complete = 0,
    /// Not yet determined, or a child process ended without a known code.
    #[default]
    Unknown = 300,
    /// Engine constructed, nothing done yet.
    Start = 400,
    /// Reserved for the wizard.
    InitializeDialog = 401,
    /// Inspecting the package and discovering hosts.
    Initializing = 402,
    /// Ready to install.
    Initialized = 403,
    /// The same or a newer version is already installed.
    AlreadyInstalled = 404,
    /// Reserved for the wizard.
    WelcomeDialog = 405,
    /// Reserved for the wizard.
    InstallingDialog = 406,
    /// Copying files.
    Installing = 407,
    /// Registering with discovered hosts.
    Registering = 408,
    /// Deleting temporary state before exit.
    Cleanup = 409,
    /// Reserved for the wizard.
    CompleteDialog = 410,
    /// Stopped at the user's request.
    Canceled = 411,
    /// The package could not be inspected.
    InitializationFailed = 500,
    /// Copying files failed; the destination was rolled back.
    InstallFailed = 501,
    /// Host registration failed.
    RegistrationFailed = 502,
    /// An unexpected error escaped the engine.
    Exception = 503,
    /// The package archive does not exist.
    PackageNotFound = 504,
    /// No package archive was given on the command line.
    PackageNotSpecified = 505,
    /// The probe's output directory does not exist.
    InspectWorkingDirMissing = 520,
    /// The probe could not read the binary.
    InspectFailed = 521,
    /// No discovered host can load the package, or a probed binary is not
    /// a supported host or plugin.
    NotCompatible = 522,
    /// Another installer instance holds the lock.
    AlreadyRunning = 550,
}

impl Phase {
    /// Alias used by probes and child processes for a clean exit.
    pub const SUCCESS: Self = Self::Complete;

    const ALL: [Self; 24] = [
        Self::Complete,
        Self::Unknown,
        Self::Start,
        Self::InitializeDialog,
        Self::Initializing,
        Self::Initialized,
        Self::AlreadyInstalled,
        Self::WelcomeDialog,
        Self::InstallingDialog,
        Self::Installing,
        Self::Registering,
        Self::Cleanup,
        Self::CompleteDialog,
        Self::Canceled,
        Self::InitializationFailed,
        Self::InstallFailed,
        Self::RegistrationFailed,
        Self::Exception,
        Self::PackageNotFound,
        Self::PackageNotSpecified,
        Self::InspectWorkingDirMissing,
        Self::InspectFailed,
        Self::NotCompatible,
        Self::AlreadyRunning,
    ];

    /// The stable integer code (and process exit code) of this phase.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an exit code back onto a phase. Unrecognised codes are `Unknown`.
    ///
    /// ```
    /// use rhi_schema::Phase;
    ///
    /// assert_eq!(Phase::from_code(404), Phase::AlreadyInstalled);
    /// assert_eq!(Phase::from_code(-1), Phase::Unknown);
    /// ```
    pub fn from_code(code: i32) -> Self {
        Self::ALL
            .into_iter()
            .find(|p| p.code() == code)
            .unwrap_or(Self::Unknown)
    }

    /// Map a child process exit status onto a phase.
    ///
    /// Unix keeps only the low byte of an exit status; every phase code is
    /// distinct in its low byte, so a truncated status still decodes.
    ///
    /// ```
    /// use rhi_schema::Phase;
    ///
    /// assert_eq!(Phase::from_exit_code(522), Phase::NotCompatible);
    /// assert_eq!(Phase::from_exit_code(522 & 0xff), Phase::NotCompatible);
    /// assert_eq!(Phase::from_exit_code(0), Phase::Complete);
    /// ```
    pub fn from_exit_code(code: i32) -> Self {
        Self::ALL
            .into_iter()
            .find(|p| p.code() == code)
            .or_else(|| {
                Self::ALL
                    .into_iter()
                    .find(|p| p.code() & 0xff == code & 0xff)
            })
            .unwrap_or(Self::Unknown)
    }

    /// True once the engine has nothing more to do except clean up.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete
                | Self::AlreadyInstalled
                | Self::Canceled
                | Self::NotCompatible
                | Self::AlreadyRunning
        ) || self.is_failure()
    }

    /// True for the 5xx failure band.
    pub fn is_failure(self) -> bool {
        self.code() >= Self::InitializationFailed.code() && self != Self::AlreadyRunning
    }

    /// Whether a terminal phase warrants an error report.
    ///
    /// Phases that reflect an outcome the user already understands never do.
    pub fn should_report_error(self) -> bool {
        if !self.is_terminal() {
            return false;
        }
        !matches!(
            self,
            Self::Complete
                | Self::AlreadyInstalled
                | Self::AlreadyRunning
                | Self::PackageNotSpecified
                | Self::Canceled
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}

/// Result of comparing an installed package version with a candidate.
///
/// Ordering is significant: anything at or above `SameCurrentUser` means the
/// candidate must not be installed over what is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum PackageInstallState {
    /// Not determined.
    #[default]
    Unknown,
    /// Nothing is installed.
    NotInstalled,
    /// An older version is installed for the current user.
    OlderCurrentUser,
    /// An older version is installed for all users.
    OlderAllUsers,
    /// The same version is installed for the current user.
    SameCurrentUser,
    /// The same version is installed for all users.
    SameAllUsers,
    /// A newer version is installed for the current user.
    NewerCurrentUser,
    /// A newer version is installed for all users.
    NewerAllUsers,
}

impl PackageInstallState {
    /// Compare an installed version against a candidate.
    ///
    /// `installed` is `None` when no manifest exists at the destination.
    ///
    /// ```
    /// use rhi_schema::{InstallUser, PackageInstallState, PackageVersion};
    ///
    /// let old = PackageVersion::new(1, 0, 0, 0);
    /// let new = PackageVersion::new(1, 0, 0, 1);
    /// assert_eq!(
    ///     PackageInstallState::compare(Some(old), new, InstallUser::CurrentUser),
    ///     PackageInstallState::OlderCurrentUser
    /// );
    /// ```
    pub fn compare(
        installed: Option<crate::PackageVersion>,
        candidate: crate::PackageVersion,
        user: crate::InstallUser,
    ) -> Self {
        use std::cmp::Ordering;

        let Some(installed) = installed else {
            return Self::NotInstalled;
        };
        let all_users = user == crate::InstallUser::AllUsers;
        match (installed.cmp(&candidate), all_users) {
            (Ordering::Less, false) => Self::OlderCurrentUser,
            (Ordering::Less, true) => Self::OlderAllUsers,
            (Ordering::Equal, false) => Self::SameCurrentUser,
            (Ordering::Equal, true) => Self::SameAllUsers,
            (Ordering::Greater, false) => Self::NewerCurrentUser,
            (Ordering::Greater, true) => Self::NewerAllUsers,
        }
    }

    /// True when the candidate should not be installed.
    pub fn is_installed_or_newer(self) -> bool {
        self >= Self::SameCurrentUser
    }
}
