//! Platform, content and install-location enums.
//!
//! The string forms returned by `as_str` are the values written into XML
//! documents. Parsing is case-insensitive.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_enum {
    ($name:ident, $what:literal, { $($variant:ident => $text:literal $(| $alias:literal)*),+ $(,)? }) => {
        impl $name {
            /// The canonical string form of this value.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let lowered = s.trim().to_ascii_lowercase();
                $(
                    if lowered == $text.to_ascii_lowercase() $(|| lowered == $alias)* {
                        return Ok(Self::$variant);
                    }
                )+
                Err(format!(concat!("Unknown ", $what, ": {}"), s))
            }
        }
    };
}

/// Bitness of a binary or of a host installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OsPlatform {
    /// Not determined.
    #[default]
    Unknown,
    /// Runs on either bitness.
    Any,
    /// 32-bit Windows.
    X86,
    /// 64-bit Windows.
    X64,
}

string_enum!(OsPlatform, "operating system", {
    Unknown => "Unknown",
    Any => "Any",
    X86 => "x86" | "win32",
    X64 => "x64" | "win64" | "amd64",
});

impl OsPlatform {
    /// True for `X86` and `X64`.
    pub fn is_concrete(&self) -> bool {
        matches!(self, Self::X86 | Self::X64)
    }
}

/// A host family member: the architecture × major-version tuple that a
/// package declares support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HostPlatform {
    /// Not determined.
    #[default]
    Unknown,
    /// Any host.
    Any,
    /// Version 4, 32-bit.
    Host4Win32,
    /// Version 5, 32-bit.
    Host5Win32,
    /// Version 5, 64-bit.
    Host5Win64,
}

string_enum!(HostPlatform, "host platform", {
    Unknown => "Unknown",
    Any => "Any",
    Host4Win32 => "Rhino4_win32",
    Host5Win32 => "Rhino5_win32",
    Host5Win64 => "Rhino5_win64",
});

impl HostPlatform {
    /// Map a bitness and host major version onto a platform.
    ///
    /// ```
    /// use rhi_schema::{HostPlatform, OsPlatform};
    ///
    /// assert_eq!(HostPlatform::from_parts(OsPlatform::X64, 5), HostPlatform::Host5Win64);
    /// assert_eq!(HostPlatform::from_parts(OsPlatform::X86, 4), HostPlatform::Host4Win32);
    /// assert_eq!(HostPlatform::from_parts(OsPlatform::X86, 6), HostPlatform::Unknown);
    /// ```
    pub fn from_parts(os: OsPlatform, major: u32) -> Self {
        match (os, major) {
            (OsPlatform::X64, _) => Self::Host5Win64,
            (OsPlatform::X86, 4) => Self::Host4Win32,
            (OsPlatform::X86, 5) => Self::Host5Win32,
            _ => Self::Unknown,
        }
    }

    /// False for `Unknown` and `Any`.
    pub fn is_concrete(&self) -> bool {
        !matches!(self, Self::Unknown | Self::Any)
    }
}

/// What a package installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ContentType {
    /// Not determined.
    #[default]
    Unknown,
    /// Compiled plugin binaries (`.rhp`).
    Plugin,
    /// Interpreted-language plugin.
    Python,
    /// Versioned tutorial content.
    Tutorial,
    /// Translated resources for one locale.
    Localization,
    /// Media shared by all help locales.
    HelpMedia,
    /// Help files for one locale.
    Help,
    /// Toolbar and workspace files.
    UserInterface,
}

string_enum!(ContentType, "content type", {
    Unknown => "Unknown",
    Plugin => "Plugin",
    Python => "Python",
    Tutorial => "Tutorial",
    Localization => "Localization",
    HelpMedia => "HelpMedia",
    Help => "Help",
    UserInterface => "UserInterface" | "ui",
});

/// Which profile folder a package installs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstallRoot {
    /// Per-user, per-machine profile.
    CurrentUserLocal,
    /// Per-user profile that follows the user between machines.
    CurrentUserRoaming,
    /// Machine-wide shared folder.
    AllUsers,
}

string_enum!(InstallRoot, "install root", {
    CurrentUserLocal => "CurrentUserLocal",
    CurrentUserRoaming => "CurrentUserRoaming",
    AllUsers => "AllUsers",
});

/// Who a package is being installed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InstallUser {
    /// The interactive user only.
    #[default]
    CurrentUser,
    /// Every user on the machine.
    AllUsers,
}

string_enum!(InstallUser, "install user", {
    CurrentUser => "CurrentUser",
    AllUsers => "AllUsers",
});
