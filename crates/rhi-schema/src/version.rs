//! Four-part package and host version numbers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A `major.minor.build.revision` version.
///
/// Ordering compares the four components left to right. `0.0.0.0` is the
/// "unset" value and never identifies a real package or host.
///
/// # Example
///
/// ```
/// use rhi_schema::PackageVersion;
///
/// let v: PackageVersion = "5.1.20927".parse().unwrap();
/// assert_eq!(v.to_string(), "5.1.20927.0");
/// assert!(v > "5.0.0.0".parse().unwrap());
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct PackageVersion {
    /// Major component.
    pub major: u32,
    /// Minor component.
    pub minor: u32,
    /// Build component.
    pub build: u32,
    /// Revision component.
    pub revision: u32,
}

/// Errors produced when parsing a [`PackageVersion`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// Fewer than two or more than four components.
    #[error("Version '{0}' must have between 2 and 4 components")]
    ComponentCount(String),

    /// A component is not a non-negative integer.
    #[error("Invalid version component '{component}' in '{input}'")]
    Component {
        /// The full input string.
        input: String,
        /// The offending component.
        component: String,
    },
}

impl PackageVersion {
    /// The unset version, `0.0.0.0`.
    pub const ZERO: Self = Self::new(0, 0, 0, 0);

    /// Build a version from its four components.
    pub const fn new(major: u32, minor: u32, build: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            build,
            revision,
        }
    }

    /// True for `0.0.0.0`.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

impl FromStr for PackageVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split('.').collect();
        if !(2..=4).contains(&parts.len()) {
            return Err(VersionError::ComponentCount(trimmed.to_string()));
        }

        let mut components = [0u32; 4];
        for (slot, part) in components.iter_mut().zip(&parts) {
            *slot = part.trim().parse().map_err(|_| VersionError::Component {
                input: trimmed.to_string(),
                component: (*part).to_string(),
            })?;
        }

        Ok(Self::new(
            components[0],
            components[1],
            components[2],
            components[3],
        ))
    }
}

impl TryFrom<String> for PackageVersion {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PackageVersion> for String {
    fn from(value: PackageVersion) -> Self {
        value.to_string()
    }
}
