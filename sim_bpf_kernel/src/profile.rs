//! Simulated kernel configuration
//!
//! A [`KernelProfile`] decides which features the simulated kernel
//! understands. Profiles are plain data and can be loaded from JSON:
//!
//! ```
//! use sim_bpf_kernel::profile::{KernelProfile, KernelVersion};
//!
//! let profile = KernelProfile::from_json(r#"{ "version": "5.4" }"#).unwrap();
//! assert_eq!(profile.version, KernelVersion::new(5, 4));
//! assert!(!profile.unprivileged);
//! ```

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while reading a profile
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProfileError {
    /// The version string is not `major.minor`
    #[error("invalid kernel version: {0}")]
    InvalidVersion(String),

    /// The profile is not valid JSON
    #[error("invalid profile: {0}")]
    Json(String),
}

/// A `major.minor` kernel version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KernelVersion {
    major: u32,
    minor: u32,
}

impl KernelVersion {
    /// Newest version the simulation knows about
    pub const LATEST: KernelVersion = KernelVersion::new(6, 1);

    /// Creates a version
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Whether this version is `major.minor` or newer
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        *self >= KernelVersion::new(major, minor)
    }
}

impl FromStr for KernelVersion {
    type Err = ProfileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProfileError::InvalidVersion(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        let major = major.parse().map_err(|_| invalid())?;
        let minor = minor.parse().map_err(|_| invalid())?;
        Ok(Self::new(major, minor))
    }
}

impl TryFrom<String> for KernelVersion {
    type Error = ProfileError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KernelVersion> for String {
    fn from(version: KernelVersion) -> Self {
        version.to_string()
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// What the simulated kernel supports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelProfile {
    /// Features newer than this version are rejected as malformed requests
    pub version: KernelVersion,

    /// Reject every request with `EPERM`, as for a caller lacking privileges
    #[serde(default)]
    pub unprivileged: bool,
}

impl KernelProfile {
    /// A privileged caller on the given version
    pub fn new(version: KernelVersion) -> Self {
        Self {
            version,
            unprivileged: false,
        }
    }

    /// A privileged caller on [`KernelVersion::LATEST`]
    pub fn latest() -> Self {
        Self::new(KernelVersion::LATEST)
    }

    /// Sets whether the caller lacks privileges
    pub fn with_unprivileged(mut self, unprivileged: bool) -> Self {
        self.unprivileged = unprivileged;
        self
    }

    /// Reads a profile from JSON
    pub fn from_json(json: &str) -> Result<Self, ProfileError> {
        serde_json::from_str(json).map_err(|err| ProfileError::Json(err.to_string()))
    }
}

impl Default for KernelProfile {
    fn default() -> Self {
        Self::latest()
    }
}
