use std::fmt;

use anyhow::{Result, ensure};
use lazy_regex::{Lazy, Regex, lazy_regex};
use serde::{Deserialize, Serialize};

pub mod bridge;
pub mod device;
pub mod install;
pub mod profile;
#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{AdbBridge, AdbCommand, Bridge, CommandOutput, InstallFlags, list_devices};
pub use device::{AdbDevice, BackupRecord, InstalledPackage};
pub use profile::{Density, DeviceProfile};

pub static PACKAGE_NAME_REGEX: Lazy<Regex> =
    lazy_regex!(r"^(?:[A-Za-z]{1}[\w]*\.)+[A-Za-z][\w]*$");

/// Validated Android package name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageName(String);

impl PackageName {
    /// Validates and constructs a `PackageName` from the provided string-like value.
    pub fn parse(value: impl AsRef<str>) -> Result<Self> {
        let value_ref = value.as_ref();
        ensure!(PACKAGE_NAME_REGEX.is_match(value_ref), "Invalid package name: '{}'", value_ref);
        Ok(Self(value_ref.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PackageName {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<PackageName> for String {
    fn from(value: PackageName) -> Self {
        value.0
    }
}
