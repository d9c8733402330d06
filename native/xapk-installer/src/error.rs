//! Error taxonomy for probing, manifest extraction, split selection and installation.
//!
//! Pre-flight gates and terminal install failures abort a single package only; the caller
//! moves on to the next one. Backup and restore errors always carry the local backup path
//! so the operator can recover by hand.

use std::path::PathBuf;

use thiserror::Error;

use crate::adb::install::FailureSignal;

/// Boxed lower-level cause, usually converted from an `anyhow::Error`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A device property could not be read or parsed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("none of the SDK properties ({keys}) returned an integer")]
    NoSdkVersion { keys: String },

    #[error("device reported no ABI (ro.product.cpu.abi and ro.product.cpu.abilist are empty)")]
    NoAbi,

    #[error("device bridge failed while probing '{what}'")]
    Bridge {
        what: String,
        #[source]
        source: BoxError,
    },
}

/// Neither manifest strategy could populate the required fields.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is missing required field '{0}'")]
    MissingField(&'static str),

    #[error("manifest field '{field}' has invalid value '{value}'")]
    InvalidField { field: &'static str, value: String },

    #[error("failed to read package archive {}", .path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("failed to parse binary manifest of {}: {message}", .path.display())]
    Unparsable { path: PathBuf, message: String },
}

/// The candidate split set cannot produce a valid install plan.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("no base or mandatory split found among {count} candidates")]
    NoBaseSplit { count: usize },

    #[error("no standalone apk for ABI {abi} in the package, and SDK {sdk} cannot install splits")]
    NoStandalone { abi: String, sdk: u32 },
}

/// Backing up an installed package before uninstalling it failed.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("'pm path {package}' failed: {message}")]
    PathQuery { package: String, message: String },

    #[error("package {package} reported no installed files")]
    NothingToBackUp { package: String },

    #[error("failed to pull '{remote}' into {}: {message}", .local.display())]
    Pull { remote: String, local: PathBuf, message: String },

    #[error("uninstall of {package} failed, backup discarded: {message}")]
    UninstallFailed { package: String, message: String },

    #[error("filesystem error while preparing backup {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("device bridge failed during backup")]
    Bridge(#[source] BoxError),
}

/// Replaying a backup failed. The backup is kept at `path`.
#[derive(Debug, Error)]
#[error(
    "restore failed: {message}. The previous installation files are kept at {} - reinstall them \
     manually (adb install-multiple -r <files>) and push any obb folder back",
    .path.display()
)]
pub struct RestoreError {
    pub path: PathBuf,
    pub message: String,
}

/// Outcome of a package install that did not succeed.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Android version is too low: package requires SDK {required}, device has {actual}")]
    SdkTooLow { required: u32, actual: u32 },

    #[error("ABI mismatch: package ships {declared:?}, device supports {supported:?}")]
    AbiMismatch { declared: Vec<String>, supported: Vec<String> },

    #[error("installation cancelled: {0}")]
    Cancelled(String),

    #[error("{}", failure_message(.signal, .message))]
    Failed { signal: FailureSignal, message: String },

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error("device bridge failed")]
    Bridge(#[source] BoxError),
}

impl InstallError {
    /// The install failure signal, if this error came from the device installer.
    pub fn signal(&self) -> Option<FailureSignal> {
        match self {
            InstallError::Failed { signal, .. } => Some(*signal),
            _ => None,
        }
    }
}

fn failure_message(signal: &FailureSignal, message: &str) -> String {
    let message = message.trim();
    match signal {
        FailureSignal::VersionDowngrade => format!(
            "downgrade rejected by the device. Please make sure the file is correct, then \
             uninstall the newer version first: {message}"
        ),
        FailureSignal::UserRestricted => format!(
            "the install was cancelled or not confirmed on the device. The first install needs \
             manual confirmation on the phone: {message}"
        ),
        FailureSignal::AlreadyExists => format!(
            "an application with the same package name and version is already installed: \
             {message}"
        ),
        _ => format!("installation failed ({signal}): {message}"),
    }
}
