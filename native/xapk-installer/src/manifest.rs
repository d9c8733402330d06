//! Package identity extraction: `aapt dump badging` when available, direct decoding of the
//! binary manifest otherwise.

#[cfg(test)]
pub(crate) mod testing;

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use apk_info::Apk;
use lazy_regex::{Lazy, Regex, lazy_regex};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::{adb::PackageName, error::ManifestError};

static NATIVE_CODE_REGEX: Lazy<Regex> = lazy_regex!(r"'([^,']+)'");

pub const MANIFEST_ENTRY: &str = "AndroidManifest.xml";

/// Identity and compatibility data of one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageManifest {
    pub package_name: PackageName,
    pub version_code: i64,
    pub min_sdk: u32,
    pub target_sdk: Option<u32>,
    /// ABI directory names as shipped (`arm64-v8a`). Empty for pure-Java packages.
    pub native_abis: BTreeSet<String>,
}

/// Fields gathered so far; required ones are checked in [`ManifestFields::build`].
#[derive(Debug, Default)]
struct ManifestFields {
    package_name: Option<String>,
    version_code: Option<i64>,
    min_sdk: Option<u32>,
    target_sdk: Option<u32>,
    native_abis: BTreeSet<String>,
}

impl ManifestFields {
    fn build(self) -> Result<PackageManifest, ManifestError> {
        let name = self.package_name.ok_or(ManifestError::MissingField("package"))?;
        let package_name = PackageName::parse(&name)
            .map_err(|_| ManifestError::InvalidField { field: "package", value: name })?;
        Ok(PackageManifest {
            package_name,
            version_code: self.version_code.ok_or(ManifestError::MissingField("versionCode"))?,
            min_sdk: self.min_sdk.ok_or(ManifestError::MissingField("minSdkVersion"))?,
            target_sdk: self.target_sdk,
            native_abis: self.native_abis,
        })
    }
}

fn parse_number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ManifestError> {
    value
        .trim()
        .parse()
        .map_err(|_| ManifestError::InvalidField { field, value: value.to_string() })
}

fn number<T: std::str::FromStr>(
    field: &'static str,
    value: Option<String>,
) -> Result<Option<T>, ManifestError> {
    value.map(|v| parse_number(field, &v)).transpose()
}

/// Parses `aapt dump badging` output.
pub fn parse_badging(output: &str) -> Result<PackageManifest, ManifestError> {
    let mut fields = ManifestFields::default();
    for line in output.lines().map(str::trim) {
        let quoted = || line.split('\'').skip(1).step_by(2);
        if line.starts_with("package: name=") {
            let mut values = quoted();
            fields.package_name = values.next().map(str::to_string);
            // second quoted token is the version code
            if let Some(code) = values.next() {
                fields.version_code = Some(parse_number("versionCode", code)?);
            }
        } else if line.starts_with("sdkVersion:") {
            if let Some(value) = quoted().next() {
                fields.min_sdk = Some(parse_number("minSdkVersion", value)?);
            }
        } else if line.starts_with("targetSdkVersion:") {
            if let Some(value) = quoted().next() {
                fields.target_sdk = Some(parse_number("targetSdkVersion", value)?);
            }
        } else if line.starts_with("native-code:") || line.starts_with("alt-native-code:") {
            fields
                .native_abis
                .extend(NATIVE_CODE_REGEX.captures_iter(line).map(|c| c[1].to_string()));
        }
    }
    fields.build()
}

/// Reads the binary manifest and `lib/<abi>/` entries straight from an apk.
#[instrument(level = "debug", skip(path), fields(path = %path.display()), err)]
pub fn read_from_archive(path: &Path) -> Result<PackageManifest, ManifestError> {
    let archive_error = |e: Box<dyn std::error::Error + Send + Sync>| ManifestError::Archive {
        path: path.to_path_buf(),
        source: e,
    };
    let file = std::fs::File::open(path).map_err(|e| archive_error(e.into()))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| archive_error(e.into()))?;
    archive.by_name(MANIFEST_ENTRY).map_err(|e| archive_error(e.into()))?;
    let native_abis = native_abis(archive.file_names());
    drop(archive);

    let apk = Apk::new(path).map_err(|e| ManifestError::Unparsable {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let target_sdk = number("targetSdkVersion", apk.get_target_sdk_version().map(|v| v.to_string()))?;
    if target_sdk.is_none() {
        warn!("targetSdkVersion not found");
    }
    ManifestFields {
        package_name: apk.get_package_name(),
        version_code: number("versionCode", apk.get_version_code().map(|v| v.to_string()))?,
        // absent attribute or absent <uses-sdk>: platform default
        min_sdk: Some(
            number("minSdkVersion", apk.get_min_sdk_version().map(|v| v.to_string()))?.unwrap_or(1),
        ),
        target_sdk,
        native_abis,
    }
    .build()
}

/// Distinct `<abi>` segments of `lib/<abi>/...` entries.
pub fn native_abis<'a>(entries: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    entries
        .filter_map(|name| name.strip_prefix("lib/"))
        .filter_map(|rest| rest.split_once('/'))
        .map(|(abi, _)| abi)
        .filter(|abi| !abi.is_empty())
        .map(str::to_string)
        .collect()
}

/// Tries the external dump tool first and falls back to direct decoding.
#[derive(Debug, Clone, Default)]
pub struct ManifestReader {
    aapt: Option<PathBuf>,
}

impl ManifestReader {
    pub fn new(aapt: Option<PathBuf>) -> Self {
        Self { aapt }
    }

    #[instrument(level = "debug", skip(self, path), fields(path = %path.display()), err)]
    pub async fn read(&self, path: &Path) -> Result<PackageManifest, ManifestError> {
        if let Some(aapt) = &self.aapt {
            match self.dump_badging(aapt, path).await {
                Some(Ok(manifest)) => {
                    debug!(?manifest, "Read manifest with aapt");
                    return Ok(manifest);
                }
                Some(Err(e)) => {
                    warn!(error = &e as &dyn std::error::Error, "Unusable aapt output, decoding manifest directly")
                }
                None => {}
            }
        } else {
            info!("aapt is not configured, decoding manifest directly");
        }

        let owned = path.to_path_buf();
        let manifest = tokio::task::spawn_blocking(move || read_from_archive(&owned))
            .await
            .map_err(|e| ManifestError::Archive { path: path.to_path_buf(), source: e.into() })??;
        debug!(?manifest, "Decoded binary manifest");
        Ok(manifest)
    }

    /// `None` when the tool could not be run or exited nonzero.
    async fn dump_badging(&self, aapt: &Path, path: &Path) -> Option<Result<PackageManifest, ManifestError>> {
        let mut command = Command::new(aapt);
        command.arg("dump").arg("badging").arg(path).kill_on_drop(true);
        #[cfg(target_os = "windows")]
        // CREATE_NO_WINDOW
        command.creation_flags(0x08000000);
        let output = match command.output().await {
            Ok(output) => output,
            Err(e) => {
                warn!(error = &e as &dyn std::error::Error, aapt = %aapt.display(), "Failed to run aapt");
                return None;
            }
        };
        if !output.status.success() {
            warn!(
                status = ?output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "aapt is misconfigured or failed"
            );
            return None;
        }
        Some(parse_badging(&String::from_utf8_lossy(&output.stdout)))
    }
}
