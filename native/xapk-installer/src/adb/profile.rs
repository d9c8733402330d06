use std::{fmt, str::FromStr};

use lazy_regex::{Lazy, Regex, lazy_regex};
use tracing::{debug, instrument, warn};

use super::AdbDevice;
use crate::error::ProbeError;

/// SDK level properties, tried in order until one parses.
pub const SDK_PROPERTIES: [&str; 4] = [
    "ro.build.version.sdk",
    "ro.product.build.version.sdk",
    "ro.system.build.version.sdk",
    "ro.system_ext.build.version.sdk",
];

static DPI_REGEX: Lazy<Regex> = lazy_regex!(r"(\d+)dpi");

/// Screen density bucket as used in split names (`config.xxhdpi`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Density {
    Ldpi,
    Mdpi,
    Tvdpi,
    Hdpi,
    Xhdpi,
    Xxhdpi,
    Xxxhdpi,
    Nodpi,
}

impl Density {
    /// Fallback order when no split matches the device bucket: highest first, `nodpi` last.
    pub const CASCADE: [Density; 8] = [
        Density::Xxxhdpi,
        Density::Xxhdpi,
        Density::Xhdpi,
        Density::Hdpi,
        Density::Tvdpi,
        Density::Mdpi,
        Density::Ldpi,
        Density::Nodpi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Density::Ldpi => "ldpi",
            Density::Mdpi => "mdpi",
            Density::Tvdpi => "tvdpi",
            Density::Hdpi => "hdpi",
            Density::Xhdpi => "xhdpi",
            Density::Xxhdpi => "xxhdpi",
            Density::Xxxhdpi => "xxxhdpi",
            Density::Nodpi => "nodpi",
        }
    }
}

impl fmt::Display for Density {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Density {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ldpi" => Density::Ldpi,
            "mdpi" => Density::Mdpi,
            "tvdpi" => Density::Tvdpi,
            "hdpi" => Density::Hdpi,
            "xhdpi" => Density::Xhdpi,
            "xxhdpi" => Density::Xxhdpi,
            "xxxhdpi" => Density::Xxxhdpi,
            "nodpi" => Density::Nodpi,
            _ => return Err(()),
        })
    }
}

/// Maps a raw dpi value to its density bucket(s).
///
/// Buckets are 40 dpi wide and the boundary belongs to the lower bucket, so 160 is `mdpi` and
/// 161 is already `hdpi`/`tvdpi`. Values above 640 and non-positive values map to nothing.
pub fn density_bucket(dpi: i64) -> Vec<Density> {
    if dpi <= 0 {
        return Vec::new();
    }
    match (dpi + 39) / 40 {
        0..=3 => vec![Density::Ldpi],
        4 => vec![Density::Mdpi],
        5..=6 => vec![Density::Tvdpi, Density::Hdpi],
        7..=8 => vec![Density::Xhdpi],
        9..=12 => vec![Density::Xxhdpi],
        13..=16 => vec![Density::Xxxhdpi],
        _ => Vec::new(),
    }
}

/// Canonical ABI spelling used for comparisons (`arm64-v8a` -> `arm64_v8a`).
pub fn normalized_abi(abi: &str) -> String {
    abi.trim().replace('-', "_")
}

/// Spelling used by the package manager and `lib/` directories (`arm64_v8a` -> `arm64-v8a`).
pub fn device_abi(abi: &str) -> String {
    match abi.trim() {
        "arm64_v8a" => "arm64-v8a",
        "armeabi_v7a" => "armeabi-v7a",
        other => other,
    }
    .to_string()
}

/// Immutable snapshot of the device properties relevant to split selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    pub serial: String,
    /// Normalized primary ABI.
    pub primary_abi: String,
    /// Normalized ABI list in device preference order. Never empty.
    pub abi_list: Vec<String>,
    pub dpi: Option<u32>,
    /// Candidate density buckets for `dpi`; empty when unknown.
    pub densities: Vec<Density>,
    /// Lowercase language part of the device locale (`en` for `en-US`).
    pub locale: String,
    pub sdk: u32,
}

impl DeviceProfile {
    /// Reads SDK level, ABIs, screen density and locale from the device.
    #[instrument(level = "debug", skip(device), fields(serial = %device.serial()), err)]
    pub async fn probe(device: &AdbDevice) -> Result<DeviceProfile, ProbeError> {
        let sdk = probe_sdk(device).await?;

        let primary = normalized_abi(&getprop(device, "ro.product.cpu.abi").await?);
        let mut abi_list: Vec<String> = getprop(device, "ro.product.cpu.abilist")
            .await?
            .split(',')
            .map(normalized_abi)
            .filter(|abi| !abi.is_empty())
            .collect();
        if abi_list.is_empty() {
            if primary.is_empty() {
                return Err(ProbeError::NoAbi);
            }
            abi_list.push(primary.clone());
        }
        let primary_abi = if primary.is_empty() { abi_list[0].clone() } else { primary };

        let displays = device
            .dumpsys(&["window", "displays"])
            .await
            .map_err(|e| ProbeError::Bridge { what: "dumpsys window displays".into(), source: e.into() })?;
        let dpi = parse_dpi(&displays);
        let densities = dpi.map(|d| density_bucket(d.into())).unwrap_or_default();
        if densities.is_empty() {
            warn!(?dpi, "Could not determine screen density bucket");
        }

        let locale = parse_locale(&getprop(device, "ro.product.locale").await?);

        let profile = DeviceProfile {
            serial: device.serial().to_string(),
            primary_abi,
            abi_list,
            dpi,
            densities,
            locale,
            sdk,
        };
        debug!(?profile, "Probed device");
        Ok(profile)
    }
}

async fn getprop(device: &AdbDevice, key: &str) -> Result<String, ProbeError> {
    device
        .getprop(key)
        .await
        .map_err(|e| ProbeError::Bridge { what: format!("getprop {key}"), source: e.into() })
}

async fn probe_sdk(device: &AdbDevice) -> Result<u32, ProbeError> {
    for key in SDK_PROPERTIES {
        let value = getprop(device, key).await?;
        match value.trim().parse::<u32>() {
            Ok(sdk) => return Ok(sdk),
            Err(_) if value.trim().is_empty() => continue,
            Err(_) => debug!(key, value = value.trim(), "Ignoring non-numeric SDK property"),
        }
    }
    Err(ProbeError::NoSdkVersion { keys: SDK_PROPERTIES.join(", ") })
}

/// Last `<n>dpi` token in `dumpsys window displays` output (the current density).
fn parse_dpi(output: &str) -> Option<u32> {
    DPI_REGEX.captures_iter(output).filter_map(|c| c[1].parse().ok()).last()
}

fn parse_locale(value: &str) -> String {
    value.trim().split(['-', '_']).next().unwrap_or_default().to_lowercase()
}
