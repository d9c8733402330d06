//! Classification of split apks by device dimension and selection of the install set.

use std::{fmt, path::{Path, PathBuf}};

use lazy_regex::{Lazy, Regex, lazy_regex};
use tracing::{debug, instrument, warn};

use crate::{
    adb::{Density, DeviceProfile, InstallFlags, profile::normalized_abi},
    error::SelectionError,
};

/// ABI split tags, normalized with underscores.
pub const KNOWN_ABIS: [&str; 7] =
    ["armeabi_v7a", "arm64_v8a", "armeabi", "x86_64", "x86", "mips64", "mips"];

static LOCALE_REGEX: Lazy<Regex> = lazy_regex!(r"^[a-z]{2,3}(?:[_-][a-zA-Z0-9]{2,4})?$");

/// What a split apk is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    Base,
    /// Normalized (`arm64_v8a`).
    Abi(String),
    Density(Density),
    /// Lowercase tag as found in the split name (`en`, `pt_br`).
    Locale(String),
    /// Feature module or any split that is not device-scoped; always installed.
    Feature(String),
}

impl Dimension {
    /// Classifies a split id such as `base`, `config.arm64_v8a`, `config.xxhdpi` or `config.en`.
    ///
    /// Only `config.` ids can be locales; a short bare id like `ads` is a feature module.
    pub fn classify(id: &str) -> Self {
        let id = id.trim();
        let (tag, config) = match id.strip_prefix("config.") {
            Some(tag) => (tag, true),
            None => (id, false),
        };
        if tag.is_empty() || tag == "base" || tag == "master" {
            return Dimension::Base;
        }
        let abi = normalized_abi(tag);
        if KNOWN_ABIS.contains(&abi.as_str()) {
            return Dimension::Abi(abi);
        }
        if let Ok(density) = tag.parse::<Density>() {
            return Dimension::Density(density);
        }
        if config && LOCALE_REGEX.is_match(tag) {
            return Dimension::Locale(tag.to_lowercase());
        }
        Dimension::Feature(id.to_string())
    }

    pub fn is_mandatory(&self) -> bool {
        matches!(self, Dimension::Base | Dimension::Feature(_))
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Base => f.write_str("base"),
            Dimension::Abi(abi) => write!(f, "abi {abi}"),
            Dimension::Density(density) => write!(f, "density {density}"),
            Dimension::Locale(locale) => write!(f, "locale {locale}"),
            Dimension::Feature(name) => write!(f, "feature {name}"),
        }
    }
}

/// One candidate apk of a split package.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SplitArtifact {
    /// Archive entry name or local file path, depending on where the package lives.
    pub path: PathBuf,
    pub dimension: Dimension,
    pub raw_id: String,
}

impl SplitArtifact {
    /// Split with a declared id (xapk `split_apks`, SAI metadata).
    pub fn from_id(id: &str, path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), dimension: Dimension::classify(id), raw_id: id.to_string() }
    }

    /// Split identified by its file name: `base.apk`, `split_config.en.apk`, `config.xxhdpi.apk`.
    pub fn from_file_name(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stem = file_stem(&path);
        let id = stem.strip_prefix("split_").unwrap_or(&stem).to_string();
        Self::from_id(&id, path)
    }

    /// bundletool split entry `splits/<module>-<config>.apk`. The `master` config of `base` is the
    /// base apk; the master of any other module is a mandatory feature split.
    pub fn from_bundletool_entry(entry: &str) -> Option<Self> {
        let name = entry.strip_prefix("splits/")?.strip_suffix(".apk")?;
        let (module, config) = name.rsplit_once('-')?;
        let dimension = match (module, Dimension::classify(&format!("config.{config}"))) {
            ("base", Dimension::Base) => Dimension::Base,
            (_, Dimension::Base) => Dimension::Feature(module.to_string()),
            (_, Dimension::Feature(_)) => Dimension::Feature(name.to_string()),
            (_, dimension) => dimension,
        };
        Some(Self { path: PathBuf::from(entry), dimension, raw_id: name.to_string() })
    }
}

fn file_stem(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy())
        .map(|n| n.strip_suffix(".apk").map(str::to_string).unwrap_or_else(|| n.into_owned()))
        .unwrap_or_default()
}

/// Files to install, in order, and the flags for the first attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub artifacts: Vec<SplitArtifact>,
    pub flags: InstallFlags,
    /// No split matched the device locale.
    pub locale_missing: bool,
}

impl InstallPlan {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.artifacts.iter().map(|a| a.path.clone()).collect()
    }
}

/// Picks the minimal split set for `profile`.
///
/// Base and feature splits are always included, base first. ABI, density and locale each
/// contribute at most one split:
/// - ABI: exact primary ABI match, else the first match walking the device ABI list;
/// - density: a split for one of the device buckets, else the first match of
///   [`Density::CASCADE`];
/// - locale: a split for the device language, else none (logged, not an error).
#[instrument(level = "debug", skip_all, fields(serial = %profile.serial, candidates = artifacts.len()), err)]
pub fn select(profile: &DeviceProfile, artifacts: &[SplitArtifact]) -> Result<InstallPlan, SelectionError> {
    let mut selected: Vec<SplitArtifact> = artifacts
        .iter()
        .filter(|a| a.dimension == Dimension::Base)
        .chain(artifacts.iter().filter(|a| matches!(a.dimension, Dimension::Feature(_))))
        .cloned()
        .collect();
    if selected.is_empty() {
        return Err(SelectionError::NoBaseSplit { count: artifacts.len() });
    }

    let abi = |wanted: &str| {
        artifacts.iter().find(|a| matches!(&a.dimension, Dimension::Abi(abi) if abi == wanted))
    };
    let abi_split = abi(&profile.primary_abi)
        .or_else(|| profile.abi_list.iter().find_map(|wanted| abi(wanted)));
    match abi_split {
        Some(split) => selected.push(split.clone()),
        None if artifacts.iter().any(|a| matches!(a.dimension, Dimension::Abi(_))) => {
            warn!(abis = ?profile.abi_list, "No ABI split matches the device")
        }
        None => {}
    }

    let density = |wanted: &Density| {
        artifacts.iter().find(|a| a.dimension == Dimension::Density(*wanted))
    };
    let density_split = profile
        .densities
        .iter()
        .find_map(density)
        .or_else(|| Density::CASCADE.iter().find_map(density));
    if let Some(split) = density_split {
        selected.push(split.clone());
    }

    let locale_split = artifacts.iter().find(|a| match &a.dimension {
        Dimension::Locale(tag) => language(tag) == profile.locale,
        _ => false,
    });
    let locale_missing = locale_split.is_none();
    match locale_split {
        Some(split) => selected.push(split.clone()),
        None => warn!(
            locale = profile.locale,
            "No split for the device language, the app will use its default language"
        ),
    }

    debug!(files = ?selected.iter().map(|a| &a.path).collect::<Vec<_>>(), "Selected splits");
    Ok(InstallPlan { artifacts: selected, flags: InstallFlags::AGGRESSIVE, locale_missing })
}

/// First SDK level that can install split apks.
pub const MIN_SPLIT_SDK: u32 = 21;

/// Picks the pre-split apk of a bundletool set for a device below [`MIN_SPLIT_SDK`].
///
/// Entries are named `standalones/standalone-<abi>_<density>.apk`. The primary ABI with the
/// device density buckets is tried first, then every listed ABI against the buckets and the
/// [`Density::CASCADE`].
#[instrument(level = "debug", skip_all, fields(serial = %profile.serial, candidates = entries.len()), err)]
pub fn select_standalone(profile: &DeviceProfile, entries: &[String]) -> Result<InstallPlan, SelectionError> {
    let find = |abi: &str, density: &Density| {
        let wanted = format!("standalones/standalone-{abi}_{density}.apk");
        entries.iter().find(|e| **e == wanted)
    };
    let densities: Vec<&Density> = profile.densities.iter().chain(Density::CASCADE.iter()).collect();
    let entry = profile
        .densities
        .iter()
        .find_map(|d| find(&profile.primary_abi, d))
        .or_else(|| {
            profile
                .abi_list
                .iter()
                .find_map(|abi| densities.iter().find_map(|d| find(abi, d)))
        })
        .ok_or_else(|| SelectionError::NoStandalone {
            abi: profile.primary_abi.clone(),
            sdk: profile.sdk,
        })?;

    warn!(
        sdk = profile.sdk,
        entry = entry.as_str(),
        "Device cannot install split apks, using a standalone apk"
    );
    Ok(InstallPlan {
        artifacts: vec![SplitArtifact {
            path: PathBuf::from(entry),
            dimension: Dimension::Base,
            raw_id: entry.clone(),
        }],
        flags: InstallFlags::AGGRESSIVE,
        locale_missing: false,
    })
}

fn language(tag: &str) -> &str {
    tag.split(['_', '-']).next().unwrap_or(tag)
}
