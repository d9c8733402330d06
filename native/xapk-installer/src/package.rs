//! Package formats and the split set each one yields.

use std::{
    fmt,
    io::{self, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail, ensure};
use fs_err::tokio as fs;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::{
    adb::{
        DeviceProfile, InstallFlags, PackageName,
        device::EXTERNAL_STORAGE,
        profile::device_abi,
    },
    error::SelectionError,
    manifest::{ManifestReader, PackageManifest},
    splits::{self, Dimension, InstallPlan, SplitArtifact},
    staging::StagingArea,
};

pub const XAPK_MANIFEST: &str = "manifest.json";
pub const APKM_INFO: &str = "info.json";
pub const APKS_TOC: &str = "toc.pb";
pub const APKS_BASE_MASTER: &str = "splits/base-master.apk";
pub const APKS_STANDALONES: &str = "standalones/";
pub const SAI_V2_META: &str = "meta.sai_v2.json";
pub const SAI_V1_META: &str = "meta.sai_v1.json";

/// Expansion location the installer knows how to push to.
const EXTERNAL_STORAGE_LOCATION: &str = "EXTERNAL_STORAGE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    Apk,
    Xapk,
    Apkm,
    Apks,
    Aab,
}

impl PackageKind {
    /// By extension, or `Xapk` for a directory holding a `manifest.json`.
    pub fn detect(path: &Path) -> Result<Self> {
        if path.is_dir() {
            ensure!(
                path.join(XAPK_MANIFEST).is_file(),
                "Directory {} has no {XAPK_MANIFEST}",
                path.display()
            );
            return Ok(PackageKind::Xapk);
        }
        let ext = path.extension().map(|e| e.to_string_lossy().to_lowercase()).unwrap_or_default();
        Ok(match ext.as_str() {
            "apk" => PackageKind::Apk,
            "xapk" => PackageKind::Xapk,
            "apkm" => PackageKind::Apkm,
            "apks" => PackageKind::Apks,
            "aab" => PackageKind::Aab,
            _ => bail!("Unsupported package type: {}", path.display()),
        })
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PackageKind::Apk => "apk",
            PackageKind::Xapk => "xapk",
            PackageKind::Apkm => "apkm",
            PackageKind::Apks => "apks",
            PackageKind::Aab => "aab",
        })
    }
}

/// Where artifact paths are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// Paths are zip entry names; entries are extracted on demand.
    Archive(PathBuf),
    /// Paths are relative to this directory.
    Directory(PathBuf),
}

/// File pushed to shared storage after the apk is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expansion {
    pub entry: PathBuf,
    pub remote: String,
}

#[derive(Debug, Clone)]
pub struct PreparedPackage {
    pub kind: PackageKind,
    pub manifest: PackageManifest,
    pub artifacts: Vec<SplitArtifact>,
    pub source: PackageSource,
    pub expansions: Vec<Expansion>,
    /// Install every artifact as is instead of selecting per device.
    pub install_all: bool,
    /// A `toc.pb` archive bundletool can install by itself.
    pub bundletool_set: bool,
    /// `standalones/*.apk` entries of a bundletool set, for devices without split support.
    pub standalones: Vec<String>,
}

impl PreparedPackage {
    pub fn plan(&self, profile: &DeviceProfile) -> Result<InstallPlan, SelectionError> {
        let from_bundletool = self.bundletool_set || !self.standalones.is_empty();
        if from_bundletool && profile.sdk < splits::MIN_SPLIT_SDK {
            return splits::select_standalone(profile, &self.standalones);
        }
        if !self.install_all {
            return splits::select(profile, &self.artifacts);
        }
        if self.artifacts.is_empty() {
            return Err(SelectionError::NoBaseSplit { count: 0 });
        }
        Ok(InstallPlan {
            artifacts: self.artifacts.clone(),
            flags: InstallFlags::AGGRESSIVE,
            locale_missing: false,
        })
    }

    /// Local paths for `entries`, extracting archive entries into `scratch` first.
    pub async fn materialize(&self, entries: &[&Path], scratch: &Path) -> Result<Vec<PathBuf>> {
        self.source.materialize(entries, scratch).await
    }
}

impl PackageSource {
    #[instrument(level = "debug", skip_all, fields(count = entries.len()), err)]
    pub async fn materialize(&self, entries: &[&Path], scratch: &Path) -> Result<Vec<PathBuf>> {
        match self {
            PackageSource::Directory(dir) => entries
                .iter()
                .map(|entry| {
                    let path = dir.join(entry);
                    ensure!(path.is_file(), "Missing package file {}", path.display());
                    Ok(path)
                })
                .collect(),
            PackageSource::Archive(archive) => {
                let archive = archive.clone();
                let scratch = scratch.to_path_buf();
                let entries: Vec<PathBuf> = entries.iter().map(|e| e.to_path_buf()).collect();
                blocking(move || extract_entries(&archive, &entries, &scratch)).await
            }
        }
    }
}

/// Reads what `kind` needs from `staged` without extracting more than the manifest source.
///
/// `.aab` bundles must be built into an `.apks` first.
#[instrument(level = "debug", skip(reader, staging, staged), fields(staged = %staged.display()), err)]
pub async fn prepare(
    kind: PackageKind,
    staged: &Path,
    reader: &ManifestReader,
    staging: &mut StagingArea,
) -> Result<PreparedPackage> {
    let prepared = match kind {
        PackageKind::Apk => prepare_apk(staged, reader).await?,
        PackageKind::Xapk => prepare_xapk(staged).await?,
        PackageKind::Apkm => prepare_apkm(staged).await?,
        PackageKind::Apks => prepare_apks(staged, reader, staging).await?,
        PackageKind::Aab => bail!("App bundles must be built for a device before they are prepared"),
    };
    debug!(
        package = %prepared.manifest.package_name,
        artifacts = prepared.artifacts.len(),
        expansions = prepared.expansions.len(),
        "Prepared package"
    );
    Ok(prepared)
}

async fn prepare_apk(staged: &Path, reader: &ManifestReader) -> Result<PreparedPackage> {
    let manifest = reader.read(staged).await?;
    let dir = staged.parent().map(Path::to_path_buf).unwrap_or_default();
    let name = staged.file_name().context("Package path has no file name")?;
    Ok(PreparedPackage {
        kind: PackageKind::Apk,
        manifest,
        artifacts: vec![SplitArtifact::from_id("base", name)],
        source: PackageSource::Directory(dir),
        expansions: Vec::new(),
        install_all: true,
        bundletool_set: false,
        standalones: Vec::new(),
    })
}

/// Integer that some tools write as a JSON string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Number {
    Int(i64),
    Text(String),
}

impl Number {
    fn value(&self, field: &str) -> Result<i64> {
        match self {
            Number::Int(value) => Ok(*value),
            Number::Text(text) => {
                text.trim().parse().with_context(|| format!("Invalid {field}: '{text}'"))
            }
        }
    }

    fn sdk(&self, field: &str) -> Result<u32> {
        u32::try_from(self.value(field)?).with_context(|| format!("Invalid {field}"))
    }
}

#[derive(Debug, Deserialize)]
struct XapkManifest {
    package_name: String,
    version_code: Number,
    min_sdk_version: Number,
    target_sdk_version: Option<Number>,
    #[serde(default)]
    split_apks: Vec<XapkSplit>,
    #[serde(default)]
    expansions: Vec<XapkExpansion>,
}

#[derive(Debug, Deserialize)]
struct XapkSplit {
    file: String,
    id: String,
}

#[derive(Debug, Deserialize)]
struct XapkExpansion {
    file: String,
    install_location: String,
    install_path: String,
}

async fn prepare_xapk(staged: &Path) -> Result<PreparedPackage> {
    let (source, bytes) = if staged.is_dir() {
        let bytes = fs::read(staged.join(XAPK_MANIFEST)).await?;
        (PackageSource::Directory(staged.to_path_buf()), bytes)
    } else {
        let archive = staged.to_path_buf();
        let bytes = blocking(move || read_entry(&archive, XAPK_MANIFEST)).await?;
        (PackageSource::Archive(staged.to_path_buf()), bytes)
    };
    let (manifest, artifacts, expansions) = parse_xapk_manifest(&bytes)?;
    Ok(PreparedPackage {
        kind: PackageKind::Xapk,
        manifest,
        install_all: !expansions.is_empty(),
        artifacts,
        source,
        expansions,
        bundletool_set: false,
        standalones: Vec::new(),
    })
}

fn parse_xapk_manifest(bytes: &[u8]) -> Result<(PackageManifest, Vec<SplitArtifact>, Vec<Expansion>)> {
    let raw: XapkManifest =
        serde_json::from_slice(bytes).with_context(|| format!("Failed to parse {XAPK_MANIFEST}"))?;
    let package_name = PackageName::parse(&raw.package_name)?;

    let mut artifacts: Vec<SplitArtifact> =
        raw.split_apks.iter().map(|split| SplitArtifact::from_id(&split.id, &split.file)).collect();
    let native_abis = artifacts
        .iter()
        .filter_map(|a| match &a.dimension {
            Dimension::Abi(abi) => Some(device_abi(abi)),
            _ => None,
        })
        .collect();

    let expansions = raw
        .expansions
        .iter()
        .map(|expansion| {
            ensure!(
                expansion.install_location == EXTERNAL_STORAGE_LOCATION,
                "Unsupported expansion install location '{}' for {}",
                expansion.install_location,
                expansion.file
            );
            Ok(Expansion {
                entry: PathBuf::from(&expansion.file),
                remote: format!("{EXTERNAL_STORAGE}{}", expansion.install_path.trim_start_matches('/')),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    // expansion packages ship a single apk named after the package
    if artifacts.is_empty() || !expansions.is_empty() {
        artifacts = vec![SplitArtifact::from_id("base", format!("{package_name}.apk"))];
    }

    let manifest = PackageManifest {
        version_code: raw.version_code.value("version_code")?,
        min_sdk: raw.min_sdk_version.sdk("min_sdk_version")?,
        target_sdk: raw.target_sdk_version.as_ref().map(|t| t.sdk("target_sdk_version")).transpose()?,
        package_name,
        native_abis,
    };
    Ok((manifest, artifacts, expansions))
}

#[derive(Debug, Deserialize)]
struct ApkmInfo {
    pname: String,
    versioncode: Number,
    min_api: Number,
    #[serde(default)]
    arches: Vec<String>,
}

async fn prepare_apkm(staged: &Path) -> Result<PreparedPackage> {
    let archive = staged.to_path_buf();
    let (names, info) = blocking(move || {
        let names = list_entries(&archive)?;
        let info = read_entry(&archive, APKM_INFO)?;
        Ok((names, info))
    })
    .await?;
    let info: ApkmInfo =
        serde_json::from_slice(&info).with_context(|| format!("Failed to parse {APKM_INFO}"))?;

    let manifest = PackageManifest {
        package_name: PackageName::parse(&info.pname)?,
        version_code: info.versioncode.value("versioncode")?,
        min_sdk: info.min_api.sdk("min_api")?,
        target_sdk: None,
        native_abis: info.arches.iter().map(|a| device_abi(&a.replace('-', "_"))).collect(),
    };
    Ok(PreparedPackage {
        kind: PackageKind::Apkm,
        manifest,
        artifacts: top_level_apks(&names).map(SplitArtifact::from_file_name).collect(),
        source: PackageSource::Archive(staged.to_path_buf()),
        expansions: Vec::new(),
        install_all: false,
        bundletool_set: false,
        standalones: Vec::new(),
    })
}

#[derive(Debug, Deserialize)]
struct SaiMeta {
    package: String,
    version_code: Number,
    #[serde(default)]
    split_apk: bool,
}

async fn prepare_apks(
    staged: &Path,
    reader: &ManifestReader,
    staging: &mut StagingArea,
) -> Result<PreparedPackage> {
    let archive = staged.to_path_buf();
    let names = blocking(move || list_entries(&archive)).await?;
    let has = |name: &str| names.iter().any(|n| n == name);
    let scratch = staging.scratch_dir(staged).await?;
    let source = PackageSource::Archive(staged.to_path_buf());

    if has(APKS_TOC) {
        let standalones: Vec<String> = names
            .iter()
            .filter(|n| n.starts_with(APKS_STANDALONES) && n.ends_with(".apk"))
            .cloned()
            .collect();
        // standalone-only sets come from bundles built for old devices
        let manifest_entry = if has(APKS_BASE_MASTER) {
            APKS_BASE_MASTER
        } else {
            standalones
                .first()
                .map(String::as_str)
                .with_context(|| format!("{APKS_TOC} archive has no {APKS_BASE_MASTER} or standalone apk"))?
        };
        let artifacts: Vec<SplitArtifact> =
            names.iter().filter_map(|n| SplitArtifact::from_bundletool_entry(n)).collect();
        let manifest = read_entry_manifest(&source, reader, manifest_entry, &scratch).await?;
        return Ok(PreparedPackage {
            kind: PackageKind::Apks,
            manifest,
            artifacts,
            source,
            expansions: Vec::new(),
            install_all: false,
            bundletool_set: true,
            standalones,
        });
    }

    if has(SAI_V2_META) {
        let archive = staged.to_path_buf();
        let meta = blocking(move || read_entry(&archive, SAI_V2_META)).await?;
        let meta: SaiMeta =
            serde_json::from_slice(&meta).with_context(|| format!("Failed to parse {SAI_V2_META}"))?;
        let mut artifacts: Vec<SplitArtifact> =
            top_level_apks(&names).map(SplitArtifact::from_file_name).collect();
        // base first, it carries the manifest
        artifacts.sort_by_key(|a| a.dimension != Dimension::Base);
        let base = artifacts.first().context("SAI archive contains no apk")?.path.clone();
        if !meta.split_apk {
            artifacts.truncate(1);
        }
        let manifest = read_entry_manifest(&source, reader, &base.to_string_lossy(), &scratch).await?;
        if manifest.package_name.as_str() != meta.package
            || Some(manifest.version_code) != meta.version_code.value("version_code").ok()
        {
            warn!(
                meta_package = meta.package,
                package = %manifest.package_name,
                "SAI metadata does not match the base apk manifest"
            );
        }
        return Ok(PreparedPackage {
            kind: PackageKind::Apks,
            manifest,
            artifacts,
            source,
            expansions: Vec::new(),
            install_all: true,
            bundletool_set: false,
            standalones: Vec::new(),
        });
    }

    if has(SAI_V1_META) {
        bail!("SAI v1 backups are not supported, export the app again with a current SAI version");
    }
    bail!("Unrecognized apks layout: no {APKS_TOC} or {SAI_V2_META}")
}

async fn read_entry_manifest(
    source: &PackageSource,
    reader: &ManifestReader,
    entry: &str,
    scratch: &Path,
) -> Result<PackageManifest> {
    let local = source.materialize(&[Path::new(entry)], scratch).await?;
    let path = local.first().context("Manifest source was not extracted")?;
    Ok(reader.read(path).await?)
}

fn top_level_apks(names: &[String]) -> impl Iterator<Item = &str> {
    names.iter().map(String::as_str).filter(|n| !n.contains('/') && n.to_lowercase().ends_with(".apk"))
}

async fn blocking<T: Send + 'static>(task: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(task).await.context("Archive task failed")?
}

fn open_archive(path: &Path) -> Result<zip::ZipArchive<std::fs::File>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    zip::ZipArchive::new(file).with_context(|| format!("Failed to open archive {}", path.display()))
}

fn list_entries(path: &Path) -> Result<Vec<String>> {
    Ok(open_archive(path)?.file_names().map(str::to_string).collect())
}

fn read_entry(path: &Path, name: &str) -> Result<Vec<u8>> {
    let mut archive = open_archive(path)?;
    let mut entry = archive
        .by_name(name)
        .with_context(|| format!("{} has no {name}", path.display()))?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Extracts `entries` under `dest`, skipping files already extracted for an earlier device.
fn extract_entries(path: &Path, entries: &[PathBuf], dest: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = open_archive(path)?;
    let mut extracted = Vec::with_capacity(entries.len());
    for entry in entries {
        let name = entry.to_string_lossy().replace('\\', "/");
        let mut file = archive
            .by_name(&name)
            .with_context(|| format!("{} has no {name}", path.display()))?;
        let relative = file
            .enclosed_name()
            .with_context(|| format!("Unsafe entry name in archive: {name}"))?;
        let out_path = dest.join(relative);
        if !out_path.is_file() {
            if let Some(parent) = out_path.parent() {
                fs_err::create_dir_all(parent)?;
            }
            let mut out = fs_err::File::create(&out_path)?;
            io::copy(&mut file, &mut out)
                .with_context(|| format!("Failed to extract {name}"))?;
            debug!(entry = name, "Extracted archive entry");
        }
        extracted.push(out_path);
    }
    info!(count = extracted.len(), "Extracted package files");
    Ok(extracted)
}
