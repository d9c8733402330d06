//! Per-file flow: stage, prepare, then probe, select and install on each device in turn.

use std::{
    error::Error,
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use derive_more::Debug;
use tracing::{error, info, instrument, warn};

use crate::{
    adb::{AdbBridge, AdbDevice, DeviceProfile, install::InstallEngine, list_devices},
    bundletool::{Bundletool, DOWNLOAD_HINT},
    confirm::Confirm,
    manifest::ManifestReader,
    package::{self, PackageKind, PreparedPackage},
    settings::Settings,
    staging::StagingArea,
    utils::{resolve_binary_path, resolve_file_path},
};

/// Connected devices whose serial contains `filter`, in `adb devices` order.
pub async fn connected_devices(adb: &Path, filter: Option<&str>) -> Result<Vec<AdbDevice>> {
    let serials = list_devices(adb).await?;
    let devices: Vec<AdbDevice> = serials
        .into_iter()
        .filter(|serial| filter.is_none_or(|f| serial.contains(f)))
        .map(|serial| AdbDevice::new(Arc::new(AdbBridge::new(adb, serial))))
        .collect();
    if devices.is_empty() {
        bail!("No connected device{}", filter.map(|f| format!(" matching '{f}'")).unwrap_or_default());
    }
    Ok(devices)
}

#[derive(Debug)]
pub struct Installer {
    reader: ManifestReader,
    bundletool: Option<Bundletool>,
    #[debug(skip)]
    confirm: Box<dyn Confirm>,
    work_dir: PathBuf,
    /// Skip the minimum SDK gate.
    pub ignore_sdk: bool,
}

impl Installer {
    pub fn new(
        reader: ManifestReader,
        bundletool: Option<Bundletool>,
        confirm: Box<dyn Confirm>,
        work_dir: PathBuf,
    ) -> Self {
        Self { reader, bundletool, confirm, work_dir, ignore_sdk: false }
    }

    /// Resolves the optional tools named in `settings`. Returns the installer and the adb path.
    pub fn from_settings(settings: &Settings, confirm: Box<dyn Confirm>) -> Result<(Self, PathBuf)> {
        let adb = resolve_binary_path(&settings.adb_path)
            .with_context(|| format!("adb not found (adb_path = '{}')", settings.adb_path))?;
        let aapt = resolve_binary_path(&settings.aapt_path);
        if aapt.is_none() {
            info!("aapt not found, manifests will be decoded directly");
        }
        let bundletool = match (
            resolve_binary_path(&settings.java_path),
            resolve_file_path(&settings.bundletool_path),
        ) {
            (Some(java), Some(jar)) => {
                Some(Bundletool::new(java, jar, adb.clone(), settings.signing.clone()))
            }
            _ => {
                info!("java or bundletool not found, .aab files cannot be installed");
                None
            }
        };
        let installer =
            Self::new(ManifestReader::new(aapt), bundletool, confirm, settings.work_dir.clone());
        Ok((installer, adb))
    }

    /// Installs one input file or unpacked directory on every device.
    ///
    /// A failure on one device does not stop the others; the file fails if any device failed.
    #[instrument(level = "debug", skip(self, input, devices), fields(input = %input.display()), err)]
    pub async fn install_file(&self, input: &Path, devices: &[AdbDevice]) -> Result<()> {
        if devices.is_empty() {
            bail!("No connected device");
        }
        let kind = PackageKind::detect(input)?;
        let mut staging = StagingArea::new(&self.work_dir);
        let staged = staging.stage_input(input).await?;
        info!(%kind, "Installing {}", input.display());

        let prepared = match kind {
            PackageKind::Aab => None,
            _ => Some(package::prepare(kind, &staged, &self.reader, &mut staging).await?),
        };

        let mut failures = Vec::new();
        for device in devices {
            let result = match &prepared {
                Some(prepared) => self.install_prepared(device, prepared, &staged, &mut staging).await,
                None => self.install_bundle(device, &staged, &mut staging).await,
            };
            match result {
                Ok(()) => info!(serial = device.serial(), "Installed {}", input.display()),
                Err(e) => {
                    error!(
                        serial = device.serial(),
                        error = e.as_ref() as &dyn Error,
                        "Install failed"
                    );
                    failures.push((device.serial().to_string(), e));
                }
            }
        }

        match failures.len() {
            0 => Ok(()),
            1 if devices.len() == 1 => Err(failures.remove(0).1),
            n => Err(anyhow!(
                "Install failed on {n} of {} devices: {}",
                devices.len(),
                failures.iter().map(|(serial, e)| format!("{serial}: {e:#}")).collect::<Vec<_>>().join("; ")
            )),
        }
    }

    /// Builds a device-specific `.apks` from an app bundle and installs its splits directly.
    async fn install_bundle(
        &self,
        device: &AdbDevice,
        staged: &Path,
        staging: &mut StagingArea,
    ) -> Result<()> {
        let bundletool = self
            .bundletool
            .as_ref()
            .with_context(|| format!("bundletool is required for app bundles. {DOWNLOAD_HINT}"))?;
        let safe_serial: String =
            device.serial().chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect();
        let mut name = OsString::from(staged.as_os_str());
        name.push(format!(".{safe_serial}.apks"));
        let output = PathBuf::from(name);
        staging.track(output.clone());

        bundletool.build_apks(staged, device.serial(), &output).await?;
        let mut prepared = package::prepare(PackageKind::Apks, &output, &self.reader, staging).await?;
        // already built for this device, no need to hand it back to bundletool
        prepared.bundletool_set = false;
        self.install_prepared(device, &prepared, &output, staging).await
    }

    #[instrument(level = "debug", skip_all, fields(serial = device.serial(), package = %prepared.manifest.package_name), err)]
    async fn install_prepared(
        &self,
        device: &AdbDevice,
        prepared: &PreparedPackage,
        staged: &Path,
        staging: &mut StagingArea,
    ) -> Result<()> {
        let profile = DeviceProfile::probe(device).await?;
        let mut engine = InstallEngine::new(device, &profile, self.confirm.as_ref(), &self.work_dir);
        engine.ignore_sdk = self.ignore_sdk;
        if self.ignore_sdk {
            warn!("Minimum SDK check is disabled");
        }

        if prepared.bundletool_set {
            match &self.bundletool {
                Some(bundletool) => {
                    engine.preflight(&prepared.manifest).await?;
                    return bundletool.install_apks(staged, device.serial()).await;
                }
                None => info!("bundletool not available, selecting splits directly"),
            }
        }

        let plan = prepared.plan(&profile)?;
        let scratch = staging.scratch_dir(staged).await?;
        let entries: Vec<&Path> = plan.artifacts.iter().map(|a| a.path.as_path()).collect();
        let files = prepared.materialize(&entries, &scratch).await?;
        let step = engine.install(&prepared.manifest, &files, plan.flags).await?;
        info!(%step, "Package installed");

        self.push_expansions(device, prepared, &scratch).await
    }

    async fn push_expansions(
        &self,
        device: &AdbDevice,
        prepared: &PreparedPackage,
        scratch: &Path,
    ) -> Result<()> {
        for expansion in &prepared.expansions {
            let local = prepared.materialize(&[expansion.entry.as_path()], scratch).await?;
            let local = local.first().context("Expansion file was not extracted")?;
            info!(remote = expansion.remote, "Pushing expansion file");
            let output = device.push(local, &expansion.remote).await?;
            if !output.success() {
                bail!(
                    "Failed to push {} to {}: {}",
                    expansion.entry.display(),
                    expansion.remote,
                    output.output.trim()
                );
            }
        }
        Ok(())
    }
}
