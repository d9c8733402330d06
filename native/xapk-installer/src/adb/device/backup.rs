use std::path::{Path, PathBuf};

use fs_err::tokio as fs;
use tracing::{debug, info, instrument, warn};

use super::{AdbDevice, OBB_ROOT};
use crate::{
    adb::{AdbCommand, InstallFlags, PackageName, install::InstallAttemptResult},
    error::{BackupError, RestoreError},
};

/// Local snapshot of an installed package, taken right before it is uninstalled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub package: PackageName,
    /// `<work_root>/<package>`
    pub local_directory: PathBuf,
    /// Pulled apk files in `pm path` order.
    pub apk_files: Vec<PathBuf>,
    /// Pulled `Android/obb/<package>` directory, if the package had one.
    pub obb_directory: Option<PathBuf>,
}

impl BackupRecord {
    pub fn contains_obb_data(&self) -> bool {
        self.obb_directory.is_some()
    }

    /// Removes the local snapshot. Failures are logged only.
    pub async fn discard(&self) {
        match fs::remove_dir_all(&self.local_directory).await {
            Ok(()) => debug!(path = %self.local_directory.display(), "Removed backup"),
            Err(e) => warn!(error = &e as &dyn std::error::Error, "Failed to remove backup"),
        }
    }
}

fn is_not_found(output: &str) -> bool {
    output.contains("No such file or directory")
        || output.contains("does not exist")
        || output.contains("not found")
}

impl AdbDevice {
    /// Pulls every installed apk of `package` and its obb directory into `<work_root>/<package>`.
    ///
    /// Missing remote paths are skipped, but at least one apk must come back.
    #[instrument(level = "debug", skip(self, work_root), fields(serial = %self.serial()), err)]
    pub async fn backup(&self, package: &PackageName, work_root: &Path) -> Result<BackupRecord, BackupError> {
        info!(package = %package, "Backing up installed package");
        let paths = self.package_paths(package).await.map_err(|e| BackupError::Bridge(e.into()))?;
        if !paths.success() {
            return Err(BackupError::PathQuery {
                package: package.to_string(),
                message: paths.output.trim().to_string(),
            });
        }
        let remote_paths: Vec<&str> = paths
            .output
            .lines()
            .filter_map(|line| line.trim().strip_prefix("package:"))
            .filter(|p| !p.is_empty())
            .collect();
        if remote_paths.is_empty() {
            return Err(BackupError::NothingToBackUp { package: package.to_string() });
        }

        let local_directory = work_root.join(package.as_str());
        if fs::metadata(&local_directory).await.is_ok() {
            fs::remove_dir_all(&local_directory)
                .await
                .map_err(|e| BackupError::Io { path: local_directory.clone(), source: e })?;
        }
        fs::create_dir_all(&local_directory)
            .await
            .map_err(|e| BackupError::Io { path: local_directory.clone(), source: e })?;

        let mut record = BackupRecord {
            package: package.clone(),
            local_directory: local_directory.clone(),
            apk_files: Vec::with_capacity(remote_paths.len()),
            obb_directory: None,
        };
        match self.pull_apks(&remote_paths, &mut record).await {
            Ok(()) if record.apk_files.is_empty() => {
                record.discard().await;
                return Err(BackupError::NothingToBackUp { package: package.to_string() });
            }
            Ok(()) => {}
            Err(e) => {
                record.discard().await;
                return Err(e);
            }
        }

        let obb_remote = format!("{OBB_ROOT}{package}");
        let output = self
            .run(AdbCommand::Pull { remote: obb_remote.clone(), local: local_directory.clone() })
            .await
            .map_err(|e| BackupError::Bridge(e.into()))?;
        if output.success() {
            info!(remote = obb_remote, "Backed up obb data");
            record.obb_directory = Some(local_directory.join(package.as_str()));
        } else if is_not_found(&output.output) {
            debug!("Package has no obb data");
        } else {
            record.discard().await;
            return Err(BackupError::Pull {
                remote: obb_remote,
                local: local_directory,
                message: output.output.trim().to_string(),
            });
        }

        info!(
            path = %record.local_directory.display(),
            apks = record.apk_files.len(),
            obb = record.contains_obb_data(),
            "Backup complete"
        );
        Ok(record)
    }

    async fn pull_apks(&self, remote_paths: &[&str], record: &mut BackupRecord) -> Result<(), BackupError> {
        for remote in remote_paths {
            let file_name = remote.rsplit('/').next().unwrap_or(remote);
            let local = record.local_directory.join(file_name);
            let output = self
                .run(AdbCommand::Pull { remote: remote.to_string(), local: local.clone() })
                .await
                .map_err(|e| BackupError::Bridge(e.into()))?;
            if output.success() {
                record.apk_files.push(local);
            } else if is_not_found(&output.output) {
                warn!(remote, "Installed file vanished before it could be pulled, skipping");
            } else {
                return Err(BackupError::Pull {
                    remote: remote.to_string(),
                    local,
                    message: output.output.trim().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Backs `package` up, then uninstalls it keeping its data.
    ///
    /// The uninstall is only issued once the backup exists. If the uninstall fails nothing was
    /// removed, so the backup is discarded.
    #[instrument(level = "debug", skip(self, work_root), fields(serial = %self.serial()), err)]
    pub async fn uninstall_with_backup(
        &self,
        package: &PackageName,
        work_root: &Path,
    ) -> Result<BackupRecord, BackupError> {
        let record = self.backup(package, work_root).await?;

        info!(package = %package, "Uninstalling (keeping data)");
        let output = match self
            .run(AdbCommand::Uninstall { keep_data: true, package: package.clone() })
            .await
        {
            Ok(output) => output,
            Err(e) => {
                record.discard().await;
                return Err(BackupError::Bridge(e.into()));
            }
        };
        if !output.success() || output.output.contains("Failure") {
            record.discard().await;
            return Err(BackupError::UninstallFailed {
                package: package.to_string(),
                message: output.output.trim().to_string(),
            });
        }
        Ok(record)
    }

    /// Reinstalls a backup. Apks go first so the package exists before its obb data is pushed.
    ///
    /// The local snapshot is deleted only after everything was replayed.
    #[instrument(level = "debug", skip(self, record), fields(serial = %self.serial(), package = %record.package), err)]
    pub async fn restore(&self, record: &BackupRecord) -> Result<(), RestoreError> {
        let fail = |message: String| RestoreError { path: record.local_directory.clone(), message };
        info!(path = %record.local_directory.display(), "Restoring previous installation");

        if let Some(obb_directory) = &record.obb_directory {
            for apk in &record.apk_files {
                let output = self
                    .install_files(InstallFlags::REPLACE_ONLY, std::slice::from_ref(apk))
                    .await
                    .map_err(|e| fail(format!("{e:#}")))?;
                let attempt = InstallAttemptResult::from_output(&output);
                if !attempt.succeeded {
                    return Err(fail(attempt.raw_message));
                }
            }
            let output = self.push(obb_directory, OBB_ROOT).await.map_err(|e| fail(format!("{e:#}")))?;
            if !output.success() {
                return Err(fail(format!("obb push failed: {}", output.output.trim())));
            }
        } else {
            let output = self
                .install_files(InstallFlags::REPLACE_ONLY, &record.apk_files)
                .await
                .map_err(|e| fail(format!("{e:#}")))?;
            let attempt = InstallAttemptResult::from_output(&output);
            if !attempt.succeeded {
                return Err(fail(attempt.raw_message));
            }
        }

        info!("Previous installation restored");
        record.discard().await;
        Ok(())
    }
}
