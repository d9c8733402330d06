mod backup;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
pub use backup::BackupRecord;
use const_format::concatcp;
use derive_more::Debug;
use lazy_regex::{Lazy, Regex, lazy_regex};
use tracing::{debug, info, instrument, warn};

use super::{AdbCommand, Bridge, CommandOutput, InstallFlags, PackageName, install::InstallAttemptResult};

/// Device-side directory used to stage files for session installs.
pub const REMOTE_TMP_DIR: &str = "/data/local/tmp/";
/// Shared storage root for expansion files.
pub const EXTERNAL_STORAGE: &str = "/storage/emulated/0/";
pub const OBB_ROOT: &str = concatcp!(EXTERNAL_STORAGE, "Android/obb/");

static VERSION_CODE_REGEX: Lazy<Regex> = lazy_regex!(r"versionCode=(\d+)");
static PRIMARY_ABI_REGEX: Lazy<Regex> = lazy_regex!(r"primaryCpuAbi=(\S+)");
static SESSION_ID_REGEX: Lazy<Regex> = lazy_regex!(r"\[(\d+)\]");

/// Version and ABI of a package already present on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub version_code: i64,
    /// As reported by the package manager (`arm64-v8a`), `None` for apps without native code.
    pub primary_abi: Option<String>,
}

/// A connected device reached through a [`Bridge`].
#[derive(Debug, Clone)]
pub struct AdbDevice {
    #[debug("{}", bridge.serial())]
    bridge: Arc<dyn Bridge>,
}

impl AdbDevice {
    pub fn new(bridge: Arc<dyn Bridge>) -> Self {
        Self { bridge }
    }

    pub fn serial(&self) -> &str {
        self.bridge.serial()
    }

    /// Sends one command and waits for it to finish.
    pub async fn run(&self, command: AdbCommand) -> Result<CommandOutput> {
        self.bridge
            .execute(&command)
            .await
            .with_context(|| format!("Failed to run '{command}' on {}", self.serial()))
    }

    /// Reads a system property. An unset property yields an empty string.
    pub async fn getprop(&self, key: &str) -> Result<String> {
        let output = self.run(AdbCommand::GetProp(key.to_string())).await?;
        if !output.success() {
            bail!("getprop {key} failed: {}", output.output.trim());
        }
        Ok(output.output.trim().to_string())
    }

    pub async fn dumpsys(&self, topic: &[&str]) -> Result<String> {
        let output =
            self.run(AdbCommand::Dumpsys(topic.iter().map(|s| s.to_string()).collect())).await?;
        if !output.success() {
            bail!("dumpsys {} failed: {}", topic.join(" "), output.output.trim());
        }
        Ok(output.output)
    }

    /// Looks up an installed copy of `package` via `pm dump`.
    #[instrument(level = "debug", skip(self), fields(serial = %self.serial()), ret, err)]
    pub async fn installed_package(&self, package: &PackageName) -> Result<Option<InstalledPackage>> {
        let output = self.run(AdbCommand::PackageDump(package.clone())).await?;
        Ok(parse_package_dump(&output.output))
    }

    /// Installed file paths reported by `pm path`.
    pub async fn package_paths(&self, package: &PackageName) -> Result<CommandOutput> {
        self.run(AdbCommand::PathQuery(package.clone())).await
    }

    pub async fn push(&self, local: &Path, remote: &str) -> Result<CommandOutput> {
        self.run(AdbCommand::Push { local: local.to_path_buf(), remote: remote.to_string() }).await
    }

    /// `adb install` for one file, `adb install-multiple` for several.
    #[instrument(level = "debug", skip(self, paths), fields(serial = %self.serial(), count = paths.len()), err)]
    pub async fn install_files(&self, flags: InstallFlags, paths: &[PathBuf]) -> Result<CommandOutput> {
        let command = match paths {
            [path] => AdbCommand::Install { flags, path: path.clone() },
            _ => AdbCommand::InstallMultiple { flags, paths: paths.to_vec() },
        };
        info!(%flags, "Installing {} file(s)", paths.len());
        self.run(command).await
    }

    /// Installs `paths` through a package installer session.
    ///
    /// Each file is pushed to [`REMOTE_TMP_DIR`] and written under its stem with dots replaced by
    /// underscores. Any failure abandons the session; pushed files are removed on every path.
    /// Returns the output of the last command issued, which is the failing one on failure.
    #[instrument(level = "debug", skip(self, paths), fields(serial = %self.serial(), count = paths.len()), err)]
    pub async fn session_install(&self, paths: &[PathBuf]) -> Result<CommandOutput> {
        let created = self.run(AdbCommand::CreateSession).await?;
        let Some(session) = parse_session_id(&created.output).filter(|_| created.success()) else {
            warn!(output = created.output.trim(), "Could not create install session");
            return Ok(CommandOutput::new(created.status.max(1), created.output));
        };
        debug!(session, "Created install session");

        let mut pushed = Vec::with_capacity(paths.len());
        let result = self.write_session(&session, paths, &mut pushed).await;

        let result = match result {
            Ok(None) => {
                let commit = self.run(AdbCommand::CommitSession(session.clone())).await;
                match commit {
                    Ok(output) if InstallAttemptResult::from_output(&output).succeeded => Ok(output),
                    Ok(output) => {
                        self.abandon_session(&session).await;
                        Ok(output)
                    }
                    Err(e) => {
                        self.abandon_session(&session).await;
                        Err(e)
                    }
                }
            }
            Ok(Some(failed)) => {
                self.abandon_session(&session).await;
                Ok(failed)
            }
            Err(e) => {
                self.abandon_session(&session).await;
                Err(e)
            }
        };

        for remote in pushed {
            match self.run(AdbCommand::RemoveRemote(remote.clone())).await {
                Ok(output) if output.success() => {}
                Ok(output) => warn!(remote, output = output.output.trim(), "Failed to remove temp file"),
                Err(e) => warn!(remote, error = format!("{e:#}"), "Failed to remove temp file"),
            }
        }
        result
    }

    /// Pushes and writes every file. `Ok(Some(output))` carries the first failing step.
    async fn write_session(
        &self,
        session: &str,
        paths: &[PathBuf],
        pushed: &mut Vec<String>,
    ) -> Result<Option<CommandOutput>> {
        for path in paths {
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid split path {}", path.display()))?
                .to_string_lossy();
            let remote = format!("{REMOTE_TMP_DIR}{file_name}");
            let output = self.push(path, &remote).await?;
            if !output.success() {
                return Ok(Some(output));
            }
            pushed.push(remote.clone());

            let name = session_entry_name(path);
            let output = self
                .run(AdbCommand::WriteSession { session: session.to_string(), name, remote })
                .await?;
            if !output.success() {
                return Ok(Some(output));
            }
        }
        Ok(None)
    }

    async fn abandon_session(&self, session: &str) {
        info!(session, "Abandoning install session");
        match self.run(AdbCommand::AbandonSession(session.to_string())).await {
            Ok(output) if !output.success() => {
                warn!(session, output = output.output.trim(), "Failed to abandon install session")
            }
            Err(e) => warn!(session, error = format!("{e:#}"), "Failed to abandon install session"),
            Ok(_) => {}
        }
    }
}

fn parse_package_dump(output: &str) -> Option<InstalledPackage> {
    let version_code = VERSION_CODE_REGEX.captures(output)?[1].parse().ok()?;
    let primary_abi = PRIMARY_ABI_REGEX
        .captures(output)
        .map(|c| c[1].to_string())
        .filter(|abi| abi != "null");
    Some(InstalledPackage { version_code, primary_abi })
}

fn parse_session_id(output: &str) -> Option<String> {
    SESSION_ID_REGEX.captures(output).map(|c| c[1].to_string())
}

/// Session entry name: file stem with `.` replaced by `_` (`config.en.apk` -> `config_en`).
fn session_entry_name(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().replace('.', "_")).unwrap_or_default()
}
