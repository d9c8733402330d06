use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument, trace, warn};

use super::PackageName;

/// Flags passed to `adb install` / `adb install-multiple`.
///
/// Rendered as one combined short-option token (`-rtd`, `-r`, ...) the way older bridge builds
/// expect; an empty set renders no token at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InstallFlags {
    pub replace: bool,
    pub allow_test: bool,
    pub allow_downgrade: bool,
}

impl InstallFlags {
    /// Replace existing install, allow test packages, allow downgrade.
    pub const AGGRESSIVE: Self = Self { replace: true, allow_test: true, allow_downgrade: true };
    pub const REPLACE_ONLY: Self = Self { replace: true, allow_test: false, allow_downgrade: false };
    pub const NONE: Self = Self { replace: false, allow_test: false, allow_downgrade: false };

    pub fn with_test(self) -> Self {
        Self { allow_test: true, ..self }
    }

    pub fn to_arg(self) -> Option<String> {
        let mut arg = String::from("-");
        if self.replace {
            arg.push('r');
        }
        if self.allow_test {
            arg.push('t');
        }
        if self.allow_downgrade {
            arg.push('d');
        }
        (arg.len() > 1).then_some(arg)
    }
}

impl fmt::Display for InstallFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_arg() {
            Some(arg) => f.write_str(&arg),
            None => f.write_str("(no flags)"),
        }
    }
}

/// One command sent to a single device over the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdbCommand {
    GetProp(String),
    Dumpsys(Vec<String>),
    PackageDump(PackageName),
    PathQuery(PackageName),
    Push { local: PathBuf, remote: String },
    Pull { remote: String, local: PathBuf },
    Install { flags: InstallFlags, path: PathBuf },
    InstallMultiple { flags: InstallFlags, paths: Vec<PathBuf> },
    CreateSession,
    WriteSession { session: String, name: String, remote: String },
    CommitSession(String),
    AbandonSession(String),
    Uninstall { keep_data: bool, package: PackageName },
    RemoveRemote(String),
}

impl AdbCommand {
    /// Arguments following `adb -s <serial>`.
    pub fn args(&self) -> Vec<OsString> {
        fn shell<const N: usize>(words: [&str; N]) -> Vec<OsString> {
            std::iter::once("shell").chain(words).map(OsString::from).collect()
        }
        fn with_flags(command: &str, flags: &InstallFlags) -> Vec<OsString> {
            let mut args = vec![OsString::from(command)];
            args.extend(flags.to_arg().map(OsString::from));
            args
        }

        match self {
            AdbCommand::GetProp(key) => shell(["getprop", key.as_str()]),
            AdbCommand::Dumpsys(topic) => {
                let mut args = shell(["dumpsys"]);
                args.extend(topic.iter().map(OsString::from));
                args
            }
            AdbCommand::PackageDump(package) => shell(["pm", "dump", package.as_str()]),
            AdbCommand::PathQuery(package) => shell(["pm", "path", package.as_str()]),
            AdbCommand::Push { local, remote } => {
                vec!["push".into(), local.as_os_str().to_owned(), remote.into()]
            }
            AdbCommand::Pull { remote, local } => {
                vec!["pull".into(), remote.into(), local.as_os_str().to_owned()]
            }
            AdbCommand::Install { flags, path } => {
                let mut args = with_flags("install", flags);
                args.push(path.as_os_str().to_owned());
                args
            }
            AdbCommand::InstallMultiple { flags, paths } => {
                let mut args = with_flags("install-multiple", flags);
                args.extend(paths.iter().map(|p| p.as_os_str().to_owned()));
                args
            }
            AdbCommand::CreateSession => shell(["pm", "install-create"]),
            AdbCommand::WriteSession { session, name, remote } => {
                shell(["pm", "install-write", session.as_str(), name.as_str(), remote.as_str()])
            }
            AdbCommand::CommitSession(session) => shell(["pm", "install-commit", session.as_str()]),
            AdbCommand::AbandonSession(session) => shell(["pm", "install-abandon", session.as_str()]),
            AdbCommand::Uninstall { keep_data, package } => {
                if *keep_data {
                    shell(["pm", "uninstall", "-k", package.as_str()])
                } else {
                    shell(["pm", "uninstall", package.as_str()])
                }
            }
            AdbCommand::RemoveRemote(path) => shell(["rm", "-f", path.as_str()]),
        }
    }
}

impl fmt::Display for AdbCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self.args();
        let rendered = args.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" ");
        f.write_str(&rendered)
    }
}

/// Exit status and combined stdout/stderr of a bridge command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn new(status: i32, output: impl Into<String>) -> Self {
        Self { status, output: output.into() }
    }

    pub fn ok(output: impl Into<String>) -> Self {
        Self::new(0, output)
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    fn from_process(output: std::process::Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", stdout.trim_end(), stderr.trim_end()),
            (false, true) => stdout.into_owned(),
            (true, _) => stderr.into_owned(),
        };
        Self { status: output.status.code().unwrap_or(-1), output: combined }
    }
}

/// Command channel to one connected device.
///
/// Implementations must not interleave commands: the engine awaits every call before issuing
/// the next one.
#[async_trait]
pub trait Bridge: Send + Sync + fmt::Debug {
    fn serial(&self) -> &str;

    /// Runs one command. `Err` means the bridge itself could not be invoked; a command that ran
    /// and failed is reported through a nonzero [`CommandOutput::status`].
    async fn execute(&self, command: &AdbCommand) -> Result<CommandOutput>;
}

/// [`Bridge`] backed by the `adb` executable.
#[derive(Debug, Clone)]
pub struct AdbBridge {
    adb_path: PathBuf,
    serial: String,
}

impl AdbBridge {
    pub fn new(adb_path: impl Into<PathBuf>, serial: impl Into<String>) -> Self {
        Self { adb_path: adb_path.into(), serial: serial.into() }
    }
}

#[async_trait]
impl Bridge for AdbBridge {
    fn serial(&self) -> &str {
        &self.serial
    }

    #[instrument(level = "debug", skip(self), fields(serial = %self.serial, command = %command), err)]
    async fn execute(&self, command: &AdbCommand) -> Result<CommandOutput> {
        let mut args = vec![OsString::from("-s"), OsString::from(&self.serial)];
        args.extend(command.args());
        let output = run_adb(&self.adb_path, &args).await?;
        trace!(status = output.status, output = %output.output, "Bridge command finished");
        Ok(output)
    }
}

async fn run_adb(adb_path: &Path, args: &[OsString]) -> Result<CommandOutput> {
    let mut command = Command::new(adb_path);
    command.args(args).kill_on_drop(true);
    #[cfg(target_os = "windows")]
    // CREATE_NO_WINDOW
    command.creation_flags(0x08000000);
    let output = command
        .output()
        .await
        .with_context(|| format!("Failed to run {}", adb_path.display()))?;
    Ok(CommandOutput::from_process(output))
}

/// Lists serials of connected devices in the `device` state.
#[instrument(level = "debug", skip(adb_path), fields(adb_path = %adb_path.display()), err)]
pub async fn list_devices(adb_path: &Path) -> Result<Vec<String>> {
    let args = [OsString::from("devices")];
    let mut output = run_adb(adb_path, &args).await?;
    if parse_devices(&output.output).daemon_started {
        info!("Started adb server for the first time, listing devices again");
        output = run_adb(adb_path, &args).await?;
    }
    anyhow::ensure!(output.success(), "'adb devices' failed: {}", output.output.trim());

    let listing = parse_devices(&output.output);
    for (serial, state) in &listing.skipped {
        warn!(serial, state, "Skipping device that is not ready");
    }
    debug!(devices = ?listing.ready, "Connected devices");
    if listing.ready.len() > 1 {
        info!("More than one device detected, installing on each in turn");
    }
    Ok(listing.ready)
}

#[derive(Debug, Default, PartialEq, Eq)]
struct DeviceListing {
    ready: Vec<String>,
    skipped: Vec<(String, String)>,
    daemon_started: bool,
}

fn parse_devices(output: &str) -> DeviceListing {
    let mut listing = DeviceListing::default();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.starts_with("* daemon") {
            listing.daemon_started |= line.contains("started successfully");
            continue;
        }
        if line.starts_with("List of devices") {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(serial), Some(state)) = (parts.next(), parts.next()) else {
            continue;
        };
        if state == "device" {
            listing.ready.push(serial.to_string());
        } else {
            listing.skipped.push((serial.to_string(), state.to_string()));
        }
    }
    listing
}
