//! `java -jar bundletool.jar` wrapper for `.aab` builds and `toc.pb` `.apks` installs.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::settings::Signing;

pub const DOWNLOAD_HINT: &str =
    "Download bundletool from https://github.com/google/bundletool/releases and set bundletool_path";

/// Marker bundletool prints when the `.apks` was built without the device's density.
const MISSING_DENSITY_MARKER: &str = "[SCREEN_DENSITY]";

#[derive(Debug, Clone)]
pub struct Bundletool {
    java: PathBuf,
    jar: PathBuf,
    adb: PathBuf,
    signing: Option<Signing>,
}

impl Bundletool {
    pub fn new(java: PathBuf, jar: PathBuf, adb: PathBuf, signing: Option<Signing>) -> Self {
        Self { java, jar, adb, signing }
    }

    fn build_apks_args(&self, bundle: &Path, serial: &str, output: &Path) -> Vec<OsString> {
        let mut bundle_arg = OsString::from("--bundle=");
        bundle_arg.push(bundle);
        let mut output_arg = OsString::from("--output=");
        output_arg.push(output);
        let mut args = self.tool_args("build-apks");
        args.extend([
            OsString::from("--connected-device"),
            OsString::from(format!("--device-id={serial}")),
            bundle_arg,
            output_arg,
        ]);
        if let Some(signing) = &self.signing {
            args.extend(signing.to_args().into_iter().map(OsString::from));
        }
        args
    }

    fn install_apks_args(&self, apks: &Path, serial: &str) -> Vec<OsString> {
        let mut apks_arg = OsString::from("--apks=");
        apks_arg.push(apks);
        let mut args = self.tool_args("install-apks");
        args.extend([apks_arg, OsString::from(format!("--device-id={serial}"))]);
        args
    }

    fn tool_args(&self, subcommand: &str) -> Vec<OsString> {
        let mut adb_arg = OsString::from("--adb=");
        adb_arg.push(&self.adb);
        vec![
            OsString::from("-jar"),
            self.jar.clone().into_os_string(),
            OsString::from(subcommand),
            adb_arg,
        ]
    }

    /// Builds the device-specific split set of `bundle` into `output`.
    #[instrument(level = "debug", skip(self, bundle, output), fields(bundle = %bundle.display()), err)]
    pub async fn build_apks(&self, bundle: &Path, serial: &str, output: &Path) -> Result<()> {
        info!("Building apks from app bundle");
        let (ok, text) = self.run(self.build_apks_args(bundle, serial, output)).await?;
        if !ok || !output.is_file() {
            bail!("bundletool build-apks failed: {}\n{DOWNLOAD_HINT}", text.trim());
        }
        Ok(())
    }

    /// Lets bundletool select and install the splits of a `toc.pb` archive itself.
    #[instrument(level = "debug", skip(self, apks), fields(apks = %apks.display()), err)]
    pub async fn install_apks(&self, apks: &Path, serial: &str) -> Result<()> {
        info!("Installing apks with bundletool");
        let (ok, text) = self.run(self.install_apks_args(apks, serial)).await?;
        if text.contains(MISSING_DENSITY_MARKER) {
            bail!(
                "The apks file has no split for this device's screen density. Rebuild it with \
                 --connected-device or --device-spec for this device"
            );
        }
        if !ok {
            bail!("bundletool install-apks failed: {}", text.trim());
        }
        Ok(())
    }

    async fn run(&self, args: Vec<OsString>) -> Result<(bool, String)> {
        debug!(?args, "Running bundletool");
        let mut command = Command::new(&self.java);
        command.args(&args).kill_on_drop(true);
        #[cfg(target_os = "windows")]
        // CREATE_NO_WINDOW
        command.creation_flags(0x08000000);
        let output = command
            .output()
            .await
            .with_context(|| format!("Failed to run {}. {DOWNLOAD_HINT}", self.java.display()))?;
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        Ok((output.status.success(), text))
    }
}
