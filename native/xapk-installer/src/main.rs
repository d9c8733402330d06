use std::{error::Error, future::Future, path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use tracing::{error, info, warn};
use xapk_installer::{
    confirm,
    installer::{Installer, connected_devices},
    settings::{SETTINGS_FILE_NAME, Settings},
    setup_logging,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Install apk, xapk, apkm, apks and aab packages on connected Android devices
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Package files or unpacked xapk directories
    #[arg(short, long = "file", required = true, num_args = 1..)]
    files: Vec<PathBuf>,

    /// Only install on devices whose serial contains this text
    #[arg(short, long)]
    serial: Option<String>,

    /// Install even if the device SDK is below the package minimum
    #[arg(short, long)]
    ignore: bool,

    /// Answer yes to every confirmation
    #[arg(short, long, conflicts_with = "no")]
    yes: bool,

    /// Answer no to every confirmation
    #[arg(short, long)]
    no: bool,

    /// Print debug output
    #[arg(long)]
    debug: bool,

    /// Settings file
    #[arg(long, default_value = SETTINGS_FILE_NAME)]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = match Settings::load_or_init(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load settings: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = match setup_logging(&settings.work_dir, cli.debug) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Failed to setup logging: {e:#}");
            None
        }
    };

    match until_interrupted(run(cli, &settings)).await {
        Some(Ok(true)) => ExitCode::SUCCESS,
        Some(Ok(false)) => ExitCode::FAILURE,
        Some(Err(e)) => {
            error!(error = e.as_ref() as &dyn Error, "{e:#}");
            ExitCode::FAILURE
        }
        None => ExitCode::from(130),
    }
}

/// `None` when Ctrl-C came first. `task` is dropped before this returns, so staged files are
/// already removed.
async fn until_interrupted<F: Future>(task: F) -> Option<F::Output> {
    tokio::select! {
        output = task => Some(output),
        () = interrupted() => None,
    }
}

async fn interrupted() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => warn!("Interrupted, cleaning up"),
        Err(e) => {
            warn!(error = &e as &dyn Error, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await
        }
    }
}

/// `Ok(false)` when at least one file failed.
async fn run(cli: Cli, settings: &Settings) -> Result<bool> {
    let (mut installer, adb) =
        Installer::from_settings(settings, confirm::policy(cli.yes, cli.no))?;
    installer.ignore_sdk = cli.ignore;
    if cli.ignore {
        warn!("Ignoring minimum SDK requirements");
    }

    let total = cli.files.len();
    let mut installed = 0;
    for file in &cli.files {
        let result = async {
            let devices = connected_devices(&adb, cli.serial.as_deref()).await?;
            installer.install_file(file, &devices).await
        }
        .await
        .with_context(|| format!("Failed to install {}", file.display()));
        match result {
            Ok(()) => installed += 1,
            Err(e) => error!("{e:#}"),
        }
    }

    info!("installed {installed}/{total}");
    Ok(installed == total)
}
