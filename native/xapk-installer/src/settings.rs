use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Keystore passed to `bundletool build-apks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signing {
    pub ks: String,
    pub ks_pass: String,
    pub ks_key_alias: String,
    pub key_pass: String,
}

impl Signing {
    pub fn to_args(&self) -> Vec<String> {
        vec![
            format!("--ks={}", self.ks),
            format!("--ks-pass={}", self.ks_pass),
            format!("--ks-key-alias={}", self.ks_key_alias),
            format!("--key-pass={}", self.key_pass),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub adb_path: String,
    /// Optional; without it manifests are decoded directly.
    pub aapt_path: String,
    pub java_path: String,
    /// Optional; without it `.aab` files cannot be installed.
    pub bundletool_path: String,
    /// Staging copies and backups live here.
    pub work_dir: PathBuf,
    pub signing: Option<Signing>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            aapt_path: "aapt".to_string(),
            java_path: "java".to_string(),
            bundletool_path: "bundletool.jar".to_string(),
            work_dir: PathBuf::from("xapk-installer-work"),
            signing: None,
        }
    }
}

impl Settings {
    /// Loads settings from `path`, writing the defaults there if the file does not exist yet.
    #[instrument(level = "debug", err)]
    pub fn load_or_init(path: &Path) -> Result<Settings> {
        if !path.exists() {
            info!(path = %path.display(), "Settings file doesn't exist, writing defaults");
            let settings = Settings::default();
            settings.save(path)?;
            return Ok(settings);
        }

        let content = fs::read_to_string(path).context("Failed to read settings file")?;
        let settings: Settings =
            serde_json::from_str(&content).context("Failed to parse settings file")?;
        debug!(?settings, "Loaded settings");
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).context("Failed to create settings directory")?;
        }
        fs::write(path, json).context("Failed to write settings file")?;
        Ok(())
    }
}
