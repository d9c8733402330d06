//! Working copies of input packages and their cleanup.

use std::{
    error::Error,
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use fs_err::tokio as fs;
use tracing::{debug, instrument, warn};

use crate::utils::copy_dir_all;

/// Records every temporary path created for one input and removes them on drop.
///
/// Backup directories are never registered here; they outlive a failed restore.
#[derive(Debug)]
pub struct StagingArea {
    work_dir: PathBuf,
    paths: Vec<PathBuf>,
}

impl StagingArea {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self { work_dir: work_dir.into(), paths: Vec::new() }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// `<work_dir>/<md5(stem)>[.<ext>]` for `input`.
    pub fn staged_path(&self, input: &Path) -> PathBuf {
        let stem = input.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let mut name = OsString::from(format!("{:x}", md5::compute(stem.as_bytes())));
        if let Some(ext) = input.extension().filter(|_| !input.is_dir()) {
            name.push(".");
            name.push(ext);
        }
        self.work_dir.join(name)
    }

    /// Copies a file or an unpacked package directory into the work directory.
    #[instrument(level = "debug", skip(self, input), fields(input = %input.display()), err)]
    pub async fn stage_input(&mut self, input: &Path) -> Result<PathBuf> {
        fs::create_dir_all(&self.work_dir).await.context("Failed to create work directory")?;
        let staged = self.staged_path(input);
        self.track(staged.clone());
        if input.is_dir() {
            copy_dir_all(input, &staged).await.context("Failed to copy package directory")?;
        } else {
            fs::copy(input, &staged).await.context("Failed to copy package file")?;
        }
        debug!(staged = %staged.display(), "Staged input");
        Ok(staged)
    }

    /// `<staged>.d/`, created and tracked on first use.
    pub async fn scratch_dir(&mut self, staged: &Path) -> Result<PathBuf> {
        let mut name = staged.as_os_str().to_owned();
        name.push(".d");
        let dir = PathBuf::from(name);
        if !self.paths.contains(&dir) {
            self.track(dir.clone());
        }
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Registers an extra temporary path (for example a built `.apks`).
    pub fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        for path in self.paths.iter().rev() {
            if !path.exists() {
                continue;
            }
            let result = if path.is_dir() {
                fs_err::remove_dir_all(path)
            } else {
                fs_err::remove_file(path)
            };
            match result {
                Ok(()) => debug!(path = %path.display(), "Cleaned up staging path"),
                Err(e) => warn!(error = &e as &dyn Error, "Failed to clean up staging path"),
            }
        }
    }
}
