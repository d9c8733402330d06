use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use fs_err::tokio as fs;
use tracing::{debug, instrument, warn};

/// Resolves a configured tool: an existing path is used as is, anything else is looked up on
/// `PATH` by name.
#[instrument(level = "debug", ret)]
pub fn resolve_binary_path(configured: &str) -> Option<PathBuf> {
    let configured = configured.trim();
    if configured.is_empty() {
        return None;
    }
    let path = Path::new(configured);
    if path.is_file() {
        return Some(path.to_path_buf());
    }
    match which::which(configured) {
        Ok(found) => Some(found),
        Err(e) => {
            debug!(error = &e as &dyn std::error::Error, configured, "Binary not found on PATH");
            None
        }
    }
}

/// Like [`resolve_binary_path`], for a plain file such as a jar.
pub fn resolve_file_path(configured: &str) -> Option<PathBuf> {
    let path = Path::new(configured.trim());
    if path.as_os_str().is_empty() || !path.is_file() {
        return None;
    }
    Some(path.to_path_buf())
}

/// Recursively copies `src` into `dst`, creating `dst`.
pub async fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        bail!("Not a directory: {}", src.display());
    }
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        fs::create_dir_all(&to).await?;
        let mut rd = fs::read_dir(&from).await?;
        while let Some(entry) = rd.next_entry().await? {
            let target = to.join(entry.file_name());
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push((entry.path(), target));
            } else if file_type.is_file() {
                fs::copy(entry.path(), &target).await?;
            } else {
                warn!(path = %entry.path().display(), "Skipping special file");
            }
        }
    }
    Ok(())
}
