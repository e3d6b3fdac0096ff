//! Storage directory checks and per-call log directories.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const LOG_DIR_PREFIX: &str = "parallelMap_log_";

/// The storage directory must exist, be a directory and accept new files.
pub fn check_storage_dir(dir: &Path) -> Result<()> {
    let metadata = fs::metadata(dir).map_err(|e| {
        Error::resource(format!("storage directory {} is not accessible: {}", dir.display(), e))
    })?;
    if !metadata.is_dir() {
        return Err(Error::resource(format!(
            "storage directory {} is not a directory",
            dir.display()
        )));
    }

    tempfile::Builder::new()
        .prefix(".parmap-probe")
        .tempfile_in(dir)
        .map(drop)
        .map_err(|e| {
            Error::resource(format!("storage directory {} is not writable: {}", dir.display(), e))
        })
}

/// Delete every `parallelMap_log_*` directory directly under `dir`.
pub fn clear_log_dirs(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let is_log_dir = entry.file_name().to_string_lossy().starts_with(LOG_DIR_PREFIX)
            && entry.file_type()?.is_dir();
        if is_log_dir {
            fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::debug!("Removed {} old log director(ies) from {}", removed, dir.display());
    }
    Ok(removed)
}

/// Create `<dir>/parallelMap_log_<call>`.
pub fn create_call_log_dir(dir: &Path, call: usize) -> Result<PathBuf> {
    let path = dir.join(format!("{}{}", LOG_DIR_PREFIX, call));
    fs::create_dir_all(&path).map_err(|e| {
        Error::resource(format!("failed to create log directory {}: {}", path.display(), e))
    })?;
    Ok(path)
}
