use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Walk upward from `start` to the first directory containing `marker`.
///
/// A relative `start` is resolved against the current directory first, so the
/// root found is always absolute.
pub fn find_project_root(start: &Path, marker: &str) -> Result<PathBuf> {
    let start = if start.as_os_str().is_empty() { Path::new(".") } else { start };
    let mut dir = std::path::absolute(start)
        .map_err(|e| Error::io(format!("failed to resolve {}", start.display()), e))?;
    loop {
        if dir.join(marker).is_file() {
            return Ok(dir);
        }
        if !dir.pop() {
            return Err(Error::ProjectRootNotFound {
                start: start.to_path_buf(),
                marker: marker.to_string(),
            });
        }
    }
}
