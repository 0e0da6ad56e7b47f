use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tracing::{debug, warn};

/// Resolve `path` against `base` unless it is already absolute.
pub fn resolve_under(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Open the process log for appending, creating it and any missing parent
/// directories.
pub async fn open_append_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

/// Remove a socket file we created. Missing files are fine, anything else is
/// only worth a warning at this point.
pub fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove {}: {}", path.display(), e),
    }
}

/// `dir` if it exists and is a directory.
pub fn existing_dir(dir: &Path) -> Option<&Path> {
    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Some(dir),
        _ => None,
    }
}
