use anyhow::{Context, Result};
use log::debug;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Expand environment variables and `~` in a path string
pub fn expand_path_str(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| path.into())
        .into_owned()
}

/// Expand a PathBuf with environment variables
pub fn expand_path_buf(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    PathBuf::from(expand_path_str(&path_str))
}

/// Create a directory and all parent directories if they don't exist
pub fn ensure_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {path:?}"))?;
        debug!("Created directory: {path:?}");
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success
pub fn remove_file_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {path:?}");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {path:?}")),
    }
}

/// Write `script` to `path` with mode 0755, replacing any existing file
pub fn write_executable_script(script: &str, path: &Path) -> Result<()> {
    fs::write(path, script).with_context(|| format!("Failed to write script {path:?}"))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Failed to make {path:?} executable"))?;
    Ok(())
}
