use std::path::Path;

use anyhow::{Result, bail};

pub fn ensure_executable(p: &Path) -> Result<()> {
    if !p.is_absolute() {
        bail!("lvm path must be absolute: {}", p.display());
    }
    if !is_executable(p) {
        bail!("lvm binary not found or not executable: {}", p.display());
    }
    Ok(())
}

fn is_executable(p: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(p) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
