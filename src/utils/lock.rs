#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use fs2::FileExt;

/// Exclusive flock held for the life of a daemon instance.
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl LockGuard {
    /// Locks the sibling `<socket>.lock` of a listening socket.
    pub fn for_socket(socket: &Path) -> Result<Self> {
        Self::try_acquire(&lock_path_for(socket))
    }

    pub fn try_acquire(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;
        let file = open_lockfile(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self {
                file,
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                bail!("another lvmd instance holds lock: {}", path.display())
            }
            Err(e) => Err(e).with_context(|| format!("flock {}", path.display())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            let mut b = fs::DirBuilder::new();
            b.recursive(true)
                .mode(0o755)
                .create(dir)
                .with_context(|| format!("create socket dir {}", dir.display()))?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(dir)
                .with_context(|| format!("create socket dir {}", dir.display()))?;
        }
    }
    Ok(())
}

fn open_lockfile(path: &Path) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        opts.mode(0o600);
    }
    opts.open(path)
        .with_context(|| format!("open lockfile {}", path.display()))
}

fn lock_path_for(socket: &Path) -> PathBuf {
    let mut name = socket.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let sock = temp.path().join("lvmd.sock");
        let g1 = LockGuard::for_socket(&sock).expect("first acquire ok");
        assert_eq!(g1.path(), temp.path().join("lvmd.sock.lock"));
        drop(g1);

        let _g2 = LockGuard::for_socket(&sock).expect("re-acquire ok after drop");
    }

    #[test]
    fn second_instance_is_refused() {
        let temp = TempDir::new().unwrap();
        let sock = temp.path().join("lvmd.sock");
        let _g1 = LockGuard::for_socket(&sock).expect("first acquire ok");
        let err = LockGuard::for_socket(&sock).unwrap_err().to_string();
        assert!(err.contains("another lvmd instance"), "err was: {err}");
    }

    #[test]
    fn creates_missing_socket_dir() {
        let temp = TempDir::new().unwrap();
        let sub = temp.path().join("run/lvmd");
        let _g = LockGuard::for_socket(&sub.join("lvmd.sock")).expect("acquire");
        assert!(sub.is_dir());
    }
}
