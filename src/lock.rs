//! Advisory per-instance lock held for the duration of a mutating operation.
//!
//! The lock is an exclusive `flock` on `<root>/locks/<name>.lock`. It is
//! released when the guard drops, including on early returns and panics; the
//! kernel also drops it if the process dies.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

pub struct InstanceLock {
    path: PathBuf,
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl InstanceLock {
    /// Try to take the lock without blocking; a held lock yields `Locked`.
    pub fn acquire(path: &Path, instance: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::acquire_inner(path, instance)
    }

    #[cfg(unix)]
    fn acquire_inner(path: &Path, instance: &str) -> Result<Self> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| AppError::io(format!("Failed to open lock {:?}: {}", path, e)))?;

        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, Errno::EWOULDBLOCK)) => return Err(AppError::locked(instance)),
            Err((_, errno)) => {
                return Err(AppError::io(format!(
                    "Failed to lock {:?}: {}",
                    path, errno
                )))
            }
        };

        // Owner hint for operators; the flock itself is what excludes.
        if let Err(e) = lock
            .set_len(0)
            .and_then(|()| writeln!(lock, "{}", std::process::id()))
        {
            log::debug!("Failed to record owner in {:?}: {}", path, e);
        }

        log::debug!("Acquired lock for instance {}", instance);
        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    #[cfg(not(unix))]
    fn acquire_inner(path: &Path, instance: &str) -> Result<Self> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(AppError::locked(instance))
            }
            Err(e) => return Err(AppError::io(format!("Failed to lock {:?}: {}", path, e))),
        };
        if let Err(e) = writeln!(file, "{}", std::process::id()) {
            log::debug!("Failed to record owner in {:?}: {}", path, e);
        }
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(not(unix))]
impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to release lock {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("locks/srv.lock");

        let first = InstanceLock::acquire(&path, "srv").unwrap();
        let err = InstanceLock::acquire(&path, "srv").err().unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::Locked);

        drop(first);
        assert!(InstanceLock::acquire(&path, "srv").is_ok());
    }

    #[test]
    fn different_instances_do_not_contend() {
        let tmp = tempfile::tempdir().unwrap();
        let _a = InstanceLock::acquire(&tmp.path().join("a.lock"), "a").unwrap();
        assert!(InstanceLock::acquire(&tmp.path().join("b.lock"), "b").is_ok());
    }
}
