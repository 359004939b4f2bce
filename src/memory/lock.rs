//! Cross-process mutex.
//!
//! A [`NamedMutex`] is an exclusive `flock(2)` on a lock file that every
//! cooperating process opens by name. `flock` locks belong to the open file
//! description, so threads sharing one `NamedMutex` would not exclude each
//! other through it: an in-process mutex is taken first to cover them.
//!
//! The kernel drops the lock when its holder dies, so a crashed process
//! never leaves the mutex held. The data it was protecting may still be
//! half updated.

use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{FlockOperation, Mode, OFlags};
use rustix::io::Errno;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

/// Mutex shared by every process that opens the same lock file.
pub struct NamedMutex {
    fd: OwnedFd,
    local: Mutex<()>,
    path: PathBuf,
}

impl NamedMutex {
    /// Open the mutex at `path`, creating the lock file if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::CLOEXEC,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| Error::Lock(format!("cannot open mutex {}: {e}", path.display())))?;

        Ok(Self {
            fd,
            local: Mutex::new(()),
            path: path.to_path_buf(),
        })
    }

    /// Block until the mutex is acquired.
    pub fn lock(&self) -> Result<NamedMutexGuard<'_>> {
        // Nothing guarded by the local mutex can be left inconsistent.
        let local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match rustix::fs::flock(&self.fd, FlockOperation::LockExclusive) {
                Ok(()) => break,
                Err(Errno::INTR) => continue,
                Err(e) => {
                    return Err(Error::Lock(format!(
                        "cannot lock mutex {}: {e}",
                        self.path.display()
                    )));
                }
            }
        }
        Ok(NamedMutexGuard {
            mutex: self,
            _local: local,
        })
    }

    /// Acquire the mutex if nobody holds it.
    pub fn try_lock(&self) -> Result<Option<NamedMutexGuard<'_>>> {
        let local = match self.local.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(None),
        };
        match rustix::fs::flock(&self.fd, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => Ok(Some(NamedMutexGuard {
                mutex: self,
                _local: local,
            })),
            Err(Errno::WOULDBLOCK) | Err(Errno::INTR) => Ok(None),
            Err(e) => Err(Error::Lock(format!(
                "cannot lock mutex {}: {e}",
                self.path.display()
            ))),
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the lock file. Processes that still have it open keep a
    /// working mutex among themselves, so only call this once every user is
    /// gone.
    pub fn destroy(self) -> Result<()> {
        Self::remove(&self.path)
    }

    /// Delete the lock file at `path`. A missing file is not an error.
    pub fn remove<P: AsRef<Path>>(path: P) -> Result<()> {
        match rustix::fs::unlink(path.as_ref()) {
            Ok(()) | Err(Errno::NOENT) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for NamedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedMutex").field("path", &self.path).finish()
    }
}

/// Holds a [`NamedMutex`] until dropped.
#[must_use = "the mutex is released as soon as the guard is dropped"]
pub struct NamedMutexGuard<'a> {
    mutex: &'a NamedMutex,
    _local: MutexGuard<'a, ()>,
}

impl Drop for NamedMutexGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = rustix::fs::flock(&self.mutex.fd, FlockOperation::Unlock) {
            tracing::warn!(path = %self.mutex.path.display(), "failed to unlock mutex: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_lock_and_try_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let first = NamedMutex::open(&path).unwrap();
        let second = NamedMutex::open(&path).unwrap();

        let guard = first.lock().unwrap();
        assert!(second.try_lock().unwrap().is_none());
        assert!(first.try_lock().unwrap().is_none());
        drop(guard);

        assert!(second.try_lock().unwrap().is_some());
    }

    #[test]
    fn test_shared_handle_excludes_threads() {
        let dir = tempfile::tempdir().unwrap();
        let mutex = Arc::new(NamedMutex::open(dir.path().join("test.lock")).unwrap());
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = Arc::clone(&mutex);
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = mutex.lock().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_separate_handles_exclude_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = NamedMutex::open(&path).unwrap();
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let _guard = mutex.lock().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_destroy_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        let mutex = NamedMutex::open(&path).unwrap();
        assert!(path.exists());

        mutex.destroy().unwrap();
        assert!(!path.exists());
        NamedMutex::remove(&path).unwrap();
    }
}
