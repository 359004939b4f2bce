//! Named shared memory regions.
//!
//! A region is a file in a tmpfs directory (normally `/dev/shm`) mapped
//! `MAP_SHARED`. Any process that knows the path can map the same bytes,
//! which is all the cooperating processes of a
//! [`DynamicSegment`](super::DynamicSegment) share: no file descriptors are
//! passed around.
//!
//! # Example
//!
//! ```rust,ignore
//! use shmalloc::memory::{MemorySegment, SharedMemorySegment};
//!
//! let region = SharedMemorySegment::create("/dev/shm/example.1", 1 << 20)?;
//!
//! // in another process
//! let same = SharedMemorySegment::open("/dev/shm/example.1")?;
//! assert_eq!(same.len(), 1 << 20);
//!
//! // once nobody needs it any more
//! SharedMemorySegment::remove("/dev/shm/example.1")?;
//! ```

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// A mapping of a named shared memory region.
///
/// Dropping the value unmaps this process's view. The region itself lives
/// until [`SharedMemorySegment::remove`] deletes its name and the last
/// mapping goes away.
pub struct SharedMemorySegment {
    /// Open descriptor of the region file.
    fd: OwnedFd,
    /// Pointer to the mmap'd region.
    ptr: NonNull<u8>,
    /// Size of the mapping.
    len: usize,
    /// Name of the region.
    path: PathBuf,
}

impl SharedMemorySegment {
    /// Create a new zero-filled region of `size` bytes at `path`.
    ///
    /// # Errors
    ///
    /// Fails if `size` is 0, if a region of that name already exists, or if
    /// sizing or mapping the region fails. A region created before the
    /// failure is removed again.
    pub fn create<P: AsRef<Path>>(path: P, size: usize) -> Result<Self> {
        let path = path.as_ref();

        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::EXCL | OFlags::CLOEXEC,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| {
            Error::AllocationFailed(format!("cannot create region {}: {e}", path.display()))
        })?;

        if let Err(e) = rustix::fs::ftruncate(&fd, size as u64) {
            let _ = rustix::fs::unlink(path);
            return Err(e.into());
        }

        match Self::map(fd, size, path) {
            Ok(segment) => {
                tracing::debug!(path = %path.display(), size, "shared region created");
                Ok(segment)
            }
            Err(e) => {
                let _ = rustix::fs::unlink(path);
                Err(e)
            }
        }
    }

    /// Map an existing region. The mapping covers the whole region.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSegment`] if no region of that name exists or
    /// if it is empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let fd = rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()).map_err(
            |e| Error::InvalidSegment(format!("cannot open region {}: {e}", path.display())),
        )?;

        let stat = rustix::fs::fstat(&fd)?;
        let size = stat.st_size as usize;
        if size == 0 {
            return Err(Error::InvalidSegment(format!(
                "region {} is empty",
                path.display()
            )));
        }

        Self::map(fd, size, path)
    }

    fn map(fd: OwnedFd, size: usize, path: &Path) -> Result<Self> {
        // SAFETY: a fresh shared mapping of a file we hold open; no existing
        // memory is affected.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        Ok(Self {
            fd,
            ptr,
            len: size,
            path: path.to_path_buf(),
        })
    }

    /// Delete the name of a region. Mappings that exist stay valid.
    ///
    /// A missing region is not an error.
    pub fn remove<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        match rustix::fs::unlink(path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "shared region removed");
                Ok(())
            }
            Err(Errno::NOENT) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a region of that name exists.
    pub fn exists<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref().exists()
    }
}

impl MemorySegment for SharedMemorySegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        Some(self.ptr.as_ptr())
    }

    fn len(&self) -> usize {
        self.len
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Shared
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        // SAFETY: the mapping was created in `map` with this length and no
        // slices into it outlive `self`.
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: SharedMemorySegment is Send + Sync because:
// - The mapping is process-wide and can be accessed from any thread
// - Mutable access is only handed out through unsafe methods whose callers
//   provide the synchronization
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl AsFd for SharedMemorySegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for SharedMemorySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemorySegment")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_memory_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");

        let segment = SharedMemorySegment::create(&path, 4096).unwrap();
        assert_eq!(segment.len(), 4096);
        assert_eq!(segment.memory_type(), MemoryType::Shared);
        assert_eq!(segment.path(), Some(path.as_path()));
        assert!(SharedMemorySegment::exists(&path));
    }

    #[test]
    fn test_shared_memory_zero_size_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        assert!(SharedMemorySegment::create(&path, 0).is_err());
        assert!(!SharedMemorySegment::exists(&path));
    }

    #[test]
    fn test_shared_memory_create_existing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let _first = SharedMemorySegment::create(&path, 4096).unwrap();
        assert!(SharedMemorySegment::create(&path, 4096).is_err());
    }

    #[test]
    fn test_shared_memory_open_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = SharedMemorySegment::open(dir.path().join("missing"));
        assert!(matches!(result, Err(Error::InvalidSegment(_))));
    }

    #[test]
    fn test_shared_memory_modifications_visible() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");

        let segment1 = SharedMemorySegment::create(&path, 4096).unwrap();
        let segment2 = SharedMemorySegment::open(&path).unwrap();
        assert_eq!(segment2.len(), 4096);

        unsafe {
            *segment1.as_mut_ptr().unwrap() = 77;
            assert_eq!(*segment2.as_ptr(), 77);

            *segment2.as_mut_ptr().unwrap().add(4095) = 88;
            assert_eq!(segment1.as_slice()[4095], 88);
        }
    }

    #[test]
    fn test_shared_memory_remove_keeps_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");

        let segment = SharedMemorySegment::create(&path, 4096).unwrap();
        unsafe { segment.as_mut_slice().unwrap()[10] = 5 };

        SharedMemorySegment::remove(&path).unwrap();
        assert!(!SharedMemorySegment::exists(&path));
        assert_eq!(unsafe { segment.as_slice()[10] }, 5);

        // removing twice is fine
        SharedMemorySegment::remove(&path).unwrap();
    }
}
