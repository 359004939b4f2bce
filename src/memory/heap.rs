//! Heap-backed memory segment.

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};

/// A memory segment backed by heap allocation.
///
/// Suitable for arenas private to one process, and for tests and benchmarks.
/// Mutable access goes through [`AsMut`], so an [`Arena`](super::Arena) can
/// be created directly on top of it.
///
/// # Example
///
/// ```rust
/// use shmalloc::config::ArenaConfig;
/// use shmalloc::memory::{Arena, HeapSegment, MemorySegment};
///
/// let segment = HeapSegment::new(4096).unwrap();
/// assert_eq!(segment.len(), 4096);
///
/// let mut arena = Arena::create(segment, &ArenaConfig::default()).unwrap();
/// let chunk = arena.allocate(100).unwrap();
/// arena.free(chunk);
/// ```
pub struct HeapSegment {
    /// Boxed slice, so the memory never moves or grows behind the arena.
    data: Box<[u64]>,
    len: usize,
}

impl HeapSegment {
    /// Create a new zero-initialized heap segment.
    ///
    /// # Errors
    ///
    /// Returns an error if size is 0.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed(
                "size must be greater than 0".into(),
            ));
        }

        // u64 words keep the start 8-byte aligned
        let data = vec![0u64; size.div_ceil(8)].into_boxed_slice();
        Ok(Self { data, len: size })
    }
}

impl AsRef<[u8]> for HeapSegment {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: the words own at least `len` initialized bytes, and u8 has
        // no alignment requirement.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr().cast(), self.len) }
    }
}

impl AsMut<[u8]> for HeapSegment {
    fn as_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.data.as_mut_ptr().cast(), self.len) }
    }
}

impl MemorySegment for HeapSegment {
    fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr().cast()
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        // Writes require `&mut self`, see `AsMut`.
        None
    }

    fn len(&self) -> usize {
        self.len
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::Heap
    }
}
