//! Memory segment trait and types.

use std::path::Path;

/// Type of memory backing a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryType {
    /// Private heap memory (single process only).
    Heap,
    /// Named shared memory mapped by every attached process.
    Shared,
}

impl MemoryType {
    /// Can this memory type be shared across processes on the same machine?
    #[inline]
    pub fn supports_ipc(&self) -> bool {
        match self {
            MemoryType::Heap => false,
            MemoryType::Shared => true,
        }
    }
}

/// Trait for memory segment backends.
///
/// A memory segment represents a contiguous region of memory an
/// [`Arena`](super::Arena) can be laid out in.
///
/// # Safety
///
/// Implementations must ensure that:
/// - Pointers remain valid for the lifetime of the segment
/// - Thread-safety requirements are met (Send + Sync)
/// - Memory is at least 8-byte aligned
pub trait MemorySegment: Send + Sync {
    /// Get a raw pointer to the start of this segment.
    fn as_ptr(&self) -> *const u8;

    /// Get a mutable pointer to the start of this segment.
    ///
    /// Returns `None` if the memory cannot be written through a shared
    /// handle.
    fn as_mut_ptr(&self) -> Option<*mut u8>;

    /// Total size of the segment in bytes.
    fn len(&self) -> usize;

    /// Returns true if the segment has zero length.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The type of memory backing this segment.
    fn memory_type(&self) -> MemoryType;

    /// Name other processes open the segment by, if any.
    fn path(&self) -> Option<&Path> {
        None
    }

    /// Get the segment as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no mutable references exist to this memory.
    unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: Caller guarantees no mutable references exist.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    /// Get the segment as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access to this memory. For shared
    /// memory this includes other processes, which in practice means holding
    /// the segment lock for as long as the slice lives.
    #[allow(clippy::mut_from_ref)]
    unsafe fn as_mut_slice(&self) -> Option<&mut [u8]> {
        // SAFETY: Caller guarantees exclusive access.
        self.as_mut_ptr()
            .map(|ptr| unsafe { std::slice::from_raw_parts_mut(ptr, self.len()) })
    }
}

impl dyn MemorySegment {
    /// Check if this segment can be opened by other processes.
    pub fn is_shareable(&self) -> bool {
        self.memory_type().supports_ipc() && self.path().is_some()
    }
}
