//! # shmalloc
//!
//! A fixed-capacity allocator living entirely inside memory shared by
//! cooperating processes, plus the segment manager that creates, resizes and
//! re-references that memory.
//!
//! ## Features
//!
//! - **Bucketed allocation**: O(1) for small sizes, first fit above 256 bytes
//! - **Boundary tags**: freeing merges with both neighbours in O(1)
//! - **Position independent**: chunks are offsets, every process may map the
//!   arena anywhere
//! - **Resizable segments**: grow or shrink the shared region; stale mappings
//!   are detected and repaired on the next access
//! - **Lock-checked access**: the arena of a shared segment is only reachable
//!   through a guard of its cross-process mutex
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shmalloc::prelude::*;
//!
//! let config = SegmentConfig::new("valuecache", 8 << 20)
//!     .arena(ArenaConfig::new("value cache", "ValueCacheSize").allow_oom(true));
//! let segment = DynamicSegment::create(config, migrate)?;
//!
//! let mut local = LocalRef::new();
//! let mut guard = segment.lock()?;
//! let result = guard.arena(&mut local)?.allocate(4096);
//! let chunk = match result {
//!     Ok(chunk) => chunk,
//!     Err(e) if e.is_out_of_memory() => {
//!         guard.resize(16 << 20)?;
//!         guard.arena(&mut local)?.allocate(4096)?
//!     }
//!     Err(e) => return Err(e),
//! };
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod memory;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{ArenaConfig, SegmentConfig};
    pub use crate::error::{Error, Result};
    pub use crate::memory::{
        Arena, ArenaStats, Chunk, DynamicSegment, HeapSegment, LocalRef, MemorySegment,
        SegmentGuard, SegmentId, migrate,
    };
}

pub use error::{Error, Result};
