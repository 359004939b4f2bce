//! Memory management for shmalloc.
//!
//! This module provides the allocator and the shared segments it lives in.
//!
//! # Architecture
//!
//! - [`Arena`]: bucketed boundary-tag allocator over any byte buffer
//! - [`MemorySegment`]: trait for memory backends ([`HeapSegment`],
//!   [`SharedMemorySegment`])
//! - [`NamedMutex`]: mutex shared by every process opening the same name
//! - [`DynamicSegment`]: resizable shared segment hosting one arena
//! - [`LocalRef`]: a process's mapping of a segment, re-attached after resizes
//!
//! # Example
//!
//! ```rust,ignore
//! use shmalloc::config::{ArenaConfig, SegmentConfig};
//! use shmalloc::memory::{DynamicSegment, LocalRef, migrate};
//!
//! let config = SegmentConfig::new("configcache", 1 << 20)
//!     .arena(ArenaConfig::new("configuration cache", "CacheSize"));
//! let segment = DynamicSegment::create(config, migrate)?;
//!
//! // in every process
//! let mut local = LocalRef::new();
//! let guard = segment.lock()?;
//! let mut arena = guard.arena(&mut local)?;
//! let chunk = arena.allocate(64)?;
//! arena.bytes_mut(&chunk)[..5].copy_from_slice(b"hello");
//! ```

mod arena;
pub mod bucket;
pub mod defaults;
mod dynamic;
mod heap;
mod lock;
mod reference;
mod segment;
mod shared;
mod stats;

pub use arena::{Arena, Chunk, HEADER_SIZE, arena_overhead, migrate, required_size};
pub use bucket::{MIN_ALLOC, required_chunk_size};
pub use dynamic::{CopyFn, DynamicSegment, SegmentGuard, SegmentId};
pub use heap::HeapSegment;
pub use lock::{NamedMutex, NamedMutexGuard};
pub use reference::LocalRef;
pub use segment::{MemorySegment, MemoryType};
pub use shared::SharedMemorySegment;
pub use stats::ArenaStats;
