//! Configuration for arenas and shared segments.
//!
//! Both types follow the same builder style: construct with `new`, adjust
//! with chained setters, or start from `Default`.

use crate::error::{Error, Result};
use crate::memory::defaults;
use std::path::PathBuf;

/// Arena configuration.
///
/// The two tags are diagnostics only: they show up in exhaustion errors and
/// statistics dumps so an operator can tell which cache ran out of memory
/// and which configuration parameter sizes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Human-readable name of the cache living in the arena.
    pub description: String,
    /// Configuration parameter the arena size comes from.
    pub origin: String,
    /// Return [`Error::OutOfMemory`] on exhaustion instead of terminating the
    /// process.
    pub allow_oom: bool,
}

impl ArenaConfig {
    /// Create a configuration with the given tags. Exhaustion is fatal.
    pub fn new(description: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            origin: origin.into(),
            allow_oom: false,
        }
    }

    /// Allow or forbid recovering from out-of-memory.
    pub fn allow_oom(mut self, allow: bool) -> Self {
        self.allow_oom = allow;
        self
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::new(defaults::DESCRIPTION, defaults::ORIGIN)
    }
}

/// Shared segment configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentConfig {
    /// Segment name. Every region and lock file of the segment is derived
    /// from it, so it must be unique within `shm_dir`.
    pub name: String,
    /// Initial data region size in bytes (0 = create without a data region).
    pub size: usize,
    /// Directory the named regions and the lock file live in.
    pub shm_dir: PathBuf,
    /// Name of the cross-process mutex.
    pub mutex_name: String,
    /// Configuration of the arena hosted in the data region.
    pub arena: ArenaConfig,
}

impl SegmentConfig {
    /// Create a configuration for segment `name` of `size` bytes.
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let name = name.into();
        Self {
            mutex_name: format!("{}.{}", name, defaults::LOCK_SUFFIX),
            name,
            size,
            shm_dir: defaults::shm_dir(),
            arena: ArenaConfig::default(),
        }
    }

    /// Set the directory holding the segment's regions.
    pub fn shm_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shm_dir = dir.into();
        self
    }

    /// Set the name of the cross-process mutex.
    pub fn mutex_name(mut self, name: impl Into<String>) -> Self {
        self.mutex_name = name.into();
        self
    }

    /// Set the arena configuration.
    pub fn arena(mut self, arena: ArenaConfig) -> Self {
        self.arena = arena;
        self
    }

    /// Check that the names can be used as file names.
    pub fn validate(&self) -> Result<()> {
        for (what, name) in [("segment", &self.name), ("mutex", &self.mutex_name)] {
            if name.is_empty() {
                return Err(Error::InvalidSegment(format!("{what} name is empty")));
            }
            if name.contains('/') || name.contains('\0') || name == "." || name == ".." {
                return Err(Error::InvalidSegment(format!(
                    "{what} name {name:?} is not a valid file name"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn control_path(&self) -> PathBuf {
        self.shm_dir
            .join(format!("{}.{}", self.name, defaults::CONTROL_SUFFIX))
    }

    pub(crate) fn region_path(&self, generation: u64) -> PathBuf {
        self.shm_dir.join(format!("{}.{}", self.name, generation))
    }

    pub(crate) fn mutex_path(&self) -> PathBuf {
        self.shm_dir.join(&self.mutex_name)
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self::new("shmalloc", defaults::SEGMENT_SIZE)
    }
}
