//! Process-local view of a shared segment.

use super::dynamic::{SegmentGuard, SegmentId};
use super::{MemorySegment, SharedMemorySegment};
use crate::error::Result;
use std::path::Path;

/// A process's cached mapping of a segment's data region.
///
/// The mapping goes stale the moment any process resizes the segment. Call
/// [`validate`](Self::validate) right after locking and before every access;
/// [`SegmentGuard::arena`] does so itself.
///
/// A `LocalRef` belongs to one segment. Validating it against the guard of
/// another segment simply re-attaches it there.
#[derive(Debug, Default)]
pub struct LocalRef {
    identity: Option<SegmentId>,
    mapping: Option<SharedMemorySegment>,
}

impl LocalRef {
    /// A reference not attached to anything yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Identity of the region currently mapped.
    pub fn identity(&self) -> Option<SegmentId> {
        self.identity
    }

    /// Whether a data region is mapped.
    pub fn is_attached(&self) -> bool {
        self.mapping.is_some()
    }

    /// Bring the reference up to date with the segment locked by `guard`.
    ///
    /// Returns `true` if the reference had to re-attach. The previous
    /// mapping is released before the current region is mapped, so a process
    /// never holds more than one generation.
    pub fn validate(&mut self, guard: &SegmentGuard<'_>) -> Result<bool> {
        let current = guard.identity();
        let current_path = current.map(|id| guard.region_path(id));
        if current == self.identity && self.mapped_path() == current_path.as_deref() {
            return Ok(false);
        }

        let stale = self.identity;
        self.detach();

        if let (Some(id), Some(path)) = (current, current_path) {
            self.mapping = Some(SharedMemorySegment::open(&path)?);
            self.identity = Some(id);
        }

        tracing::debug!(
            segment = guard.segment().name(),
            from = ?stale.map(SegmentId::get),
            to = ?current.map(SegmentId::get),
            "reference re-attached"
        );
        Ok(true)
    }

    /// Drop the mapping. The next [`validate`](Self::validate) re-attaches.
    pub fn detach(&mut self) {
        self.mapping = None;
        self.identity = None;
    }

    fn mapped_path(&self) -> Option<&Path> {
        self.mapping.as_ref().and_then(|m| m.path())
    }

    pub(crate) fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        // SAFETY: only reachable through a `SegmentGuard`, so the segment
        // mutex is held, and `&mut self` keeps this the only slice.
        self.mapping
            .as_ref()
            .and_then(|mapping| unsafe { mapping.as_mut_slice() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArenaConfig, SegmentConfig};
    use crate::memory::{Chunk, DynamicSegment, migrate};

    fn config(dir: &tempfile::TempDir, name: &str, size: usize) -> SegmentConfig {
        SegmentConfig::new(name, size)
            .shm_dir(dir.path())
            .arena(ArenaConfig::new("reference test", "TestCacheSize").allow_oom(true))
    }

    #[test]
    fn test_validate_attaches_once() {
        let dir = tempfile::tempdir().unwrap();
        let segment = DynamicSegment::create(config(&dir, "seg", 4096), migrate).unwrap();
        let mut local = LocalRef::new();
        assert!(!local.is_attached());

        let guard = segment.lock().unwrap();
        assert!(local.validate(&guard).unwrap());
        assert!(local.is_attached());
        assert_eq!(local.identity(), guard.identity());
        assert!(!local.validate(&guard).unwrap());
    }

    #[test]
    fn test_validate_follows_resize_from_other_handle() {
        let dir = tempfile::tempdir().unwrap();
        let segment = DynamicSegment::create(config(&dir, "seg", 4096), migrate).unwrap();
        let other = DynamicSegment::open(config(&dir, "seg", 0), migrate).unwrap();

        let mut local = LocalRef::new();
        let offset = {
            let guard = segment.lock().unwrap();
            let mut arena = guard.arena(&mut local).unwrap();
            let chunk = arena.allocate(32).unwrap();
            arena.bytes_mut(&chunk)[..4].copy_from_slice(b"data");
            chunk.into_offset()
        };

        other.resize(16384).unwrap();

        let guard = segment.lock().unwrap();
        assert!(local.validate(&guard).unwrap());
        assert_eq!(local.identity().map(SegmentId::get), Some(2));
        let arena = guard.arena(&mut local).unwrap();
        assert_eq!(arena.orig_size(), 16384);
        assert_eq!(&arena.bytes(&Chunk::from_offset(offset))[..4], b"data");
    }

    #[test]
    fn test_validate_switches_segment() {
        let dir = tempfile::tempdir().unwrap();
        let first = DynamicSegment::create(config(&dir, "first", 4096), migrate).unwrap();
        let second = DynamicSegment::create(config(&dir, "second", 8192), migrate).unwrap();
        let mut local = LocalRef::new();

        local.validate(&first.lock().unwrap()).unwrap();
        // same generation number, different segment
        assert!(local.validate(&second.lock().unwrap()).unwrap());
        let guard = second.lock().unwrap();
        assert_eq!(guard.arena(&mut local).unwrap().orig_size(), 8192);
    }

    #[test]
    fn test_detach() {
        let dir = tempfile::tempdir().unwrap();
        let segment = DynamicSegment::create(config(&dir, "seg", 4096), migrate).unwrap();
        let mut local = LocalRef::new();

        let guard = segment.lock().unwrap();
        local.validate(&guard).unwrap();
        local.detach();
        assert!(!local.is_attached());
        assert!(local.identity().is_none());
        assert!(local.validate(&guard).unwrap());
    }
}
