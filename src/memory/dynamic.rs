//! Resizable shared segment hosting one arena.
//!
//! A [`DynamicSegment`] is made of three named objects in the segment
//! directory:
//!
//! ```text
//! <name>.lock    lock file of the cross-process mutex
//! <name>.ctl     control block: magic, generation, size, generation counter
//! <name>.<gen>   data region of the current generation, holding the arena
//! ```
//!
//! Resizing creates the data region of the next generation, migrates the
//! arena into it through the copy callback and removes the old region. The
//! generation published in the control block is the segment identity: a
//! process whose [`LocalRef`](super::LocalRef) still maps an older generation
//! notices on its next [`validate`](super::LocalRef::validate) and
//! re-attaches.
//!
//! Everything that reads or writes the control block or the arena happens
//! through a [`SegmentGuard`], which only exists while the mutex is held.
//!
//! # Example
//!
//! ```rust,ignore
//! use shmalloc::config::SegmentConfig;
//! use shmalloc::memory::{DynamicSegment, LocalRef, migrate};
//!
//! let segment = DynamicSegment::create(SegmentConfig::new("valuecache", 1 << 20), migrate)?;
//! let mut local = LocalRef::new();
//!
//! let mut guard = segment.lock()?;
//! let chunk = guard.arena(&mut local)?.allocate(128)?;
//! guard.resize(4 << 20)?;
//! // still the same chunk, now in the larger region
//! let arena = guard.arena(&mut local)?;
//! assert_eq!(arena.chunk_size(&chunk), 128);
//! ```

use super::arena::Arena;
use super::defaults;
use super::lock::{NamedMutex, NamedMutexGuard};
use super::reference::LocalRef;
use super::{MemorySegment, SharedMemorySegment};
use crate::config::SegmentConfig;
use crate::error::{Error, Result};
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Magic number of an initialised control block ("SHMSEGCT").
const CONTROL_MAGIC: u64 = 0x5348_4D53_4547_4354;

/// Callback migrating the arena of an old data region (second argument)
/// into a newly created, zero-filled region (first argument).
///
/// [`migrate`](super::migrate) is the default; cache layers with their own
/// notion of content can supply a semantic copy instead.
pub type CopyFn = Box<dyn Fn(&mut [u8], &[u8]) -> Result<()> + Send + Sync>;

/// Identity of one generation of a segment's data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(NonZeroU64);

impl SegmentId {
    /// Identity for a raw generation number. Generation 0 means "no data
    /// region" and has no identity.
    pub fn from_raw(generation: u64) -> Option<Self> {
        NonZeroU64::new(generation).map(Self)
    }

    /// Raw generation number.
    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Layout of the control block region.
#[repr(C)]
struct ControlBlock {
    magic: AtomicU64,
    /// Current generation, 0 while there is no data region.
    generation: AtomicU64,
    /// Size of the current data region.
    size: AtomicU64,
    /// Highest generation ever handed out.
    counter: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<ControlBlock>() <= defaults::CONTROL_SIZE);

/// Shared segment manager.
///
/// One process creates the segment, every other process opens it by name.
/// Each process brings its own copy callback: code cannot be shared through
/// the segment.
pub struct DynamicSegment {
    config: SegmentConfig,
    control: SharedMemorySegment,
    mutex: NamedMutex,
    copy_fn: CopyFn,
}

impl DynamicSegment {
    /// Create a segment with a data region of `config.size` bytes holding a
    /// fresh arena.
    ///
    /// With `config.size == 0` the segment starts without a data region; the
    /// first [`resize`](SegmentGuard::resize) creates it.
    ///
    /// # Errors
    ///
    /// Fails if a segment of that name exists, if the names are invalid, or
    /// if creating or mapping any region fails. Everything created before the
    /// failure is removed again.
    pub fn create<F>(config: SegmentConfig, copy_fn: F) -> Result<Self>
    where
        F: Fn(&mut [u8], &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        config.validate()?;

        let mutex = NamedMutex::open(config.mutex_path())?;
        let control = {
            let _guard = mutex.lock()?;
            Self::init(&config)?
        };

        tracing::debug!(
            segment = config.name.as_str(),
            size = config.size,
            "shared segment created"
        );

        Ok(Self {
            config,
            control,
            mutex,
            copy_fn: Box::new(copy_fn),
        })
    }

    fn init(config: &SegmentConfig) -> Result<SharedMemorySegment> {
        let control_path = config.control_path();
        let control = SharedMemorySegment::create(&control_path, defaults::CONTROL_SIZE)?;

        let generation = if config.size == 0 {
            0
        } else {
            match Self::create_region(config, 1, config.size, None) {
                Ok(()) => 1,
                Err(e) => {
                    let _ = SharedMemorySegment::remove(&control_path);
                    return Err(e);
                }
            }
        };

        let block = control_block(&control);
        block.generation.store(generation, Ordering::Release);
        block.size.store(config.size as u64, Ordering::Release);
        block.counter.store(generation, Ordering::Release);
        block.magic.store(CONTROL_MAGIC, Ordering::Release);
        Ok(control)
    }

    /// Create the data region of `generation` and lay out its arena: a fresh
    /// one, or one migrated from `old` through `copy_fn`.
    ///
    /// On error the new region is removed again.
    fn create_region(
        config: &SegmentConfig,
        generation: u64,
        size: usize,
        old: Option<(&SharedMemorySegment, &CopyFn)>,
    ) -> Result<()> {
        let path = config.region_path(generation);
        let region = SharedMemorySegment::create(&path, size)?;

        // SAFETY: the region was just created and the segment mutex is held,
        // so nobody else can map or touch it yet.
        let result = match unsafe { region.as_mut_slice() } {
            None => Err(Error::InvalidSegment(format!(
                "region {} is not writable",
                path.display()
            ))),
            Some(dst) => match old {
                None => Arena::create(dst, &config.arena).map(drop),
                // SAFETY: the mutex is held, so the old arena is not being
                // modified.
                Some((old, copy_fn)) => copy_fn(dst, unsafe { old.as_slice() }),
            },
        };

        if let Err(e) = result {
            drop(region);
            let _ = SharedMemorySegment::remove(&path);
            return Err(e);
        }
        Ok(())
    }

    /// Attach to a segment another process created.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSegment`] if no segment of that name exists
    /// or its control block is not initialised.
    pub fn open<F>(config: SegmentConfig, copy_fn: F) -> Result<Self>
    where
        F: Fn(&mut [u8], &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        config.validate()?;

        let mutex = NamedMutex::open(config.mutex_path())?;
        let control = {
            let _guard = mutex.lock()?;
            let control = SharedMemorySegment::open(config.control_path())?;
            if control.len() < defaults::CONTROL_SIZE
                || control_block(&control).magic.load(Ordering::Acquire) != CONTROL_MAGIC
            {
                return Err(Error::InvalidSegment(format!(
                    "segment {} has no valid control block",
                    config.name
                )));
            }
            control
        };

        tracing::debug!(segment = config.name.as_str(), "shared segment opened");

        Ok(Self {
            config,
            control,
            mutex,
            copy_fn: Box::new(copy_fn),
        })
    }

    /// Acquire the segment mutex, blocking until it is available.
    pub fn lock(&self) -> Result<SegmentGuard<'_>> {
        let guard = self.mutex.lock()?;
        Ok(SegmentGuard {
            segment: self,
            _guard: guard,
        })
    }

    /// Acquire the segment mutex if no other holder has it.
    pub fn try_lock(&self) -> Result<Option<SegmentGuard<'_>>> {
        Ok(self.mutex.try_lock()?.map(|guard| SegmentGuard {
            segment: self,
            _guard: guard,
        }))
    }

    /// Lock the segment and resize it. See [`SegmentGuard::resize`].
    pub fn resize(&self, new_size: usize) -> Result<()> {
        self.lock()?.resize(new_size)
    }

    /// Segment configuration.
    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Remove the segment: data region, control block and mutex.
    ///
    /// Other processes that still have the segment open keep their current
    /// mappings but can no longer re-attach after a resize. Only call this
    /// when tearing the whole subsystem down.
    pub fn destroy(self) -> Result<()> {
        {
            let _guard = self.mutex.lock()?;
            Self::remove_regions(&self.config)?;
        }
        NamedMutex::remove(self.config.mutex_path())?;

        tracing::debug!(segment = self.config.name.as_str(), "shared segment destroyed");
        Ok(())
    }

    /// Remove whatever exists of the segment described by `config`, such as
    /// the leftovers of a process that died while creating or resizing it.
    /// Missing pieces are skipped.
    pub fn remove(config: &SegmentConfig) -> Result<()> {
        config.validate()?;
        Self::remove_regions(config)?;
        NamedMutex::remove(config.mutex_path())
    }

    fn remove_regions(config: &SegmentConfig) -> Result<()> {
        for path in Self::region_paths(config)? {
            SharedMemorySegment::remove(path)?;
        }
        SharedMemorySegment::remove(config.control_path())
    }

    /// Every data region of the segment present in the directory, whatever
    /// its generation.
    fn region_paths(config: &SegmentConfig) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}.", config.name);
        let entries = match std::fs::read_dir(&config.shm_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let is_region = file_name
                .strip_prefix(&prefix)
                .is_some_and(|rest| rest.parse::<u64>().is_ok());
            if is_region {
                paths.push(entry.path());
            }
        }
        Ok(paths)
    }

    fn block(&self) -> &ControlBlock {
        control_block(&self.control)
    }
}

fn control_block(control: &SharedMemorySegment) -> &ControlBlock {
    // SAFETY: the mapping is page aligned, at least CONTROL_SIZE bytes long,
    // lives as long as `control`, and is only accessed through atomics.
    unsafe { &*control.as_ptr().cast::<ControlBlock>() }
}

impl std::fmt::Debug for DynamicSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicSegment")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Proof that the segment mutex is held.
///
/// The mutex is released when the guard is dropped (or through
/// [`unlock`](Self::unlock)).
#[must_use = "the segment is unlocked as soon as the guard is dropped"]
pub struct SegmentGuard<'a> {
    segment: &'a DynamicSegment,
    _guard: NamedMutexGuard<'a>,
}

impl SegmentGuard<'_> {
    /// Identity of the current data region, `None` while there is none.
    pub fn identity(&self) -> Option<SegmentId> {
        SegmentId::from_raw(self.segment.block().generation.load(Ordering::Acquire))
    }

    /// Size of the current data region in bytes.
    pub fn size(&self) -> usize {
        self.segment.block().size.load(Ordering::Acquire) as usize
    }

    /// The segment this guard locks.
    pub fn segment(&self) -> &DynamicSegment {
        self.segment
    }

    pub(crate) fn region_path(&self, id: SegmentId) -> PathBuf {
        self.segment.config.region_path(id.get())
    }

    /// Validate `local` and open the arena through its mapping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSegment`] if the segment has no data region
    /// yet, and whatever re-attaching or opening the arena reports.
    pub fn arena<'r>(&'r self, local: &'r mut LocalRef) -> Result<Arena<&'r mut [u8]>> {
        local.validate(self)?;
        let bytes = local.bytes_mut().ok_or_else(|| {
            Error::InvalidSegment(format!(
                "segment {} has no data region",
                self.segment.config.name
            ))
        })?;
        Arena::open(bytes)
    }

    /// Replace the data region with one of `new_size` bytes.
    ///
    /// The arena is migrated through the segment's copy callback, or created
    /// fresh when there was no data region. The new identity is published
    /// only after the old region is gone; on any error before that the
    /// segment keeps its current region untouched.
    pub fn resize(&mut self, new_size: usize) -> Result<()> {
        if new_size == 0 {
            return Err(Error::InvalidRequest(format!(
                "segment {}: cannot resize to zero bytes",
                self.segment.config.name
            )));
        }

        let segment = self.segment;
        let config = &segment.config;
        let block = segment.block();
        let old_generation = block.generation.load(Ordering::Acquire);
        let old_size = block.size.load(Ordering::Acquire);

        // Claimed before the region exists, so a region left behind by a
        // crashed resize never collides with a later one.
        let generation = block.counter.load(Ordering::Acquire) + 1;
        block.counter.store(generation, Ordering::Release);

        if old_generation == 0 {
            DynamicSegment::create_region(config, generation, new_size, None)?;
        } else {
            let old_path = config.region_path(old_generation);
            let old = SharedMemorySegment::open(&old_path)?;
            let copy_fn = &segment.copy_fn;
            DynamicSegment::create_region(config, generation, new_size, Some((&old, copy_fn)))?;
            drop(old);

            if let Err(e) = SharedMemorySegment::remove(&old_path) {
                let _ = SharedMemorySegment::remove(config.region_path(generation));
                return Err(e);
            }
        }

        block.size.store(new_size as u64, Ordering::Release);
        block.generation.store(generation, Ordering::Release);

        tracing::debug!(
            segment = config.name.as_str(),
            from = old_size,
            to = new_size,
            generation,
            "shared segment resized"
        );
        Ok(())
    }

    /// Release the mutex.
    pub fn unlock(self) {}
}
