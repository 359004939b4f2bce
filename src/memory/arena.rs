//! Bucketed boundary-tag allocator over a byte range.
//!
//! An [`Arena`] manages free and used chunks inside any byte buffer: a
//! `Vec<u8>`, a [`HeapSegment`](super::HeapSegment), or the mapped bytes of a
//! shared region. All allocator state, header included, lives inside the
//! buffer itself, so every process that maps the same region sees the same
//! allocator.
//!
//! # Memory Layout
//!
//! ```text
//! ┌──────────────┬───────┬───────┬────────────────────────────────────────┐
//! │ header       │ descr │ param │ chunks ...                             │
//! └──────────────┴───────┴───────┴────────────────────────────────────────┘
//!                                 ^ lo_bound                    hi_bound ^
//!
//! chunk:  ┌──────────┬──────────────────────────────┬──────────┐
//!         │ size tag │ payload (size bytes)         │ size tag │
//!         └──────────┴──────────────────────────────┴──────────┘
//! free payload:      │ prev link │ next link │ ...  │
//! ```
//!
//! Bit 63 of a size tag marks the chunk used. Links and bounds are byte
//! offsets from the start of the buffer, never addresses, so the arena is
//! position independent and every process may map it anywhere.
//!
//! Free chunks are linked into the bucket of their size class (see
//! [`bucket`](super::bucket)). Freeing merges a chunk with a free neighbour on
//! either side in O(1) by reading the neighbours' boundary tags.
//!
//! # Example
//!
//! ```rust
//! use shmalloc::config::ArenaConfig;
//! use shmalloc::memory::Arena;
//!
//! let config = ArenaConfig::new("example cache", "ExampleCacheSize").allow_oom(true);
//! let mut arena = Arena::create(vec![0u8; 4096], &config).unwrap();
//!
//! let chunk = arena.allocate(40).unwrap();
//! arena.bytes_mut(&chunk)[..5].copy_from_slice(b"hello");
//! assert_eq!(&arena.bytes(&chunk)[..5], b"hello");
//!
//! arena.free(chunk);
//! assert_eq!(arena.used_size(), 0);
//! ```

use super::bucket::{
    BUCKET_COUNT, CHUNK_OVERHEAD, MIN_ALLOC, OVERFLOW_BUCKET, SIZE_FIELD, bucket_by_size,
    proper_alloc_size,
};
use super::stats::ArenaStats;
use crate::config::ArenaConfig;
use crate::error::{Error, Result};
use tracing::Level;

/// Magic number identifying an initialised arena ("SHMALLOC" in ASCII).
const ARENA_MAGIC: u64 = 0x5348_4D41_4C4C_4F43;

/// Current arena layout version.
const ARENA_VERSION: u64 = 1;

/// Marks a size tag as belonging to a used chunk.
const USED_FLAG: u64 = 1 << 63;

/// Header flag: return errors on exhaustion instead of terminating.
const FLAG_ALLOW_OOM: u64 = 1;

/// End-of-list marker. Offset 0 is the header, never a chunk.
const NIL: usize = 0;

/// Overflow bucket scans longer than this are logged.
const LONG_SCAN: usize = 100;

/// Header field offsets.
mod field {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 8;
    pub const FLAGS: usize = 16;
    pub const ORIG_SIZE: usize = 24;
    pub const TOTAL_SIZE: usize = 32;
    pub const USED_SIZE: usize = 40;
    pub const FREE_SIZE: usize = 48;
    pub const LO_BOUND: usize = 56;
    pub const HI_BOUND: usize = 64;
    pub const DESCR_OFF: usize = 72;
    pub const DESCR_LEN: usize = 80;
    pub const PARAM_OFF: usize = 88;
    pub const PARAM_LEN: usize = 96;
    pub const BUCKETS: usize = 104;
}

/// Size of the fixed arena header.
pub const HEADER_SIZE: usize = field::BUCKETS + BUCKET_COUNT * 8;

#[inline]
const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Bytes a buffer needs beyond the desired payload capacity so that an arena
/// created in it has a `total_size` of exactly that capacity (for capacities
/// that are multiples of 8).
pub fn arena_overhead(descr: &str, param: &str) -> usize {
    align8(HEADER_SIZE + descr.len() + param.len()) + CHUNK_OVERHEAD
}

/// Bytes to reserve on top of the expected payload so that `chunks_num`
/// allocations of that total payload are guaranteed to fit, given the tags
/// stored in the arena.
pub fn required_size(chunks_num: usize, descr: &str, param: &str) -> usize {
    let chunks_num = chunks_num.max(1);
    let mut size = HEADER_SIZE;
    size += descr.len() + param.len();
    // aligning the first chunk and the end of the last one
    size += (SIZE_FIELD - 1) * 2;
    size += chunks_num * CHUNK_OVERHEAD;
    // each chunk may be rounded up by at most MIN_ALLOC - 1 bytes
    size += chunks_num * (MIN_ALLOC - 1);
    size
}

/// Handle to a used chunk.
///
/// A chunk is identified by the offset of its payload from the start of the
/// arena. The handle is neither `Copy` nor `Clone`:
/// [`Arena::free`] and [`Arena::reallocate`] consume it, so a freed chunk
/// cannot be touched again through the same handle.
///
/// Cache layers that keep chunk references inside the arena itself store
/// [`Chunk::offset`] and rebuild the handle with [`Chunk::from_offset`].
#[derive(Debug, PartialEq, Eq, Hash)]
#[must_use = "dropping a chunk handle leaks the chunk"]
pub struct Chunk {
    offset: usize,
}

impl Chunk {
    /// Rebuild a handle from a payload offset previously obtained through
    /// [`Chunk::offset`]. The arena validates the offset on every use.
    #[inline]
    pub fn from_offset(offset: usize) -> Self {
        Self { offset }
    }

    /// Payload offset from the start of the arena.
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Give up the handle, keeping only its offset.
    #[inline]
    pub fn into_offset(self) -> usize {
        self.offset
    }
}

/// Allocator state stored inside a byte buffer.
///
/// `B` is anything exposing the bytes: `&[u8]` for read-only inspection,
/// `&mut [u8]` or `Vec<u8>` (or any other `AsMut<[u8]>`) for allocation.
///
/// Callers of the mutating operations must hold exclusive access to the
/// bytes. For shared segments that means holding the segment lock, which
/// [`SegmentGuard::arena`](super::SegmentGuard::arena) enforces.
pub struct Arena<B> {
    bytes: B,
}

impl<B: AsRef<[u8]>> Arena<B> {
    /// Attach to an arena previously initialised in `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArena`] if the bytes do not start with a
    /// compatible arena header or if the recorded bounds do not fit.
    pub fn open(bytes: B) -> Result<Self> {
        let len = bytes.as_ref().len();
        if len < HEADER_SIZE {
            return Err(Error::InvalidArena(format!(
                "{len} bytes cannot hold an arena header"
            )));
        }

        let arena = Self { bytes };
        if arena.word(field::MAGIC) != ARENA_MAGIC {
            return Err(Error::InvalidArena("bad magic".into()));
        }
        let version = arena.word(field::VERSION);
        if version != ARENA_VERSION {
            return Err(Error::InvalidArena(format!(
                "unsupported version {version}, expected {ARENA_VERSION}"
            )));
        }

        let lo = arena.lo_bound();
        let hi = arena.hi_bound();
        let tags_end = arena
            .field(field::PARAM_OFF)
            .saturating_add(arena.field(field::PARAM_LEN));
        if lo < HEADER_SIZE
            || lo % 8 != 0
            || tags_end > lo
            || hi > len
            || hi < lo.saturating_add(CHUNK_OVERHEAD)
        {
            return Err(Error::InvalidArena(format!(
                "bounds {lo}..{hi} do not fit in {len} bytes"
            )));
        }
        if arena.total_size() != hi - lo - CHUNK_OVERHEAD {
            return Err(Error::InvalidArena("inconsistent total size".into()));
        }

        Ok(arena)
    }

    /// Give back the underlying bytes.
    pub fn into_inner(self) -> B {
        self.bytes
    }

    #[inline]
    fn buf(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    #[inline]
    fn word(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf()[offset..offset + 8]);
        u64::from_ne_bytes(raw)
    }

    #[inline]
    fn field(&self, offset: usize) -> usize {
        self.word(offset) as usize
    }

    /// Payload capacity: the payload of the single chunk a fresh arena holds.
    pub fn total_size(&self) -> usize {
        self.field(field::TOTAL_SIZE)
    }

    /// Payload bytes held by used chunks.
    pub fn used_size(&self) -> usize {
        self.field(field::USED_SIZE)
    }

    /// Payload bytes held by free chunks.
    pub fn free_size(&self) -> usize {
        self.field(field::FREE_SIZE)
    }

    /// Size of the buffer the arena was created in.
    pub fn orig_size(&self) -> usize {
        self.field(field::ORIG_SIZE)
    }

    /// Whether exhaustion is reported as an error instead of being fatal.
    pub fn allow_oom(&self) -> bool {
        self.word(field::FLAGS) & FLAG_ALLOW_OOM != 0
    }

    /// Description tag.
    pub fn description(&self) -> &str {
        self.tag(field::DESCR_OFF, field::DESCR_LEN)
    }

    /// Configuration origin tag.
    pub fn origin(&self) -> &str {
        self.tag(field::PARAM_OFF, field::PARAM_LEN)
    }

    fn tag(&self, off_field: usize, len_field: usize) -> &str {
        let off = self.field(off_field);
        let len = self.field(len_field);
        self.buf()
            .get(off..off.saturating_add(len))
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .unwrap_or("<invalid>")
    }

    /// Offset of the first chunk.
    pub fn lo_bound(&self) -> usize {
        self.field(field::LO_BOUND)
    }

    /// Offset one past the last chunk.
    pub fn hi_bound(&self) -> usize {
        self.field(field::HI_BOUND)
    }

    #[inline]
    fn bucket_head(&self, index: usize) -> Option<usize> {
        match self.field(field::BUCKETS + index * 8) {
            NIL => None,
            chunk => Some(chunk),
        }
    }

    #[inline]
    fn chunk_size_at(&self, chunk: usize) -> usize {
        (self.word(chunk) & !USED_FLAG) as usize
    }

    #[inline]
    fn is_used_at(&self, chunk: usize) -> bool {
        self.word(chunk) & USED_FLAG != 0
    }

    #[inline]
    fn prev_link(&self, chunk: usize) -> Option<usize> {
        match self.field(chunk + SIZE_FIELD) {
            NIL => None,
            prev => Some(prev),
        }
    }

    #[inline]
    fn next_link(&self, chunk: usize) -> Option<usize> {
        match self.field(chunk + 2 * SIZE_FIELD) {
            NIL => None,
            next => Some(next),
        }
    }

    /// Free neighbour preceding `chunk`, found through its trailing tag.
    fn free_prev(&self, chunk: usize) -> Option<usize> {
        if chunk <= self.lo_bound() {
            return None;
        }
        let tag = self.word(chunk - SIZE_FIELD);
        if tag & USED_FLAG != 0 {
            return None;
        }
        Some(chunk - CHUNK_OVERHEAD - tag as usize)
    }

    /// Free neighbour following `chunk`.
    fn free_next(&self, chunk: usize, size: usize) -> Option<usize> {
        let next = chunk + CHUNK_OVERHEAD + size;
        (next < self.hi_bound() && !self.is_used_at(next)).then_some(next)
    }

    /// Check that `chunk` refers to a used chunk of this arena and return
    /// the offset of its leading tag.
    fn locate(&self, chunk: &Chunk) -> std::result::Result<usize, String> {
        let lo = self.lo_bound();
        let hi = self.hi_bound();
        let payload = chunk.offset;
        if payload < lo + SIZE_FIELD || payload >= hi || (payload - lo) % 8 != 0 {
            return Err(format!(
                "chunk at offset {payload} is outside of arena bounds {lo}..{hi}"
            ));
        }
        let start = payload - SIZE_FIELD;
        let tag = self.word(start);
        let size = (tag & !USED_FLAG) as usize;
        if tag & USED_FLAG == 0 {
            return Err(format!("chunk at offset {payload} is not in use"));
        }
        if size < MIN_ALLOC || payload + size + SIZE_FIELD > hi || self.word(payload + size) != tag
        {
            return Err(format!("chunk at offset {payload} has corrupted boundary tags"));
        }
        Ok(start)
    }

    fn checked(&self, chunk: &Chunk) -> usize {
        match self.locate(chunk) {
            Ok(start) => start,
            Err(msg) => self.fatal(&msg),
        }
    }

    /// Payload size of a used chunk. May exceed the size it was requested
    /// with because of rounding and unsplit remainders.
    pub fn chunk_size(&self, chunk: &Chunk) -> usize {
        let start = self.checked(chunk);
        self.chunk_size_at(start)
    }

    /// Payload of a used chunk.
    pub fn bytes(&self, chunk: &Chunk) -> &[u8] {
        let start = self.checked(chunk);
        let size = self.chunk_size_at(start);
        &self.buf()[chunk.offset..chunk.offset + size]
    }

    /// Snapshot of the arena's occupancy.
    pub fn stats(&self) -> ArenaStats {
        let mut stats = ArenaStats::new(self.total_size(), self.used_size(), self.free_size());
        for index in 0..BUCKET_COUNT {
            let mut chunk = self.bucket_head(index);
            while let Some(c) = chunk {
                stats.record_free(index, self.chunk_size_at(c));
                chunk = self.next_link(c);
            }
        }
        stats.finish()
    }

    /// Log the statistics block at `level`.
    pub fn dump_stats(&self, level: Level) {
        self.stats().dump(self.description(), level);
    }

    /// Report corruption and terminate the process. A damaged arena is never
    /// handed back to cooperating processes as if it were usable.
    fn fatal(&self, msg: &str) -> ! {
        tracing::error!(arena = self.description(), "{msg}");
        std::process::exit(1)
    }

    /// Turn exhaustion into an error, or terminate when the arena does not
    /// allow out-of-memory recovery.
    fn exhausted(&self, requested: usize) -> Error {
        let err = Error::OutOfMemory {
            requested,
            descr: self.description().to_string(),
            param: self.origin().to_string(),
        };
        if self.allow_oom() {
            tracing::debug!(arena = self.description(), requested, "out of memory");
            return err;
        }

        tracing::error!(
            arena = self.description(),
            "out of memory (requested {requested} bytes)"
        );
        tracing::error!(
            arena = self.description(),
            "please increase {} configuration parameter",
            self.origin()
        );
        self.dump_stats(Level::ERROR);
        std::process::exit(1)
    }

    /// Find a free chunk of at least `size` payload bytes.
    ///
    /// The exact size class is tried first, then the overflow bucket
    /// (first fit), then the larger exact size classes.
    fn find_chunk(&self, size: usize) -> Option<usize> {
        let index = bucket_by_size(size);
        if index != OVERFLOW_BUCKET {
            if let Some(chunk) = self.bucket_head(index) {
                return Some(chunk);
            }
        }
        self.first_fit(size)
            .or_else(|| ((index + 1)..OVERFLOW_BUCKET).find_map(|i| self.bucket_head(i)))
    }

    fn first_fit(&self, size: usize) -> Option<usize> {
        let mut chunk = self.bucket_head(OVERFLOW_BUCKET);
        let mut remaining = self.free_size();
        let mut skipped = 0usize;

        while let Some(c) = chunk {
            let chunk_size = self.chunk_size_at(c);
            if chunk_size >= size {
                if skipped >= LONG_SCAN {
                    tracing::debug!(
                        arena = self.description(),
                        skipped,
                        size,
                        "long overflow bucket scan"
                    );
                }
                return Some(c);
            }
            skipped += 1;
            remaining = remaining.saturating_sub(chunk_size);
            // nothing left that could hold the request
            if remaining < size {
                break;
            }
            chunk = self.next_link(c);
        }
        None
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Arena<B> {
    /// Initialise an arena in `bytes`: one header followed by a single free
    /// chunk spanning the rest of the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArena`] if the buffer is too small to hold the
    /// header, both tags and one minimal chunk.
    pub fn create(bytes: B, config: &ArenaConfig) -> Result<Self> {
        let len = bytes.as_ref().len();
        let descr = config.description.as_bytes();
        let param = config.origin.as_bytes();

        let descr_off = HEADER_SIZE;
        let param_off = descr_off + descr.len();
        let lo = align8(param_off + param.len());
        let hi = len & !7;
        if hi < lo + CHUNK_OVERHEAD + MIN_ALLOC {
            return Err(Error::InvalidArena(format!(
                "{}: {len} bytes are not enough for an arena, need at least {}",
                config.description,
                lo + CHUNK_OVERHEAD + MIN_ALLOC
            )));
        }

        let mut arena = Self { bytes };
        {
            let buf = arena.buf_mut();
            buf[..lo].fill(0);
            buf[descr_off..param_off].copy_from_slice(descr);
            buf[param_off..param_off + param.len()].copy_from_slice(param);
        }
        arena.set_word(field::MAGIC, ARENA_MAGIC);
        arena.set_word(field::VERSION, ARENA_VERSION);
        let flags = if config.allow_oom { FLAG_ALLOW_OOM } else { 0 };
        arena.set_word(field::FLAGS, flags);
        arena.set_field(field::ORIG_SIZE, len);
        arena.set_field(field::TOTAL_SIZE, hi - lo - CHUNK_OVERHEAD);
        arena.set_field(field::LO_BOUND, lo);
        arena.set_field(field::HI_BOUND, hi);
        arena.set_field(field::DESCR_OFF, descr_off);
        arena.set_field(field::DESCR_LEN, descr.len());
        arena.set_field(field::PARAM_OFF, param_off);
        arena.set_field(field::PARAM_LEN, param.len());
        arena.clear();

        tracing::debug!(
            arena = config.description.as_str(),
            size = len,
            total = arena.total_size(),
            "arena created"
        );
        Ok(arena)
    }

    #[inline]
    fn buf_mut(&mut self) -> &mut [u8] {
        self.bytes.as_mut()
    }

    #[inline]
    fn set_word(&mut self, offset: usize, value: u64) {
        self.buf_mut()[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    #[inline]
    fn set_field(&mut self, offset: usize, value: usize) {
        self.set_word(offset, value as u64);
    }

    fn add_used(&mut self, delta: isize) {
        let used = self.used_size().wrapping_add_signed(delta);
        self.set_field(field::USED_SIZE, used);
    }

    fn add_free(&mut self, delta: isize) {
        let free = self.free_size().wrapping_add_signed(delta);
        self.set_field(field::FREE_SIZE, free);
    }

    fn set_bucket_head(&mut self, index: usize, chunk: Option<usize>) {
        self.set_field(field::BUCKETS + index * 8, chunk.unwrap_or(NIL));
    }

    fn set_prev_link(&mut self, chunk: usize, prev: Option<usize>) {
        self.set_field(chunk + SIZE_FIELD, prev.unwrap_or(NIL));
    }

    fn set_next_link(&mut self, chunk: usize, next: Option<usize>) {
        self.set_field(chunk + 2 * SIZE_FIELD, next.unwrap_or(NIL));
    }

    fn set_free_chunk_size(&mut self, chunk: usize, size: usize) {
        self.set_field(chunk, size);
        self.set_field(chunk + SIZE_FIELD + size, size);
    }

    fn set_used_chunk_size(&mut self, chunk: usize, size: usize) {
        let tag = size as u64 | USED_FLAG;
        self.set_word(chunk, tag);
        self.set_word(chunk + SIZE_FIELD + size, tag);
    }

    /// Push a free chunk onto the head of its bucket.
    fn link_chunk(&mut self, chunk: usize) {
        let index = bucket_by_size(self.chunk_size_at(chunk));
        let head = self.bucket_head(index);
        self.set_prev_link(chunk, None);
        self.set_next_link(chunk, head);
        if let Some(head) = head {
            self.set_prev_link(head, Some(chunk));
        }
        self.set_bucket_head(index, Some(chunk));
    }

    /// Take a free chunk out of its bucket.
    fn unlink_chunk(&mut self, chunk: usize) {
        let prev = self.prev_link(chunk);
        let next = self.next_link(chunk);
        match prev {
            Some(prev) => self.set_next_link(prev, next),
            None => {
                let index = bucket_by_size(self.chunk_size_at(chunk));
                if self.bucket_head(index) != Some(chunk) {
                    self.fatal(&format!("free chunk at {chunk} is missing from its bucket"));
                }
                self.set_bucket_head(index, next);
            }
        }
        if let Some(next) = next {
            self.set_prev_link(next, prev);
        }
    }

    /// Hand out `size` bytes of the free chunk `chunk`, splitting off the
    /// remainder when it can form a chunk of its own.
    fn carve(&mut self, chunk: usize, size: usize) -> Chunk {
        let chunk_size = self.chunk_size_at(chunk);
        self.unlink_chunk(chunk);

        if chunk_size < size + CHUNK_OVERHEAD + MIN_ALLOC {
            self.add_used(chunk_size as isize);
            self.add_free(-(chunk_size as isize));
            self.set_used_chunk_size(chunk, chunk_size);
        } else {
            let rest = chunk + CHUNK_OVERHEAD + size;
            let rest_size = chunk_size - size - CHUNK_OVERHEAD;
            self.set_free_chunk_size(rest, rest_size);
            self.link_chunk(rest);

            self.add_used(size as isize);
            self.add_free(rest_size as isize - chunk_size as isize);
            self.set_used_chunk_size(chunk, size);
        }

        Chunk {
            offset: chunk + SIZE_FIELD,
        }
    }

    /// Allocate a chunk of at least `size` bytes.
    ///
    /// The request is rounded up to a multiple of 8 with a floor of
    /// [`MIN_ALLOC`]. The returned payload is 8-byte aligned relative to the
    /// start of the arena.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for a zero-byte request and
    /// [`Error::OutOfMemory`] when the arena is exhausted and allows
    /// out-of-memory recovery; the arena is left untouched in both cases.
    /// Exhaustion terminates the process otherwise.
    pub fn allocate(&mut self, size: usize) -> Result<Chunk> {
        if size == 0 {
            return Err(Error::InvalidRequest(format!(
                "{}: asking for zero bytes",
                self.description()
            )));
        }
        let size = proper_alloc_size(size);
        match self.find_chunk(size) {
            Some(chunk) => Ok(self.carve(chunk, size)),
            None => Err(self.exhausted(size)),
        }
    }

    /// Resize an allocation.
    ///
    /// - `None` behaves like [`allocate`](Self::allocate) (and like a no-op
    ///   for a zero size).
    /// - A zero `size` frees the chunk and returns `None`.
    /// - Shrinking keeps the chunk in place; the tail is released only when
    ///   at least three quarters of the chunk become unused.
    /// - Growing merges in the following chunk when it is free and large
    ///   enough, otherwise the content moves to a new chunk.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate). On [`Error::OutOfMemory`] the
    /// original chunk is no longer reachable through a handle, but its
    /// content stays allocated at the same offset: use
    /// [`Chunk::from_offset`] with the previous offset to keep using it.
    pub fn reallocate(&mut self, chunk: Option<Chunk>, size: usize) -> Result<Option<Chunk>> {
        let Some(chunk) = chunk else {
            if size == 0 {
                return Ok(None);
            }
            return self.allocate(size).map(Some);
        };
        if size == 0 {
            self.free(chunk);
            return Ok(None);
        }

        let size = proper_alloc_size(size);
        let start = self.checked(&chunk);
        let chunk_size = self.chunk_size_at(start);
        let next = self.free_next(start, chunk_size);

        if size <= chunk_size {
            // not much to gain, the caller is likely to grow again
            if size > chunk_size / 4 {
                return Ok(Some(chunk));
            }

            let released = chunk_size - size;
            if let Some(next) = next {
                let next_size = self.chunk_size_at(next);
                self.unlink_chunk(next);
                let rest = start + CHUNK_OVERHEAD + size;
                self.set_free_chunk_size(rest, released + next_size);
                self.link_chunk(rest);
                self.set_used_chunk_size(start, size);
                self.add_free(released as isize);
                self.add_used(-(released as isize));
            } else if released >= CHUNK_OVERHEAD + MIN_ALLOC {
                let rest = start + CHUNK_OVERHEAD + size;
                let rest_size = released - CHUNK_OVERHEAD;
                self.set_free_chunk_size(rest, rest_size);
                self.link_chunk(rest);
                self.set_used_chunk_size(start, size);
                self.add_free(rest_size as isize);
                self.add_used(-(released as isize));
            }
            return Ok(Some(chunk));
        }

        if let Some(next) = next {
            let next_size = self.chunk_size_at(next);
            if chunk_size + CHUNK_OVERHEAD + next_size >= size {
                self.unlink_chunk(next);
                let merged = chunk_size + CHUNK_OVERHEAD + next_size;
                if merged < size + CHUNK_OVERHEAD + MIN_ALLOC {
                    self.set_used_chunk_size(start, merged);
                    self.add_used((next_size + CHUNK_OVERHEAD) as isize);
                    self.add_free(-(next_size as isize));
                } else {
                    let rest = start + CHUNK_OVERHEAD + size;
                    let rest_size = merged - size - CHUNK_OVERHEAD;
                    self.set_free_chunk_size(rest, rest_size);
                    self.link_chunk(rest);
                    self.set_used_chunk_size(start, size);
                    self.add_used((size - chunk_size) as isize);
                    self.add_free(rest_size as isize - next_size as isize);
                }
                return Ok(Some(chunk));
            }
        }

        if let Some(free) = self.find_chunk(size) {
            let moved = self.carve(free, size);
            let from = chunk.offset;
            self.buf_mut()
                .copy_within(from..from + chunk_size, moved.offset);
            self.release(start);
            return Ok(Some(moved));
        }

        // Would freeing the chunk and merging it with its free neighbours
        // make room? Only then touch the arena, so that a failed request
        // leaves it exactly as it was.
        let mut reachable = chunk_size;
        if let Some(prev) = self.free_prev(start) {
            reachable += self.chunk_size_at(prev) + CHUNK_OVERHEAD;
        }
        if let Some(next) = next {
            reachable += self.chunk_size_at(next) + CHUNK_OVERHEAD;
        }
        if reachable < size {
            return Err(self.exhausted(size));
        }

        let staged = self.buf()[chunk.offset..chunk.offset + chunk_size].to_vec();
        self.release(start);
        let Some(free) = self.find_chunk(size) else {
            self.fatal(&format!(
                "merged chunk of {reachable} bytes cannot serve {size} bytes"
            ));
        };
        let moved = self.carve(free, size);
        let to = moved.offset;
        self.buf_mut()[to..to + staged.len()].copy_from_slice(&staged);
        Ok(Some(moved))
    }

    /// Release a chunk, merging it with free neighbours.
    ///
    /// Handing over a chunk this arena did not produce, or one whose tags
    /// were overwritten, terminates the process.
    pub fn free(&mut self, chunk: Chunk) {
        let start = self.checked(&chunk);
        self.release(start);
    }

    fn release(&mut self, chunk: usize) {
        let mut chunk = chunk;
        let mut size = self.chunk_size_at(chunk);
        self.add_used(-(size as isize));
        self.add_free(size as isize);

        let prev = self.free_prev(chunk);
        let next = self.free_next(chunk, size);

        if let Some(prev) = prev {
            let prev_size = self.chunk_size_at(prev);
            self.unlink_chunk(prev);
            self.add_free(CHUNK_OVERHEAD as isize);
            size += prev_size + CHUNK_OVERHEAD;
            chunk = prev;
        }
        if let Some(next) = next {
            let next_size = self.chunk_size_at(next);
            self.unlink_chunk(next);
            self.add_free(CHUNK_OVERHEAD as isize);
            size += next_size + CHUNK_OVERHEAD;
        }

        self.set_free_chunk_size(chunk, size);
        self.link_chunk(chunk);
    }

    /// Mutable payload of a used chunk.
    pub fn bytes_mut(&mut self, chunk: &Chunk) -> &mut [u8] {
        let start = self.checked(chunk);
        let size = self.chunk_size_at(start);
        &mut self.buf_mut()[chunk.offset..chunk.offset + size]
    }

    /// Reset to the freshly created state: one free chunk spanning the whole
    /// capacity. Every outstanding chunk handle becomes invalid.
    pub fn clear(&mut self) {
        for index in 0..BUCKET_COUNT {
            self.set_bucket_head(index, None);
        }
        let lo = self.lo_bound();
        let total = self.total_size();
        self.set_free_chunk_size(lo, total);
        self.link_chunk(lo);
        self.set_field(field::USED_SIZE, 0);
        self.set_field(field::FREE_SIZE, total);
    }
}

/// Migrate the arena in `src` into the differently sized buffer `dst`.
///
/// Every chunk keeps its offset, so chunk handles and offsets stored by
/// cache layers stay valid in the new buffer. Growing adds the new space to
/// a trailing free chunk (or appends one). Shrinking succeeds only if the
/// trailing chunk is free and stays at least [`MIN_ALLOC`] bytes large.
///
/// This is the default copy callback of
/// [`DynamicSegment`](super::DynamicSegment).
///
/// # Errors
///
/// Returns [`Error::InvalidArena`] if `src` holds no arena and
/// [`Error::ResizeFailed`] if the live chunks do not fit in `dst`.
pub fn migrate(dst: &mut [u8], src: &[u8]) -> Result<()> {
    let old = Arena::open(src)?;
    let old_hi = old.hi_bound();
    let new_hi = dst.len() & !7;

    // the trailing chunk, found through its trailing tag
    let last_tag = old.word(old_hi - SIZE_FIELD);
    let last_size = (last_tag & !USED_FLAG) as usize;
    let last_chunk = old_hi - CHUNK_OVERHEAD - last_size;
    let last_free = last_tag & USED_FLAG == 0;

    if new_hi < old_hi {
        let cut = old_hi - new_hi;
        if !last_free || last_size < cut + MIN_ALLOC {
            return Err(Error::ResizeFailed(format!(
                "{}: live chunks need more than {} bytes",
                old.description(),
                dst.len()
            )));
        }
    }

    let keep = old_hi.min(new_hi);
    dst[..keep].copy_from_slice(&src[..keep]);
    let mut arena = Arena { bytes: dst };
    arena.set_field(field::ORIG_SIZE, arena.buf().len());

    if new_hi < old_hi {
        let cut = old_hi - new_hi;
        arena.unlink_chunk(last_chunk);
        arena.set_free_chunk_size(last_chunk, last_size - cut);
        arena.link_chunk(last_chunk);
        arena.add_free(-(cut as isize));
        arena.set_field(field::HI_BOUND, new_hi);
        arena.set_field(field::TOTAL_SIZE, arena.total_size() - cut);
    } else {
        let gain = new_hi - old_hi;
        if last_free {
            arena.unlink_chunk(last_chunk);
            arena.set_free_chunk_size(last_chunk, last_size + gain);
            arena.link_chunk(last_chunk);
            arena.add_free(gain as isize);
        } else if gain >= CHUNK_OVERHEAD + MIN_ALLOC {
            arena.set_free_chunk_size(old_hi, gain - CHUNK_OVERHEAD);
            arena.link_chunk(old_hi);
            arena.add_free((gain - CHUNK_OVERHEAD) as isize);
        } else {
            // too little to form a chunk: stays unused slack past hi_bound
            tracing::trace!(arena = arena.description(), gain, "resize gain too small");
            return Ok(());
        }
        arena.set_field(field::HI_BOUND, new_hi);
        arena.set_field(field::TOTAL_SIZE, arena.total_size() + gain);
    }

    tracing::debug!(
        arena = arena.description(),
        from = src.len(),
        to = arena.buf().len(),
        "arena migrated"
    );
    Ok(())
}
