//! Size classes for free chunks.
//!
//! Free chunks are kept in one list per 8-byte size class from
//! [`MIN_BUCKET_SIZE`] up to (but excluding) [`MAX_BUCKET_SIZE`], plus one
//! overflow list holding every free chunk of [`MAX_BUCKET_SIZE`] bytes or
//! more regardless of its exact size.
//!
//! ```text
//! bucket:   0    1    2   ...   28    29
//! size:    24   32   40   ...  248   >=256
//! ```

/// Smallest payload handed out. A multiple of 8 large enough to host the
/// two free-list links a free chunk stores in its payload.
pub const MIN_ALLOC: usize = 24;

/// Payload size of the first exact size class.
pub const MIN_BUCKET_SIZE: usize = MIN_ALLOC;

/// Starting from this payload size all free chunks share the overflow bucket.
pub const MAX_BUCKET_SIZE: usize = 256;

/// Number of buckets, the overflow bucket included.
pub const BUCKET_COUNT: usize = (MAX_BUCKET_SIZE - MIN_BUCKET_SIZE) / 8 + 1;

/// Index of the overflow bucket.
pub const OVERFLOW_BUCKET: usize = BUCKET_COUNT - 1;

/// Width of one boundary tag.
pub const SIZE_FIELD: usize = 8;

/// Book-keeping bytes every chunk carries: a leading and a trailing tag.
pub const CHUNK_OVERHEAD: usize = 2 * SIZE_FIELD;

const _: () = assert!(MIN_ALLOC % 8 == 0 && MIN_ALLOC >= 2 * SIZE_FIELD);
const _: () = assert!(BUCKET_COUNT == 30);

/// Round a request up to the payload size actually reserved for it.
#[inline]
pub const fn proper_alloc_size(size: usize) -> usize {
    if size >= MIN_ALLOC {
        size.saturating_add(7) & !7
    } else {
        MIN_ALLOC
    }
}

/// Bucket a free chunk of `size` payload bytes belongs to.
#[inline]
pub const fn bucket_by_size(size: usize) -> usize {
    if size < MIN_BUCKET_SIZE {
        0
    } else if size < MAX_BUCKET_SIZE {
        (size - MIN_BUCKET_SIZE) >> 3
    } else {
        OVERFLOW_BUCKET
    }
}

/// Smallest payload size stored in a bucket.
#[inline]
pub const fn bucket_size(index: usize) -> usize {
    MIN_BUCKET_SIZE + index * 8
}

/// Arena bytes one allocation of `size` occupies once rounding and boundary
/// tags are accounted for. Zero for a zero-byte request.
#[inline]
pub const fn required_chunk_size(size: usize) -> usize {
    if size == 0 {
        0
    } else {
        proper_alloc_size(size) + CHUNK_OVERHEAD
    }
}
