//! Default names, sizes and locations.
//!
//! # Usage
//!
//! ```rust,ignore
//! use shmalloc::config::SegmentConfig;
//! use shmalloc::memory::defaults;
//!
//! let config = SegmentConfig::new("valuecache", defaults::SEGMENT_SIZE)
//!     .shm_dir(defaults::shm_dir());
//! ```

use std::path::PathBuf;

/// Directory where Linux keeps POSIX shared memory objects (tmpfs).
pub const SHM_DIR: &str = "/dev/shm";

/// Default size of a shared segment (8 MiB).
pub const SEGMENT_SIZE: usize = 8 * 1024 * 1024;

/// Description tag used when none is configured.
pub const DESCRIPTION: &str = "shared memory arena";

/// Configuration origin tag used when none is configured.
pub const ORIGIN: &str = "CacheSize";

/// Suffix of the control block region holding a segment's identity.
pub const CONTROL_SUFFIX: &str = "ctl";

/// Suffix of the lock file backing a segment's mutex.
pub const LOCK_SUFFIX: &str = "lock";

/// Size of the control block region.
pub const CONTROL_SIZE: usize = 64;

/// Where shared regions are placed when no directory is configured.
///
/// `/dev/shm` when the host has it, the system temp directory otherwise.
pub fn shm_dir() -> PathBuf {
    let dev_shm = PathBuf::from(SHM_DIR);
    if dev_shm.is_dir() {
        dev_shm
    } else {
        std::env::temp_dir()
    }
}
