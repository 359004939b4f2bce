//! Error types for shmalloc.

use thiserror::Error;

/// Result type alias using shmalloc's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for arena and segment operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The arena cannot satisfy an allocation and was configured to allow
    /// out-of-memory recovery.
    #[error("{descr}: out of memory (requested {requested} bytes), please increase {param}")]
    OutOfMemory {
        /// Rounded size of the request that failed.
        requested: usize,
        /// Arena description tag.
        descr: String,
        /// Configuration parameter the arena size comes from.
        param: String,
    },

    /// The caller asked for something the allocator never serves.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The bytes handed over do not hold a usable arena.
    #[error("invalid arena: {0}")]
    InvalidArena(String),

    /// A shared region could not be allocated or mapped.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid shared segment operation.
    #[error("invalid memory segment: {0}")]
    InvalidSegment(String),

    /// The cross-process mutex could not be created, acquired or removed.
    #[error("mutex error: {0}")]
    Lock(String),

    /// Migrating the arena into a resized segment failed.
    #[error("resize failed: {0}")]
    ResizeFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// Returns true if this is a recoverable out-of-memory condition.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}
