//! Error types for rasterflow.

use thiserror::Error;

/// Result type alias using rasterflow's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for rasterflow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The page arena has no free run large enough for the request.
    #[error("arena exhausted: no free run of {requested_pages} pages (largest is {largest_run})")]
    ArenaExhausted {
        /// Pages needed to satisfy the allocation.
        requested_pages: usize,
        /// Largest contiguous free run currently available.
        largest_run: usize,
    },

    /// The cache could not make room: every entry is referenced or locked.
    #[error("cache is full: could not free {requested} bytes")]
    CacheFull {
        /// Bytes the failed allocation asked for.
        requested: usize,
    },

    /// A non-blocking lock attempt found the entry contended.
    #[error("cache entry {hash:#018x} is locked")]
    EntryLocked {
        /// Hash of the contended entry.
        hash: u64,
    },

    /// No cache entry exists for the given hash.
    #[error("no cache entry for hash {hash:#018x}")]
    EntryMissing {
        /// The missing hash.
        hash: u64,
    },

    /// Memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Accelerator device reported an error.
    #[error("device {devid} error: {reason}")]
    Device {
        /// Device index.
        devid: usize,
        /// Backend-reported reason.
        reason: String,
    },

    /// Accelerator device is out of memory.
    #[error("device {devid} out of memory ({requested} bytes)")]
    DeviceOutOfMemory {
        /// Device index.
        devid: usize,
        /// Bytes the failed allocation asked for.
        requested: usize,
    },

    /// Evaluation was cancelled by the shutdown token.
    #[error("pipeline evaluation aborted")]
    Aborted,

    /// A region of interest is degenerate or out of bounds.
    #[error("invalid region of interest: {0}")]
    InvalidRoi(String),

    /// A raster mask producer has no cached output yet; the caller should
    /// re-enter the pipeline at the recorded hash.
    #[error("raster mask from stage '{producer}' not cached, re-entry required")]
    MaskUnavailable {
        /// Name of the stage expected to produce the mask.
        producer: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
