//! The content-addressed pixel cache.
//!
//! Every stage output in a pipeline is identified by a cumulative content
//! hash and stored here. The store owns the page arena, enforces the memory
//! budget with non-blocking LRU eviction, and runs a periodic TTL sweep for
//! cold entries.
//!
//! # Locking protocol
//!
//! Three levels, always taken coarse to fine:
//!
//! 1. the store mutex (map lookups, inserts, removals),
//! 2. per-entry read/write locks (buffer contents),
//! 3. entry-internal mutexes (descriptor, companion list).
//!
//! `get_or_create` holds the store mutex across lookup-miss-insert, so one
//! thread creates a given hash. The creator gets the entry write-locked and
//! publishes by downgrading; concurrent hitters block on the read lock, not
//! on the store.
//!
//! # Example
//!
//! ```rust,ignore
//! use rasterflow::cache::{BufferDescriptor, CacheConfig, CacheStore, Colorspace};
//!
//! let store = CacheStore::new(CacheConfig::default())?;
//! let desc = BufferDescriptor { width: 512, height: 512, bpp: 16, cst: Colorspace::Rgb };
//!
//! let mut lease = store.get_or_create(hash, desc, pipe_id)?;
//! if lease.created() {
//!     fill_pixels(lease.as_mut_slice());
//!     lease.publish();
//! }
//! consume(lease.as_slice());
//! ```

mod entry;
mod store;

pub use entry::{
    BufferDescriptor, CacheEntry, Colorspace, Companion, EntryReadGuard, EntryWriteGuard,
};
pub use store::{CacheConfig, CacheLease, CacheStats, CacheStore, SweeperHandle};
