//! Memory management for rasterflow.
//!
//! One fixed-size page arena backs every pixel buffer the cache hands out.
//! The arena is created once at startup with the cache store and shared
//! through an `Arc`.
//!
//! # Example
//!
//! ```rust,ignore
//! use rasterflow::memory::{PageArena, PAGE_SIZE};
//!
//! // 4096 pages of 64KB each = 256MB region, one fd
//! let arena = PageArena::new(4096)?;
//!
//! let buf = arena.alloc(12 * 1024 * 1024)?;
//! // ... fill pixels ...
//! arena.free(buf, 12 * 1024 * 1024);
//! ```

mod arena;

pub use arena::{ArenaStats, PAGE_SIZE, PageArena, pages_for};
