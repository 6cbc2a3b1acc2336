//! # Rasterflow
//!
//! A memoized image-pipeline evaluator with a page-arena pixel cache.
//!
//! Rasterflow evaluates ordered chains of raster processing stages over a
//! source image, memoizing every intermediate buffer in a shared cache so
//! that an edit recomputes only the stages downstream of it.
//!
//! ## Features
//!
//! - **Page arena**: pixel buffers live in one memfd-backed arena managed
//!   in 64 KiB pages with best-fit allocation and free-run coalescing
//! - **Memoization cache**: content-hashed entries with per-entry locks, a
//!   single-creator guarantee and never-blocking LRU eviction
//! - **Content hashing**: cumulative djb2 chains over stage parameters and
//!   regions, with an independent chain for raster mask lineage
//! - **Accelerator bridge**: zero-copy detection, companion buffer reuse
//!   and host resynchronization for device-dispatched stages
//! - **Run control**: backbuffer delivery, cooperative cancellation and a
//!   bounded retry loop around device failures and mask re-entry
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rasterflow::prelude::*;
//!
//! let store = CacheStore::new(CacheConfig::default())?;
//! let driver = PipelineDriver::new(store);
//!
//! let mut pipe = Pipeline::new(1, PipeKind::Full, 16);
//! pipe.push_stage(exposure);
//! pipe.push_stage(filmic);
//! pipe.set_history_hash(history);
//!
//! let result = driver.process(&pipe, &image)?;
//! display(result.output.as_slice());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod cache;
pub mod error;
pub mod gpu;
pub mod memory;
pub mod observability;
pub mod pipeline;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::cache::{BufferDescriptor, CacheConfig, CacheLease, CacheStore, Colorspace};
    pub use crate::error::{Error, Result};
    pub use crate::gpu::{Device, DeviceManager};
    pub use crate::memory::{PAGE_SIZE, PageArena};
    pub use crate::pipeline::{
        PipeKind, Pipeline, PipelineDriver, Roi, SourceImage, StageOp, StageSpec,
    };
}

pub use error::{Error, Result};
