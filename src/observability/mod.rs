//! Observability: metrics via `metrics-rs`, structured logging via `tracing`.
//!
//! Tracing events are emitted inline throughout the crate; this module owns
//! the metric definitions and recording helpers.
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `rasterflow_cache_hits` | Counter | Cache lookups that found an entry |
//! | `rasterflow_cache_misses` | Counter | Cache lookups that created an entry |
//! | `rasterflow_cache_evictions` | Counter | Entries evicted under memory pressure |
//! | `rasterflow_cache_swept` | Counter | Entries removed by the TTL sweep |
//! | `rasterflow_cache_entries` | Gauge | Resident cache entries |
//! | `rasterflow_cache_used_bytes` | Gauge | Arena bytes held by cache entries |
//! | `rasterflow_arena_free_pages` | Gauge | Free pages in the backing arena |
//! | `rasterflow_arena_largest_run` | Gauge | Largest contiguous free page run |
//! | `rasterflow_device_errors` | Counter | Accelerator errors per device |
//! | `rasterflow_companion_lookups` | Counter | Device companion buffer lookups |
//! | `rasterflow_stage_time_ns` | Histogram | Per-stage processing time |
//!
//! [`init_metrics`] describes them all; call it once at startup. Recording
//! works without initialization (and without an installed recorder), it is
//! just unlabeled.

mod metrics;

pub use metrics::{
    StageTimer, init_metrics, record_cache_eviction, record_cache_hit, record_cache_miss,
    record_cache_occupancy, record_cache_swept, record_companion_reuse, record_device_error,
    stage_timer,
};
