//! Metrics collection using metrics-rs.

use crate::cache::CacheStats;
use crate::memory::ArenaStats;
use metrics::{Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const CACHE_HITS: &str = "rasterflow_cache_hits";
const CACHE_MISSES: &str = "rasterflow_cache_misses";
const CACHE_EVICTIONS: &str = "rasterflow_cache_evictions";
const CACHE_SWEPT: &str = "rasterflow_cache_swept";
const CACHE_ENTRIES: &str = "rasterflow_cache_entries";
const CACHE_USED_BYTES: &str = "rasterflow_cache_used_bytes";
const ARENA_FREE_PAGES: &str = "rasterflow_arena_free_pages";
const ARENA_LARGEST_RUN: &str = "rasterflow_arena_largest_run";
const DEVICE_ERRORS: &str = "rasterflow_device_errors";
const COMPANION_LOOKUPS: &str = "rasterflow_companion_lookups";
const STAGE_TIME_NS: &str = "rasterflow_stage_time_ns";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return; // Already initialized
    }

    metrics::describe_counter!(
        CACHE_HITS,
        Unit::Count,
        "Cache lookups that found an existing entry"
    );
    metrics::describe_counter!(
        CACHE_MISSES,
        Unit::Count,
        "Cache lookups that had to create an entry"
    );
    metrics::describe_counter!(
        CACHE_EVICTIONS,
        Unit::Count,
        "Entries evicted to make room under memory pressure"
    );
    metrics::describe_counter!(
        CACHE_SWEPT,
        Unit::Count,
        "Cold entries removed by the TTL sweep"
    );
    metrics::describe_gauge!(CACHE_ENTRIES, Unit::Count, "Resident cache entries");
    metrics::describe_gauge!(
        CACHE_USED_BYTES,
        Unit::Bytes,
        "Arena bytes held by cache entries"
    );
    metrics::describe_gauge!(
        ARENA_FREE_PAGES,
        Unit::Count,
        "Free pages in the backing arena"
    );
    metrics::describe_gauge!(
        ARENA_LARGEST_RUN,
        Unit::Count,
        "Largest contiguous run of free arena pages"
    );
    metrics::describe_counter!(
        DEVICE_ERRORS,
        Unit::Count,
        "Accelerator errors, labeled by device"
    );
    metrics::describe_counter!(
        COMPANION_LOOKUPS,
        Unit::Count,
        "Device companion buffer lookups, labeled by outcome"
    );
    metrics::describe_histogram!(
        STAGE_TIME_NS,
        Unit::Nanoseconds,
        "Time to process a single stage"
    );
}

/// Record a cache lookup hit.
#[inline]
pub fn record_cache_hit() {
    counter!(CACHE_HITS).increment(1);
}

/// Record a cache lookup miss.
#[inline]
pub fn record_cache_miss() {
    counter!(CACHE_MISSES).increment(1);
}

/// Record an entry evicted under memory pressure.
#[inline]
pub fn record_cache_eviction() {
    counter!(CACHE_EVICTIONS).increment(1);
}

/// Record entries removed by one TTL sweep cycle.
#[inline]
pub fn record_cache_swept(count: usize) {
    counter!(CACHE_SWEPT).increment(count as u64);
}

/// Publish the occupancy gauges from a store and arena snapshot.
#[inline]
pub fn record_cache_occupancy(stats: &CacheStats, arena: &ArenaStats) {
    gauge!(CACHE_ENTRIES).set(stats.entries as f64);
    gauge!(CACHE_USED_BYTES).set(stats.used_bytes as f64);
    gauge!(ARENA_FREE_PAGES).set(arena.free_pages as f64);
    gauge!(ARENA_LARGEST_RUN).set(arena.largest_run as f64);
}

/// Record an accelerator error.
#[inline]
pub fn record_device_error(devid: usize) {
    counter!(DEVICE_ERRORS, "device" => devid.to_string()).increment(1);
}

/// Record the outcome of a device companion buffer lookup.
#[inline]
pub fn record_companion_reuse(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(COMPANION_LOOKUPS, "outcome" => outcome).increment(1);
}

/// Start a timer for one stage dispatch; the elapsed time is recorded when
/// the returned guard drops.
pub fn stage_timer(stage: &str, device: bool) -> StageTimer {
    let backend = if device { "device" } else { "cpu" };
    StageTimer {
        start: Instant::now(),
        histogram: histogram!(STAGE_TIME_NS, "stage" => stage.to_string(), "backend" => backend),
    }
}

/// Guard that records stage processing time when dropped.
pub struct StageTimer {
    start: Instant,
    histogram: Histogram,
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.histogram.record(self.start.elapsed().as_nanos() as f64);
    }
}
