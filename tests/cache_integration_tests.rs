//! Integration tests for the cache store.
//!
//! These tests verify the store's concurrency contract under realistic
//! load: one creator per hash with everyone else blocking on the entry
//! lock, eviction that never waits on a held buffer, and housekeeping
//! (TTL sweep, per-pipeline flush) running against live traffic.

use rasterflow::cache::{BufferDescriptor, CacheConfig, CacheStore, Colorspace};
use rasterflow::error::Error;
use rasterflow::memory::PAGE_SIZE;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn descriptor(pages: usize) -> BufferDescriptor {
    // One page is 64 KiB: width * 4 bytes per pixel * height.
    BufferDescriptor {
        width: 128,
        height: (pages * PAGE_SIZE / (128 * 4)) as u32,
        bpp: 4,
        cst: Colorspace::Rgb,
    }
}

/// Route store logs through the test harness; `RUST_LOG` selects what
/// shows. Safe to call from every test, only the first call wins.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn store(pages: usize) -> Arc<CacheStore> {
    init_logging();
    CacheStore::new(CacheConfig {
        arena_pages: pages,
        ..Default::default()
    })
    .unwrap()
}

// ============================================================================
// Single Creator Tests
// ============================================================================

/// Many threads racing on one hash: exactly one creates and fills, the
/// rest block until publish and read the filled pixels.
#[test]
fn test_single_creator_under_contention() {
    let store = store(16);
    let creators = AtomicU32::new(0);
    let threads = 8u64;

    thread::scope(|s| {
        for _ in 0..threads {
            let store = &store;
            let creators = &creators;
            s.spawn(move || {
                let mut lease = store.get_or_create(0xabcd, descriptor(1), 1).unwrap();
                if lease.created() {
                    creators.fetch_add(1, Ordering::SeqCst);
                    // Readers must not observe a half-filled buffer.
                    thread::sleep(Duration::from_millis(5));
                    lease.as_mut_slice().fill(0x42);
                    lease.publish();
                }
                assert!(lease.as_slice().iter().all(|&b| b == 0x42));
            });
        }
    });

    assert_eq!(creators.load(Ordering::SeqCst), 1);
    let stats = store.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, threads - 1);
}

// ============================================================================
// Eviction Tests
// ============================================================================

/// Filling the arena evicts the oldest unreferenced entries instead of
/// failing, and never exceeds the configured footprint.
#[test]
fn test_eviction_under_pressure() {
    let store = store(4);

    for i in 0..20u64 {
        let mut lease = store.get_or_create(i + 1, descriptor(1), 1).unwrap();
        lease.publish();
    }

    let stats = store.stats();
    assert!(stats.evictions >= 16);
    assert!(stats.entries <= 4);
    assert!(stats.used_bytes <= 4 * PAGE_SIZE);
}

/// Eviction skips referenced entries. With every buffer held, the store
/// reports it is full instead of blocking on a lock.
#[test]
fn test_full_store_with_held_leases() {
    let store = store(4);

    let mut held: Vec<_> = (0..4u64)
        .map(|i| {
            let mut lease = store.get_or_create(i + 1, descriptor(1), 1).unwrap();
            lease.publish();
            lease
        })
        .collect();

    match store.get_or_create(0x99, descriptor(1), 1) {
        Err(Error::CacheFull { .. }) => {}
        other => panic!("expected CacheFull, got {other:?}"),
    }

    // Releasing one lease makes room again.
    drop(held.remove(0));
    let lease = store.get_or_create(0x99, descriptor(1), 1).unwrap();
    assert!(lease.created());
}

/// Eviction prefers the entry that has gone longest without a lookup.
#[test]
fn test_eviction_is_lru() {
    let store = store(4);

    for i in 0..4u64 {
        store
            .get_or_create(i + 1, descriptor(1), 1)
            .unwrap()
            .publish();
    }
    // Touch everything except entry 2.
    for i in [1u64, 3, 4] {
        store.get(i).unwrap();
    }

    store.get_or_create(0x55, descriptor(1), 1).unwrap().publish();
    assert!(!store.contains(2));
    for i in [1u64, 3, 4, 0x55] {
        assert!(store.contains(i));
    }
}

// ============================================================================
// Housekeeping Tests
// ============================================================================

/// The background sweeper removes cold entries while hot ones survive.
#[test]
fn test_background_sweeper() {
    let store = CacheStore::new(CacheConfig {
        arena_pages: 16,
        sweep_interval: Duration::from_millis(10),
        entry_ttl: Duration::ZERO,
        min_hits_to_keep: 4,
        ..Default::default()
    })
    .unwrap();
    let _sweeper = store.spawn_sweeper().unwrap();

    store.get_or_create(0x1, descriptor(1), 1).unwrap().publish();
    let mut hot = store.get_or_create(0x2, descriptor(1), 1).unwrap();
    hot.publish();
    drop(hot);
    for _ in 0..4 {
        store.get(0x2).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    while store.contains(0x1) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!store.contains(0x1));
    assert!(store.contains(0x2));
}

/// Flushing one pipeline leaves other pipelines' entries alone.
#[test]
fn test_flush_is_scoped_to_pipeline() {
    let store = store(16);

    for i in 0..3u64 {
        store
            .get_or_create(0x10 + i, descriptor(1), 7)
            .unwrap()
            .publish();
    }
    store.get_or_create(0x20, descriptor(1), 8).unwrap().publish();

    assert_eq!(store.flush(Some(7)), 3);
    assert!(!store.contains(0x10));
    assert!(store.contains(0x20));

    assert_eq!(store.flush(None), 1);
    assert_eq!(store.stats().entries, 0);
}

/// Scratch buffers live outside the arena and die with their last
/// reference.
#[test]
fn test_scratch_lifecycle() {
    let store = store(4);
    let before = store.stats().used_bytes;

    let mut lease = store.scratch_alloc(descriptor(1), 1).unwrap();
    lease.as_mut_slice().fill(9);
    let hash = lease.hash();
    assert!(store.contains(hash));
    assert_eq!(store.stats().used_bytes, before);

    drop(lease);
    assert!(!store.contains(hash));
}

// ============================================================================
// Mixed Workload Tests
// ============================================================================

/// Concurrent pipelines sharing a store: disjoint hash ranges, heavy
/// reuse, eviction churn. The store must stay consistent throughout.
#[test]
fn test_concurrent_mixed_workload() {
    let store = store(8);
    let threads = 4;

    thread::scope(|s| {
        for t in 0..threads as u64 {
            let store = &store;
            s.spawn(move || {
                for i in 0..50u64 {
                    let hash = (t << 32) | ((i % 6) + 1);
                    match store.get_or_create(hash, descriptor(1), t) {
                        Ok(mut lease) => {
                            if lease.created() {
                                lease.as_mut_slice().fill(t as u8);
                                lease.publish();
                            }
                            assert!(lease.as_slice().iter().all(|&b| b == t as u8));
                        }
                        Err(Error::CacheFull { .. }) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            });
        }
    });

    let stats = store.stats();
    assert!(stats.entries <= 8);
    assert!(stats.used_bytes <= 8 * PAGE_SIZE);
}
