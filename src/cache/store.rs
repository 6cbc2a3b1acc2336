//! The pixel cache store.
//!
//! One process-wide map from content hash to [`CacheEntry`], backed by the
//! page arena. The store mutex is held across lookup-miss-insert so exactly
//! one thread creates a given hash; the new entry is returned write-locked
//! and every concurrent reader blocks on the entry lock until the creator
//! publishes.
//!
//! Eviction never blocks: only entries with no references whose write lock
//! can be taken immediately are candidates, oldest first. When nothing is
//! evictable the allocation fails with "cache is full" and the caller deals
//! with it.

use crate::cache::entry::{
    BufferDescriptor, CacheEntry, EntryReadGuard, EntryWriteGuard,
};
use crate::error::{Error, Result};
use crate::memory::PageArena;
use crate::observability;
use crate::pipeline::hash::{HASH_SEED, hash_u64};
use parking_lot::Mutex;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Cache store configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Pages in the backing arena.
    pub arena_pages: usize,
    /// Memory budget in bytes for arena-backed entries.
    pub max_bytes: usize,
    /// How often the background sweep wakes up.
    pub sweep_interval: Duration,
    /// Entries older than this are sweep candidates.
    pub entry_ttl: Duration,
    /// Entries with at least this many hits survive the sweep.
    pub min_hits_to_keep: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        // 256MB arena; sweep every 5 minutes, dropping cold entries older
        // than 3 minutes with fewer than 4 hits.
        let arena_pages = 4096;
        Self {
            arena_pages,
            max_bytes: arena_pages * crate::memory::PAGE_SIZE,
            sweep_interval: Duration::from_secs(300),
            entry_ttl: Duration::from_secs(180),
            min_hits_to_keep: 4,
        }
    }
}

/// Counters reported by [`CacheStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Live entries.
    pub entries: usize,
    /// Bytes of arena memory held by entries.
    pub used_bytes: usize,
    /// Lookup hits since creation.
    pub hits: u64,
    /// Lookup misses since creation.
    pub misses: u64,
    /// Entries removed by LRU eviction.
    pub evictions: u64,
    /// Entries removed by the TTL sweep.
    pub swept: u64,
}

impl CacheStats {
    /// Hit rate in [0, 1].
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct StoreInner {
    entries: HashMap<u64, Arc<CacheEntry>>,
    used_bytes: usize,
}

/// Process-wide pixel cache.
pub struct CacheStore {
    arena: Arc<PageArena>,
    inner: Mutex<StoreInner>,
    config: CacheConfig,
    age: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    swept: AtomicU64,
}

/// How a lease currently holds the entry lock.
enum LeaseGuard {
    Read(EntryReadGuard),
    Write(EntryWriteGuard),
}

/// A referenced, locked view of a cache entry.
///
/// Holds one cache reference and either the read or the write lock. The
/// reference and lock are released on drop. A lease returned with
/// `created == true` holds the write lock: fill the buffer, then call
/// [`CacheLease::publish`] to let readers in.
pub struct CacheLease {
    store: Arc<CacheStore>,
    entry: Arc<CacheEntry>,
    guard: Option<LeaseGuard>,
    created: bool,
}

impl CacheLease {
    /// The underlying entry.
    #[inline]
    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }

    /// Content hash of the leased entry.
    #[inline]
    pub fn hash(&self) -> u64 {
        self.entry.hash()
    }

    /// Buffer descriptor.
    #[inline]
    pub fn descriptor(&self) -> BufferDescriptor {
        self.entry.descriptor()
    }

    /// Whether this lease created the entry (and must fill it).
    #[inline]
    pub fn created(&self) -> bool {
        self.created
    }

    /// Whether the lease currently holds the write lock.
    #[inline]
    pub fn is_writable(&self) -> bool {
        matches!(self.guard, Some(LeaseGuard::Write(_)))
    }

    /// Pixel data.
    pub fn as_slice(&self) -> &[u8] {
        assert!(self.guard.is_some(), "lease used after guard release");
        // SAFETY: the lease holds a read or write guard on the entry.
        unsafe { self.entry.as_slice() }
    }

    /// Mutable pixel data. Only valid while the lease holds the write lock.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(self.is_writable(), "mutable access without the write lock");
        // SAFETY: the lease holds the exclusive write guard.
        unsafe { self.entry.as_mut_slice() }
    }

    /// Downgrade the creator's write lock to a read lock, making the entry
    /// visible to blocked readers. No-op when already read-locked.
    pub fn publish(&mut self) {
        if matches!(self.guard, Some(LeaseGuard::Write(_))) {
            let Some(LeaseGuard::Write(w)) = self.guard.take() else {
                return;
            };
            // Flag before the downgrade opens the lock to blocked readers.
            self.entry.mark_published();
            self.guard = Some(LeaseGuard::Read(ArcRwLockWriteGuard::downgrade(w)));
        }
    }

    /// Throw away a partially written entry.
    ///
    /// Removes the entry from the store before releasing the write lock, so
    /// no new lookup can land on the discarded data.
    pub fn discard(mut self) {
        let entry = Arc::clone(&self.entry);
        self.store.remove_for_discard(&entry);
        // Guard and reference drop in Drop.
        trace!(hash = format_args!("{:#018x}", entry.hash()), "discarded cache entry");
    }
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        // A creator that drops without publishing leaves a half-filled
        // buffer behind; pull the entry out of the map before the write
        // lock opens, same as an explicit discard.
        if self.created && self.is_writable() && !self.entry.published() {
            self.store.remove_for_discard(&self.entry);
        }
        self.guard = None;
        self.store.release(&self.entry);
    }
}

impl std::fmt::Debug for CacheLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheLease")
            .field("hash", &format_args!("{:#018x}", self.entry.hash()))
            .field("created", &self.created)
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl CacheStore {
    /// Create a store and its backing arena.
    pub fn new(config: CacheConfig) -> Result<Arc<Self>> {
        let arena = PageArena::new(config.arena_pages)?;
        Ok(Arc::new(Self {
            arena,
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                used_bytes: 0,
            }),
            config,
            age: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            swept: AtomicU64::new(0),
        }))
    }

    /// The backing arena.
    #[inline]
    pub fn arena(&self) -> &Arc<PageArena> {
        &self.arena
    }

    /// Store configuration.
    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn next_age(&self) -> u64 {
        self.age.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up `hash`, creating the entry on a miss.
    ///
    /// Hit: returns a read-locked lease (blocking until the creator
    /// publishes). Miss: allocates from the arena, evicting cold entries as
    /// needed, and returns a write-locked lease with `created() == true`.
    pub fn get_or_create(
        self: &Arc<Self>,
        hash: u64,
        descriptor: BufferDescriptor,
        pipe_id: u64,
    ) -> Result<CacheLease> {
        let size = descriptor.size();
        let mut inner = loop {
            let inner = self.inner.lock();
            let Some(entry) = inner.entries.get(&hash).cloned() else {
                break inner;
            };
            entry.add_ref();
            drop(inner);
            let guard = entry.read();
            // The creator may have discarded the entry while we waited on
            // its write lock; the removal lands before the lock opens, so
            // looking up again turns this into a miss.
            if !entry.published() {
                drop(guard);
                self.release(&entry);
                continue;
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            entry.touch(self.next_age());
            observability::record_cache_hit();
            return Ok(CacheLease {
                store: Arc::clone(self),
                entry,
                guard: Some(LeaseGuard::Read(guard)),
                created: false,
            });
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        observability::record_cache_miss();

        let ptr = self.alloc_with_eviction(&mut inner, size)?;
        let entry = Arc::new(CacheEntry::new_arena(
            hash,
            ptr,
            size,
            descriptor,
            pipe_id,
            self.next_age(),
            Arc::clone(&self.arena),
        ));
        entry.add_ref();
        // Take the write lock before the store mutex drops: a concurrent
        // hit on this hash must block until the buffer is filled.
        let guard = entry.write();
        inner.entries.insert(hash, Arc::clone(&entry));
        inner.used_bytes += size;
        drop(inner);

        trace!(
            hash = format_args!("{hash:#018x}"),
            size, pipe_id, "created cache entry"
        );
        Ok(CacheLease {
            store: Arc::clone(self),
            entry,
            guard: Some(LeaseGuard::Write(guard)),
            created: true,
        })
    }

    /// Arena allocation with the LRU eviction loop.
    fn alloc_with_eviction(
        &self,
        inner: &mut StoreInner,
        size: usize,
    ) -> Result<NonNull<u8>> {
        loop {
            if inner.used_bytes + size <= self.config.max_bytes {
                match self.arena.alloc(size) {
                    Ok(ptr) => return Ok(ptr),
                    Err(Error::ArenaExhausted { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            if !self.evict_one(inner) {
                warn!(
                    requested = size,
                    used = inner.used_bytes,
                    "cache is full: nothing left to evict"
                );
                return Err(Error::CacheFull { requested: size });
            }
        }
    }

    /// Evict the oldest unreferenced, uncontended entry. Returns false when
    /// no entry qualifies.
    fn evict_one(&self, inner: &mut StoreInner) -> bool {
        let mut victim: Option<(u64, u64, EntryWriteGuard)> = None;
        for (h, e) in &inner.entries {
            if e.ref_count() != 0 || e.is_external() {
                continue;
            }
            if victim.as_ref().is_some_and(|(_, age, _)| e.age() >= *age) {
                continue;
            }
            if let Some(guard) = e.try_write() {
                victim = Some((*h, e.age(), guard));
            }
        }
        let Some((hash, _, guard)) = victim else {
            return false;
        };
        // New references go through this store mutex, so holding it plus
        // the entry write lock makes the removal safe.
        if let Some(entry) = inner.entries.remove(&hash) {
            inner.used_bytes -= entry.size();
            self.evictions.fetch_add(1, Ordering::Relaxed);
            observability::record_cache_eviction();
            debug!(
                hash = format_args!("{hash:#018x}"),
                size = entry.size(),
                "evicted cache entry"
            );
        }
        drop(guard);
        true
    }

    /// Look up `hash` and take a blocking read lease.
    ///
    /// Returns `None` on a miss, and on the race where the creator
    /// discards the entry while this call waits for its write lock.
    pub fn get(self: &Arc<Self>, hash: u64) -> Option<CacheLease> {
        loop {
            let inner = self.inner.lock();
            let entry = inner.entries.get(&hash).cloned()?;
            entry.add_ref();
            drop(inner);
            let guard = entry.read();
            if !entry.published() {
                drop(guard);
                self.release(&entry);
                continue;
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            entry.touch(self.next_age());
            observability::record_cache_hit();
            return Some(CacheLease {
                store: Arc::clone(self),
                entry,
                guard: Some(LeaseGuard::Read(guard)),
                created: false,
            });
        }
    }

    /// Non-blocking read lookup for latency-sensitive callers.
    ///
    /// Reports [`Error::EntryLocked`] instead of waiting when the entry is
    /// being written.
    pub fn try_get(self: &Arc<Self>, hash: u64) -> Result<CacheLease> {
        let inner = self.inner.lock();
        let entry = inner
            .entries
            .get(&hash)
            .cloned()
            .ok_or(Error::EntryMissing { hash })?;
        let Some(guard) = entry.try_read() else {
            return Err(Error::EntryLocked { hash });
        };
        if !entry.published() {
            return Err(Error::EntryMissing { hash });
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        entry.touch(self.next_age());
        entry.add_ref();
        drop(inner);
        Ok(CacheLease {
            store: Arc::clone(self),
            entry,
            guard: Some(LeaseGuard::Read(guard)),
            created: false,
        })
    }

    /// Whether an entry for `hash` exists right now.
    pub fn contains(&self, hash: u64) -> bool {
        self.inner.lock().entries.contains_key(&hash)
    }

    /// Allocate a transient scratch buffer outside the arena.
    ///
    /// The entry is keyed by a hash of its own address, marked
    /// auto-destroy, and dies when the returned lease (and any later
    /// references) drop.
    pub fn scratch_alloc(
        self: &Arc<Self>,
        descriptor: BufferDescriptor,
        pipe_id: u64,
    ) -> Result<CacheLease> {
        let mut entry = CacheEntry::new_external(0, descriptor, pipe_id, self.next_age())?;
        // Keyed by the buffer address: unique for the entry's lifetime.
        let hash = hash_u64(HASH_SEED, entry.ptr().as_ptr() as u64);
        entry.set_hash(hash);
        let entry = Arc::new(entry);
        entry.add_ref();
        let guard = entry.write();
        let mut inner = self.inner.lock();
        inner.entries.insert(hash, Arc::clone(&entry));
        drop(inner);
        Ok(CacheLease {
            store: Arc::clone(self),
            entry,
            guard: Some(LeaseGuard::Write(guard)),
            created: true,
        })
    }

    /// Take an extra reference on an existing entry.
    ///
    /// Used by the backbuffer protocol, which keeps exactly one reference
    /// on the last delivered output of each pipeline.
    pub fn ref_entry(&self, hash: u64) -> Result<()> {
        let inner = self.inner.lock();
        let entry = inner.entries.get(&hash).ok_or(Error::EntryMissing { hash })?;
        entry.add_ref();
        Ok(())
    }

    /// Drop a reference taken with [`CacheStore::ref_entry`].
    pub fn unref_entry(&self, hash: u64) {
        let entry = {
            let inner = self.inner.lock();
            inner.entries.get(&hash).cloned()
        };
        if let Some(entry) = entry {
            self.release(&entry);
        }
    }

    /// Release one reference; auto-destroy entries die on the last one.
    fn release(&self, entry: &Arc<CacheEntry>) {
        let left = entry.drop_ref();
        if left == 0 && entry.auto_destroy() {
            let mut inner = self.inner.lock();
            let matches = inner
                .entries
                .get(&entry.hash())
                .is_some_and(|e| Arc::ptr_eq(e, entry));
            if matches && entry.ref_count() == 0 {
                if let Some(guard) = entry.try_write() {
                    let removed = inner.entries.remove(&entry.hash());
                    if let Some(removed) = removed {
                        if !removed.is_external() {
                            inner.used_bytes -= removed.size();
                        }
                    }
                    drop(guard);
                }
            }
        }
    }

    /// Remove a discarded entry from the map regardless of its hit count.
    /// The caller still holds the write lock and its reference.
    fn remove_for_discard(&self, entry: &Arc<CacheEntry>) {
        let mut inner = self.inner.lock();
        let matches = inner
            .entries
            .get(&entry.hash())
            .is_some_and(|e| Arc::ptr_eq(e, entry));
        if matches {
            inner.entries.remove(&entry.hash());
            if !entry.is_external() {
                inner.used_bytes -= entry.size();
            }
        }
    }

    /// Remove the entry for `hash`.
    ///
    /// Requires no references and an uncontended write lock. Without
    /// `force`, entries hot enough to survive the sweep are kept.
    pub fn remove(&self, hash: u64, force: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get(&hash)
            .cloned()
            .ok_or(Error::EntryMissing { hash })?;
        if entry.ref_count() != 0 {
            return Err(Error::EntryLocked { hash });
        }
        if !force && entry.hits() >= self.config.min_hits_to_keep {
            return Ok(());
        }
        let Some(guard) = entry.try_write() else {
            return Err(Error::EntryLocked { hash });
        };
        inner.entries.remove(&hash);
        if !entry.is_external() {
            inner.used_bytes -= entry.size();
        }
        drop(guard);
        Ok(())
    }

    /// Drop every droppable entry, optionally restricted to one pipeline.
    ///
    /// Referenced or write-contended entries survive. Returns the number
    /// of entries removed.
    pub fn flush(&self, pipe_id: Option<u64>) -> usize {
        let mut inner = self.inner.lock();
        let hashes: Vec<u64> = inner
            .entries
            .iter()
            .filter(|(_, e)| pipe_id.is_none_or(|id| e.pipe_id() == id))
            .map(|(h, _)| *h)
            .collect();
        let mut removed = 0;
        for hash in hashes {
            let Some(entry) = inner.entries.get(&hash).cloned() else {
                continue;
            };
            if entry.ref_count() != 0 {
                continue;
            }
            let Some(guard) = entry.try_write() else {
                continue;
            };
            inner.entries.remove(&hash);
            if !entry.is_external() {
                inner.used_bytes -= entry.size();
            }
            drop(guard);
            removed += 1;
        }
        debug!(?pipe_id, removed, "flushed cache entries");
        removed
    }

    /// Drop every cached device companion on `devid`, store-wide.
    ///
    /// Called by the bridge when a device allocation fails, before the
    /// retry.
    pub fn flush_companions(&self, devid: usize) -> usize {
        let inner = self.inner.lock();
        let mut dropped = 0;
        for entry in inner.entries.values() {
            dropped += entry.companions_flush_device(devid);
        }
        if dropped > 0 {
            debug!(devid, dropped, "flushed device companion buffers");
        }
        dropped
    }

    /// One TTL sweep cycle.
    ///
    /// Skips the cycle entirely when the store mutex is contended; the
    /// sweep is housekeeping and must never delay evaluation.
    pub fn sweep(&self) -> usize {
        let Some(mut inner) = self.inner.try_lock() else {
            trace!("sweep skipped, store busy");
            return 0;
        };
        let ttl = self.config.entry_ttl;
        let min_hits = self.config.min_hits_to_keep;
        let hashes: Vec<u64> = inner
            .entries
            .iter()
            .filter(|(_, e)| {
                e.elapsed() >= ttl && e.hits() < min_hits && e.ref_count() == 0
            })
            .map(|(h, _)| *h)
            .collect();
        let mut removed = 0;
        for hash in hashes {
            let Some(entry) = inner.entries.get(&hash).cloned() else {
                continue;
            };
            if entry.ref_count() != 0 {
                continue;
            }
            let Some(guard) = entry.try_write() else {
                continue;
            };
            inner.entries.remove(&hash);
            if !entry.is_external() {
                inner.used_bytes -= entry.size();
            }
            drop(guard);
            removed += 1;
        }
        if removed > 0 {
            self.swept.fetch_add(removed as u64, Ordering::Relaxed);
            observability::record_cache_swept(removed);
            debug!(removed, "ttl sweep removed cold entries");
        }
        removed
    }

    /// Spawn the background sweep thread.
    ///
    /// The thread holds a weak reference and exits when the store is gone
    /// or the handle is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Result<SweeperHandle> {
        let (stop_tx, stop_rx) = kanal::bounded::<()>(1);
        let weak = Arc::downgrade(self);
        let interval = self.config.sweep_interval;
        let join = std::thread::Builder::new()
            .name("rasterflow-sweep".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(kanal::ReceiveErrorTimeout::Timeout) => {}
                        _ => break,
                    }
                    let Some(store) = weak.upgrade() else { break };
                    store.sweep();
                }
            })?;
        Ok(SweeperHandle {
            stop: stop_tx,
            join: Some(join),
        })
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            used_bytes: inner.used_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }

    /// Log the hit rate and publish occupancy gauges. Called by the driver
    /// when a pipeline run completes.
    pub fn report(&self) {
        let stats = self.stats();
        let arena = self.arena.stats();
        observability::record_cache_occupancy(&stats, &arena);
        info!(
            entries = stats.entries,
            used_bytes = stats.used_bytes,
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            hit_rate = format_args!("{:.1}%", stats.hit_rate() * 100.0),
            "pixel cache"
        );
    }
}

/// Handle owning the background sweep thread.
///
/// Dropping it stops and joins the thread.
pub struct SweeperHandle {
    stop: kanal::Sender<()>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::Colorspace;
    use crate::memory::PAGE_SIZE;

    fn small_config(pages: usize) -> CacheConfig {
        CacheConfig {
            arena_pages: pages,
            max_bytes: pages * PAGE_SIZE,
            sweep_interval: Duration::from_secs(300),
            entry_ttl: Duration::from_secs(180),
            min_hits_to_keep: 4,
        }
    }

    fn page_desc() -> BufferDescriptor {
        // Exactly one 64KB page.
        BufferDescriptor {
            width: 128,
            height: 128,
            bpp: 4,
            cst: Colorspace::Rgb,
        }
    }

    #[test]
    fn test_create_then_hit() {
        let store = CacheStore::new(small_config(8)).unwrap();
        let mut lease = store.get_or_create(0x1, page_desc(), 1).unwrap();
        assert!(lease.created());
        lease.as_mut_slice()[0] = 9;
        lease.publish();
        drop(lease);

        let lease = store.get_or_create(0x1, page_desc(), 1).unwrap();
        assert!(!lease.created());
        assert_eq!(lease.as_slice()[0], 9);

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_single_creator_under_race() {
        let store = CacheStore::new(small_config(8)).unwrap();
        let created = std::sync::atomic::AtomicU32::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let mut lease = store.get_or_create(0x42, page_desc(), 1).unwrap();
                    if lease.created() {
                        created.fetch_add(1, Ordering::SeqCst);
                        lease.as_mut_slice().fill(7);
                        lease.publish();
                    }
                    // Readers must observe the fully populated buffer.
                    assert!(lease.as_slice().iter().all(|&b| b == 7));
                });
            }
        });

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats().entries, 1);
    }

    #[test]
    fn test_eviction_prefers_oldest_unreferenced() {
        let store = CacheStore::new(small_config(2)).unwrap();
        // Entry 1 stays referenced via its lease; entry 2 is dropped.
        let mut held = store.get_or_create(0x1, page_desc(), 1).unwrap();
        held.publish();
        let mut l2 = store.get_or_create(0x2, page_desc(), 1).unwrap();
        l2.publish();
        drop(l2);

        // Arena is full; creating a third entry must evict entry 2, not the
        // referenced entry 1.
        let l3 = store.get_or_create(0x3, page_desc(), 1).unwrap();
        assert!(l3.created());
        assert!(store.contains(0x1));
        assert!(!store.contains(0x2));
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_cache_full_when_everything_referenced() {
        let store = CacheStore::new(small_config(2)).unwrap();
        let _a = store.get_or_create(0x1, page_desc(), 1).unwrap();
        let _b = store.get_or_create(0x2, page_desc(), 1).unwrap();
        match store.get_or_create(0x3, page_desc(), 1) {
            Err(Error::CacheFull { requested }) => assert_eq!(requested, PAGE_SIZE),
            other => panic!("expected CacheFull, got {other:?}"),
        }
    }

    #[test]
    fn test_try_get_reports_contention() {
        let store = CacheStore::new(small_config(4)).unwrap();
        let writer = store.get_or_create(0x1, page_desc(), 1).unwrap();
        assert!(writer.is_writable());
        match store.try_get(0x1) {
            Err(Error::EntryLocked { hash }) => assert_eq!(hash, 0x1),
            other => panic!("expected EntryLocked, got {other:?}"),
        }
        match store.try_get(0x9) {
            Err(Error::EntryMissing { .. }) => {}
            other => panic!("expected EntryMissing, got {other:?}"),
        }
    }

    #[test]
    fn test_sweep_predicate() {
        let mut config = small_config(8);
        config.entry_ttl = Duration::ZERO;
        let store = CacheStore::new(config).unwrap();

        // Cold entry: swept.
        let mut cold = store.get_or_create(0x1, page_desc(), 1).unwrap();
        cold.publish();
        drop(cold);

        // Hot entry: enough hits to survive.
        let mut hot = store.get_or_create(0x2, page_desc(), 1).unwrap();
        hot.publish();
        drop(hot);
        for _ in 0..4 {
            drop(store.get(0x2).unwrap());
        }

        // Referenced entry: survives regardless.
        let mut held = store.get_or_create(0x3, page_desc(), 1).unwrap();
        held.publish();

        let removed = store.sweep();
        assert_eq!(removed, 1);
        assert!(!store.contains(0x1));
        assert!(store.contains(0x2));
        assert!(store.contains(0x3));
    }

    #[test]
    fn test_flush_by_pipeline() {
        let store = CacheStore::new(small_config(8)).unwrap();
        for (hash, pipe) in [(0x1u64, 1u64), (0x2, 1), (0x3, 2)] {
            let mut l = store.get_or_create(hash, page_desc(), pipe).unwrap();
            l.publish();
            drop(l);
        }
        assert_eq!(store.flush(Some(1)), 2);
        assert!(!store.contains(0x1));
        assert!(store.contains(0x3));
        assert_eq!(store.flush(None), 1);
        assert_eq!(store.stats().entries, 0);
    }

    #[test]
    fn test_scratch_auto_destroy() {
        let store = CacheStore::new(small_config(4)).unwrap();
        let mut scratch = store.scratch_alloc(page_desc(), 1).unwrap();
        let hash = scratch.hash();
        assert!(scratch.entry().is_external());
        scratch.as_mut_slice().fill(1);
        scratch.publish();
        assert!(store.contains(hash));
        drop(scratch);
        assert!(!store.contains(hash));
        // Scratch memory never came from the arena.
        assert_eq!(store.stats().used_bytes, 0);
    }

    #[test]
    fn test_discard_removes_partial_entry() {
        let store = CacheStore::new(small_config(4)).unwrap();
        let lease = store.get_or_create(0x1, page_desc(), 1).unwrap();
        assert!(lease.created());
        lease.discard();
        assert!(!store.contains(0x1));
        // The arena pages came back.
        assert_eq!(store.arena().stats().free_pages, 4);
    }

    #[test]
    fn test_blocked_reader_never_sees_discarded_entry() {
        let store = CacheStore::new(small_config(4)).unwrap();
        let creator = store.get_or_create(0xbad, page_desc(), 1).unwrap();
        assert!(creator.created());

        std::thread::scope(|s| {
            let reader = s.spawn(|| store.get(0xbad));
            // Give the reader time to block on the creator's write lock.
            std::thread::sleep(Duration::from_millis(20));
            creator.discard();
            // The reader must come back empty, not with a lease on the
            // half-filled buffer.
            assert!(reader.join().unwrap().is_none());
        });
        assert!(!store.contains(0xbad));
    }

    #[test]
    fn test_unpublished_lease_drop_acts_as_discard() {
        let store = CacheStore::new(small_config(4)).unwrap();
        let lease = store.get_or_create(0x1, page_desc(), 1).unwrap();
        assert!(lease.created());
        drop(lease);
        assert!(!store.contains(0x1));
        assert_eq!(store.arena().stats().free_pages, 4);
    }

    #[test]
    fn test_remove_force_ignores_hits() {
        let store = CacheStore::new(small_config(4)).unwrap();
        let mut l = store.get_or_create(0x1, page_desc(), 1).unwrap();
        l.publish();
        drop(l);
        for _ in 0..5 {
            drop(store.get(0x1).unwrap());
        }
        // Hot entry survives a plain remove but not a forced one.
        store.remove(0x1, false).unwrap();
        assert!(store.contains(0x1));
        store.remove(0x1, true).unwrap();
        assert!(!store.contains(0x1));
    }

    #[test]
    fn test_sweeper_thread_runs() {
        let mut config = small_config(4);
        config.entry_ttl = Duration::ZERO;
        config.sweep_interval = Duration::from_millis(10);
        let store = CacheStore::new(config).unwrap();
        let sweeper = store.spawn_sweeper().unwrap();

        let mut l = store.get_or_create(0x1, page_desc(), 1).unwrap();
        l.publish();
        drop(l);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while store.contains(0x1) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!store.contains(0x1));
        drop(sweeper);
    }
}
