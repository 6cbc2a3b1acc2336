//! Cache entry: one hashed pixel buffer plus its bookkeeping.
//!
//! Entries are shared as `Arc<CacheEntry>`. The pixel data itself is either
//! a run of arena pages or, for scratch buffers, a heap allocation owned by
//! the entry. Access is gated by a per-entry read/write lock handed out as
//! owned (`Arc`-backed) guards so they can outlive the store mutex scope.

use crate::error::{Error, Result};
use crate::gpu::DeviceBuffer;
use crate::memory::PageArena;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use smallvec::SmallVec;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// Owned read guard on a cache entry's buffer.
pub type EntryReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;
/// Owned write guard on a cache entry's buffer.
pub type EntryWriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

/// Colorspace tag carried by a buffer descriptor.
///
/// The evaluator does no color management; the tag exists so device
/// kernels that convert in place can record what the buffer now holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Colorspace {
    /// Unknown or not applicable.
    #[default]
    None,
    /// Camera raw data.
    Raw,
    /// RGB, any encoding.
    Rgb,
    /// CIE Lab.
    Lab,
    /// Single-channel mask.
    Mask,
}

/// Shape of a pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per pixel.
    pub bpp: u32,
    /// Colorspace tag.
    pub cst: Colorspace,
}

impl BufferDescriptor {
    /// Buffer size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.width as usize * self.height as usize * self.bpp as usize
    }
}

/// Where an entry's backing memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Backing {
    /// Run of pages inside the shared arena.
    Arena,
    /// Heap allocation owned by the entry (scratch buffers).
    External,
}

/// A device companion buffer cached on an entry for reuse.
///
/// Keyed the way the device sees it: same host pointer, device, geometry,
/// element size and flags mean the device object can be reused as is.
#[derive(Debug)]
pub struct Companion {
    /// Host pointer the device buffer is backed by.
    pub host_addr: usize,
    /// Device index.
    pub devid: usize,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per pixel.
    pub bpp: u32,
    /// Allocation flags the buffer was created with.
    pub host_backed: bool,
    /// Colorspace the device-side contents are in.
    pub cst: Colorspace,
    /// The device buffer itself.
    pub buf: DeviceBuffer,
}

/// One cached pixel buffer.
pub struct CacheEntry {
    /// Content hash identifying this buffer.
    hash: u64,
    /// Pixel data. Valid for `size` bytes; guarded by `lock`.
    data: NonNull<u8>,
    /// Buffer size in bytes.
    size: usize,
    /// Shape of the buffer. The colorspace tag can change after in-place
    /// device conversions, hence the mutex.
    descriptor: Mutex<BufferDescriptor>,
    /// Backing memory kind.
    backing: Backing,
    /// Arena the data lives in when `backing == Arena`.
    arena: Option<Arc<PageArena>>,
    /// LRU age: store-wide monotonic sequence, refreshed on every hit.
    age: AtomicU64,
    /// Wall-clock creation time, for the TTL sweep.
    created: Instant,
    /// Number of cache hits on this entry.
    hits: AtomicU32,
    /// Pipeline that created the entry.
    pipe_id: u64,
    /// Reference count; entries with references are never evicted.
    refs: AtomicI32,
    /// Remove the entry as soon as the last reference drops.
    auto_destroy: AtomicBool,
    /// Set once the creator publishes the filled buffer. Readers that
    /// waited out the creator's write lock must re-check this: a discarded
    /// entry never becomes readable.
    published: AtomicBool,
    /// Buffer lock. Shared so guards can be owned (`read_arc`).
    lock: Arc<RwLock<()>>,
    /// Cached device companions for this buffer.
    companions: Mutex<SmallVec<[Companion; 2]>>,
}

impl CacheEntry {
    pub(crate) fn new_arena(
        hash: u64,
        data: NonNull<u8>,
        size: usize,
        descriptor: BufferDescriptor,
        pipe_id: u64,
        age: u64,
        arena: Arc<PageArena>,
    ) -> Self {
        Self {
            hash,
            data,
            size,
            descriptor: Mutex::new(descriptor),
            backing: Backing::Arena,
            arena: Some(arena),
            age: AtomicU64::new(age),
            created: Instant::now(),
            hits: AtomicU32::new(0),
            pipe_id,
            refs: AtomicI32::new(0),
            auto_destroy: AtomicBool::new(false),
            published: AtomicBool::new(false),
            lock: Arc::new(RwLock::new(())),
            companions: Mutex::new(SmallVec::new()),
        }
    }

    pub(crate) fn new_external(
        hash: u64,
        descriptor: BufferDescriptor,
        pipe_id: u64,
        age: u64,
    ) -> Result<Self> {
        let size = descriptor.size();
        if size == 0 {
            return Err(Error::AllocationFailed("zero-sized scratch buffer".into()));
        }
        let boxed: Box<[u8]> = vec![0u8; size].into_boxed_slice();
        let data = NonNull::new(Box::into_raw(boxed).cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("scratch allocation failed".into()))?;
        Ok(Self {
            hash,
            data,
            size,
            descriptor: Mutex::new(descriptor),
            backing: Backing::External,
            arena: None,
            age: AtomicU64::new(age),
            created: Instant::now(),
            hits: AtomicU32::new(0),
            pipe_id,
            refs: AtomicI32::new(0),
            auto_destroy: AtomicBool::new(true),
            published: AtomicBool::new(false),
            lock: Arc::new(RwLock::new(())),
            companions: Mutex::new(SmallVec::new()),
        })
    }

    /// Content hash of this entry.
    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Set the hash before the entry is shared. Scratch buffers are keyed
    /// by their own address, which is only known after allocation.
    pub(crate) fn set_hash(&mut self, hash: u64) {
        self.hash = hash;
    }

    /// Buffer size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Raw pointer to the pixel data.
    ///
    /// Only meaningful while holding one of the entry's lock guards.
    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.data
    }

    /// Current buffer descriptor.
    #[inline]
    pub fn descriptor(&self) -> BufferDescriptor {
        *self.descriptor.lock()
    }

    /// Update the colorspace tag after an in-place conversion.
    pub fn set_colorspace(&self, cst: Colorspace) {
        self.descriptor.lock().cst = cst;
    }

    /// Pipeline that created the entry.
    #[inline]
    pub fn pipe_id(&self) -> u64 {
        self.pipe_id
    }

    /// LRU age (store-wide sequence number).
    #[inline]
    pub fn age(&self) -> u64 {
        self.age.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, age: u64) {
        self.age.store(age, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of cache hits so far.
    #[inline]
    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Time since the entry was created.
    #[inline]
    pub fn elapsed(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    /// Current reference count.
    #[inline]
    pub fn ref_count(&self) -> i32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn add_ref(&self) -> i32 {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn drop_ref(&self) -> i32 {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "cache entry refcount underflow");
        prev - 1
    }

    /// Whether the entry dies on the last unref.
    #[inline]
    pub fn auto_destroy(&self) -> bool {
        self.auto_destroy.load(Ordering::Acquire)
    }

    /// Mark the entry for destruction on the last unref.
    pub fn set_auto_destroy(&self) {
        self.auto_destroy.store(true, Ordering::Release);
    }

    /// Whether the creator has published the buffer contents.
    #[inline]
    pub fn published(&self) -> bool {
        self.published.load(Ordering::Acquire)
    }

    pub(crate) fn mark_published(&self) {
        self.published.store(true, Ordering::Release);
    }

    /// Whether the backing memory is owned by the entry (scratch) rather
    /// than the arena.
    #[inline]
    pub fn is_external(&self) -> bool {
        self.backing == Backing::External
    }

    /// Take a read guard, blocking until the creator's write guard drops.
    pub fn read(&self) -> EntryReadGuard {
        self.lock.read_arc()
    }

    /// Take a read guard without blocking.
    pub fn try_read(&self) -> Option<EntryReadGuard> {
        self.lock.try_read_arc()
    }

    /// Take the write guard, blocking.
    pub fn write(&self) -> EntryWriteGuard {
        self.lock.write_arc()
    }

    /// Take the write guard without blocking.
    pub fn try_write(&self) -> Option<EntryWriteGuard> {
        self.lock.try_write_arc()
    }

    /// View the pixel data.
    ///
    /// # Safety
    ///
    /// The caller must hold a read or write guard on this entry for the
    /// lifetime of the slice.
    #[inline]
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: data is valid for size bytes; the caller holds the lock.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.size) }
    }

    /// View the pixel data mutably.
    ///
    /// # Safety
    ///
    /// The caller must hold the write guard on this entry for the lifetime
    /// of the slice.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: data is valid for size bytes; the write guard is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.size) }
    }

    /// Look up a reusable device companion and take it out of the list.
    pub fn companion_take(
        &self,
        host_addr: usize,
        devid: usize,
        width: u32,
        height: u32,
        bpp: u32,
        host_backed: bool,
    ) -> Option<Companion> {
        let mut list = self.companions.lock();
        let idx = list.iter().position(|c| {
            c.host_addr == host_addr
                && c.devid == devid
                && c.width == width
                && c.height == height
                && c.bpp == bpp
                && c.host_backed == host_backed
        })?;
        Some(list.swap_remove(idx))
    }

    /// Store a device companion for later reuse.
    pub fn companion_put(&self, companion: Companion) {
        self.companions.lock().push(companion);
    }

    /// Drop every cached companion on the given device.
    pub fn companions_flush_device(&self, devid: usize) -> usize {
        let mut list = self.companions.lock();
        let before = list.len();
        list.retain(|c| c.devid != devid);
        before - list.len()
    }

    /// Number of cached companions.
    pub fn companion_count(&self) -> usize {
        self.companions.lock().len()
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        // Companions release their device memory via their own Drop.
        self.companions.get_mut().clear();
        match self.backing {
            Backing::Arena => {
                if let Some(arena) = &self.arena {
                    arena.free(self.data, self.size);
                }
            }
            Backing::External => {
                // SAFETY: data was produced by Box::into_raw of a boxed
                // slice of exactly `size` bytes and is freed exactly once.
                unsafe {
                    drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                        self.data.as_ptr(),
                        self.size,
                    )));
                }
            }
        }
    }
}

// SAFETY: CacheEntry is Send + Sync because:
// - The pixel pointer is only dereferenced under the entry rwlock
// - All counters are atomics; descriptor and companions sit behind mutexes
// - Arena-backed data is freed exactly once, in Drop
unsafe impl Send for CacheEntry {}
unsafe impl Sync for CacheEntry {}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("hash", &format_args!("{:#018x}", self.hash))
            .field("size", &self.size)
            .field("refs", &self.ref_count())
            .field("hits", &self.hits())
            .field("backing", &self.backing)
            .finish()
    }
}
