//! Page-granular arena allocation for pixel buffers.
//!
//! This module provides `PageArena`, which allocates one large memfd region
//! and hands out runs of fixed-size pages. Pixel buffers are large and
//! short-lived; carving them out of a single mapping avoids both allocator
//! churn and fd exhaustion (one fd per arena, not per buffer).
//!
//! # Design Rationale
//!
//! Cache buffers vary in size (full-resolution floats down to thumbnail
//! previews), so a slot pool with one fixed slot size wastes memory. The
//! arena instead tracks free space as a sorted list of page runs:
//!
//! - `alloc` does a best-fit scan and consumes the winning run from its
//!   front, so the list stays sorted without re-sorting.
//! - `free` re-inserts the run in sorted position and coalesces with both
//!   neighbors, keeping fragmentation bounded.
//! - a free whose range overlaps an existing free run is a double free;
//!   it is logged and ignored rather than corrupting the list.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────┬────────┬────────┬────────┬────────┐
//! │ page 0 │ page 1 │ page 2 │  ...   │ page N │
//! └────────┴────────┴────────┴────────┴────────┘
//! ^                                            ^
//! base                         base + total_size
//! ```
//!
//! Allocations are whole page runs starting at `base + start * PAGE_SIZE`.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, error};

/// Size of one arena page in bytes.
pub const PAGE_SIZE: usize = 64 * 1024;

/// A contiguous run of free pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRun {
    /// First page of the run.
    start: usize,
    /// Number of pages in the run.
    len: usize,
}

impl FreeRun {
    #[inline]
    fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Snapshot of arena occupancy, used for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Total pages in the region.
    pub total_pages: usize,
    /// Pages currently free.
    pub free_pages: usize,
    /// Number of free runs (fragmentation indicator).
    pub runs: usize,
    /// Largest contiguous free run in pages.
    pub largest_run: usize,
}

/// Fixed-size page arena backing the pixel cache.
///
/// One memfd, one mapping, one mutex around the free-run list. Buffer
/// pointers handed out by [`PageArena::alloc`] stay valid until the matching
/// [`PageArena::free`]; the arena itself must outlive them, which the cache
/// store guarantees by holding the `Arc`.
pub struct PageArena {
    /// The memfd file descriptor (one fd for the entire arena).
    _fd: OwnedFd,
    /// Base pointer to the mmap'd region.
    base: NonNull<u8>,
    /// Total size of the region in bytes.
    total_size: usize,
    /// Total number of pages.
    total_pages: usize,
    /// Sorted, coalesced list of free runs.
    free: Mutex<Vec<FreeRun>>,
}

/// Round a byte size up to whole pages.
#[inline]
pub fn pages_for(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

impl PageArena {
    /// Create a new arena covering `total_pages` pages.
    pub fn new(total_pages: usize) -> Result<Arc<Self>> {
        Self::with_name("rasterflow-arena", total_pages)
    }

    /// Create a new arena with a debug name.
    pub fn with_name(name: &str, total_pages: usize) -> Result<Arc<Self>> {
        if total_pages == 0 {
            return Err(Error::AllocationFailed("total_pages must be > 0".into()));
        }

        let total_size = total_pages
            .checked_mul(PAGE_SIZE)
            .ok_or_else(|| Error::AllocationFailed("arena size overflow".into()))?;

        let cname = CString::new(name).map_err(|e| Error::AllocationFailed(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, total_size as u64)?;

        let base = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                total_size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };

        let base = NonNull::new(base.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        debug!(name, total_pages, total_size, "created page arena");

        Ok(Arc::new(Self {
            _fd: fd,
            base,
            total_size,
            total_pages,
            // One run covering the whole region.
            free: Mutex::new(vec![FreeRun {
                start: 0,
                len: total_pages,
            }]),
        }))
    }

    /// Allocate a buffer of at least `size` bytes, rounded up to whole pages.
    ///
    /// Best-fit: the smallest free run that fits wins, an exact fit ends the
    /// scan early. The winning run is consumed from its front so the free
    /// list stays sorted. Returns [`Error::ArenaExhausted`] when no run
    /// fits; the cache store reacts by evicting and retrying.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::AllocationFailed("zero-sized arena alloc".into()));
        }
        let pages = pages_for(size);

        let mut free = self.free.lock();

        let mut best: Option<usize> = None;
        for (i, run) in free.iter().enumerate() {
            if run.len < pages {
                continue;
            }
            if run.len == pages {
                best = Some(i);
                break;
            }
            match best {
                Some(b) if free[b].len <= run.len => {}
                _ => best = Some(i),
            }
        }

        let Some(i) = best else {
            let largest_run = free.iter().map(|r| r.len).max().unwrap_or(0);
            return Err(Error::ArenaExhausted {
                requested_pages: pages,
                largest_run,
            });
        };

        let start = free[i].start;
        free[i].start += pages;
        free[i].len -= pages;
        if free[i].len == 0 {
            free.remove(i);
        }

        // SAFETY: start + pages <= total_pages, so the pointer is inside the
        // mapping and the run it heads does not overlap any other live run.
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start * PAGE_SIZE)) })
    }

    /// Return a buffer previously handed out by [`PageArena::alloc`].
    ///
    /// `size` must be the size passed to `alloc`. A pointer outside the
    /// region, or a range overlapping an already-free run, is logged at
    /// error level and otherwise ignored.
    pub fn free(&self, ptr: NonNull<u8>, size: usize) {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        if addr < base || addr >= base + self.total_size {
            error!(addr, "arena free of pointer outside the region, ignored");
            return;
        }
        let byte_off = addr - base;
        if byte_off % PAGE_SIZE != 0 {
            error!(byte_off, "arena free of unaligned pointer, ignored");
            return;
        }
        let start = byte_off / PAGE_SIZE;
        let pages = pages_for(size);
        if start + pages > self.total_pages {
            error!(start, pages, "arena free past end of region, ignored");
            return;
        }

        let mut free = self.free.lock();

        // Insert position by start page.
        let pos = free.partition_point(|r| r.start < start);

        // Overlap with either neighbor means this range (or part of it) is
        // already free. Treat as a double free: log and bail.
        if pos > 0 && free[pos - 1].end() > start {
            error!(start, pages, "double free detected in arena, ignored");
            return;
        }
        if pos < free.len() && start + pages > free[pos].start {
            error!(start, pages, "double free detected in arena, ignored");
            return;
        }

        // Coalesce with the previous run, then with the next.
        if pos > 0 && free[pos - 1].end() == start {
            free[pos - 1].len += pages;
            if pos < free.len() && free[pos - 1].end() == free[pos].start {
                free[pos - 1].len += free[pos].len;
                free.remove(pos);
            }
        } else if pos < free.len() && start + pages == free[pos].start {
            free[pos].start = start;
            free[pos].len += pages;
        } else {
            free.insert(pos, FreeRun { start, len: pages });
        }
    }

    /// Whether `ptr` points inside the arena region.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.total_size
    }

    /// Total number of pages.
    #[inline]
    pub fn total_pages(&self) -> usize {
        self.total_pages
    }

    /// Total region size in bytes.
    #[inline]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Bytes currently free.
    pub fn free_bytes(&self) -> usize {
        let free = self.free.lock();
        free.iter().map(|r| r.len).sum::<usize>() * PAGE_SIZE
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> ArenaStats {
        let free = self.free.lock();
        let free_pages = free.iter().map(|r| r.len).sum();
        let largest_run = free.iter().map(|r| r.len).max().unwrap_or(0);
        ArenaStats {
            total_pages: self.total_pages,
            free_pages,
            runs: free.len(),
            largest_run,
        }
    }
}

impl Drop for PageArena {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.total_size);
        }
    }
}

// SAFETY: PageArena is Send + Sync because:
// - The free-run list is behind a mutex
// - The fd is kernel-reference-counted
// - Handed-out page runs never overlap, so concurrent writers touch
//   disjoint memory
unsafe impl Send for PageArena {}
unsafe impl Sync for PageArena {}

impl std::fmt::Debug for PageArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("PageArena")
            .field("total_pages", &stats.total_pages)
            .field("free_pages", &stats.free_pages)
            .field("runs", &stats.runs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_rounds_to_pages() {
        let arena = PageArena::new(8).unwrap();
        let p = arena.alloc(1).unwrap();
        assert_eq!(arena.stats().free_pages, 7);
        arena.free(p, 1);
        assert_eq!(arena.stats().free_pages, 8);
    }

    #[test]
    fn test_single_run_after_init() {
        let arena = PageArena::new(16).unwrap();
        let stats = arena.stats();
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.largest_run, 16);
    }

    #[test]
    fn test_free_coalesces_both_neighbors() {
        let arena = PageArena::new(8).unwrap();
        let a = arena.alloc(PAGE_SIZE).unwrap();
        let b = arena.alloc(PAGE_SIZE).unwrap();
        let c = arena.alloc(PAGE_SIZE).unwrap();

        // Free the outer two, then the middle: all three must fuse with the
        // tail run into one.
        arena.free(a, PAGE_SIZE);
        arena.free(c, PAGE_SIZE);
        assert_eq!(arena.stats().runs, 2);
        arena.free(b, PAGE_SIZE);
        let stats = arena.stats();
        assert_eq!(stats.runs, 1);
        assert_eq!(stats.free_pages, 8);
    }

    #[test]
    fn test_best_fit_prefers_smallest_run() {
        let arena = PageArena::new(16).unwrap();
        // Carve [a:2][b:1][c:4][rest:9], then free a and c leaving holes of
        // 2 and 4 pages around b.
        let a = arena.alloc(2 * PAGE_SIZE).unwrap();
        let b = arena.alloc(PAGE_SIZE).unwrap();
        let c = arena.alloc(4 * PAGE_SIZE).unwrap();
        arena.free(a, 2 * PAGE_SIZE);
        arena.free(c, 4 * PAGE_SIZE);

        // A 2-page request must land in the 2-page hole, not the 4-page one.
        let d = arena.alloc(2 * PAGE_SIZE).unwrap();
        assert_eq!(d, a);

        arena.free(d, 2 * PAGE_SIZE);
        arena.free(b, PAGE_SIZE);
    }

    #[test]
    fn test_exhaustion_reports_largest_run() {
        let arena = PageArena::new(4).unwrap();
        let _a = arena.alloc(3 * PAGE_SIZE).unwrap();
        match arena.alloc(2 * PAGE_SIZE) {
            Err(Error::ArenaExhausted {
                requested_pages,
                largest_run,
            }) => {
                assert_eq!(requested_pages, 2);
                assert_eq!(largest_run, 1);
            }
            other => panic!("expected ArenaExhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_double_free_is_ignored() {
        let arena = PageArena::new(4).unwrap();
        let a = arena.alloc(PAGE_SIZE).unwrap();
        arena.free(a, PAGE_SIZE);
        let before = arena.stats();
        arena.free(a, PAGE_SIZE);
        assert_eq!(arena.stats(), before);
    }

    #[test]
    fn test_foreign_pointer_free_is_ignored() {
        let arena = PageArena::new(4).unwrap();
        let mut local = [0u8; 16];
        let ptr = NonNull::new(local.as_mut_ptr()).unwrap();
        assert!(!arena.contains(ptr));
        let before = arena.stats();
        arena.free(ptr, PAGE_SIZE);
        assert_eq!(arena.stats(), before);
    }

    #[test]
    fn test_contains() {
        let arena = PageArena::new(4).unwrap();
        let a = arena.alloc(PAGE_SIZE).unwrap();
        assert!(arena.contains(a));
        arena.free(a, PAGE_SIZE);
    }

    #[test]
    fn test_allocations_are_writable_and_disjoint() {
        let arena = PageArena::new(4).unwrap();
        let a = arena.alloc(PAGE_SIZE).unwrap();
        let b = arena.alloc(PAGE_SIZE).unwrap();
        unsafe {
            std::ptr::write_bytes(a.as_ptr(), 0xAA, PAGE_SIZE);
            std::ptr::write_bytes(b.as_ptr(), 0xBB, PAGE_SIZE);
            assert_eq!(*a.as_ptr(), 0xAA);
            assert_eq!(*b.as_ptr(), 0xBB);
        }
        arena.free(a, PAGE_SIZE);
        arena.free(b, PAGE_SIZE);
    }

    #[test]
    fn test_fragmentation_then_full_recovery() {
        let arena = PageArena::new(32).unwrap();
        let mut held = Vec::new();
        for _ in 0..32 {
            held.push(arena.alloc(PAGE_SIZE).unwrap());
        }
        assert!(arena.alloc(PAGE_SIZE).is_err());

        // Free every other page, then reallocate into the holes.
        for (i, p) in held.iter().enumerate() {
            if i % 2 == 0 {
                arena.free(*p, PAGE_SIZE);
            }
        }
        assert_eq!(arena.stats().runs, 16);
        for _ in 0..16 {
            arena.alloc(PAGE_SIZE).unwrap();
        }
        assert!(arena.alloc(PAGE_SIZE).is_err());
    }
}
