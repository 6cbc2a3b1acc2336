//! Cache entry ↔ device buffer plumbing.
//!
//! The evaluator is written as a CPU pipeline over host buffers; device
//! kernels run against device buffers prepared here. The goals are to
//! avoid copies where the driver allows it and to stay correct where it
//! does not:
//!
//! - Host-backed buffers may be **true zero-copy** (the device reads host
//!   memory directly) or a **staging copy** (legal, but host and device
//!   contents drift apart without explicit transfers). The two are told
//!   apart at runtime by mapping the buffer and comparing pointers.
//! - For true zero-copy input buffers the owning cache entry must stay
//!   read-locked until the device queue drains; the evaluator holds its
//!   input lease across the dispatch, which satisfies this.
//! - Device buffers backed by a cache entry's host pointer are cached on
//!   that entry for reuse (allocation and pinning are expensive). A device
//!   allocation failure flushes every cached companion on that device and
//!   retries once.

use crate::cache::{CacheEntry, CacheStore, Colorspace, Companion};
use crate::error::{Error, Result};
use crate::gpu::{Device, DeviceBuffer};
use crate::observability;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, trace};

/// Direction of a host/device synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Push host memory to the device.
    HostToDevice,
    /// Pull device memory to the host.
    DeviceToHost,
}

/// Determine whether a host-backed buffer is truly zero-copy.
///
/// Maps the buffer (blocking), compares the mapped pointer with the host
/// pointer, unmaps and drains the queue. Matching pointers mean the device
/// reads host memory directly; anything else, including map failure, is
/// treated as a staging copy.
pub fn is_zero_copy(device: &dyn Device, buf: &DeviceBuffer, host: NonNull<u8>) -> bool {
    if !buf.is_host_backed() {
        return false;
    }
    let Ok(mapped) = device.map(buf) else {
        return false;
    };
    let matches = mapped == host.as_ptr();
    if device.unmap(buf, mapped).is_err() {
        return false;
    }
    // Drain rather than wait on events: the unmap must be complete before
    // host memory is touched or the entry lock released.
    let _ = device.finish();
    matches
}

/// Obtain a device buffer for a cache entry's host pointer, or a
/// device-private buffer when `host` is `None`.
///
/// With `reuse` set and a host-backed request, a companion cached on the
/// entry is reused when its key (host pointer, device, geometry, element
/// size, flags) matches; the companion's colorspace tag is returned so the
/// caller knows what the device-side contents hold. Any allocation failure
/// flushes the store's cached companions on this device and retries once.
pub fn init_buffer(
    store: &CacheStore,
    device: &Arc<dyn Device>,
    entry: Option<&Arc<CacheEntry>>,
    host: Option<NonNull<u8>>,
    width: u32,
    height: u32,
    bpp: u32,
    reuse: bool,
) -> Result<(DeviceBuffer, Option<Colorspace>, bool)> {
    let devid = device.id();

    let take_companion = |entry: Option<&Arc<CacheEntry>>, host: Option<NonNull<u8>>| {
        let (entry, host) = (entry?, host?);
        entry.companion_take(host.as_ptr() as usize, devid, width, height, bpp, true)
    };

    if reuse {
        if let Some(c) = take_companion(entry, host) {
            trace!(devid, width, height, "reused device companion buffer");
            observability::record_companion_reuse(true);
            return Ok((c.buf, Some(c.cst), true));
        }
        observability::record_companion_reuse(false);
    }

    let alloc = |device: &Arc<dyn Device>| match host {
        Some(h) => device.alloc_host_backed(h, width, height, bpp),
        None => device.alloc(width, height, bpp),
    };

    match alloc(device) {
        Ok(buf) => Ok((buf, None, false)),
        Err(Error::DeviceOutOfMemory { .. }) => {
            // Stale cached companions are the usual culprit; drop them all
            // on this device and try once more.
            let dropped = store.flush_companions(devid);
            debug!(devid, dropped, "device allocation failed, flushed companions and retrying");
            if reuse {
                if let Some(c) = take_companion(entry, host) {
                    return Ok((c.buf, Some(c.cst), true));
                }
            }
            let buf = alloc(device)?;
            Ok((buf, None, false))
        }
        Err(e) => Err(e),
    }
}

/// Release or cache a device buffer.
///
/// Host-backed buffers paired with a cache entry go into that entry's
/// companion list for reuse, tagged with the colorspace the device-side
/// contents are in. Everything else is released immediately (the buffer's
/// drop frees the device memory).
pub fn clear_buffer(buf: DeviceBuffer, entry: Option<&Arc<CacheEntry>>, cst: Colorspace) {
    match (entry, buf.host_addr(), buf.is_host_backed()) {
        (Some(entry), Some(host_addr), true) => {
            entry.companion_put(Companion {
                host_addr,
                devid: buf.devid(),
                width: buf.width(),
                height: buf.height(),
                bpp: buf.bpp(),
                host_backed: true,
                cst,
                buf,
            });
        }
        _ => drop(buf),
    }
}

/// Synchronize between a host buffer and a host-backed device buffer.
///
/// Tries a map/unmap cycle first: on a true zero-copy buffer that is the
/// whole synchronization barrier and no bytes move. Otherwise falls back
/// to an explicit blocking transfer.
///
/// # Safety
///
/// `host` must be valid for `len` bytes and the caller must hold the
/// owning cache entry's lock matching `dir` (read for host-to-device,
/// write for device-to-host) for the duration of the call.
pub unsafe fn pinned_copy(
    device: &dyn Device,
    host: NonNull<u8>,
    len: usize,
    buf: &DeviceBuffer,
    dir: SyncDirection,
) -> Result<()> {
    if buf.is_host_backed() {
        if let Ok(mapped) = device.map(buf) {
            let matched = mapped == host.as_ptr();
            device.unmap(buf, mapped)?;
            device.finish()?;
            if matched {
                trace!(?dir, "synced via map/unmap (zero-copy)");
                return Ok(());
            }
        }
    }

    match dir {
        SyncDirection::HostToDevice => {
            // SAFETY: host is valid for len bytes per the caller contract.
            let src = unsafe { std::slice::from_raw_parts(host.as_ptr(), len) };
            device.write_host_to_device(src, buf)
        }
        SyncDirection::DeviceToHost => {
            // SAFETY: host is valid for len bytes and exclusively held per
            // the caller contract.
            let dst = unsafe { std::slice::from_raw_parts_mut(host.as_ptr(), len) };
            device.read_device_to_host(buf, dst)
        }
    }
}

/// Force a device → host resynchronization of a cache entry.
///
/// Used before handing a buffer whose current contents live device-side to
/// CPU code: write-locks the entry, pulls the pixels, updates the
/// colorspace tag and drains the queue before unlocking.
///
/// The caller must not hold any guard on `entry`.
pub fn resync_to_host(
    device: &dyn Device,
    entry: &Arc<CacheEntry>,
    buf: &DeviceBuffer,
    cst: Colorspace,
) -> Result<()> {
    let guard = entry.write();
    // SAFETY: entry data is valid for entry.size() bytes and the write
    // guard is held across the copy.
    unsafe {
        pinned_copy(
            device,
            entry.ptr(),
            entry.size(),
            buf,
            SyncDirection::DeviceToHost,
        )?;
    }
    entry.set_colorspace(cst);
    device.finish()?;
    drop(guard);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{BufferDescriptor, CacheConfig, CacheStore};
    use crate::gpu::MockDevice;

    fn desc() -> BufferDescriptor {
        BufferDescriptor {
            width: 8,
            height: 8,
            bpp: 4,
            cst: Colorspace::Rgb,
        }
    }

    fn store() -> Arc<CacheStore> {
        CacheStore::new(CacheConfig {
            arena_pages: 8,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_zero_copy_detection() {
        let zc: Arc<dyn Device> = MockDevice::new(0, 1 << 20, true);
        let staging: Arc<dyn Device> = MockDevice::new(1, 1 << 20, false);
        let mut host = vec![0u8; 256];
        let ptr = NonNull::new(host.as_mut_ptr()).unwrap();

        let buf = zc.alloc_host_backed(ptr, 8, 8, 4).unwrap();
        assert!(is_zero_copy(zc.as_ref(), &buf, ptr));

        let buf = staging.alloc_host_backed(ptr, 8, 8, 4).unwrap();
        assert!(!is_zero_copy(staging.as_ref(), &buf, ptr));

        let private = staging.alloc(8, 8, 4).unwrap();
        assert!(!is_zero_copy(staging.as_ref(), &private, ptr));
    }

    #[test]
    fn test_companion_reuse_roundtrip() {
        let store = store();
        let device: Arc<dyn Device> = MockDevice::new(0, 1 << 20, false);
        let mut lease = store.get_or_create(0x1, desc(), 1).unwrap();
        lease.publish();
        let entry = Arc::clone(lease.entry());
        let host = entry.ptr();

        let (buf, cst, reused) =
            init_buffer(&store, &device, Some(&entry), Some(host), 8, 8, 4, true).unwrap();
        assert!(!reused);
        assert!(cst.is_none());

        clear_buffer(buf, Some(&entry), Colorspace::Lab);
        assert_eq!(entry.companion_count(), 1);

        let (_buf, cst, reused) =
            init_buffer(&store, &device, Some(&entry), Some(host), 8, 8, 4, true).unwrap();
        assert!(reused);
        assert_eq!(cst, Some(Colorspace::Lab));
        assert_eq!(entry.companion_count(), 0);
    }

    #[test]
    fn test_companion_key_mismatch_is_a_miss() {
        let store = store();
        let device: Arc<dyn Device> = MockDevice::new(0, 1 << 20, false);
        let mut lease = store.get_or_create(0x1, desc(), 1).unwrap();
        lease.publish();
        let entry = Arc::clone(lease.entry());
        let host = entry.ptr();

        let (buf, _, _) =
            init_buffer(&store, &device, Some(&entry), Some(host), 8, 8, 4, true).unwrap();
        clear_buffer(buf, Some(&entry), Colorspace::Rgb);

        // Different geometry must not reuse the cached companion.
        let (_buf, _, reused) =
            init_buffer(&store, &device, Some(&entry), Some(host), 4, 4, 4, true).unwrap();
        assert!(!reused);
        assert_eq!(entry.companion_count(), 1);
    }

    #[test]
    fn test_oom_flushes_companions_and_retries() {
        let store = store();
        // Budget fits exactly one 256-byte buffer.
        let device: Arc<dyn Device> = MockDevice::new(0, 256, false);
        let mut lease = store.get_or_create(0x1, desc(), 1).unwrap();
        lease.publish();
        let entry = Arc::clone(lease.entry());
        let host = entry.ptr();

        // Fill the device with a cached companion.
        let (buf, _, _) =
            init_buffer(&store, &device, Some(&entry), Some(host), 8, 8, 4, true).unwrap();
        clear_buffer(buf, Some(&entry), Colorspace::Rgb);
        assert_eq!(device.available_memory(), 0);

        // A fresh allocation only succeeds because the flush drops the
        // cached companion.
        let mut lease2 = store.get_or_create(0x2, desc(), 1).unwrap();
        lease2.publish();
        let entry2 = Arc::clone(lease2.entry());
        let (buf2, _, reused) = init_buffer(
            &store,
            &device,
            Some(&entry2),
            Some(entry2.ptr()),
            8,
            8,
            4,
            true,
        )
        .unwrap();
        assert!(!reused);
        assert_eq!(entry.companion_count(), 0);
        drop(buf2);
    }

    #[test]
    fn test_pinned_copy_staging_roundtrip() {
        let device: Arc<dyn Device> = MockDevice::new(0, 1 << 20, false);
        let mut host = vec![5u8; 256];
        let ptr = NonNull::new(host.as_mut_ptr()).unwrap();
        let buf = device.alloc_host_backed(ptr, 8, 8, 4).unwrap();

        // SAFETY: host outlives both calls and nothing else references it.
        unsafe {
            pinned_copy(device.as_ref(), ptr, 256, &buf, SyncDirection::HostToDevice).unwrap();
        }
        host.fill(0);
        unsafe {
            pinned_copy(device.as_ref(), ptr, 256, &buf, SyncDirection::DeviceToHost).unwrap();
        }
        assert!(host.iter().all(|&b| b == 5));
    }

    #[test]
    fn test_resync_to_host() {
        let store = store();
        let device: Arc<dyn Device> = MockDevice::new(0, 1 << 20, false);
        let mut lease = store.get_or_create(0x1, desc(), 1).unwrap();
        lease.as_mut_slice().fill(1);
        lease.publish();
        let entry = Arc::clone(lease.entry());
        drop(lease);

        // Device-side copy holds newer pixels.
        let buf = device.alloc_host_backed(entry.ptr(), 8, 8, 4).unwrap();
        device.write_host_to_device(&vec![9u8; 256], &buf).unwrap();

        resync_to_host(device.as_ref(), &entry, &buf, Colorspace::Lab).unwrap();
        let read = entry.read();
        // SAFETY: read guard held.
        assert!(unsafe { entry.as_slice() }.iter().all(|&b| b == 9));
        drop(read);
        assert_eq!(entry.descriptor().cst, Colorspace::Lab);
    }
}
