//! Accelerator device abstraction.
//!
//! The evaluator talks to accelerators through the [`Device`] trait: buffer
//! allocation (device-private or backed by a host pointer), map/unmap,
//! explicit blocking transfers, and a queue drain. Real backends plug in
//! behind the trait; [`MockDevice`] is a CPU-backed implementation used in
//! tests and on machines without an accelerator, and can simulate both
//! zero-copy and staging-copy drivers as well as allocation failures.
//!
//! [`DeviceManager`] tracks registered devices and their error counts. A
//! device that keeps failing is disabled for the rest of the session; the
//! pipeline driver additionally disables a device per-pipeline on the first
//! failure and retries the run on the CPU.

pub mod bridge;

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Consecutive errors after which a device is disabled for the session.
pub const DEVICE_ERROR_CEILING: u32 = 3;

/// Opaque handle to device memory.
///
/// The buffer releases its device memory when dropped, wherever the drop
/// happens (bridge, cache entry companion list, or test scope).
#[derive(Debug)]
pub struct DeviceBuffer {
    /// Device the buffer lives on.
    devid: usize,
    /// Width in pixels.
    width: u32,
    /// Height in pixels.
    height: u32,
    /// Bytes per pixel.
    bpp: u32,
    /// Whether the buffer is backed by a host pointer.
    host_backed: bool,
    /// Backend-specific handle.
    handle: DeviceBufferHandle,
}

/// Backend-specific buffer handle.
#[derive(Debug)]
enum DeviceBufferHandle {
    /// CPU-backed mock allocation.
    Mock(Arc<MockAlloc>),
}

impl DeviceBuffer {
    /// Device index.
    #[inline]
    pub fn devid(&self) -> usize {
        self.devid
    }

    /// Width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per pixel.
    #[inline]
    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    /// Buffer size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.width as usize * self.height as usize * self.bpp as usize
    }

    /// Whether the buffer was created from a host pointer.
    #[inline]
    pub fn is_host_backed(&self) -> bool {
        self.host_backed
    }

    /// Host pointer the buffer is backed by, if any.
    #[inline]
    pub fn host_addr(&self) -> Option<usize> {
        match &self.handle {
            DeviceBufferHandle::Mock(alloc) => alloc.host,
        }
    }
}

/// Accelerator device interface.
///
/// All transfer operations are blocking; `finish` drains whatever the
/// backend has queued. Implementations must be safe to share across the
/// evaluator threads.
pub trait Device: Send + Sync {
    /// Device index, assigned at registration.
    fn id(&self) -> usize;

    /// Human-readable device name.
    fn name(&self) -> &str;

    /// Allocate a device-private buffer.
    fn alloc(&self, width: u32, height: u32, bpp: u32) -> Result<DeviceBuffer>;

    /// Allocate a buffer backed by `host` (pinned). Depending on the
    /// driver this may be true zero-copy or an internal staging copy;
    /// callers distinguish the two via [`bridge::is_zero_copy`].
    fn alloc_host_backed(
        &self,
        host: NonNull<u8>,
        width: u32,
        height: u32,
        bpp: u32,
    ) -> Result<DeviceBuffer>;

    /// Map the buffer for CPU access, blocking until device work on it is
    /// done. Returns the mapped pointer.
    fn map(&self, buf: &DeviceBuffer) -> Result<*mut u8>;

    /// Unmap a previously mapped buffer.
    fn unmap(&self, buf: &DeviceBuffer, mapped: *mut u8) -> Result<()>;

    /// Blocking host to device copy.
    ///
    /// # Safety contract
    ///
    /// `host` must be valid for the buffer size; callers pass slices
    /// obtained under the owning cache entry's lock.
    fn write_host_to_device(&self, host: &[u8], buf: &DeviceBuffer) -> Result<()>;

    /// Blocking device to host copy.
    fn read_device_to_host(&self, buf: &DeviceBuffer, host: &mut [u8]) -> Result<()>;

    /// Drain the command queue.
    fn finish(&self) -> Result<()>;

    /// Bytes of device memory currently available.
    fn available_memory(&self) -> usize;
}

/// Shared memory budget for a mock device.
#[derive(Debug)]
struct Budget {
    capacity: usize,
    used: AtomicUsize,
}

impl Budget {
    fn try_take(&self, size: usize) -> bool {
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            if used + size > self.capacity {
                return false;
            }
            match self.used.compare_exchange_weak(
                used,
                used + size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(v) => used = v,
            }
        }
    }

    fn give_back(&self, size: usize) {
        self.used.fetch_sub(size, Ordering::AcqRel);
    }
}

/// One mock allocation. Owns its staging copy unless the device is in
/// zero-copy mode and the buffer is host-backed.
#[derive(Debug)]
struct MockAlloc {
    host: Option<usize>,
    /// Staging copy; empty when the allocation is true zero-copy.
    data: Mutex<Box<[u8]>>,
    charged: usize,
    budget: Arc<Budget>,
}

impl Drop for MockAlloc {
    fn drop(&mut self) {
        self.budget.give_back(self.charged);
    }
}

/// CPU-backed [`Device`] implementation.
///
/// Used in tests and as the fallback backend. `zero_copy` selects whether
/// host-backed buffers alias host memory (a well-behaved driver) or keep an
/// internal staging copy (the conservative case the bridge must detect).
pub struct MockDevice {
    id: usize,
    name: String,
    zero_copy: bool,
    budget: Arc<Budget>,
    /// Number of upcoming allocations to fail, for OOM-path tests.
    fail_allocs: AtomicU32,
    /// Allocations served since creation.
    allocs: AtomicU64,
}

impl MockDevice {
    /// Create a mock device with the given memory capacity.
    pub fn new(id: usize, capacity: usize, zero_copy: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: format!("mock-{id}"),
            zero_copy,
            budget: Arc::new(Budget {
                capacity,
                used: AtomicUsize::new(0),
            }),
            fail_allocs: AtomicU32::new(0),
            allocs: AtomicU64::new(0),
        })
    }

    /// Make the next `n` allocations fail with an out-of-memory error.
    pub fn fail_next_allocs(&self, n: u32) {
        self.fail_allocs.store(n, Ordering::Release);
    }

    /// Total allocations served.
    pub fn alloc_count(&self) -> u64 {
        self.allocs.load(Ordering::Relaxed)
    }

    fn take_budget(&self, size: usize) -> Result<()> {
        let pending = self.fail_allocs.load(Ordering::Acquire);
        if pending > 0
            && self
                .fail_allocs
                .compare_exchange(pending, pending - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return Err(Error::DeviceOutOfMemory {
                devid: self.id,
                requested: size,
            });
        }
        if !self.budget.try_take(size) {
            return Err(Error::DeviceOutOfMemory {
                devid: self.id,
                requested: size,
            });
        }
        Ok(())
    }
}

impl Device for MockDevice {
    fn id(&self) -> usize {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn alloc(&self, width: u32, height: u32, bpp: u32) -> Result<DeviceBuffer> {
        let size = width as usize * height as usize * bpp as usize;
        self.take_budget(size)?;
        self.allocs.fetch_add(1, Ordering::Relaxed);
        Ok(DeviceBuffer {
            devid: self.id,
            width,
            height,
            bpp,
            host_backed: false,
            handle: DeviceBufferHandle::Mock(Arc::new(MockAlloc {
                host: None,
                data: Mutex::new(vec![0u8; size].into_boxed_slice()),
                charged: size,
                budget: Arc::clone(&self.budget),
            })),
        })
    }

    fn alloc_host_backed(
        &self,
        host: NonNull<u8>,
        width: u32,
        height: u32,
        bpp: u32,
    ) -> Result<DeviceBuffer> {
        let size = width as usize * height as usize * bpp as usize;
        self.take_budget(size)?;
        self.allocs.fetch_add(1, Ordering::Relaxed);
        let data = if self.zero_copy {
            Box::default()
        } else {
            vec![0u8; size].into_boxed_slice()
        };
        Ok(DeviceBuffer {
            devid: self.id,
            width,
            height,
            bpp,
            host_backed: true,
            handle: DeviceBufferHandle::Mock(Arc::new(MockAlloc {
                host: Some(host.as_ptr() as usize),
                data: Mutex::new(data),
                charged: size,
                budget: Arc::clone(&self.budget),
            })),
        })
    }

    fn map(&self, buf: &DeviceBuffer) -> Result<*mut u8> {
        let DeviceBufferHandle::Mock(alloc) = &buf.handle;
        if let Some(host) = alloc.host {
            if self.zero_copy {
                return Ok(host as *mut u8);
            }
        }
        Ok(alloc.data.lock().as_mut_ptr())
    }

    fn unmap(&self, _buf: &DeviceBuffer, _mapped: *mut u8) -> Result<()> {
        Ok(())
    }

    fn write_host_to_device(&self, host: &[u8], buf: &DeviceBuffer) -> Result<()> {
        let DeviceBufferHandle::Mock(alloc) = &buf.handle;
        let mut data = alloc.data.lock();
        if data.is_empty() {
            // True zero-copy alias of the host pointer, nothing to move.
            return Ok(());
        }
        let n = host.len().min(data.len());
        data[..n].copy_from_slice(&host[..n]);
        Ok(())
    }

    fn read_device_to_host(&self, buf: &DeviceBuffer, host: &mut [u8]) -> Result<()> {
        let DeviceBufferHandle::Mock(alloc) = &buf.handle;
        let data = alloc.data.lock();
        if data.is_empty() {
            return Ok(());
        }
        let n = host.len().min(data.len());
        host[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        Ok(())
    }

    fn available_memory(&self) -> usize {
        self.budget.capacity - self.budget.used.load(Ordering::Acquire)
    }
}

/// Per-device health tracking.
struct DeviceState {
    errors: AtomicU32,
    disabled: AtomicBool,
}

/// Registry of accelerator devices with error escalation.
pub struct DeviceManager {
    devices: Vec<Arc<dyn Device>>,
    state: Vec<DeviceState>,
}

impl DeviceManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            state: Vec::new(),
        }
    }

    /// Register a device, returning its index.
    pub fn register(&mut self, device: Arc<dyn Device>) -> usize {
        let devid = self.devices.len();
        debug!(devid, name = device.name(), "registered device");
        self.devices.push(device);
        self.state.push(DeviceState {
            errors: AtomicU32::new(0),
            disabled: AtomicBool::new(false),
        });
        devid
    }

    /// Number of registered devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no devices are registered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Get a device if it exists and is still enabled for the session.
    pub fn get(&self, devid: usize) -> Option<Arc<dyn Device>> {
        let state = self.state.get(devid)?;
        if state.disabled.load(Ordering::Acquire) {
            return None;
        }
        self.devices.get(devid).cloned()
    }

    /// Record a device error. When the count reaches the ceiling the
    /// device is disabled for the rest of the session.
    pub fn note_error(&self, devid: usize) {
        let Some(state) = self.state.get(devid) else {
            return;
        };
        let errors = state.errors.fetch_add(1, Ordering::AcqRel) + 1;
        crate::observability::record_device_error(devid);
        if errors >= DEVICE_ERROR_CEILING && !state.disabled.swap(true, Ordering::AcqRel) {
            warn!(
                devid,
                errors, "device exceeded the error ceiling, disabled for this session"
            );
        } else {
            warn!(devid, errors, "device error recorded");
        }
    }

    /// Error count for a device.
    pub fn error_count(&self, devid: usize) -> u32 {
        self.state
            .get(devid)
            .map(|s| s.errors.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Whether the device is disabled session-wide.
    pub fn is_disabled(&self, devid: usize) -> bool {
        self.state
            .get(devid)
            .map(|s| s.disabled.load(Ordering::Acquire))
            .unwrap_or(true)
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}
