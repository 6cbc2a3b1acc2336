//! Pipelines: ordered stage chains over a source image.
//!
//! A [`Pipeline`] owns its stage list and the per-pipeline state the
//! evaluator and driver need: the cooperative shutdown token, history
//! hashes for dirty tracking, the bound accelerator device, the re-entry
//! marker for missing raster masks and the backbuffer slot.
//!
//! Evaluation itself lives in [`eval`] (backward recursion over the chain)
//! and [`driver`] (run control: retries, device escalation, backbuffer
//! delivery).

pub mod driver;
pub mod eval;
pub mod hash;
pub mod stage;

pub use driver::{PipelineDriver, ProcessResult, MAX_RUNS};
pub use eval::EvalParams;
pub use hash::{HASH_SEED, StageHashes, chain_hashes, hash_bytes, hash_u64};
pub use stage::{Roi, StageOp, StageSpec};

use crate::cache::CacheStore;
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, Ordering};

/// What a pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    /// Full-resolution editor view.
    Full,
    /// Downscaled navigation preview.
    Preview,
    /// Thumbnail generation.
    Thumbnail,
    /// File export.
    Export,
}

impl PipeKind {
    /// Full-resolution pipes serialize on the process-wide evaluation
    /// lock; previews and thumbnails run concurrently.
    #[inline]
    pub fn is_full_resolution(&self) -> bool {
        matches!(self, PipeKind::Full | PipeKind::Export)
    }
}

/// Cooperative cancellation token.
///
/// Checked at every stage boundary; cancelling discards the in-flight
/// output and force-removes partially written entries.
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    /// A fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Re-arm the token for the next run.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Provider of the source image a pipeline starts from.
pub trait SourceImage: Send + Sync {
    /// Hash identifying the image content (file id, import checksum).
    fn identity_hash(&self) -> u64;

    /// Full region of the image.
    fn full_roi(&self) -> Roi;

    /// Fill `out` with the pixels of `roi` at `bpp` bytes per pixel.
    fn fill(&self, roi: &Roi, bpp: u32, out: &mut [u8]) -> Result<()>;
}

/// The backbuffer: the last delivered output of a pipeline.
#[derive(Debug, Clone, Copy)]
struct Backbuf {
    /// Content hash of the delivered output entry.
    output_hash: u64,
    /// History hash the output was computed from.
    history_hash: u64,
}

/// An ordered chain of processing stages over one source image.
pub struct Pipeline {
    id: u64,
    kind: PipeKind,
    bpp: u32,
    stages: Vec<Arc<dyn StageOp>>,
    shutdown: ShutdownToken,
    /// Hash of the current edit history, supplied by the owner.
    history_hash: AtomicU64,
    /// History hash of the last completed run.
    last_history_hash: AtomicU64,
    /// Pending re-entry target (0 = none): content hash of a raster mask
    /// producer whose output went missing mid-run.
    reentry_hash: AtomicU64,
    /// Bound device index, -1 when none.
    devid: AtomicIsize,
    /// Device disabled for this pipeline after an error.
    device_disabled: AtomicBool,
    /// Show masks instead of pixels; non-distorting stages pass through.
    mask_display: AtomicBool,
    backbuf: Mutex<Option<Backbuf>>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new(id: u64, kind: PipeKind, bpp: u32) -> Self {
        Self {
            id,
            kind,
            bpp,
            stages: Vec::new(),
            shutdown: ShutdownToken::new(),
            history_hash: AtomicU64::new(0),
            last_history_hash: AtomicU64::new(u64::MAX),
            reentry_hash: AtomicU64::new(0),
            devid: AtomicIsize::new(-1),
            device_disabled: AtomicBool::new(false),
            mask_display: AtomicBool::new(false),
            backbuf: Mutex::new(None),
        }
    }

    /// Append a stage.
    pub fn push_stage(&mut self, stage: Arc<dyn StageOp>) {
        self.stages.push(stage);
    }

    /// Pipeline id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pipeline kind.
    #[inline]
    pub fn kind(&self) -> PipeKind {
        self.kind
    }

    /// Bytes per pixel of the buffers this pipeline produces.
    #[inline]
    pub fn bpp(&self) -> u32 {
        self.bpp
    }

    /// The stage chain.
    #[inline]
    pub fn stages(&self) -> &[Arc<dyn StageOp>] {
        &self.stages
    }

    /// The cancellation token, for sharing with UI threads.
    #[inline]
    pub fn shutdown(&self) -> &ShutdownToken {
        &self.shutdown
    }

    /// Update the history hash after an edit.
    pub fn set_history_hash(&self, hash: u64) {
        self.history_hash.store(hash, Ordering::Release);
    }

    /// Current history hash.
    #[inline]
    pub fn history_hash(&self) -> u64 {
        self.history_hash.load(Ordering::Acquire)
    }

    /// Whether the pipeline needs re-evaluation.
    pub fn is_dirty(&self) -> bool {
        self.history_hash.load(Ordering::Acquire) != self.last_history_hash.load(Ordering::Acquire)
    }

    pub(crate) fn mark_clean(&self, history_hash: u64) {
        self.last_history_hash.store(history_hash, Ordering::Release);
    }

    /// Bind an accelerator device.
    pub fn set_device(&self, devid: usize) {
        self.devid.store(devid as isize, Ordering::Release);
        self.device_disabled.store(false, Ordering::Release);
    }

    /// Bound device, if any and not disabled for this pipeline.
    pub fn device(&self) -> Option<usize> {
        if self.device_disabled.load(Ordering::Acquire) {
            return None;
        }
        let id = self.devid.load(Ordering::Acquire);
        (id >= 0).then_some(id as usize)
    }

    /// Disable the device for this pipeline (the session-wide ceiling is
    /// the device manager's business).
    pub fn disable_device(&self) {
        self.device_disabled.store(true, Ordering::Release);
    }

    /// Switch mask display on or off.
    pub fn set_mask_display(&self, on: bool) {
        self.mask_display.store(on, Ordering::Release);
    }

    /// Whether mask display is active.
    #[inline]
    pub fn mask_display(&self) -> bool {
        self.mask_display.load(Ordering::Acquire)
    }

    pub(crate) fn set_reentry(&self, hash: u64) {
        self.reentry_hash.store(hash, Ordering::Release);
    }

    /// Pending re-entry target, if any.
    pub fn reentry_hash(&self) -> Option<u64> {
        let h = self.reentry_hash.load(Ordering::Acquire);
        (h != 0).then_some(h)
    }

    /// Current backbuffer output hash, if one is held.
    pub fn backbuf_hash(&self) -> Option<u64> {
        self.backbuf.lock().map(|b| b.output_hash)
    }

    /// Whether the held backbuffer matches the current history.
    pub fn backbuf_valid(&self) -> bool {
        let history = self.history_hash();
        self.backbuf
            .lock()
            .is_some_and(|b| b.history_hash == history)
    }

    /// Swap the backbuffer reference: reference the new output, then
    /// release the previous one. The entry keeps exactly one cache
    /// reference while it is the backbuffer.
    pub(crate) fn swap_backbuf(&self, store: &CacheStore, output_hash: u64, history_hash: u64) -> Result<()> {
        store.ref_entry(output_hash)?;
        let old = self.backbuf.lock().replace(Backbuf {
            output_hash,
            history_hash,
        });
        if let Some(old) = old {
            store.unref_entry(old.output_hash);
        }
        Ok(())
    }

    /// Drop the backbuffer reference, if any.
    pub fn release_backbuf(&self, store: &CacheStore) {
        if let Some(old) = self.backbuf.lock().take() {
            store.unref_entry(old.output_hash);
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stages", &self.stages.len())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
