//! Run control around the evaluator.
//!
//! The driver owns what a single [`EvalContext`] run cannot decide alone:
//!
//! - the **clean shortcut**: when the pipeline's history hash matches the
//!   one its backbuffer was produced from, the cached output is returned
//!   without evaluating anything;
//! - the **backbuffer protocol**: the last delivered output of each
//!   pipeline keeps exactly one cache reference, swapped atomically on
//!   delivery so the UI always has a resident buffer to draw;
//! - the **full-resolution lock**: full and export pipelines serialize on
//!   one process-wide mutex, previews and thumbnails run freely;
//! - the **retry loop**: a run that fails recoverably (device trouble, a
//!   missing raster mask) is retried up to [`MAX_RUNS`] times, flushing or
//!   disabling as the error dictates.

use crate::cache::{CacheLease, CacheStore};
use crate::error::{Error, Result};
use crate::gpu::DeviceManager;
use crate::pipeline::eval::{EvalContext, EvalParams};
use crate::pipeline::{Pipeline, SourceImage};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum evaluation attempts per [`PipelineDriver::process`] call.
pub const MAX_RUNS: u32 = 3;

/// Full-resolution pipelines hold this across their whole run; the big
/// buffers involved make concurrent full-res evaluation counterproductive.
static FULL_RES_LOCK: Mutex<()> = Mutex::new(());

/// A delivered pipeline output.
#[derive(Debug)]
pub struct ProcessResult {
    /// Read lease on the output buffer.
    pub output: CacheLease,
    /// Evaluation attempts it took (0 for the clean shortcut).
    pub runs: u32,
}

/// Drives pipelines to completion against one cache store.
pub struct PipelineDriver {
    store: Arc<CacheStore>,
    devices: Option<Arc<DeviceManager>>,
    params: EvalParams,
}

impl PipelineDriver {
    /// A driver without accelerator devices.
    pub fn new(store: Arc<CacheStore>) -> Self {
        Self {
            store,
            devices: None,
            params: EvalParams::default(),
        }
    }

    /// Attach a device manager.
    pub fn with_devices(mut self, devices: Arc<DeviceManager>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Override the evaluation tunables.
    pub fn with_params(mut self, params: EvalParams) -> Self {
        self.params = params;
        self
    }

    /// The backing store.
    #[inline]
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Produce the pipeline's output for its current history state.
    pub fn process(&self, pipe: &Pipeline, source: &dyn SourceImage) -> Result<ProcessResult> {
        let history = pipe.history_hash();

        // The backbuffer keeps a reference on its entry, so a valid
        // backbuffer is always resident.
        if pipe.backbuf_valid() {
            if let Some(hash) = pipe.backbuf_hash() {
                if let Some(output) = self.store.get(hash) {
                    debug!(pipe = pipe.id(), "pipeline clean, reusing backbuffer");
                    return Ok(ProcessResult { output, runs: 0 });
                }
            }
        }

        let _full_res = pipe
            .kind()
            .is_full_resolution()
            .then(|| FULL_RES_LOCK.lock());

        let ctx = EvalContext::new(&self.store, pipe, source, self.devices.as_ref(), self.params);

        let mut last_err = Error::Aborted;
        for run in 1..=MAX_RUNS {
            match ctx.run() {
                Ok(output) => {
                    self.deliver(pipe, &output, history)?;
                    info!(
                        pipe = pipe.id(),
                        runs = run,
                        hash = format_args!("{:#018x}", output.hash()),
                        "pipeline processed"
                    );
                    self.store.report();
                    return Ok(ProcessResult { output, runs: run });
                }
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(e @ (Error::Device { .. } | Error::DeviceOutOfMemory { .. })) => {
                    let devid = match &e {
                        Error::Device { devid, .. } | Error::DeviceOutOfMemory { devid, .. } => {
                            *devid
                        }
                        _ => unreachable!(),
                    };
                    if let Some(devices) = &self.devices {
                        devices.note_error(devid);
                    }
                    pipe.disable_device();
                    warn!(
                        pipe = pipe.id(),
                        devid,
                        run,
                        error = %e,
                        "device trouble, retrying on CPU"
                    );
                    last_err = e;
                }
                Err(e @ Error::MaskUnavailable { .. }) => {
                    // A fast path skipped a raster mask producer. Drop this
                    // pipeline's cached outputs so the rerun recomputes the
                    // whole chain, producer included. The re-entry marker
                    // stays set until delivery: the rerun takes no fast
                    // paths and keeps only the producer's output.
                    let flushed = self.store.flush(Some(pipe.id()));
                    warn!(
                        pipe = pipe.id(),
                        run,
                        flushed,
                        error = %e,
                        "raster mask missing, flushed pipeline for re-entry"
                    );
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        warn!(pipe = pipe.id(), error = %last_err, "pipeline gave up after {MAX_RUNS} runs");
        Err(last_err)
    }

    /// Swap the backbuffer to the new output and mark the pipeline clean.
    fn deliver(&self, pipe: &Pipeline, output: &CacheLease, history: u64) -> Result<()> {
        pipe.swap_backbuf(&self.store, output.hash(), history)?;
        pipe.mark_clean(history);
        pipe.set_reentry(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::pipeline::stage::{Roi, StageOp, StageSpec};
    use crate::pipeline::PipeKind;

    struct Gradient;

    impl SourceImage for Gradient {
        fn identity_hash(&self) -> u64 {
            0xbeef
        }

        fn full_roi(&self) -> Roi {
            Roi::full(8, 8)
        }

        fn fill(&self, _roi: &Roi, _bpp: u32, out: &mut [u8]) -> Result<()> {
            for (i, b) in out.iter_mut().enumerate() {
                *b = i as u8;
            }
            Ok(())
        }
    }

    struct Invert(StageSpec);

    impl StageOp for Invert {
        fn spec(&self) -> &StageSpec {
            &self.0
        }

        fn process_cpu(&self, input: &[u8], output: &mut [u8], _: &Roi, _: &Roi) -> Result<()> {
            for (o, i) in output.iter_mut().zip(input) {
                *o = !i;
            }
            Ok(())
        }
    }

    fn driver() -> PipelineDriver {
        PipelineDriver::new(
            CacheStore::new(CacheConfig {
                arena_pages: 64,
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn pipe() -> Pipeline {
        let mut pipe = Pipeline::new(7, PipeKind::Preview, 4);
        pipe.push_stage(Arc::new(Invert(StageSpec::new("invert", 1))));
        pipe.set_history_hash(100);
        pipe
    }

    #[test]
    fn test_clean_shortcut() {
        let driver = driver();
        let pipe = pipe();
        let img = Gradient;

        let first = driver.process(&pipe, &img).unwrap();
        assert_eq!(first.runs, 1);
        let hash = first.output.hash();
        drop(first);

        // Unchanged history: the backbuffer is handed back without a run.
        let second = driver.process(&pipe, &img).unwrap();
        assert_eq!(second.runs, 0);
        assert_eq!(second.output.hash(), hash);
    }

    #[test]
    fn test_backbuffer_holds_exactly_one_reference() {
        let driver = driver();
        let pipe = pipe();
        let img = Gradient;

        let result = driver.process(&pipe, &img).unwrap();
        let entry = Arc::clone(result.output.entry());
        drop(result);
        assert_eq!(entry.ref_count(), 1);

        // Re-delivering the same output swaps the reference in place, never
        // stacking a second one.
        pipe.set_history_hash(101);
        let result = driver.process(&pipe, &img).unwrap();
        assert!(Arc::ptr_eq(result.output.entry(), &entry));
        drop(result);
        assert_eq!(entry.ref_count(), 1);

        pipe.release_backbuf(driver.store());
        assert_eq!(entry.ref_count(), 0);
    }

    #[test]
    fn test_dirty_history_reruns() {
        let driver = driver();
        let pipe = pipe();
        let img = Gradient;

        driver.process(&pipe, &img).unwrap();
        pipe.set_history_hash(101);
        // Same stage chain, so the run is all cache hits, but it is a run.
        let result = driver.process(&pipe, &img).unwrap();
        assert_eq!(result.runs, 1);
    }

    #[test]
    fn test_cancelled_pipeline_aborts() {
        let driver = driver();
        let pipe = pipe();
        pipe.shutdown().cancel();
        assert!(matches!(
            driver.process(&pipe, &Gradient),
            Err(Error::Aborted)
        ));
    }

    #[test]
    fn test_bypass_output_not_retained_after_release() {
        let driver = driver();
        let img = Gradient;

        let mut pipe = Pipeline::new(11, PipeKind::Preview, 4);
        let mut spec = StageSpec::new("transient", 2);
        spec.bypass_cache = true;
        pipe.push_stage(Arc::new(Invert(spec)));
        pipe.set_history_hash(1);

        let result = driver.process(&pipe, &img).unwrap();
        let hash = result.output.hash();
        assert!(driver.store().contains(hash));
        drop(result);

        // The backbuffer holds the last reference; releasing it takes the
        // bypassing stage's output with it.
        pipe.release_backbuf(driver.store());
        assert!(!driver.store().contains(hash));
    }

    #[test]
    fn test_mask_reentry_flushes_and_reruns() {
        let driver = driver();
        let img = Gradient;

        let mut pipe = Pipeline::new(9, PipeKind::Preview, 4);
        let mut producer = StageSpec::new("masker", 5);
        producer.produces_raster_mask = true;
        pipe.push_stage(Arc::new(Invert(producer)));
        pipe.push_stage(Arc::new(Invert(StageSpec::new("mid", 6))));
        let mut consumer = StageSpec::new("blend", 7);
        consumer.raster_mask_source = Some("masker".into());
        pipe.push_stage(Arc::new(Invert(consumer)));
        pipe.set_history_hash(1);

        let first = driver.process(&pipe, &img).unwrap();
        let producer_hash = {
            let ctx = EvalContext::new(driver.store(), &pipe, &img, None, EvalParams::default());
            ctx.hashes[0].content
        };
        let out_hash = first.output.hash();
        drop(first);

        // Make the producer and the final output vanish while the middle
        // stage stays resident, as a sweep or eviction would.
        pipe.release_backbuf(driver.store());
        driver.store().remove(producer_hash, true).unwrap();
        driver.store().remove(out_hash, true).unwrap();

        pipe.set_history_hash(2);
        let second = driver.process(&pipe, &img).unwrap();
        assert_eq!(second.runs, 2);
        assert!(driver.store().contains(producer_hash));
        assert_eq!(pipe.reentry_hash(), None);
    }
}
