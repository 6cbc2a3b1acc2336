//! Recursive pipeline evaluation.
//!
//! Evaluation walks the stage chain backwards: the output of stage `k` is
//! requested, and if the memoization cache does not already hold it the
//! evaluator recurses for the output of stage `k - 1`, down to the source
//! image. Every produced buffer is published under its cumulative content
//! hash, so a later run touches only the stages downstream of the first
//! edit.
//!
//! Per stage the evaluator tries the bound accelerator device first (when
//! the stage has a device kernel) and falls back to the CPU kernel on any
//! device error. Device outputs are synchronized back to the host before
//! the entry is published, so the host copy of every cached buffer is
//! always current.
//!
//! Cancellation is cooperative: the shutdown token is checked at every
//! stage boundary, and a cancelled run discards its partially written
//! output before unwinding.

use crate::cache::{BufferDescriptor, CacheLease, CacheStore, Colorspace};
use crate::error::{Error, Result};
use crate::gpu::{bridge, Device, DeviceManager};
use crate::observability;
use crate::pipeline::hash::{chain_hashes, hash_roi, hash_u64, StageHashes, HASH_SEED};
use crate::pipeline::stage::{Roi, StageOp};
use crate::pipeline::{Pipeline, SourceImage};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Evaluation tunables.
#[derive(Debug, Clone, Copy)]
pub struct EvalParams {
    /// Working-set size above which a non-distorting stage is processed in
    /// horizontal strips instead of one piece.
    pub tile_mem_limit: usize,
}

impl Default for EvalParams {
    fn default() -> Self {
        Self {
            tile_mem_limit: 64 * 1024 * 1024,
        }
    }
}

/// Per-run evaluation state: the hash and region chains are computed once
/// up front and shared by every recursion level.
pub(crate) struct EvalContext<'a> {
    store: &'a Arc<CacheStore>,
    pipe: &'a Pipeline,
    source: &'a dyn SourceImage,
    devices: Option<&'a Arc<DeviceManager>>,
    params: EvalParams,
    base_roi: Roi,
    base_hash: u64,
    rois: Vec<(Roi, Roi)>,
    pub(crate) hashes: Vec<StageHashes>,
    /// Running cache-bypass flag per stage, monotonic like the hash
    /// chain's: once a stage bypasses, everything downstream does.
    bypass: Vec<bool>,
}

/// Input and output regions per stage.
///
/// Forward pass: each stage declares its output region from its input.
/// Backward pass: each stage widens its input window via
/// [`StageOp::modify_roi_in`], and that window becomes the upstream
/// stage's output region. Disabled stages pass regions through unchanged.
pub(crate) fn compute_rois(stages: &[Arc<dyn StageOp>], base_roi: Roi) -> Vec<(Roi, Roi)> {
    let mut rois = Vec::with_capacity(stages.len());
    let mut current = base_roi;
    for stage in stages {
        if !stage.spec().enabled {
            rois.push((current, current));
            continue;
        }
        let roi_out = stage.modify_roi_out(&current);
        rois.push((current, roi_out));
        current = roi_out;
    }

    let mut required: Option<Roi> = None;
    for (stage, pair) in stages.iter().zip(rois.iter_mut()).rev() {
        if let Some(required) = required {
            pair.1 = required;
        }
        pair.0 = if stage.spec().enabled {
            stage.modify_roi_in(&pair.1)
        } else {
            pair.1
        };
        required = Some(pair.0);
    }
    rois
}

impl<'a> EvalContext<'a> {
    pub(crate) fn new(
        store: &'a Arc<CacheStore>,
        pipe: &'a Pipeline,
        source: &'a dyn SourceImage,
        devices: Option<&'a Arc<DeviceManager>>,
        params: EvalParams,
    ) -> Self {
        let rois = compute_rois(pipe.stages(), source.full_roi());
        // The source is materialized at the first stage's input window.
        let base_roi = rois
            .first()
            .map_or_else(|| source.full_roi(), |(roi_in, _)| *roi_in);
        // The base hash ties every downstream hash to the image content and
        // the region it was materialized at.
        let base_hash = hash_roi(hash_u64(HASH_SEED, source.identity_hash()), &base_roi);
        let hashes = chain_hashes(base_hash, pipe.stages(), &rois);
        let mut bypass = Vec::with_capacity(pipe.stages().len());
        let mut flag = false;
        for stage in pipe.stages() {
            let spec = stage.spec();
            if spec.enabled {
                flag |= spec.bypass_cache;
            }
            bypass.push(flag);
        }
        Self {
            store,
            pipe,
            source,
            devices,
            params,
            base_roi,
            base_hash,
            rois,
            hashes,
            bypass,
        }
    }

    /// Content hash the finished run will publish its output under.
    pub(crate) fn output_hash(&self) -> u64 {
        self.hashes
            .last()
            .map_or(self.base_hash, |h| h.content)
    }

    /// Evaluate the whole chain.
    pub(crate) fn run(&self) -> Result<CacheLease> {
        self.eval_rec(self.pipe.stages().len() as isize - 1)
    }

    /// Output of stage `idx`; `idx < 0` is the materialized source image.
    fn eval_rec(&self, idx: isize) -> Result<CacheLease> {
        if self.pipe.shutdown().is_cancelled() {
            return Err(Error::Aborted);
        }

        if idx < 0 {
            return self.materialize_source();
        }
        let idx = idx as usize;
        let stage = &self.pipe.stages()[idx];
        let spec = stage.spec();

        // A disabled stage's output is its input's: recurse straight
        // through it.
        if !spec.enabled {
            return self.eval_rec(idx as isize - 1);
        }

        let hash = self.hashes[idx].content;
        let reentry = self.pipe.reentry_hash().is_some();
        // Transient outputs are thrown away on their last unref: anything
        // downstream of a cache-bypassing stage, and during re-entry
        // everything except the raster mask producer the re-entry exists
        // to restore.
        let dispose = self.bypass[idx] || (reentry && !spec.produces_raster_mask);
        // Bypass and re-entry force a recompute: never take the fast path.
        if !self.bypass[idx] && !reentry {
            if let Some(lease) = self.store.get(hash) {
                trace!(stage = %spec.name, hash = format_args!("{hash:#018x}"), "stage output cached");
                return Ok(lease);
            }
        }

        let input = self.eval_rec(idx as isize - 1)?;

        // A consumer of a raster mask needs the producer's output to still
        // be resident. When an upstream fast path skipped past the
        // producer, flag the pipeline for re-entry and unwind.
        if let Some(producer) = &spec.raster_mask_source {
            self.check_raster_mask(idx, producer)?;
        }

        let (roi_in, roi_out) = self.rois[idx];
        let descriptor = BufferDescriptor {
            width: roi_out.width,
            height: roi_out.height,
            bpp: self.pipe.bpp(),
            cst: input.descriptor().cst,
        };
        let mut output = self
            .store
            .get_or_create(hash, descriptor, self.pipe.id())?;
        if !output.created() {
            // Another thread created it while we evaluated the input.
            if dispose {
                output.entry().set_auto_destroy();
            }
            return Ok(output);
        }

        match self.run_stage(stage.as_ref(), &input, &mut output, &roi_in, &roi_out) {
            Ok(()) => {
                if dispose {
                    output.entry().set_auto_destroy();
                }
                output.publish();
                Ok(output)
            }
            Err(e) => {
                output.discard();
                Err(e)
            }
        }
    }

    /// Bring the source pixels into the cache.
    fn materialize_source(&self) -> Result<CacheLease> {
        let descriptor = BufferDescriptor {
            width: self.base_roi.width,
            height: self.base_roi.height,
            bpp: self.pipe.bpp(),
            cst: Colorspace::Rgb,
        };
        let mut lease = self
            .store
            .get_or_create(self.base_hash, descriptor, self.pipe.id())?;
        if !lease.created() {
            return Ok(lease);
        }
        let bpp = self.pipe.bpp();
        match self
            .source
            .fill(&self.base_roi, bpp, lease.as_mut_slice())
        {
            Ok(()) => {
                debug!(
                    hash = format_args!("{:#018x}", self.base_hash),
                    width = self.base_roi.width,
                    height = self.base_roi.height,
                    "materialized source image"
                );
                // During re-entry the base buffer is transient too.
                if self.pipe.reentry_hash().is_some() {
                    lease.entry().set_auto_destroy();
                }
                lease.publish();
                Ok(lease)
            }
            Err(e) => {
                lease.discard();
                Err(e)
            }
        }
    }

    /// Verify the raster mask producer's output is resident.
    fn check_raster_mask(&self, consumer_idx: usize, producer: &str) -> Result<()> {
        let found = self.pipe.stages()[..consumer_idx]
            .iter()
            .position(|s| s.spec().produces_raster_mask && s.spec().name == producer);
        let Some(pidx) = found else {
            return Err(Error::MaskUnavailable {
                producer: producer.to_string(),
            });
        };
        let producer_hash = self.hashes[pidx].content;
        if self.store.contains(producer_hash) {
            return Ok(());
        }
        warn!(
            producer,
            hash = format_args!("{producer_hash:#018x}"),
            "raster mask producer not resident, requesting re-entry"
        );
        self.pipe.set_reentry(producer_hash);
        Err(Error::MaskUnavailable {
            producer: producer.to_string(),
        })
    }

    /// Run one stage into its freshly created output entry.
    fn run_stage(
        &self,
        stage: &dyn StageOp,
        input: &CacheLease,
        output: &mut CacheLease,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()> {
        let spec = stage.spec();

        if self.pipe.shutdown().is_cancelled() {
            return Err(Error::Aborted);
        }

        // In mask-display mode, stages that neither distort nor produce
        // masks must not alter the displayed mask: pass the input through.
        if self.pipe.mask_display()
            && !spec.distorts
            && !spec.produces_raster_mask
            && input.as_slice().len() == output.as_slice().len()
        {
            output.as_mut_slice().copy_from_slice(input.as_slice());
            trace!(stage = %spec.name, "mask display passthrough");
            return Ok(());
        }

        if stage.supports_device() {
            if let Some(device) = self.stage_device() {
                let timer = observability::stage_timer(&spec.name, true);
                match self.run_stage_device(&device, stage, input, output, roi_in, roi_out) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        drop(timer);
                        warn!(
                            stage = %spec.name,
                            devid = device.id(),
                            error = %e,
                            "device kernel failed, falling back to CPU"
                        );
                        if let Some(devices) = self.devices {
                            devices.note_error(device.id());
                        }
                        self.pipe.disable_device();
                    }
                }
            }
        }

        let _timer = observability::stage_timer(&spec.name, false);
        self.run_stage_cpu(stage, input, output, roi_in, roi_out)
    }

    /// The pipeline's device, when one is bound, enabled on both the
    /// pipeline and the session, and registered.
    fn stage_device(&self) -> Option<Arc<dyn Device>> {
        let devid = self.pipe.device()?;
        self.devices?.get(devid)
    }

    fn run_stage_device(
        &self,
        device: &Arc<dyn Device>,
        stage: &dyn StageOp,
        input: &CacheLease,
        output: &mut CacheLease,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()> {
        let in_entry = input.entry();
        let in_ptr = in_entry.ptr();
        let in_cst = input.descriptor().cst;

        let (in_buf, in_dev_cst, _reused) = bridge::init_buffer(
            self.store,
            device,
            Some(in_entry),
            Some(in_ptr),
            roi_in.width,
            roi_in.height,
            self.pipe.bpp(),
            true,
        )?;

        // A reused companion whose device-side contents already match the
        // entry's colorspace needs no upload; everything else does, unless
        // the buffer is true zero-copy.
        let upload_needed = in_dev_cst != Some(in_cst)
            && !bridge::is_zero_copy(device.as_ref(), &in_buf, in_ptr);
        let uploaded = (|| -> Result<()> {
            if upload_needed {
                // SAFETY: the input lease holds a read guard on the entry
                // for the whole dispatch.
                unsafe {
                    bridge::pinned_copy(
                        device.as_ref(),
                        in_ptr,
                        in_entry.size(),
                        &in_buf,
                        bridge::SyncDirection::HostToDevice,
                    )?;
                }
            }
            Ok(())
        })();
        if let Err(e) = uploaded {
            bridge::clear_buffer(in_buf, Some(in_entry), in_cst);
            return Err(e);
        }

        let out_entry = Arc::clone(output.entry());
        let out_buf = match bridge::init_buffer(
            self.store,
            device,
            Some(&out_entry),
            Some(out_entry.ptr()),
            roi_out.width,
            roi_out.height,
            self.pipe.bpp(),
            true,
        ) {
            Ok((buf, _, _)) => buf,
            Err(e) => {
                bridge::clear_buffer(in_buf, Some(in_entry), in_cst);
                return Err(e);
            }
        };

        let result = (|| -> Result<()> {
            stage.process_device(device.as_ref(), &in_buf, &out_buf, roi_in, roi_out)?;
            // Publish-before-use rule: the host copy must be current before
            // the write lock is released.
            // SAFETY: the output lease holds the write guard.
            unsafe {
                bridge::pinned_copy(
                    device.as_ref(),
                    out_entry.ptr(),
                    out_entry.size(),
                    &out_buf,
                    bridge::SyncDirection::DeviceToHost,
                )?;
            }
            device.finish()
        })();

        let out_cst = output.descriptor().cst;
        bridge::clear_buffer(in_buf, Some(in_entry), in_cst);
        match result {
            Ok(()) => {
                bridge::clear_buffer(out_buf, Some(&out_entry), out_cst);
                Ok(())
            }
            Err(e) => {
                // The device-side output is garbage; do not cache it.
                drop(out_buf);
                Err(e)
            }
        }
    }

    fn run_stage_cpu(
        &self,
        stage: &dyn StageOp,
        input: &CacheLease,
        output: &mut CacheLease,
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()> {
        let spec = stage.spec();
        let bpp = self.pipe.bpp();
        let working_set =
            (roi_in.size(bpp) + roi_out.size(bpp)) as f32 * stage.memory_factor();

        // Distorting stages and stages whose input and output shapes differ
        // need the whole input region at once; everything else can run in
        // horizontal strips when the working set is large.
        let same_shape =
            roi_in.width == roi_out.width && roi_in.height == roi_out.height;
        if spec.distorts || !same_shape || working_set as usize <= self.params.tile_mem_limit {
            return stage.process_cpu(input.as_slice(), output.as_mut_slice(), roi_in, roi_out);
        }

        let tiles = (working_set as usize).div_ceil(self.params.tile_mem_limit);
        let rows_per_tile = (roi_out.height as usize).div_ceil(tiles).max(1);
        debug!(stage = %spec.name, tiles, rows_per_tile, "tiling stage");

        let row_bytes = roi_out.width as usize * bpp as usize;
        let input_slice = input.as_slice();
        let output_slice = output.as_mut_slice();
        let mut row = 0usize;
        while row < roi_out.height as usize {
            if self.pipe.shutdown().is_cancelled() {
                return Err(Error::Aborted);
            }
            let rows = rows_per_tile.min(roi_out.height as usize - row);
            let tile_in = Roi {
                x: roi_in.x,
                y: roi_in.y + row as i32,
                width: roi_in.width,
                height: rows as u32,
                scale: roi_in.scale,
            };
            let tile_out = Roi {
                x: roi_out.x,
                y: roi_out.y + row as i32,
                width: roi_out.width,
                height: rows as u32,
                scale: roi_out.scale,
            };
            let offset = row * row_bytes;
            let len = rows * row_bytes;
            stage.process_cpu(
                &input_slice[offset..offset + len],
                &mut output_slice[offset..offset + len],
                &tile_in,
                &tile_out,
            )?;
            row += rows;
        }
        Ok(())
    }
}
