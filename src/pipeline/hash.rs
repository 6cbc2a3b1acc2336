//! Cumulative content hashing over the stage chain.
//!
//! Two independent Bernstein (djb2) chains run over the pipeline in stage
//! order:
//!
//! - the **content chain** identifies each stage's output buffer. It folds
//!   the previous cumulative hash (the image identity seed for the first
//!   stage) with the stage's parameter hash, its blend hash, the input and
//!   output regions, the display-only flag and the running cache-bypass
//!   flag.
//! - the **mask chain** identifies the geometric lineage of raster masks.
//!   Only stages that distort geometry or produce raster masks contribute.
//!
//! Disabled stages are completely transparent to both chains: their slot
//! repeats the upstream hashes unchanged, so toggling a stage off makes its
//! outputs identical to its input's.
//!
//! The bypass flag is monotonic. Once any stage sets it, every downstream
//! content hash folds it in, so no downstream output can collide with a
//! pre-bypass one.

use crate::pipeline::stage::{Roi, StageOp};
use std::sync::Arc;

/// Seed of the Bernstein hash.
pub const HASH_SEED: u64 = 5381;

/// Fold bytes into a running djb2 hash.
#[inline]
pub fn hash_bytes(seed: u64, bytes: &[u8]) -> u64 {
    let mut h = seed;
    for &b in bytes {
        h = (h << 5).wrapping_add(h) ^ b as u64;
    }
    h
}

/// Fold one u64 into a running hash.
#[inline]
pub fn hash_u64(seed: u64, v: u64) -> u64 {
    hash_bytes(seed, &v.to_le_bytes())
}

/// Fold a region of interest into a running hash.
#[inline]
pub fn hash_roi(seed: u64, roi: &Roi) -> u64 {
    let mut h = hash_bytes(seed, &roi.x.to_le_bytes());
    h = hash_bytes(h, &roi.y.to_le_bytes());
    h = hash_bytes(h, &roi.width.to_le_bytes());
    h = hash_bytes(h, &roi.height.to_le_bytes());
    hash_bytes(h, &roi.scale.to_bits().to_le_bytes())
}

/// Cumulative hashes after one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageHashes {
    /// Content hash of the stage's output buffer.
    pub content: u64,
    /// Mask-lineage hash after the stage.
    pub mask: u64,
}

/// Compute the cumulative hash pair for every stage.
///
/// `image_seed` identifies the source image (and its base region); `rois`
/// holds each stage's input and output regions in stage order.
pub fn chain_hashes(
    image_seed: u64,
    stages: &[Arc<dyn StageOp>],
    rois: &[(Roi, Roi)],
) -> Vec<StageHashes> {
    debug_assert_eq!(stages.len(), rois.len());

    let mut content = image_seed;
    // The mask chain is seeded independently so the two never collide.
    let mut mask = hash_u64(HASH_SEED, image_seed);
    let mut bypass = false;
    let mut out = Vec::with_capacity(stages.len());

    for (stage, (roi_in, roi_out)) in stages.iter().zip(rois) {
        let spec = stage.spec();
        if !spec.enabled {
            out.push(StageHashes { content, mask });
            continue;
        }

        bypass |= spec.bypass_cache;

        let mut h = hash_u64(content, spec.params_hash);
        h = hash_u64(h, spec.blend_hash);
        h = hash_roi(h, roi_in);
        h = hash_roi(h, roi_out);
        h = hash_bytes(h, &[spec.display_only as u8, bypass as u8]);
        content = h;

        if spec.distorts || spec.produces_raster_mask {
            let mut m = hash_u64(mask, spec.params_hash);
            m = hash_roi(m, roi_out);
            mask = m;
        }

        out.push(StageHashes { content, mask });
    }

    out
}
