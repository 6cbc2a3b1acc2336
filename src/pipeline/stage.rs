//! Stage descriptors and the stage kernel trait.

use crate::error::{Error, Result};
use crate::gpu::{Device, DeviceBuffer};

/// A region of interest: the window of the image a buffer covers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Roi {
    /// Left edge in full-image coordinates.
    pub x: i32,
    /// Top edge in full-image coordinates.
    pub y: i32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Scale relative to the full image (1.0 = full resolution).
    pub scale: f32,
}

impl Roi {
    /// Full-image region at scale 1.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
            scale: 1.0,
        }
    }

    /// Pixel count.
    #[inline]
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Buffer size in bytes at the given bytes-per-pixel.
    #[inline]
    pub fn size(&self, bpp: u32) -> usize {
        self.pixels() * bpp as usize
    }

    /// Reject degenerate regions.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.scale <= 0.0 {
            return Err(Error::InvalidRoi(format!(
                "{}x{} at scale {}",
                self.width, self.height, self.scale
            )));
        }
        Ok(())
    }
}

/// Static description of one pipeline stage.
///
/// The parameter hashes summarize the stage's editing parameters and its
/// blend/mask parameters; the hashing engine folds them into the cumulative
/// chains, it never inspects the parameters themselves.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// Stage name, unique within a pipeline.
    pub name: String,
    /// Disabled stages are completely transparent to hashing and
    /// evaluation.
    pub enabled: bool,
    /// Once set, every downstream output is considered uncacheable across
    /// edits (the flag is folded into all downstream hashes).
    pub bypass_cache: bool,
    /// Hash of the stage's editing parameters.
    pub params_hash: u64,
    /// Hash of the stage's blend and mask parameters.
    pub blend_hash: u64,
    /// Whether the stage changes geometry (crop, rotate, lens).
    pub distorts: bool,
    /// Whether the stage publishes a raster mask for downstream stages.
    pub produces_raster_mask: bool,
    /// Whether the stage only affects display, not the stored pixels.
    pub display_only: bool,
    /// Name of an upstream stage whose raster mask this stage consumes.
    pub raster_mask_source: Option<String>,
}

impl StageSpec {
    /// A minimal enabled stage with the given name and parameter hash.
    pub fn new(name: impl Into<String>, params_hash: u64) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            bypass_cache: false,
            params_hash,
            blend_hash: 0,
            distorts: false,
            produces_raster_mask: false,
            display_only: false,
            raster_mask_source: None,
        }
    }
}

/// One processing stage of a pipeline.
///
/// Implementations provide the CPU kernel and may provide a device kernel.
/// Buffers are raw bytes; the descriptor travelling with each cache entry
/// carries the pixel layout.
pub trait StageOp: Send + Sync {
    /// Stage description.
    fn spec(&self) -> &StageSpec;

    /// Output region produced from a given input region.
    fn modify_roi_out(&self, roi_in: &Roi) -> Roi {
        *roi_in
    }

    /// Input region required to produce a given output region.
    fn modify_roi_in(&self, roi_out: &Roi) -> Roi {
        *roi_out
    }

    /// CPU kernel.
    fn process_cpu(
        &self,
        input: &[u8],
        output: &mut [u8],
        roi_in: &Roi,
        roi_out: &Roi,
    ) -> Result<()>;

    /// Whether a device kernel exists.
    fn supports_device(&self) -> bool {
        false
    }

    /// Device kernel. Input and output are device buffers prepared by the
    /// bridge; the implementation must not touch host memory.
    fn process_device(
        &self,
        device: &dyn Device,
        _input: &DeviceBuffer,
        _output: &DeviceBuffer,
        _roi_in: &Roi,
        _roi_out: &Roi,
    ) -> Result<()> {
        Err(Error::Device {
            devid: device.id(),
            reason: format!("stage '{}' has no device kernel", self.spec().name),
        })
    }

    /// Peak working-set multiplier of the kernel relative to input plus
    /// output, used by the tiling decision.
    fn memory_factor(&self) -> f32 {
        1.0
    }
}
