//! Tiling geometry: padding to the alignment boundary and the tile grid.
//!
//! Input tiles are `2 * patch_size` square and overlap their neighbours by
//! `patch_size`. After the model runs, `patch_size / 2` is trimmed from each
//! side so only the well-conditioned center of every tile is kept.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::UpscaleError;

pub const DEFAULT_PATCH_SIZE: usize = 32;
pub const DEFAULT_SIZE_FACTOR: usize = 64;
pub const DEFAULT_ALIGN_FACTOR: usize = 2;

/// Linear enlargement applied by nearest-neighbor before tiling.
pub const PRESCALE_FACTOR: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingConfig {
    /// Edge length of one output tile.
    pub patch_size: usize,
    /// Padded dimensions are rounded up to a multiple of this, plus one patch.
    pub size_factor: usize,
    /// Down/up nearest factor of the alignment step.
    pub align_factor: usize,
}

impl Default for TilingConfig {
    fn default() -> Self {
        Self {
            patch_size: DEFAULT_PATCH_SIZE,
            size_factor: DEFAULT_SIZE_FACTOR,
            align_factor: DEFAULT_ALIGN_FACTOR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisPadding {
    pub before: usize,
    pub after: usize,
}

/// Geometry of one upscale run, derived from the source dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingPlan {
    pub patch_size: usize,
    pub source_width: usize,
    pub source_height: usize,
    pub padded_width: usize,
    pub padded_height: usize,
    pub pad_x: AxisPadding,
    pub pad_y: AxisPadding,
    pub rows: usize,
    pub cols: usize,
    pub output_width: usize,
    pub output_height: usize,
}

impl TilingConfig {
    pub fn validate(&self) -> Result<()> {
        let Self {
            patch_size,
            size_factor,
            align_factor,
        } = *self;

        if patch_size == 0 || patch_size % 2 != 0 {
            return Err(invalid(format!(
                "patch_size must be a positive even number, got {patch_size}"
            )));
        }
        if size_factor == 0 || size_factor % patch_size != 0 {
            return Err(invalid(format!(
                "size_factor ({size_factor}) must be a positive multiple of patch_size ({patch_size})"
            )));
        }
        if align_factor == 0 || patch_size % align_factor != 0 || size_factor % align_factor != 0 {
            return Err(invalid(format!(
                "align_factor ({align_factor}) must divide patch_size ({patch_size}) and size_factor ({size_factor})"
            )));
        }
        Ok(())
    }

    /// `size_factor * ceil(len / size_factor) + patch_size`
    pub fn padded_len(&self, len: usize) -> usize {
        self.size_factor * len.div_ceil(self.size_factor) + self.patch_size
    }

    /// Symmetric padding for one axis; the odd pixel, if any, goes after.
    pub fn padding(&self, len: usize) -> AxisPadding {
        let total = self.padded_len(len) - len;
        AxisPadding {
            before: total / 2,
            after: total - total / 2,
        }
    }

    pub fn plan(&self, source_width: usize, source_height: usize) -> Result<TilingPlan> {
        self.validate()?;
        let scaled_w = source_width * PRESCALE_FACTOR;
        let scaled_h = source_height * PRESCALE_FACTOR;
        let padded_width = self.padded_len(scaled_w);
        let padded_height = self.padded_len(scaled_h);
        let (rows, cols) = grid_dimensions(padded_width, padded_height, self.patch_size)?;

        Ok(TilingPlan {
            patch_size: self.patch_size,
            source_width,
            source_height,
            padded_width,
            padded_height,
            pad_x: self.padding(scaled_w),
            pad_y: self.padding(scaled_h),
            rows,
            cols,
            output_width: scaled_w,
            output_height: scaled_h,
        })
    }
}

impl TilingPlan {
    pub fn tile_count(&self) -> usize {
        self.rows * self.cols
    }
}

/// Tile grid for a preprocessed image of `width × height`.
///
/// Returns `(rows, cols)`. The padding step guarantees divisibility; a
/// remainder means the geometry is misconfigured and is reported instead of
/// silently dropping the last row or column.
pub fn grid_dimensions(width: usize, height: usize, patch_size: usize) -> Result<(usize, usize)> {
    if patch_size == 0 || width < patch_size || height < patch_size {
        return Err(UpscaleError::Geometry(format!(
            "{width}x{height} image is too small for {patch_size}px patches"
        ))
        .into());
    }
    let inner_w = width - patch_size;
    let inner_h = height - patch_size;
    if inner_w % patch_size != 0 || inner_h % patch_size != 0 {
        return Err(UpscaleError::Geometry(format!(
            "{width}x{height} does not divide into {patch_size}px tiles after removing one patch of border"
        ))
        .into());
    }
    Ok((inner_h / patch_size, inner_w / patch_size))
}

/// Top-left corner `(x, y)` of the tile at `(row, col)`, in both the
/// preprocessed image and the accumulator.
pub fn tile_origin(row: usize, col: usize, patch_size: usize) -> (usize, usize) {
    (col * patch_size, row * patch_size)
}

fn invalid(message: String) -> anyhow::Error {
    UpscaleError::InvalidConfig(message).into()
}
