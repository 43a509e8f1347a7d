//! Integer-factor nearest-neighbor resampling on HWC tensors.
//!
//! Both directions map destination pixel centers onto the source grid, the
//! same convention as a fractional nearest resize: `src = floor((dst + 0.5) * src_len / dst_len)`.
//! For an integer factor `k` that reduces to `dst / k` when enlarging and
//! `dst * k + k / 2` when shrinking.

use anyhow::Result;
use ndarray::{s, Array3, ArrayView3};

use crate::error::UpscaleError;
use crate::image_buffer::ImageBuffer;

/// Enlarge by `factor` on both spatial axes; every source pixel becomes a
/// `factor × factor` block.
pub fn upsample(src: ArrayView3<'_, f32>, factor: usize) -> Result<Array3<f32>> {
    check_factor(factor)?;
    let (h, w, c) = src.dim();
    let mut dst = Array3::<f32>::zeros((h * factor, w * factor, c));

    for dst_y in 0..h * factor {
        let src_y = dst_y / factor;
        for dst_x in 0..w * factor {
            let src_x = dst_x / factor;
            dst.slice_mut(s![dst_y, dst_x, ..])
                .assign(&src.slice(s![src_y, src_x, ..]));
        }
    }

    Ok(dst)
}

/// Shrink by `factor` on both spatial axes. Both axes must be divisible by
/// `factor`; anything else would silently drop a partial row or column.
pub fn downsample(src: ArrayView3<'_, f32>, factor: usize) -> Result<Array3<f32>> {
    check_factor(factor)?;
    let (h, w, c) = src.dim();
    if h % factor != 0 || w % factor != 0 {
        return Err(UpscaleError::Geometry(format!(
            "cannot downsample {w}x{h} by {factor}: dimensions are not divisible"
        ))
        .into());
    }

    let (out_h, out_w) = (h / factor, w / factor);
    let offset = factor / 2;
    let mut dst = Array3::<f32>::zeros((out_h, out_w, c));

    for dst_y in 0..out_h {
        let src_y = dst_y * factor + offset;
        for dst_x in 0..out_w {
            let src_x = dst_x * factor + offset;
            dst.slice_mut(s![dst_y, dst_x, ..])
                .assign(&src.slice(s![src_y, src_x, ..]));
        }
    }

    Ok(dst)
}

pub fn upsample_image(image: &ImageBuffer, factor: usize) -> Result<ImageBuffer> {
    Ok(ImageBuffer::from_tensor(upsample(image.view(), factor)?))
}

pub fn downsample_image(image: &ImageBuffer, factor: usize) -> Result<ImageBuffer> {
    Ok(ImageBuffer::from_tensor(downsample(image.view(), factor)?))
}

/// Downsample then upsample by the same factor. Output dimensions equal the
/// input dimensions; content is quantized to `factor × factor` blocks.
pub fn align(image: &ImageBuffer, factor: usize) -> Result<ImageBuffer> {
    let down = downsample(image.view(), factor)?;
    Ok(ImageBuffer::from_tensor(upsample(down.view(), factor)?))
}

fn check_factor(factor: usize) -> Result<()> {
    if factor == 0 {
        return Err(
            UpscaleError::InvalidConfig("resample factor must be positive".to_string()).into(),
        );
    }
    Ok(())
}
