//! Immutable raster image backed by an HWC `f32` tensor.
//!
//! Every transform returns a new [`ImageBuffer`]. Storage is shared through an
//! `Arc`, so clones are cheap and a buffer handed to an observer never changes
//! underneath it.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use image::{DynamicImage, ExtendedColorType, ImageEncoder};
use ndarray::{s, Array3, ArrayView3};

use crate::error::UpscaleError;

#[derive(Clone, Debug, PartialEq)]
pub struct ImageBuffer {
    data: Arc<Array3<f32>>,
}

impl ImageBuffer {
    /// Wrap a height × width × channels tensor. Values are expected in `[0, 1]`.
    pub fn from_tensor(tensor: Array3<f32>) -> Self {
        Self {
            data: Arc::new(tensor),
        }
    }

    pub fn zeros(width: usize, height: usize, channels: usize) -> Self {
        Self::from_tensor(Array3::zeros((height, width, channels)))
    }

    pub fn width(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn height(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn channels(&self) -> usize {
        self.data.shape()[2]
    }

    /// `(width, height)`
    pub fn dimensions(&self) -> (usize, usize) {
        (self.width(), self.height())
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    /// Owned copy of the pixel tensor.
    pub fn to_tensor(&self) -> Array3<f32> {
        self.data.as_ref().clone()
    }

    pub fn pixel(&self, x: usize, y: usize, channel: usize) -> f32 {
        self.data[[y, x, channel]]
    }

    /// Cut out the `width × height` region whose top-left corner is `(x, y)`.
    pub fn crop(&self, x: usize, y: usize, width: usize, height: usize) -> Result<Self> {
        self.check_region(x, y, width, height)?;
        let region = self.data.slice(s![y..y + height, x..x + width, ..]);
        Ok(Self::from_tensor(region.to_owned()))
    }

    /// Remove `inset` pixels from every side.
    pub fn crop_border(&self, inset: usize) -> Result<Self> {
        let (w, h) = self.dimensions();
        if inset * 2 > w || inset * 2 > h {
            return Err(UpscaleError::Geometry(format!(
                "cannot trim {inset}px from each side of a {w}x{h} image"
            ))
            .into());
        }
        self.crop(inset, inset, w - inset * 2, h - inset * 2)
    }

    /// Center-crop to exactly `width × height`.
    pub fn crop_center(&self, width: usize, height: usize) -> Result<Self> {
        let (w, h) = self.dimensions();
        if width > w || height > h {
            return Err(UpscaleError::Geometry(format!(
                "cannot center-crop a {w}x{h} image to {width}x{height}"
            ))
            .into());
        }
        self.crop((w - width) / 2, (h - height) / 2, width, height)
    }

    /// Pad with edge replication: border pixels copy the nearest source pixel.
    pub fn pad_edge(&self, top: usize, bottom: usize, left: usize, right: usize) -> Self {
        let (w, h) = self.dimensions();
        if top == 0 && bottom == 0 && left == 0 && right == 0 {
            return self.clone();
        }
        if w == 0 || h == 0 {
            return Self::zeros(w + left + right, h + top + bottom, self.channels());
        }

        let new_w = w + left + right;
        let new_h = h + top + bottom;
        let mut padded = Array3::<f32>::zeros((new_h, new_w, self.channels()));

        for y in 0..new_h {
            let src_y = y.saturating_sub(top).min(h - 1);
            for x in 0..new_w {
                let src_x = x.saturating_sub(left).min(w - 1);
                padded
                    .slice_mut(s![y, x, ..])
                    .assign(&self.data.slice(s![src_y, src_x, ..]));
            }
        }

        Self::from_tensor(padded)
    }

    /// Paste `patch` with its top-left corner at `(x, y)`.
    ///
    /// Consumes `self`; the storage is reused when nothing else holds it.
    pub fn composite(mut self, patch: &ImageBuffer, x: usize, y: usize) -> Result<Self> {
        if patch.channels() != self.channels() {
            return Err(UpscaleError::ChannelMismatch {
                expected: self.channels(),
                actual: patch.channels(),
            }
            .into());
        }
        self.check_region(x, y, patch.width(), patch.height())?;

        let target = Arc::make_mut(&mut self.data);
        target
            .slice_mut(s![y..y + patch.height(), x..x + patch.width(), ..])
            .assign(&patch.data.view());
        Ok(self)
    }

    pub fn from_dynamic(image: &DynamicImage) -> Self {
        let rgba = image.to_rgba8();
        let (w, h) = (rgba.width() as usize, rgba.height() as usize);
        let tensor = Array3::from_shape_fn((h, w, 4), |(y, x, c)| {
            f32::from(rgba.get_pixel(x as u32, y as u32).0[c]) / 255.0
        });
        Self::from_tensor(tensor)
    }

    /// Quantize to interleaved 8-bit samples, clamping out-of-range values.
    pub fn to_u8_samples(&self) -> Vec<u8> {
        self.data
            .iter()
            .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect()
    }

    pub fn encode_png(&self) -> Result<Vec<u8>> {
        let color_type = match self.channels() {
            1 => ExtendedColorType::L8,
            2 => ExtendedColorType::La8,
            3 => ExtendedColorType::Rgb8,
            4 => ExtendedColorType::Rgba8,
            other => {
                return Err(UpscaleError::ChannelMismatch {
                    expected: 4,
                    actual: other,
                }
                .into())
            }
        };

        let samples = self.to_u8_samples();
        let mut png_bytes = Vec::new();
        image::codecs::png::PngEncoder::new(&mut png_bytes)
            .write_image(
                &samples,
                self.width() as u32,
                self.height() as u32,
                color_type,
            )
            .context("PNG encoding failed")?;
        Ok(png_bytes)
    }

    pub fn save_png(&self, path: &Path) -> Result<()> {
        let encoded = self.encode_png()?;
        std::fs::write(path, encoded)
            .with_context(|| format!("failed to write image: {}", path.display()))
    }

    fn check_region(&self, x: usize, y: usize, width: usize, height: usize) -> Result<()> {
        let (w, h) = self.dimensions();
        let fits = x.checked_add(width).is_some_and(|end| end <= w)
            && y.checked_add(height).is_some_and(|end| end <= h);
        if !fits {
            return Err(UpscaleError::OutOfBounds {
                x,
                y,
                width,
                height,
                image_width: w,
                image_height: h,
            }
            .into());
        }
        Ok(())
    }
}
