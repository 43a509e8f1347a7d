//! Boundary to the single-tile upscaling model.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;

use crate::image_buffer::ImageBuffer;

pub type UpscaleFuture = Pin<Box<dyn Future<Output = Result<ImageBuffer>> + Send + 'static>>;

/// An opaque image-to-image model.
///
/// Implementations may be shared by many tasks across conversions and must
/// tolerate concurrent calls. The tiling loop never issues two calls at once
/// for the same image.
pub trait Upscaler: Send + Sync {
    fn name(&self) -> &str;
    fn upscale(&self, image: ImageBuffer) -> UpscaleFuture;
}

pub type SharedUpscaler = Arc<dyn Upscaler>;

/// Returns its input unchanged. The preprocessing pipeline already enlarges
/// the image 2x, so this yields a plain nearest-neighbor upscale.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityUpscaler;

impl Upscaler for IdentityUpscaler {
    fn name(&self) -> &str {
        "identity"
    }

    fn upscale(&self, image: ImageBuffer) -> UpscaleFuture {
        Box::pin(async move { Ok(image) })
    }
}

/// Adapts a closure into an [`Upscaler`].
pub struct FnUpscaler<F> {
    name: String,
    func: F,
}

impl<F> FnUpscaler<F>
where
    F: Fn(ImageBuffer) -> UpscaleFuture + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Upscaler for FnUpscaler<F>
where
    F: Fn(ImageBuffer) -> UpscaleFuture + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn upscale(&self, image: ImageBuffer) -> UpscaleFuture {
        (self.func)(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identity_returns_input() {
        let img = ImageBuffer::zeros(4, 3, 2);
        let out = IdentityUpscaler.upscale(img.clone()).await.unwrap();
        assert_eq!(out, img);
        assert_eq!(IdentityUpscaler.name(), "identity");
    }

    #[tokio::test]
    async fn test_fn_upscaler_delegates_to_closure() {
        let upscaler = FnUpscaler::new("crop", |img: ImageBuffer| -> UpscaleFuture {
            Box::pin(async move { img.crop(0, 0, 1, 1) })
        });
        let out = upscaler.upscale(ImageBuffer::zeros(4, 4, 1)).await.unwrap();
        assert_eq!(out.dimensions(), (1, 1));
        assert_eq!(upscaler.name(), "crop");
    }
}
