//! Decoding boundary: turns a user-supplied source into an [`ImageBuffer`].

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::UpscaleError;
use crate::image_buffer::ImageBuffer;

pub type DecodeFuture = Pin<Box<dyn Future<Output = Result<ImageBuffer>> + Send + 'static>>;

/// Where a conversion's input comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Path(PathBuf),
    Bytes { name: String, data: Arc<[u8]> },
}

impl ImageSource {
    pub fn bytes(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self::Bytes {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Short label for logs and progress output.
    pub fn display_name(&self) -> String {
        match self {
            Self::Path(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            Self::Bytes { name, .. } => name.clone(),
        }
    }
}

pub trait Decoder: Send + Sync {
    fn decode(&self, source: ImageSource) -> DecodeFuture;
}

pub type SharedDecoder = Arc<dyn Decoder>;

/// Decodes any format the `image` crate is built with into 4-channel RGBA.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageFileDecoder;

impl Decoder for ImageFileDecoder {
    fn decode(&self, source: ImageSource) -> DecodeFuture {
        Box::pin(async move {
            let (name, data): (String, Arc<[u8]>) = match source {
                ImageSource::Path(path) => {
                    let bytes = tokio::fs::read(&path).await.map_err(|e| {
                        UpscaleError::Decode(format!("cannot read {}: {e}", path.display()))
                    })?;
                    (path.display().to_string(), bytes.into())
                }
                ImageSource::Bytes { name, data } => (name, data),
            };

            debug!(source = %name, bytes = data.len(), "Decoding input image");
            // Decoding is CPU-bound; keep it off the async workers.
            tokio::task::spawn_blocking(move || decode_bytes(&data))
                .await
                .context("image decode worker failed")?
        })
    }
}

pub fn decode_bytes(data: &[u8]) -> Result<ImageBuffer> {
    if data.is_empty() {
        return Err(UpscaleError::Decode("input image data is empty".to_string()).into());
    }
    let image =
        image::load_from_memory(data).map_err(|e| UpscaleError::Decode(e.to_string()))?;
    Ok(ImageBuffer::from_dynamic(&image))
}
