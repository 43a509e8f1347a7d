//! One tile through the external upscaler.

use anyhow::Context;
use tracing::debug;

use crate::error::UpscaleError;
use crate::image_buffer::ImageBuffer;
use crate::task::{Task, TaskFailure, TaskState, TaskStatus};
use crate::upscaler::SharedUpscaler;

/// Upscales a `2 * patch_size` tile and keeps its `patch_size` center.
#[derive(Clone, Debug)]
pub struct PatchUpscaleTask {
    original: ImageBuffer,
    task: Task<ImageBuffer>,
}

impl PatchUpscaleTask {
    /// `tile` is the oversized model input; `original` is the matching
    /// `patch_size` region before upscaling, shown while the tile is pending.
    pub fn new(
        upscaler: SharedUpscaler,
        tile: ImageBuffer,
        patch_size: usize,
        original: ImageBuffer,
    ) -> Self {
        let task = Task::new(async move {
            let (tile_w, tile_h) = tile.dimensions();
            let output = upscaler
                .upscale(tile)
                .await
                .with_context(|| format!("upscaler '{}' failed on a tile", upscaler.name()))?;

            if output.dimensions() != (tile_w, tile_h) {
                return Err(UpscaleError::Conversion(format!(
                    "upscaler '{}' returned {}x{} for a {tile_w}x{tile_h} tile",
                    upscaler.name(),
                    output.width(),
                    output.height()
                ))
                .into());
            }

            let cropped = output.crop_border(patch_size / 2)?;
            debug!(
                width = cropped.width(),
                height = cropped.height(),
                "Tile upscaled"
            );
            Ok(cropped)
        });

        Self { original, task }
    }

    pub fn original(&self) -> &ImageBuffer {
        &self.original
    }

    pub fn task(&self) -> &Task<ImageBuffer> {
        &self.task
    }

    pub fn state(&self) -> TaskState<ImageBuffer> {
        self.task.state()
    }

    pub fn status(&self) -> TaskStatus {
        self.task.status()
    }

    pub async fn run(&self) -> Result<ImageBuffer, TaskFailure> {
        self.task.run().await
    }

    /// The upscaled tile once finished, otherwise the original region.
    pub fn display_image(&self) -> ImageBuffer {
        match self.task.state() {
            TaskState::Success(result) => result,
            _ => self.original.clone(),
        }
    }
}
