//! Tiled 2x upscaling engine: tasks, preprocessing, tile dispatch and
//! compositing, plus the conversion flows that drive them.

pub mod codec;
pub mod config;
pub mod conversion;
pub mod error;
pub mod image_buffer;
pub mod logging;
pub mod onnx;
pub mod patch_task;
pub mod resample;
pub mod snapshot;
pub mod task;
pub mod tiling;
pub mod upscale_task;
pub mod upscaler;
