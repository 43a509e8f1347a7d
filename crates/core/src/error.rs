//! Error taxonomy for the upscale engine.
//!
//! Library functions return `anyhow::Result`; the variants below are wrapped
//! inside it so callers can `downcast_ref::<UpscaleError>()` when they need
//! to tell a decode failure from a model failure.

#[derive(Debug, thiserror::Error)]
pub enum UpscaleError {
    /// The input could not be read or parsed as an image.
    #[error("failed to decode image: {0}")]
    Decode(String),

    /// The external upscaler rejected or failed on an image.
    #[error("upscaler failed: {0}")]
    Conversion(String),

    /// Tiling geometry does not line up (misconfigured padding or factors).
    #[error("invalid tiling geometry: {0}")]
    Geometry(String),

    /// A crop / composite region falls outside the image.
    #[error(
        "region {width}x{height} at ({x}, {y}) is outside image bounds {image_width}x{image_height}"
    )]
    OutOfBounds {
        x: usize,
        y: usize,
        width: usize,
        height: usize,
        image_width: usize,
        image_height: usize,
    },

    /// Two images with different channel counts were combined.
    #[error("channel count mismatch: expected {expected}, got {actual}")]
    ChannelMismatch { expected: usize, actual: usize },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
