//! ONNX Runtime upscaler: one `ort::Session` shared by every tile.
//!
//! The model takes and returns an NCHW `f32` RGB tensor in `[0, 1]` with the
//! same spatial size; the 2x enlargement already happened in preprocessing,
//! so the model only restores detail. Alpha, when present, bypasses the
//! model.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Axis, Ix4};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::UpscaleError;
use crate::image_buffer::ImageBuffer;
use crate::upscaler::{UpscaleFuture, Upscaler};

/// Channels the model consumes and produces.
const MODEL_CHANNELS: usize = 3;

/// Execution provider selection. TensorRT falls back to CUDA, and CUDA falls
/// back to CPU, when the runtime libraries are missing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
}

impl InferenceBackend {
    /// Case-insensitive; unknown values map to `Cuda`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            _ => Self::Cuda,
        }
    }
}

impl fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub trt_cache_dir: Option<&'a Path>,
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let load_context = || format!("Failed to load ONNX model: {}", config.model_path.display());

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            let cache_dir = config
                .trt_cache_dir
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(&cache_dir) {
                warn!(
                    dir = %cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            info!(
                cache_dir = %cache_dir.display(),
                "Initializing TensorRT session (first run may take several minutes)"
            );
            let started = Instant::now();
            let session = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(cache_dir.to_string_lossy().to_string())
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(load_context)?;
            info!(
                elapsed_secs = started.elapsed().as_secs_f64(),
                "TensorRT session ready"
            );
            session
        }
        InferenceBackend::Cuda => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!("CUDA EP is not available; inference will fall back to CPU");
            }
            debug!(backend = "cuda", "Building session with CUDA EP");
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(config.model_path)
                .with_context(load_context)?
        }
    };

    Ok(session)
}

pub struct OnnxUpscaler {
    name: String,
    session: Arc<Mutex<Session>>,
    input_name: String,
    output_name: String,
}

impl fmt::Debug for OnnxUpscaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnnxUpscaler")
            .field("name", &self.name)
            .field("input_name", &self.input_name)
            .field("output_name", &self.output_name)
            .finish()
    }
}

impl OnnxUpscaler {
    pub fn load(config: &SessionConfig<'_>) -> Result<Self> {
        debug!(
            model = %config.model_path.display(),
            backend = %config.backend,
            "Loading ONNX upscaling model"
        );
        let session = build_session(config)?;

        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .context("ONNX model has no inputs")?;
        let output_name = session
            .outputs()
            .first()
            .map(|output| output.name().to_string())
            .context("ONNX model has no outputs")?;
        debug!(%input_name, %output_name, "Detected model IO");

        let name = config
            .model_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());

        Ok(Self {
            name,
            session: Arc::new(Mutex::new(session)),
            input_name,
            output_name,
        })
    }
}

impl Upscaler for OnnxUpscaler {
    fn name(&self) -> &str {
        &self.name
    }

    fn upscale(&self, image: ImageBuffer) -> UpscaleFuture {
        let session = Arc::clone(&self.session);
        let input_name = self.input_name.clone();
        let output_name = self.output_name.clone();

        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let input = to_nchw(image.view())?;
                let output = {
                    let mut session = session
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    let input_tensor = Tensor::from_array(input)?;
                    let outputs = session.run(ort::inputs![input_name.as_str() => &input_tensor])?;
                    let output_view = outputs[output_name.as_str()].try_extract_array::<f32>()?;
                    output_view.to_owned()
                };
                let output = output.into_dimensionality::<Ix4>()?;
                from_nchw(output.view(), &image)
            })
            .await
            .context("ONNX inference worker failed")?
        })
    }
}

/// HWC image to a `1 × 3 × H × W` tensor. Grayscale is replicated to RGB and
/// alpha is dropped.
pub fn to_nchw(image: ArrayView3<f32>) -> Result<Array4<f32>> {
    let (h, w, c) = image.dim();
    if !matches!(c, 1 | 3 | 4) {
        return Err(UpscaleError::ChannelMismatch {
            expected: MODEL_CHANNELS,
            actual: c,
        }
        .into());
    }
    let gray = c == 1;
    Ok(Array4::from_shape_fn(
        (1, MODEL_CHANNELS, h, w),
        |(_, ch, y, x)| {
            if gray {
                image[[y, x, 0]]
            } else {
                image[[y, x, ch]]
            }
        },
    ))
}

/// Model output back to an image with `source`'s channel layout. Values are
/// clamped to `[0, 1]`; alpha is copied from `source`, grayscale is the RGB
/// mean.
pub fn from_nchw(output: ArrayView4<f32>, source: &ImageBuffer) -> Result<ImageBuffer> {
    let (n, c, h, w) = output.dim();
    if n != 1 || c != MODEL_CHANNELS {
        return Err(UpscaleError::Conversion(format!(
            "model returned a {n}x{c}x{h}x{w} tensor, expected 1x{MODEL_CHANNELS}xHxW"
        ))
        .into());
    }

    let rgb = output.index_axis(Axis(0), 0);
    let channels = source.channels();
    let same_size = (w, h) == source.dimensions();

    let tensor = match channels {
        1 => Array3::from_shape_fn((h, w, 1), |(y, x, _)| {
            ((rgb[[0, y, x]] + rgb[[1, y, x]] + rgb[[2, y, x]]) / 3.0).clamp(0.0, 1.0)
        }),
        3 | 4 => Array3::from_shape_fn((h, w, channels), |(y, x, ch)| {
            if ch < MODEL_CHANNELS {
                rgb[[ch, y, x]].clamp(0.0, 1.0)
            } else if same_size {
                source.pixel(x, y, ch)
            } else {
                1.0
            }
        }),
        other => {
            return Err(UpscaleError::ChannelMismatch {
                expected: MODEL_CHANNELS,
                actual: other,
            }
            .into())
        }
    };
    Ok(ImageBuffer::from_tensor(tensor))
}
