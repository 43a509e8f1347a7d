//! Whole-image upscale: preprocessing, tile dispatch, compositing.
//!
//! The source is enlarged 2x by nearest-neighbor, padded (edge replication)
//! to `size_factor * k + patch_size` on each axis, and phase-aligned by a
//! nearest down/up round trip. The padded image is then cut into overlapping
//! `2 * patch_size` tiles laid out on a `patch_size` grid. Each tile goes
//! through a [`PatchUpscaleTask`]; the `patch_size` centers are composited
//! into an accumulator which is finally center-cropped to twice the source
//! size.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::image_buffer::ImageBuffer;
use crate::patch_task::PatchUpscaleTask;
use crate::resample;
use crate::task::{Task, TaskFailure, TaskState, TaskStatus};
use crate::tiling::{grid_dimensions, tile_origin, TilingConfig, PRESCALE_FACTOR};
use crate::upscaler::SharedUpscaler;

/// Upper bound on tiles whose upscaler call may be outstanding at once.
///
/// Tiles are composited in row-major order and the first failure stops
/// dispatch, so raising this only overlaps model calls; it never reorders the
/// output. A value of one keeps external load to a single call per image and
/// makes progress advance one tile at a time.
pub const MAX_TILES_IN_FLIGHT: usize = 1;

/// Fixed-size arena of tile slots indexed by `(row, col)`.
#[derive(Clone, Debug)]
pub struct TileGrid {
    rows: usize,
    cols: usize,
    slots: Vec<Option<PatchUpscaleTask>>,
}

impl TileGrid {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            slots: vec![None; rows * cols],
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total slot count, created or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&PatchUpscaleTask> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.slots[row * self.cols + col].as_ref()
    }

    /// Slots in row-major order.
    pub fn slots(&self) -> impl Iterator<Item = Option<&PatchUpscaleTask>> {
        self.slots.iter().map(Option::as_ref)
    }

    pub fn created_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn succeeded_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|tile| tile.status() == TaskStatus::Success)
            .count()
    }

    fn insert(&mut self, row: usize, col: usize, tile: PatchUpscaleTask) {
        let index = row * self.cols + col;
        self.slots[index] = Some(tile);
    }
}

#[derive(Default)]
struct TileProgress {
    preview: Option<ImageBuffer>,
    grid: Option<TileGrid>,
}

struct UpscaleShared {
    progress: Mutex<TileProgress>,
    revision: watch::Sender<u64>,
}

impl UpscaleShared {
    fn lock(&self) -> MutexGuard<'_, TileProgress> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, update: impl FnOnce(&mut TileProgress)) {
        update(&mut self.lock());
        self.notify();
    }

    fn notify(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

#[derive(Clone)]
pub struct UpscaleTask {
    task: Task<ImageBuffer>,
    shared: Arc<UpscaleShared>,
    config: TilingConfig,
}

impl UpscaleTask {
    pub fn new(upscaler: SharedUpscaler, source: ImageBuffer) -> Self {
        Self::with_config(upscaler, source, TilingConfig::default())
    }

    pub fn with_config(upscaler: SharedUpscaler, source: ImageBuffer, config: TilingConfig) -> Self {
        let (revision, _) = watch::channel(0);
        let shared = Arc::new(UpscaleShared {
            progress: Mutex::new(TileProgress::default()),
            revision,
        });

        let task = Task::new(run_tiled_upscale(
            upscaler,
            source,
            config,
            Arc::clone(&shared),
        ));

        Self {
            task,
            shared,
            config,
        }
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

    pub fn config(&self) -> &TilingConfig {
        &self.config
    }

    pub fn patch_size(&self) -> usize {
        self.config.patch_size
    }

    /// Preprocessed image with its `patch_size / 2` border trimmed; `None`
    /// until preprocessing finishes.
    pub fn preview(&self) -> Option<ImageBuffer> {
        self.shared.lock().preview.clone()
    }

    /// Snapshot of the tile grid; `None` until preprocessing finishes.
    pub fn grid(&self) -> Option<TileGrid> {
        self.shared.lock().grid.clone()
    }

    /// Percentage of tiles that finished successfully.
    ///
    /// NaN while the grid does not exist yet: the total is unknown, which is
    /// different from zero progress.
    pub fn progress(&self) -> f64 {
        let guard = self.shared.lock();
        match guard.grid.as_ref() {
            Some(grid) if !grid.is_empty() => {
                100.0 * grid.succeeded_count() as f64 / grid.len() as f64
            }
            _ => f64::NAN,
        }
    }

    /// Ticks whenever the preview, the grid, or a tile's outcome changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }
}

/// Steps 1-3 of the pipeline: 2x nearest, edge-pad to alignment, phase align.
pub fn preprocess(source: &ImageBuffer, config: &TilingConfig) -> Result<ImageBuffer> {
    config.validate()?;
    let scaled = resample::upsample_image(source, PRESCALE_FACTOR)?;
    let (w, h) = scaled.dimensions();
    let pad_x = config.padding(w);
    let pad_y = config.padding(h);
    let padded = scaled.pad_edge(pad_y.before, pad_y.after, pad_x.before, pad_x.after);
    resample::align(&padded, config.align_factor)
}

type TileOutcome = Pin<Box<dyn Future<Output = Result<ImageBuffer, TaskFailure>> + Send>>;

/// Bounded FIFO of dispatched tiles. Completions are consumed in dispatch
/// order, which is also compositing order.
struct TileQueue {
    capacity: usize,
    pending: VecDeque<(usize, usize, TileOutcome)>,
}

impl TileQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    fn is_full(&self) -> bool {
        self.pending.len() >= self.capacity
    }

    fn push(&mut self, row: usize, col: usize, outcome: TileOutcome) {
        self.pending.push_back((row, col, outcome));
    }

    async fn next_completed(&mut self) -> Option<(usize, usize, Result<ImageBuffer, TaskFailure>)> {
        let (row, col, outcome) = self.pending.pop_front()?;
        Some((row, col, outcome.await))
    }
}

async fn run_tiled_upscale(
    upscaler: SharedUpscaler,
    source: ImageBuffer,
    config: TilingConfig,
    shared: Arc<UpscaleShared>,
) -> Result<ImageBuffer> {
    let (src_w, src_h) = source.dimensions();
    let patch = config.patch_size;

    let preprocessed = tokio::task::spawn_blocking(move || preprocess(&source, &config))
        .await
        .context("preprocessing worker failed")??;
    let (w, h) = preprocessed.dimensions();
    let (rows, cols) = grid_dimensions(w, h, patch)?;
    let preview = preprocessed.crop_border(patch / 2)?;

    info!(
        source_width = src_w,
        source_height = src_h,
        padded_width = w,
        padded_height = h,
        rows,
        cols,
        upscaler = upscaler.name(),
        "Starting tiled upscale"
    );

    shared.publish(|progress| {
        progress.preview = Some(preview.clone());
        progress.grid = Some(TileGrid::new(rows, cols));
    });

    let mut accumulator = ImageBuffer::zeros(w - patch, h - patch, preprocessed.channels());
    let mut queue = TileQueue::new(MAX_TILES_IN_FLIGHT);

    for row in 0..rows {
        for col in 0..cols {
            while queue.is_full() {
                accumulator = composite_next(&mut queue, accumulator, patch, &shared).await?;
            }

            let (x, y) = tile_origin(row, col, patch);
            let tile = preprocessed.crop(x, y, patch * 2, patch * 2)?;
            let original = preview.crop(x, y, patch, patch)?;
            let tile_task = PatchUpscaleTask::new(Arc::clone(&upscaler), tile, patch, original);

            let outcome = tile_task.task().run();
            shared.publish(|progress| {
                if let Some(grid) = progress.grid.as_mut() {
                    grid.insert(row, col, tile_task.clone());
                }
            });
            debug!(row, col, "Dispatched tile");
            queue.push(row, col, Box::pin(outcome));
        }
    }

    while !queue.pending.is_empty() {
        accumulator = composite_next(&mut queue, accumulator, patch, &shared).await?;
    }

    let result = accumulator.crop_center(src_w * PRESCALE_FACTOR, src_h * PRESCALE_FACTOR)?;
    info!(
        width = result.width(),
        height = result.height(),
        "Tiled upscale finished"
    );
    Ok(result)
}

async fn composite_next(
    queue: &mut TileQueue,
    accumulator: ImageBuffer,
    patch: usize,
    shared: &UpscaleShared,
) -> Result<ImageBuffer> {
    let Some((row, col, outcome)) = queue.next_completed().await else {
        return Ok(accumulator);
    };
    // The tile's own state has already changed; let grid observers know.
    shared.notify();

    let tile = outcome.with_context(|| format!("tile ({row}, {col}) failed"))?;
    let (x, y) = tile_origin(row, col, patch);
    accumulator.composite(&tile, x, y)
}
