//! Conversion Flow (load → scale2x → upscale for one input) and the list of
//! flows a front end is tracking.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{ImageSource, SharedDecoder};
use crate::image_buffer::ImageBuffer;
use crate::resample;
use crate::task::{Task, TaskFailure, TaskStatus};
use crate::tiling::{TilingConfig, PRESCALE_FACTOR};
use crate::upscale_task::UpscaleTask;
use crate::upscaler::SharedUpscaler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Load,
    Scale2x,
    Upscale,
}

impl StageId {
    /// Execution order.
    pub const ALL: [StageId; 3] = [StageId::Load, StageId::Scale2x, StageId::Upscale];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Scale2x => "scale2x",
            Self::Upscale => "upscale",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct FlowState {
    load: Option<Task<ImageBuffer>>,
    scale2x: Option<Task<ImageBuffer>>,
    upscale: Option<UpscaleTask>,
    current: Option<StageId>,
    selected: Option<StageId>,
}

pub struct ConversionFlow {
    id: Uuid,
    source: ImageSource,
    decoder: SharedDecoder,
    upscaler: SharedUpscaler,
    tiling: TilingConfig,
    state: Mutex<FlowState>,
    running: AtomicBool,
    revision: watch::Sender<u64>,
    list: Weak<ListInner>,
}

impl fmt::Debug for ConversionFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionFlow")
            .field("id", &self.id)
            .field("source", &self.source.display_name())
            .field("current_stage", &self.current_stage())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Clears the running flag on every exit path of [`ConversionFlow::run`].
struct RunningGuard<'a> {
    flow: &'a ConversionFlow,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flow.running.store(false, Ordering::SeqCst);
        self.flow.notify();
    }
}

impl ConversionFlow {
    /// A flow that is not registered in any [`ConversionList`]; `close()` on
    /// it is always a no-op.
    pub fn new(
        source: ImageSource,
        decoder: SharedDecoder,
        upscaler: SharedUpscaler,
        tiling: TilingConfig,
    ) -> Arc<Self> {
        Self::build(source, decoder, upscaler, tiling, Weak::new())
    }

    fn build(
        source: ImageSource,
        decoder: SharedDecoder,
        upscaler: SharedUpscaler,
        tiling: TilingConfig,
        list: Weak<ListInner>,
    ) -> Arc<Self> {
        let (revision, _) = watch::channel(0);
        Arc::new(Self {
            id: Uuid::new_v4(),
            source,
            decoder,
            upscaler,
            tiling,
            state: Mutex::new(FlowState::default()),
            running: AtomicBool::new(false),
            revision,
            list,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    pub fn tiling(&self) -> &TilingConfig {
        &self.tiling
    }

    /// Run the three stages in order, stopping at the first failure.
    ///
    /// Stage failures stay in the stage tasks; nothing is returned here.
    /// Calling this while a run is in progress, or after one has finished,
    /// does nothing.
    pub async fn run(&self) {
        if self.claim() {
            self.run_claimed().await;
        }
    }

    /// Set the running flag unless the flow is running or already ran.
    /// A successful claim must be followed by [`Self::run_claimed`].
    fn claim(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!(flow = %self.id, "Conversion already running");
            return false;
        }
        if self.lock().load.is_some() {
            self.running.store(false, Ordering::SeqCst);
            debug!(flow = %self.id, "Conversion already ran");
            return false;
        }
        self.notify();
        true
    }

    async fn run_claimed(&self) {
        let _guard = RunningGuard { flow: self };
        info!(flow = %self.id, source = %self.source.display_name(), "Conversion started");

        let load = Task::new(self.decoder.decode(self.source.clone()));
        self.begin_stage(StageId::Load, |state| state.load = Some(load.clone()));
        let Some(loaded) = self.await_stage(StageId::Load, load.run()).await else {
            return;
        };

        let scale_input = loaded.clone();
        let scale2x = Task::new(async move {
            tokio::task::spawn_blocking(move || {
                resample::upsample_image(&scale_input, PRESCALE_FACTOR)
            })
            .await
            .context("scale2x worker failed")?
        });
        self.begin_stage(StageId::Scale2x, |state| state.scale2x = Some(scale2x.clone()));
        if self
            .await_stage(StageId::Scale2x, scale2x.run())
            .await
            .is_none()
        {
            return;
        }

        let upscale = UpscaleTask::with_config(Arc::clone(&self.upscaler), loaded, self.tiling);
        self.begin_stage(StageId::Upscale, |state| state.upscale = Some(upscale.clone()));
        if self
            .await_stage(StageId::Upscale, upscale.task().run())
            .await
            .is_some()
        {
            info!(flow = %self.id, "Conversion finished");
        }
    }

    /// Store the stage's task and make it current.
    fn begin_stage(&self, stage: StageId, store: impl FnOnce(&mut FlowState)) {
        {
            let mut state = self.lock();
            store(&mut state);
            state.current = Some(stage);
        }
        self.notify();
        info!(flow = %self.id, %stage, "Stage started");
    }

    async fn await_stage(
        &self,
        stage: StageId,
        outcome: impl Future<Output = Result<ImageBuffer, TaskFailure>>,
    ) -> Option<ImageBuffer> {
        let result = outcome.await;
        self.notify();
        match result {
            Ok(image) => {
                info!(
                    flow = %self.id,
                    %stage,
                    width = image.width(),
                    height = image.height(),
                    "Stage finished"
                );
                Some(image)
            }
            Err(failure) => {
                warn!(flow = %self.id, %stage, error = %failure, "Stage failed");
                None
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn can_close(&self) -> bool {
        !self.is_running()
    }

    pub fn current_stage(&self) -> Option<StageId> {
        self.lock().current
    }

    /// The explicitly selected stage, or the current stage if the user never
    /// picked one.
    pub fn selected_stage(&self) -> Option<StageId> {
        let state = self.lock();
        state.selected.or(state.current)
    }

    /// View state only; never affects execution.
    pub fn select_stage(&self, stage: StageId) {
        self.lock().selected = Some(stage);
        self.notify();
    }

    pub fn stage_task(&self, stage: StageId) -> Option<Task<ImageBuffer>> {
        let state = self.lock();
        match stage {
            StageId::Load => state.load.clone(),
            StageId::Scale2x => state.scale2x.clone(),
            StageId::Upscale => state.upscale.as_ref().map(|u| u.task().clone()),
        }
    }

    pub fn stage_status(&self, stage: StageId) -> Option<TaskStatus> {
        self.stage_task(stage).map(|task| task.status())
    }

    pub fn upscale_task(&self) -> Option<UpscaleTask> {
        self.lock().upscale.clone()
    }

    /// Every stage exists and succeeded.
    pub fn all_finished(&self) -> bool {
        StageId::ALL
            .iter()
            .all(|stage| self.stage_status(*stage) == Some(TaskStatus::Success))
    }

    /// The first stage that failed, with its failure.
    pub fn failure(&self) -> Option<(StageId, TaskFailure)> {
        StageId::ALL.iter().find_map(|stage| {
            self.stage_task(*stage)
                .and_then(|task| task.state().failure().cloned())
                .map(|failure| (*stage, failure))
        })
    }

    /// The upscaled image once the whole flow succeeded.
    pub fn output(&self) -> Option<ImageBuffer> {
        self.stage_task(StageId::Upscale)
            .and_then(|task| task.state().result().cloned())
    }

    /// Remove this flow from its list. Returns `false` without effect if the
    /// flow is running or not registered in a list.
    pub fn close(&self) -> bool {
        match self.list.upgrade() {
            Some(inner) => ConversionList { inner }.close_conversion(self),
            None => false,
        }
    }

    /// Ticks on stage starts, stage outcomes, selection and running changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

struct ListInner {
    flows: Mutex<Vec<Arc<ConversionFlow>>>,
    revision: watch::Sender<u64>,
}

/// Flows newest first. Cloning shares the same list.
#[derive(Clone)]
pub struct ConversionList {
    inner: Arc<ListInner>,
}

impl Default for ConversionList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConversionList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionList")
            .field("len", &self.len())
            .finish()
    }
}

impl ConversionList {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(ListInner {
                flows: Mutex::new(Vec::new()),
                revision,
            }),
        }
    }

    /// Create a flow with default tiling, put it at the front and start it.
    pub fn start_conversion(
        &self,
        source: ImageSource,
        decoder: SharedDecoder,
        upscaler: SharedUpscaler,
    ) -> Arc<ConversionFlow> {
        self.start_conversion_with(source, decoder, upscaler, TilingConfig::default())
    }

    /// Must be called within a tokio runtime.
    pub fn start_conversion_with(
        &self,
        source: ImageSource,
        decoder: SharedDecoder,
        upscaler: SharedUpscaler,
        tiling: TilingConfig,
    ) -> Arc<ConversionFlow> {
        let flow = ConversionFlow::build(
            source,
            decoder,
            upscaler,
            tiling,
            Arc::downgrade(&self.inner),
        );
        // running before anyone can see it, so it cannot be closed unstarted
        let claimed = flow.claim();
        self.lock().insert(0, Arc::clone(&flow));
        self.notify();
        debug!(flow = %flow.id(), "Conversion added");

        if claimed {
            let runner = Arc::clone(&flow);
            tokio::spawn(async move { runner.run_claimed().await });
        }
        flow
    }

    /// Remove `flow` if it is in this list and can be closed.
    pub fn close_conversion(&self, flow: &ConversionFlow) -> bool {
        if !flow.can_close() {
            debug!(flow = %flow.id(), "Conversion is running; not closing");
            return false;
        }
        let removed = {
            let mut flows = self.lock();
            let before = flows.len();
            flows.retain(|candidate| candidate.id() != flow.id());
            flows.len() != before
        };
        if removed {
            self.notify();
            debug!(flow = %flow.id(), "Conversion closed");
        }
        removed
    }

    pub fn conversions(&self) -> Vec<Arc<ConversionFlow>> {
        self.lock().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<ConversionFlow>> {
        self.lock().iter().find(|flow| flow.id() == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Ticks when flows are added or removed.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<ConversionFlow>>> {
        self.inner
            .flows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.inner.revision.send_modify(|revision| *revision += 1);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use anyhow::anyhow;
    use ndarray::Array3;
    use tokio::sync::oneshot;

    use super::*;
    use crate::codec::{DecodeFuture, Decoder};
    use crate::error::UpscaleError;
    use crate::upscaler::IdentityUpscaler;

    /// Serves a fixed image, or fails, without touching the filesystem.
    struct StaticDecoder {
        image: Option<ImageBuffer>,
        calls: AtomicUsize,
    }

    impl StaticDecoder {
        fn ok(image: ImageBuffer) -> Arc<Self> {
            Arc::new(Self {
                image: Some(image),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                image: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl Decoder for StaticDecoder {
        fn decode(&self, _source: ImageSource) -> DecodeFuture {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let image = self.image.clone();
            Box::pin(async move {
                image.ok_or_else(|| UpscaleError::Decode("not an image".to_string()).into())
            })
        }
    }

    /// Blocks until released, so tests can observe a running flow.
    struct GatedDecoder {
        image: ImageBuffer,
        gate: Mutex<Option<oneshot::Receiver<()>>>,
    }

    impl Decoder for GatedDecoder {
        fn decode(&self, _source: ImageSource) -> DecodeFuture {
            let image = self.image.clone();
            let gate = self.gate.lock().unwrap().take();
            Box::pin(async move {
                if let Some(gate) = gate {
                    gate.await.map_err(|_| anyhow!("gate dropped"))?;
                }
                Ok(image)
            })
        }
    }

    fn gradient(width: usize, height: usize) -> ImageBuffer {
        ImageBuffer::from_tensor(Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
            ((x + 2 * y + c) % 11) as f32 / 10.0
        }))
    }

    fn source() -> ImageSource {
        ImageSource::bytes("test.png", vec![0u8])
    }

    #[test]
    fn test_stage_ids_serialize_snake_case() {
        assert_eq!(serde_json::to_string(&StageId::Scale2x).unwrap(), "\"scale2x\"");
        assert_eq!(StageId::Upscale.to_string(), "upscale");
        assert_eq!(StageId::ALL[0], StageId::Load);
    }

    #[tokio::test]
    async fn test_flow_runs_all_stages() {
        let flow = ConversionFlow::new(
            source(),
            StaticDecoder::ok(gradient(20, 12)),
            Arc::new(IdentityUpscaler),
            TilingConfig::default(),
        );
        assert_eq!(flow.current_stage(), None);
        assert!(flow.stage_task(StageId::Load).is_none());

        flow.run().await;

        assert!(flow.all_finished());
        assert!(!flow.is_running());
        assert!(flow.can_close());
        assert_eq!(flow.current_stage(), Some(StageId::Upscale));
        assert_eq!(flow.selected_stage(), Some(StageId::Upscale));
        assert!(flow.failure().is_none());

        let scaled = flow.stage_task(StageId::Scale2x).unwrap().state();
        assert_eq!(scaled.result().unwrap().dimensions(), (40, 24));
        assert_eq!(flow.output().unwrap().dimensions(), (40, 24));
        assert_eq!(flow.upscale_task().unwrap().progress(), 100.0);
    }

    #[tokio::test]
    async fn test_load_failure_stops_later_stages() {
        let flow = ConversionFlow::new(
            source(),
            StaticDecoder::failing(),
            Arc::new(IdentityUpscaler),
            TilingConfig::default(),
        );
        flow.run().await;

        assert_eq!(flow.stage_status(StageId::Load), Some(TaskStatus::Failure));
        assert!(flow.stage_task(StageId::Scale2x).is_none());
        assert!(flow.stage_task(StageId::Upscale).is_none());
        assert!(!flow.all_finished());
        assert!(!flow.is_running());

        let (stage, failure) = flow.failure().unwrap();
        assert_eq!(stage, StageId::Load);
        assert!(matches!(
            failure.downcast_ref::<UpscaleError>(),
            Some(UpscaleError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_selection_is_view_state_only() {
        let flow = ConversionFlow::new(
            source(),
            StaticDecoder::ok(gradient(8, 8)),
            Arc::new(IdentityUpscaler),
            TilingConfig::default(),
        );
        flow.select_stage(StageId::Load);
        flow.run().await;

        assert_eq!(flow.selected_stage(), Some(StageId::Load));
        assert_eq!(flow.current_stage(), Some(StageId::Upscale));
        assert!(flow.all_finished());
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let decoder = StaticDecoder::ok(gradient(8, 8));
        let flow = ConversionFlow::new(
            source(),
            decoder.clone(),
            Arc::new(IdentityUpscaler),
            TilingConfig::default(),
        );
        flow.run().await;
        flow.run().await;
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 1);
        assert!(flow.all_finished());
    }

    #[tokio::test]
    async fn test_unregistered_flow_close_is_no_op() {
        let flow = ConversionFlow::new(
            source(),
            StaticDecoder::ok(gradient(8, 8)),
            Arc::new(IdentityUpscaler),
            TilingConfig::default(),
        );
        assert!(!flow.close());
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let list = ConversionList::new();
        let first = list.start_conversion(
            source(),
            StaticDecoder::ok(gradient(8, 8)),
            Arc::new(IdentityUpscaler),
        );
        let second = list.start_conversion(
            source(),
            StaticDecoder::ok(gradient(8, 8)),
            Arc::new(IdentityUpscaler),
        );

        let ids: Vec<Uuid> = list.conversions().iter().map(|f| f.id()).collect();
        assert_eq!(ids, vec![second.id(), first.id()]);
        assert_eq!(list.get(first.id()).unwrap().id(), first.id());
    }

    #[tokio::test]
    async fn test_close_immediately_after_start_is_refused() {
        let list = ConversionList::new();
        let flow = list.start_conversion(
            source(),
            StaticDecoder::ok(gradient(8, 8)),
            Arc::new(IdentityUpscaler),
        );

        assert!(flow.is_running());
        assert!(!flow.can_close());
        assert!(!list.close_conversion(&flow));
        assert!(!flow.close());
        assert_eq!(list.len(), 1);

        let mut revisions = flow.subscribe();
        revisions.wait_for(|_| !flow.is_running()).await.unwrap();
        assert!(flow.all_finished());
        assert!(list.close_conversion(&flow));
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_flow_upscales_single_channel_source() {
        let gray = ImageBuffer::from_tensor(Array3::from_shape_fn((96, 96, 1), |(y, x, _)| {
            ((x * 7 + y * 3) % 17) as f32 / 16.0
        }));
        let flow = ConversionFlow::new(
            source(),
            StaticDecoder::ok(gray.clone()),
            Arc::new(IdentityUpscaler),
            TilingConfig::default(),
        );
        flow.run().await;

        assert!(flow.all_finished());
        let output = flow.output().unwrap();
        assert_eq!(output.dimensions(), (192, 192));
        assert_eq!(output.channels(), 1);
        assert_eq!(output, resample::upsample_image(&gray, 2).unwrap());
    }

    #[tokio::test]
    async fn test_running_flow_cannot_be_closed() {
        let (release, gate) = oneshot::channel();
        let decoder = Arc::new(GatedDecoder {
            image: gradient(8, 8),
            gate: Mutex::new(Some(gate)),
        });
        let list = ConversionList::new();
        let flow = list.start_conversion(source(), decoder, Arc::new(IdentityUpscaler));

        // let the spawned run reach the gated decode
        let mut revisions = flow.subscribe();
        revisions
            .wait_for(|_| flow.current_stage() == Some(StageId::Load))
            .await
            .unwrap();
        assert!(flow.is_running());
        assert!(!flow.can_close());
        assert!(!list.close_conversion(&flow));
        assert!(!flow.close());
        assert_eq!(list.len(), 1);

        release.send(()).unwrap();
        revisions.wait_for(|_| !flow.is_running()).await.unwrap();
        assert!(flow.all_finished());
        assert!(flow.close());
        assert!(list.is_empty());
        // already removed
        assert!(!list.close_conversion(&flow));
    }
}
