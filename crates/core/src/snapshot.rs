//! Read-only, serialisable views of conversions for front ends.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversion::{ConversionFlow, StageId};
use crate::task::TaskStatus;
use crate::upscale_task::TileGrid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub id: Uuid,
    pub source: String,
    pub running: bool,
    pub can_close: bool,
    pub all_finished: bool,
    pub current_stage: Option<StageId>,
    pub selected_stage: Option<StageId>,
    pub stages: Vec<StageSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage: StageId,
    /// `None` until the stage has started.
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `(width, height)` of the stage result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_size: Option<(usize, usize)>,
    /// Tile progress in percent; upscale stage only, once the grid exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tiles: Option<TileGridSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileGridSnapshot {
    pub rows: usize,
    pub cols: usize,
    pub created: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Row-major; `None` for slots whose tile was never created.
    pub statuses: Vec<Option<TaskStatus>>,
}

impl TileGridSnapshot {
    pub fn from_grid(grid: &TileGrid) -> Self {
        let statuses: Vec<Option<TaskStatus>> = grid
            .slots()
            .map(|slot| slot.map(|tile| tile.status()))
            .collect();
        let count = |wanted: TaskStatus| {
            statuses
                .iter()
                .filter(|status| **status == Some(wanted))
                .count()
        };

        Self {
            rows: grid.rows(),
            cols: grid.cols(),
            created: statuses.iter().flatten().count(),
            succeeded: count(TaskStatus::Success),
            failed: count(TaskStatus::Failure),
            statuses,
        }
    }
}

impl ConversionFlow {
    pub fn snapshot(&self) -> FlowSnapshot {
        let stages = StageId::ALL
            .iter()
            .map(|stage| self.stage_snapshot(*stage))
            .collect();

        FlowSnapshot {
            id: self.id(),
            source: self.source().display_name(),
            running: self.is_running(),
            can_close: self.can_close(),
            all_finished: self.all_finished(),
            current_stage: self.current_stage(),
            selected_stage: self.selected_stage(),
            stages,
        }
    }

    pub fn stage_snapshot(&self, stage: StageId) -> StageSnapshot {
        let state = self.stage_task(stage).map(|task| task.state());
        let mut snapshot = StageSnapshot {
            stage,
            status: state.as_ref().map(|s| s.status()),
            error: state
                .as_ref()
                .and_then(|s| s.failure())
                .map(|failure| failure.message()),
            output_size: state
                .as_ref()
                .and_then(|s| s.result())
                .map(|image| image.dimensions()),
            progress: None,
            tiles: None,
        };

        if stage == StageId::Upscale {
            if let Some(upscale) = self.upscale_task() {
                let progress = upscale.progress();
                snapshot.progress = (!progress.is_nan()).then_some(progress);
                snapshot.tiles = upscale.grid().as_ref().map(TileGridSnapshot::from_grid);
            }
        }
        snapshot
    }
}
