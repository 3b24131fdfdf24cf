//! Weighted acquisition progress
//!
//! Each stage contributes a fixed share of the overall figure. Skipped stages
//! count as complete. Overall progress never moves backwards, even when a
//! download retry restarts a file.

use std::time::Duration;

use common::types::LifecycleStage;
use model_manager::BatchProgress;

/// Share of each stage in the overall progress, in execution order
pub const STAGE_WEIGHTS: [(LifecycleStage, f64); 6] = [
    (LifecycleStage::Discovery, 2.0),
    (LifecycleStage::Downloading, 70.0),
    (LifecycleStage::Extracting, 8.0),
    (LifecycleStage::Validating, 8.0),
    (LifecycleStage::Initializing, 2.0),
    (LifecycleStage::Loading, 10.0),
];

fn total_weight() -> f64 {
    STAGE_WEIGHTS.iter().map(|(_, weight)| weight).sum()
}

/// Overall progress of one acquisition
#[derive(Debug, Clone, PartialEq)]
pub struct OverallProgress {
    /// Weighted completion in `[0, 1]`
    pub fraction: f64,
    /// Stage currently running
    pub stage: Option<LifecycleStage>,
    /// Completion of the current stage in `[0, 1]`
    pub stage_fraction: f64,
    /// Bytes downloaded so far
    pub bytes_downloaded: u64,
    /// Total bytes to download, once known
    pub bytes_total: Option<u64>,
    /// Estimated time until the download completes
    pub eta: Option<Duration>,
}

impl OverallProgress {
    pub fn percent(&self) -> f64 {
        self.fraction * 100.0
    }
}

impl Default for OverallProgress {
    fn default() -> Self {
        Self {
            fraction: 0.0,
            stage: None,
            stage_fraction: 0.0,
            bytes_downloaded: 0,
            bytes_total: None,
            eta: None,
        }
    }
}

/// Accumulates stage progress for one acquisition
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    /// Completion per stage, indexed by `LifecycleStage::index`
    stages: [f64; 6],
    current: Option<LifecycleStage>,
    bytes_downloaded: u64,
    bytes_total: Option<u64>,
    bytes_per_second: f64,
    high_water: f64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a stage; every earlier stage counts as complete
    pub fn enter(&mut self, stage: LifecycleStage) {
        for earlier in &mut self.stages[..stage.index()] {
            *earlier = 1.0;
        }
        self.current = Some(stage);
    }

    /// Marks a stage as skipped
    pub fn skip(&mut self, stage: LifecycleStage) {
        self.stages[stage.index()] = 1.0;
    }

    /// Sets the completion of a stage
    pub fn update(&mut self, stage: LifecycleStage, fraction: f64) {
        self.stages[stage.index()] = fraction.clamp(0.0, 1.0);
    }

    /// Records download progress
    pub fn record_download(&mut self, batch: &BatchProgress) {
        self.update(LifecycleStage::Downloading, batch.fraction);
        self.bytes_downloaded = batch.received_bytes;
        self.bytes_total = (batch.expected_bytes > 0).then_some(batch.expected_bytes);
        self.bytes_per_second = batch.bytes_per_second;
    }

    /// Marks every stage as complete
    pub fn complete(&mut self) {
        self.stages = [1.0; 6];
        self.current = None;
    }

    pub fn snapshot(&mut self) -> OverallProgress {
        let weighted: f64 = STAGE_WEIGHTS
            .iter()
            .map(|(stage, weight)| weight * self.stages[stage.index()])
            .sum();
        self.high_water = self.high_water.max(weighted / total_weight()).min(1.0);

        OverallProgress {
            fraction: self.high_water,
            stage: self.current,
            stage_fraction: self.current.map(|stage| self.stages[stage.index()]).unwrap_or(0.0),
            bytes_downloaded: self.bytes_downloaded,
            bytes_total: self.bytes_total,
            eta: self.eta(),
        }
    }

    fn eta(&self) -> Option<Duration> {
        if self.current != Some(LifecycleStage::Downloading) || self.bytes_per_second <= 0.0 {
            return None;
        }
        let remaining = self.bytes_total?.saturating_sub(self.bytes_downloaded);
        // an absurd Content-Length can exceed Duration::MAX
        Duration::try_from_secs_f64(remaining as f64 / self.bytes_per_second).ok()
    }
}
