//! Pump-probe delay scan.
//!
//! Every point is spread over several steps so the controller loop stays
//! responsive:
//!
//! 1. start a non-waiting move to the delay
//! 2. poll `is_moving` once per step until the stage settles
//! 3. launch the camera read on a spawned task
//! 4. poll the task once per step; when done, extract, store and announce
//!
//! Results go to the [`ScanStore`] as `("probe" | "reference" | "signal",
//! scan, point)`. The mean signal across scans is recomputed after each scan.

use crate::cam::Cam;
use crate::delay_line::DelayLine;
use crate::scan::{Progress, ScanContext, ScanSteps};
use crate::storage::{ScanKey, ScanStore};
use anyhow::anyhow;
use async_trait::async_trait;
use ndarray::Array1;
use parking_lot::RwLock;
use pp_core::error::{PpError, PpResult};
use pp_core::reading::DetectorReading;
use pp_core::signal::ProcessedRead;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const PROBE_LINE: &str = "probe";
pub const REFERENCE_LINE: &str = "reference";
pub const SIGNAL_LINE: &str = "signal";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PointStage {
    Move,
    Settle,
    Acquire,
}

/// Live results of a pump-probe run, shared with observers.
#[derive(Debug, Clone, Default)]
pub struct PumpProbeResults {
    pub latest_signal: Option<Array1<f64>>,
    /// Mean signal across finished scans, per delay point.
    pub mean_signals: Vec<Option<Array1<f64>>>,
    pub scans_done: usize,
}

pub struct PumpProbePlan {
    name: String,
    cam: Arc<Cam>,
    delay_line: Arc<DelayLine>,
    delays: Vec<f64>,
    shots: usize,
    store: Box<dyn ScanStore>,

    point: usize,
    stage: PointStage,
    pending: Option<JoinHandle<anyhow::Result<DetectorReading>>>,
    settle_polls: u64,
    saved_shots: Option<usize>,
    saved_pos: Option<f64>,
    results: Arc<RwLock<PumpProbeResults>>,
}

impl PumpProbePlan {
    /// Validate the parameters. Devices are not touched.
    pub fn new(
        name: impl Into<String>,
        cam: Arc<Cam>,
        delay_line: Arc<DelayLine>,
        delays: Vec<f64>,
        shots: usize,
        store: Box<dyn ScanStore>,
    ) -> PpResult<Self> {
        if delays.is_empty() {
            return Err(PpError::Configuration("delay list is empty".into()));
        }
        if let Some(bad) = delays.iter().find(|d| !d.is_finite()) {
            return Err(PpError::Configuration(format!("invalid delay {}", bad)));
        }
        if shots == 0 {
            return Err(PpError::Configuration("shots must be positive".into()));
        }

        Ok(Self {
            name: name.into(),
            cam,
            delay_line,
            results: Arc::new(RwLock::new(PumpProbeResults {
                mean_signals: vec![None; delays.len()],
                ..Default::default()
            })),
            delays,
            shots,
            store,
            point: 0,
            stage: PointStage::Move,
            pending: None,
            settle_polls: 0,
            saved_shots: None,
            saved_pos: None,
        })
    }

    pub fn delays(&self) -> &[f64] {
        &self.delays
    }

    pub fn store(&self) -> &dyn ScanStore {
        self.store.as_ref()
    }

    /// Handle to the live results; stays valid after the plan is boxed.
    pub fn results(&self) -> Arc<RwLock<PumpProbeResults>> {
        self.results.clone()
    }

    pub fn latest_signal(&self) -> Option<Array1<f64>> {
        self.results.read().latest_signal.clone()
    }

    pub fn mean_signal(&self, point: usize) -> Option<Array1<f64>> {
        self.store.mean_across_scans(SIGNAL_LINE, point)
    }

    /// Steps spent waiting for the stage to settle.
    pub fn settle_polls(&self) -> u64 {
        self.settle_polls
    }

    fn record(&mut self, scan: usize, processed: &ProcessedRead) -> anyhow::Result<()> {
        let point = self.point;
        self.store.append(
            ScanKey::new(PROBE_LINE, scan, point),
            processed.probe_mean.clone(),
        )?;
        self.store.append(
            ScanKey::new(REFERENCE_LINE, scan, point),
            processed.reference_mean.clone(),
        )?;
        self.store.append(
            ScanKey::new(SIGNAL_LINE, scan, point),
            processed.differential_signal.clone(),
        )?;
        self.results.write().latest_signal = Some(processed.differential_signal.clone());
        Ok(())
    }
}

#[async_trait]
impl ScanSteps for PumpProbePlan {
    fn name(&self) -> &str {
        &self.name
    }

    fn shorthand(&self) -> &str {
        "pp"
    }

    fn meta(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut meta = serde_json::Map::new();
        meta.insert("delays_fs".into(), serde_json::json!(self.delays));
        meta.insert("shots".into(), serde_json::json!(self.shots));
        meta.insert("camera".into(), serde_json::json!(self.cam.name()));
        meta.insert("delay_line".into(), serde_json::json!(self.delay_line.name()));
        meta
    }

    async fn setup_plan(&mut self, _ctx: &mut ScanContext) -> anyhow::Result<Progress> {
        self.saved_shots = Some(self.cam.shots().await);
        self.saved_pos = Some(self.delay_line.refresh_pos().await?);
        self.cam.set_shots(self.shots).await?;
        Ok(Progress::Complete)
    }

    async fn pre_scan(&mut self, _ctx: &mut ScanContext) -> anyhow::Result<Progress> {
        self.point = 0;
        self.stage = PointStage::Move;
        Ok(Progress::Complete)
    }

    async fn scan(&mut self, ctx: &mut ScanContext) -> anyhow::Result<Progress> {
        let Some(&target) = self.delays.get(self.point) else {
            return Ok(Progress::Complete);
        };

        match self.stage {
            PointStage::Move => {
                ctx.tracker.start_point();
                self.delay_line.set_pos(target, false).await?;
                self.stage = PointStage::Settle;
                Ok(Progress::Yield)
            }
            PointStage::Settle => {
                if self.delay_line.is_moving().await? {
                    self.settle_polls += 1;
                    return Ok(Progress::Yield);
                }
                self.delay_line.refresh_pos().await?;
                let cam = self.cam.clone();
                self.pending = Some(tokio::spawn(async move { cam.read().await }));
                self.stage = PointStage::Acquire;
                Ok(Progress::Yield)
            }
            PointStage::Acquire => {
                if !self.pending.as_ref().map_or(true, |h| h.is_finished()) {
                    return Ok(Progress::Yield);
                }
                let handle = self
                    .pending
                    .take()
                    .ok_or_else(|| anyhow!("no acquisition in flight"))?;
                let reading = handle
                    .await
                    .map_err(|e| anyhow!("acquisition task failed: {}", e))??;
                let processed = self.cam.process(&reading)?;
                self.record(ctx.cur_scan, &processed)?;

                tracing::debug!(
                    plan = %self.name,
                    scan = ctx.cur_scan,
                    point = self.point,
                    delay_fs = target,
                    "Point recorded"
                );
                ctx.step_done(self.point);

                self.point += 1;
                self.stage = PointStage::Move;
                if self.point >= self.delays.len() {
                    Ok(Progress::Complete)
                } else {
                    Ok(Progress::Yield)
                }
            }
        }
    }

    async fn post_scan(&mut self, ctx: &mut ScanContext) -> anyhow::Result<Progress> {
        let means = (0..self.delays.len())
            .map(|point| self.store.mean_across_scans(SIGNAL_LINE, point))
            .collect();
        let mut results = self.results.write();
        results.mean_signals = means;
        results.scans_done = ctx.cur_scan + 1;
        Ok(Progress::Complete)
    }

    async fn post_plan(&mut self, _ctx: &mut ScanContext) -> anyhow::Result<Progress> {
        // An in-flight read finishes on its own; its result is dropped.
        self.pending.take();

        let mut first_err: Option<anyhow::Error> = None;
        if let Some(shots) = self.saved_shots.take() {
            if let Err(e) = self.cam.set_shots(shots).await {
                first_err.get_or_insert(e);
            }
        }
        if let Some(pos) = self.saved_pos.take() {
            if let Err(e) = self.delay_line.set_pos(pos, true).await {
                first_err.get_or_insert(e);
            }
        }
        if let Err(e) = self.store.close() {
            first_err.get_or_insert(e.into());
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(Progress::Complete),
        }
    }
}
