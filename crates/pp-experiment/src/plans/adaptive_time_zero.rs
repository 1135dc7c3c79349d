//! Time-zero search with adaptive refinement.
//!
//! A coarse sweep from `start` to `stop` (ps) reads one scalar per delay.
//! Afterwards the sorted curve is inspected: wherever two neighbours differ
//! by more than `max_diff` of the curve's peak-to-peak range and are still
//! more than `min_step` apart, the midpoint is measured next. The scan ends
//! when no such gap is left.

use crate::cam::Cam;
use crate::delay_line::DelayLine;
use crate::scan::{Progress, ScanContext, ScanSteps};
use async_trait::async_trait;
use ndarray::Array1;
use parking_lot::RwLock;
use pp_core::error::{PpError, PpResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Upper bound on the coarse sweep length.
pub const MAX_COARSE_POINTS: usize = 10_000;

/// Scalar taken from the differential signal at each delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    #[default]
    Mean,
    Max,
    PeakToPeak,
}

impl ReadMode {
    pub fn reduce(self, signal: &Array1<f64>) -> f64 {
        if signal.is_empty() {
            return 0.0;
        }
        let max = signal.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        let min = signal.fold(f64::INFINITY, |acc, &v| acc.min(v));
        match self {
            ReadMode::Mean => signal.mean().unwrap_or(0.0),
            ReadMode::Max => max,
            ReadMode::PeakToPeak => max - min,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveTimeZeroConfig {
    /// Sweep start in ps.
    pub start: f64,
    /// Sweep end in ps (exclusive).
    pub stop: f64,
    /// Coarse step in ps.
    pub step: f64,
    pub shots: usize,
    /// Largest allowed jump between neighbours, as a fraction of the
    /// peak-to-peak range.
    pub max_diff: f64,
    /// Smallest spacing in ps that is still refined.
    pub min_step: f64,
    pub mode: ReadMode,
}

impl Default for AdaptiveTimeZeroConfig {
    fn default() -> Self {
        Self {
            start: -5.0,
            stop: 5.0,
            step: 0.2,
            shots: 100,
            max_diff: 0.3,
            min_step: 0.05,
            mode: ReadMode::Mean,
        }
    }
}

impl AdaptiveTimeZeroConfig {
    pub fn validate(&self) -> PpResult<()> {
        let finite = [self.start, self.stop, self.step, self.max_diff, self.min_step]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(PpError::Configuration("non-finite sweep parameter".into()));
        }
        if self.step <= 0.0 || self.min_step <= 0.0 || self.max_diff <= 0.0 {
            return Err(PpError::Configuration(
                "step, min_step and max_diff must be positive".into(),
            ));
        }
        if self.stop <= self.start {
            return Err(PpError::Configuration(format!(
                "stop ({}) must be greater than start ({})",
                self.stop, self.start
            )));
        }
        if self.shots == 0 {
            return Err(PpError::Configuration("shots must be positive".into()));
        }
        let points = ((self.stop - self.start) / self.step).ceil();
        if points > MAX_COARSE_POINTS as f64 {
            return Err(PpError::Configuration(format!(
                "coarse sweep has {} points, limit is {}",
                points, MAX_COARSE_POINTS
            )));
        }
        Ok(())
    }

    /// `start, start + step, ...` below `stop`.
    pub fn coarse_positions(&self) -> Vec<f64> {
        let n = ((self.stop - self.start) / self.step).ceil().max(0.0) as usize;
        (0..n).map(|i| self.start + i as f64 * self.step).collect()
    }
}

/// Midpoint of the first gap worth refining in a curve sorted by position.
pub fn find_hole(points: &[(f64, f64)], max_diff: f64, min_step: f64) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let max = points.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
    let min = points.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
    let ptp = max - min;
    if ptp <= 0.0 || !ptp.is_finite() {
        return None;
    }
    points.windows(2).find_map(|pair| {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        let jump = ((y1 - y0) / ptp).abs();
        (jump > max_diff && x1 - x0 > min_step).then_some((x0 + x1) / 2.0)
    })
}

/// Access to the measured curve that outlives the boxed plan.
#[derive(Clone)]
pub struct TimeZeroHandle {
    delay_line: Arc<DelayLine>,
    points: Arc<RwLock<Vec<(f64, f64)>>>,
}

impl TimeZeroHandle {
    /// Measured `(position_ps, value)` pairs sorted by position.
    pub fn data(&self) -> Vec<(f64, f64)> {
        let mut data = self.points.read().clone();
        data.sort_by(|a, b| a.0.total_cmp(&b.0));
        data
    }

    /// Position with the largest absolute value.
    pub fn peak_position(&self) -> Option<f64> {
        self.points
            .read()
            .iter()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|p| p.0)
    }

    /// Move to `pos_ps`, make it time zero and shift the curve accordingly.
    pub async fn set_zero_pos(&self, pos_ps: f64) -> anyhow::Result<()> {
        self.delay_line.set_pos(pos_ps * 1000.0, true).await?;
        self.delay_line.set_home().await?;
        for point in self.points.write().iter_mut() {
            point.0 -= pos_ps;
        }
        Ok(())
    }
}

pub struct AdaptiveTimeZeroPlan {
    name: String,
    cam: Arc<Cam>,
    delay_line: Arc<DelayLine>,
    config: AdaptiveTimeZeroConfig,
    queue: VecDeque<f64>,
    points: Arc<RwLock<Vec<(f64, f64)>>>,
    saved_shots: Option<usize>,
    saved_pos: Option<f64>,
}

impl AdaptiveTimeZeroPlan {
    pub fn new(
        name: impl Into<String>,
        cam: Arc<Cam>,
        delay_line: Arc<DelayLine>,
        config: AdaptiveTimeZeroConfig,
    ) -> PpResult<Self> {
        config.validate()?;
        Ok(Self {
            name: name.into(),
            cam,
            delay_line,
            config,
            queue: VecDeque::new(),
            points: Arc::new(RwLock::new(Vec::new())),
            saved_shots: None,
            saved_pos: None,
        })
    }

    pub fn handle(&self) -> TimeZeroHandle {
        TimeZeroHandle {
            delay_line: self.delay_line.clone(),
            points: self.points.clone(),
        }
    }

    pub fn data(&self) -> Vec<(f64, f64)> {
        self.handle().data()
    }

    fn next_position(&mut self) -> Option<f64> {
        if let Some(pos) = self.queue.pop_front() {
            return Some(pos);
        }
        let hole = find_hole(&self.data(), self.config.max_diff, self.config.min_step);
        if let Some(pos) = hole {
            tracing::debug!(plan = %self.name, pos_ps = pos, "Refining");
        }
        hole
    }
}

#[async_trait]
impl ScanSteps for AdaptiveTimeZeroPlan {
    fn name(&self) -> &str {
        &self.name
    }

    fn shorthand(&self) -> &str {
        "atz"
    }

    /// One coarse sweep plus its refinement.
    fn default_max_scan(&self) -> usize {
        1
    }

    fn meta(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(&self.config) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    async fn setup_plan(&mut self, _ctx: &mut ScanContext) -> anyhow::Result<Progress> {
        self.saved_shots = Some(self.cam.shots().await);
        self.saved_pos = Some(self.delay_line.refresh_pos().await?);
        self.cam.set_shots(self.config.shots).await?;
        Ok(Progress::Complete)
    }

    async fn pre_scan(&mut self, _ctx: &mut ScanContext) -> anyhow::Result<Progress> {
        self.points.write().clear();
        self.queue = self.config.coarse_positions().into();
        Ok(Progress::Complete)
    }

    async fn scan(&mut self, ctx: &mut ScanContext) -> anyhow::Result<Progress> {
        let Some(pos) = self.next_position() else {
            return Ok(Progress::Complete);
        };

        ctx.tracker.start_point();
        self.delay_line.set_pos(pos * 1000.0, true).await?;
        let processed = self.cam.update().await?;
        let value = self.config.mode.reduce(&processed.differential_signal);

        let point = {
            let mut points = self.points.write();
            points.push((pos, value));
            points.len() - 1
        };
        ctx.step_done(point);
        Ok(Progress::Yield)
    }

    async fn post_plan(&mut self, _ctx: &mut ScanContext) -> anyhow::Result<Progress> {
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
        match first_err {
            Some(e) => Err(e),
            None => Ok(Progress::Complete),
        }
    }
}
