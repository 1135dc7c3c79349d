//! Plan abstraction driven by the controller loop.
//!
//! A plan is a resumable unit of experiment logic. The controller calls
//! [`Plan::make_step`] once per loop iteration; each call performs exactly
//! one unit of work and hands control back, so pause and stop requests are
//! observed between steps without preempting a measurement.
//!
//! # Status
//!
//! ```text
//! Idle ──first step──> Running <──resume/pause──> Paused
//!                         │
//!            ┌────────────┴────────────┐
//!            ▼                         ▼
//!        Finished                   Stopped
//!   (ran to completion)   (stop request or failure)
//! ```
//!
//! Terminal plans answer every further step with [`StepResult::Done`].

use async_trait::async_trait;
use chrono::{DateTime, Local};
use pp_core::error::{DeviceError, PpError, PpResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};

/// Lifecycle status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Idle,
    Running,
    Paused,
    Stopped,
    Finished,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PlanStatus::Stopped | PlanStatus::Finished)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStatus::Idle => write!(f, "idle"),
            PlanStatus::Running => write!(f, "running"),
            PlanStatus::Paused => write!(f, "paused"),
            PlanStatus::Stopped => write!(f, "stopped"),
            PlanStatus::Finished => write!(f, "finished"),
        }
    }
}

/// Outcome of one [`Plan::make_step`] call.
#[derive(Debug)]
pub enum StepResult {
    /// More work remains.
    Continue,
    /// The plan is exhausted. This is the normal end, not an error.
    Done,
    /// The plan aborted. Cleanup has already run.
    Failed(anyhow::Error),
}

impl StepResult {
    pub fn is_continue(&self) -> bool {
        matches!(self, StepResult::Continue)
    }
}

/// Notifications emitted by running plans.
///
/// Delivery is fire-and-forget: a plan never waits for listeners and a send
/// without receivers is not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanEvent {
    PlanStarted { name: String },
    ScanStarted { scan: usize },
    StepDone { scan: usize, point: usize },
    ScanFinished { scan: usize },
    PlanFinished { status: PlanStatus },
    PlanStopped,
}

/// Descriptive metadata of one plan run.
#[derive(Debug, Clone, Serialize)]
pub struct PlanMeta {
    pub uid: String,
    pub name: String,
    pub shorthand: String,
    pub creation_time: DateTime<Local>,
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl PlanMeta {
    pub fn new(name: impl Into<String>, shorthand: impl Into<String>) -> Self {
        Self {
            uid: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            shorthand: shorthand.into(),
            creation_time: Local::now(),
            meta: serde_json::Map::new(),
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Map<String, serde_json::Value>) -> Self {
        self.meta = meta;
        self
    }

    /// File name stem shared by every output of this run,
    /// e.g. `"24-03-01 14_05 Sample A.pp"`.
    pub fn file_stem(&self) -> String {
        format!(
            "{} {}.{}",
            self.creation_time.format("%y-%m-%d %H_%M"),
            self.name,
            self.shorthand
        )
    }

    /// Write the metadata as `<dir>/<file_stem>.json`.
    pub fn save_meta(&self, dir: impl AsRef<Path>) -> PpResult<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.json", self.file_stem()));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        tracing::debug!(path = %path.display(), "Plan metadata saved");
        Ok(path)
    }
}

/// Wall-clock bookkeeping of a run: total, per-scan and per-point durations.
#[derive(Debug, Clone, Default)]
pub struct TimeTracker {
    plan_start: Option<Instant>,
    scan_start: Option<Instant>,
    point_start: Option<Instant>,
    last_scan: Option<Duration>,
    last_point: Option<Duration>,
    points: u64,
    point_total: Duration,
}

impl TimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_plan(&mut self) {
        self.plan_start = Some(Instant::now());
    }

    pub fn start_scan(&mut self) {
        self.scan_start = Some(Instant::now());
    }

    pub fn finish_scan(&mut self) {
        if let Some(start) = self.scan_start.take() {
            self.last_scan = Some(start.elapsed());
        }
    }

    pub fn start_point(&mut self) {
        self.point_start = Some(Instant::now());
    }

    pub fn finish_point(&mut self) {
        if let Some(start) = self.point_start.take() {
            let elapsed = start.elapsed();
            self.last_point = Some(elapsed);
            self.points += 1;
            self.point_total += elapsed;
        }
    }

    pub fn total(&self) -> Duration {
        self.plan_start
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }

    pub fn last_scan(&self) -> Option<Duration> {
        self.last_scan
    }

    pub fn last_point(&self) -> Option<Duration> {
        self.last_point
    }

    pub fn mean_point(&self) -> Option<Duration> {
        u32::try_from(self.points)
            .ok()
            .filter(|&n| n > 0)
            .map(|n| self.point_total / n)
    }

    /// Human readable summary for status displays.
    pub fn summary(&self) -> String {
        let mut s = format!("Total time: {}", format_duration(self.total()));
        if let Some(point) = self.last_point {
            s.push_str(&format!("\nTime per point: {}", format_duration(point)));
        }
        if let Some(scan) = self.last_scan {
            s.push_str(&format!("\nTime per scan: {}", format_duration(scan)));
        }
        s
    }
}

/// `H:MM:SS.ss`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    let hours = (secs / 3600.0).floor();
    let minutes = ((secs - hours * 3600.0) / 60.0).floor();
    let seconds = secs - hours * 3600.0 - minutes * 60.0;
    format!("{}:{:02}:{:05.2}", hours as u64, minutes as u64, seconds)
}

/// A resumable unit of experiment logic.
///
/// Implementations must keep each [`make_step`](Plan::make_step) bounded by
/// one hardware operation: waits on motion or acquisition are expressed as
/// repeated steps that poll, never as blocking loops.
#[async_trait]
pub trait Plan: Send {
    fn name(&self) -> &str;

    /// Short tag used as file extension of outputs, e.g. `"pp"`.
    fn shorthand(&self) -> &str;

    fn meta(&self) -> &PlanMeta;

    fn status(&self) -> PlanStatus;

    /// Perform exactly one unit of work.
    async fn make_step(&mut self) -> StepResult;

    /// Ask the plan to wind down. Honored at the next step boundary;
    /// cleanup still runs.
    fn request_stop(&mut self);

    /// Mark the plan paused or running. Ignored in terminal states.
    fn set_paused(&mut self, paused: bool);

    fn subscribe(&self) -> broadcast::Receiver<PlanEvent>;

    fn time_tracker(&self) -> &TimeTracker;
}

/// Convert an adapter error into the library error type, keeping structured
/// device errors intact.
pub fn into_pp_error(err: anyhow::Error) -> PpError {
    match err.downcast::<DeviceError>() {
        Ok(device) => PpError::Device(device),
        Err(other) => PpError::Plan(format!("{:#}", other)),
    }
}
