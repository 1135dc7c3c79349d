//! Multi-scan plans as an explicit phase machine.
//!
//! [`ScanRunner`] turns a set of [`ScanSteps`] hooks into a [`Plan`]:
//!
//! ```text
//! Setup ─> PreScan ─> Scanning ─> PostScan ─┬─> PreScan   (cur_scan < max_scan)
//!                                           └─> PostPlan ─> Finished
//!
//! stop request:        any phase before PostPlan ─> PostPlan ─> Stopped
//! error in a hook:     PostPlan cleanup, then Failed(error) ─> Stopped
//! ```
//!
//! Each hook call is one unit of work. A hook returns [`Progress::Yield`]
//! while it needs more steps (waiting on a moving stage, polling an
//! offloaded read) and [`Progress::Complete`] once its phase is done.

use crate::plan::{Plan, PlanEvent, PlanMeta, PlanStatus, StepResult, TimeTracker};
use async_trait::async_trait;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Default repeat count for plans that are meant to run until stopped.
pub const DEFAULT_MAX_SCAN: usize = 1_000_000;

/// Result of one hook call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Call the same hook again on the next step.
    Yield,
    /// The phase is done; advance.
    Complete,
}

/// State shared with the hooks of a running scan plan.
pub struct ScanContext {
    /// Zero-based index of the current scan.
    pub cur_scan: usize,
    pub tracker: TimeTracker,
    events: broadcast::Sender<PlanEvent>,
}

impl ScanContext {
    fn new(events: broadcast::Sender<PlanEvent>) -> Self {
        Self {
            cur_scan: 0,
            tracker: TimeTracker::new(),
            events,
        }
    }

    pub fn emit(&self, event: PlanEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Close the current point: stop its timer and announce the new data.
    pub fn step_done(&mut self, point: usize) {
        self.tracker.finish_point();
        self.emit(PlanEvent::StepDone {
            scan: self.cur_scan,
            point,
        });
    }
}

/// Phase hooks of a scan plan.
///
/// Every hook except [`scan`](ScanSteps::scan) completes immediately by
/// default.
#[async_trait]
pub trait ScanSteps: Send {
    fn name(&self) -> &str;

    fn shorthand(&self) -> &str;

    /// Plan parameters recorded with the run metadata.
    fn meta(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::Map::new()
    }

    /// Number of scans when the runner is not given one. Single-pass plans
    /// return 1.
    fn default_max_scan(&self) -> usize {
        DEFAULT_MAX_SCAN
    }

    /// One-time preparation before the first scan.
    async fn setup_plan(&mut self, _ctx: &mut ScanContext) -> anyhow::Result<Progress> {
        Ok(Progress::Complete)
    }

    async fn pre_scan(&mut self, _ctx: &mut ScanContext) -> anyhow::Result<Progress> {
        Ok(Progress::Complete)
    }

    /// The sweep of one scan.
    async fn scan(&mut self, ctx: &mut ScanContext) -> anyhow::Result<Progress>;

    async fn post_scan(&mut self, _ctx: &mut ScanContext) -> anyhow::Result<Progress> {
        Ok(Progress::Complete)
    }

    /// Restore device state and close outputs. Runs on every exit path.
    async fn post_plan(&mut self, _ctx: &mut ScanContext) -> anyhow::Result<Progress> {
        Ok(Progress::Complete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Setup,
    PreScan,
    Scanning,
    PostScan,
    PostPlan,
    Finished,
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanPhase::Setup => write!(f, "setup"),
            ScanPhase::PreScan => write!(f, "pre_scan"),
            ScanPhase::Scanning => write!(f, "scanning"),
            ScanPhase::PostScan => write!(f, "post_scan"),
            ScanPhase::PostPlan => write!(f, "post_plan"),
            ScanPhase::Finished => write!(f, "finished"),
        }
    }
}

/// Drives [`ScanSteps`] through the scan phases.
pub struct ScanRunner<S: ScanSteps> {
    steps: S,
    meta: PlanMeta,
    phase: ScanPhase,
    status: PlanStatus,
    max_scan: usize,
    stop_after_scan: bool,
    stop_requested: bool,
    failure: Option<anyhow::Error>,
    events: broadcast::Sender<PlanEvent>,
    ctx: ScanContext,
}

impl<S: ScanSteps> ScanRunner<S> {
    pub fn new(steps: S) -> Self {
        let (events, _) = broadcast::channel(256);
        let meta = PlanMeta::new(steps.name(), steps.shorthand()).with_meta(steps.meta());
        let max_scan = steps.default_max_scan().max(1);
        Self {
            ctx: ScanContext::new(events.clone()),
            steps,
            meta,
            phase: ScanPhase::Setup,
            status: PlanStatus::Idle,
            max_scan,
            stop_after_scan: false,
            stop_requested: false,
            failure: None,
            events,
        }
    }

    /// Adopt a prepared identity, e.g. one whose file stem already names an
    /// open store. Extra metadata of the steps is kept.
    pub fn with_plan_meta(mut self, meta: PlanMeta) -> Self {
        let extra = std::mem::take(&mut self.meta.meta);
        self.meta = meta;
        self.meta.meta.extend(extra);
        self
    }

    pub fn with_max_scan(mut self, max_scan: usize) -> Self {
        self.max_scan = max_scan.max(1);
        self
    }

    /// Finish after the scan in progress instead of starting another one.
    pub fn stop_after_scan(&mut self) {
        self.stop_after_scan = true;
    }

    pub fn phase(&self) -> ScanPhase {
        self.phase
    }

    pub fn cur_scan(&self) -> usize {
        self.ctx.cur_scan
    }

    pub fn max_scan(&self) -> usize {
        self.max_scan
    }

    pub fn steps(&self) -> &S {
        &self.steps
    }

    pub fn steps_mut(&mut self) -> &mut S {
        &mut self.steps
    }

    fn emit(&self, event: PlanEvent) {
        let _ = self.events.send(event);
    }

    fn begin_scan(&mut self) {
        self.ctx.tracker.start_scan();
        self.emit(PlanEvent::ScanStarted {
            scan: self.ctx.cur_scan,
        });
        debug!(plan = %self.meta.name, scan = self.ctx.cur_scan, "Scan started");
    }

    /// Move to the phase after `self.phase`.
    fn advance(&mut self) {
        self.phase = match self.phase {
            ScanPhase::Setup => {
                self.begin_scan();
                ScanPhase::PreScan
            }
            ScanPhase::PreScan => ScanPhase::Scanning,
            ScanPhase::Scanning => ScanPhase::PostScan,
            ScanPhase::PostScan => {
                self.ctx.tracker.finish_scan();
                self.emit(PlanEvent::ScanFinished {
                    scan: self.ctx.cur_scan,
                });
                info!(
                    plan = %self.meta.name,
                    scan = self.ctx.cur_scan,
                    "Scan finished"
                );
                self.ctx.cur_scan += 1;
                if self.ctx.cur_scan >= self.max_scan || self.stop_after_scan {
                    ScanPhase::PostPlan
                } else {
                    self.begin_scan();
                    ScanPhase::PreScan
                }
            }
            ScanPhase::PostPlan | ScanPhase::Finished => ScanPhase::Finished,
        };
    }

    /// Terminal bookkeeping once `post_plan` is through.
    fn conclude(&mut self, cleanup_error: Option<anyhow::Error>) -> StepResult {
        self.phase = ScanPhase::Finished;

        if let Some(original) = self.failure.take() {
            if let Some(cleanup) = cleanup_error {
                warn!(plan = %self.meta.name, error = %cleanup, "Cleanup after failure failed");
            }
            self.status = PlanStatus::Stopped;
            self.emit(PlanEvent::PlanStopped);
            self.emit(PlanEvent::PlanFinished {
                status: self.status,
            });
            return StepResult::Failed(original);
        }

        if let Some(cleanup) = cleanup_error {
            error!(plan = %self.meta.name, error = %cleanup, "Cleanup failed");
            self.status = PlanStatus::Stopped;
            self.emit(PlanEvent::PlanStopped);
            self.emit(PlanEvent::PlanFinished {
                status: self.status,
            });
            return StepResult::Failed(cleanup);
        }

        self.status = if self.stop_requested {
            self.emit(PlanEvent::PlanStopped);
            PlanStatus::Stopped
        } else {
            PlanStatus::Finished
        };
        self.emit(PlanEvent::PlanFinished {
            status: self.status,
        });
        info!(
            plan = %self.meta.name,
            status = %self.status,
            scans = self.ctx.cur_scan,
            elapsed = ?self.ctx.tracker.total(),
            "Plan ended"
        );
        StepResult::Done
    }
}

#[async_trait]
impl<S: ScanSteps> Plan for ScanRunner<S> {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn shorthand(&self) -> &str {
        &self.meta.shorthand
    }

    fn meta(&self) -> &PlanMeta {
        &self.meta
    }

    fn status(&self) -> PlanStatus {
        self.status
    }

    async fn make_step(&mut self) -> StepResult {
        if self.status.is_terminal() {
            return StepResult::Done;
        }

        if self.status == PlanStatus::Idle {
            if self.stop_requested {
                self.phase = ScanPhase::Finished;
                self.status = PlanStatus::Stopped;
                self.emit(PlanEvent::PlanStopped);
                return StepResult::Done;
            }
            self.ctx.tracker.start_plan();
            self.emit(PlanEvent::PlanStarted {
                name: self.meta.name.clone(),
            });
            info!(plan = %self.meta.name, max_scan = self.max_scan, "Plan started");
        }
        self.status = PlanStatus::Running;

        if self.stop_requested && !matches!(self.phase, ScanPhase::PostPlan | ScanPhase::Finished)
        {
            info!(plan = %self.meta.name, phase = %self.phase, "Stop requested, cleaning up");
            self.phase = ScanPhase::PostPlan;
        }

        let phase = self.phase;
        let ctx = &mut self.ctx;
        let result = match phase {
            ScanPhase::Setup => self.steps.setup_plan(ctx).await,
            ScanPhase::PreScan => self.steps.pre_scan(ctx).await,
            ScanPhase::Scanning => self.steps.scan(ctx).await,
            ScanPhase::PostScan => self.steps.post_scan(ctx).await,
            ScanPhase::PostPlan => self.steps.post_plan(ctx).await,
            ScanPhase::Finished => return self.conclude(None),
        };

        match (phase, result) {
            (_, Ok(Progress::Yield)) => StepResult::Continue,
            (ScanPhase::PostPlan, Ok(Progress::Complete)) => self.conclude(None),
            (ScanPhase::PostPlan, Err(e)) => self.conclude(Some(e)),
            (_, Ok(Progress::Complete)) => {
                self.advance();
                StepResult::Continue
            }
            (phase, Err(e)) => {
                error!(
                    plan = %self.meta.name,
                    phase = %phase,
                    scan = self.ctx.cur_scan,
                    error = %e,
                    "Plan step failed, running cleanup"
                );
                self.failure = Some(e);
                self.phase = ScanPhase::PostPlan;
                StepResult::Continue
            }
        }
    }

    fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    fn set_paused(&mut self, paused: bool) {
        self.status = match (self.status, paused) {
            (PlanStatus::Running, true) => PlanStatus::Paused,
            (PlanStatus::Paused, false) => PlanStatus::Running,
            (status, _) => status,
        };
    }

    fn subscribe(&self) -> broadcast::Receiver<PlanEvent> {
        self.events.subscribe()
    }

    fn time_tracker(&self) -> &TimeTracker {
        &self.ctx.tracker
    }
}
