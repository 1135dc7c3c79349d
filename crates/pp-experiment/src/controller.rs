//! Controller polling loop.
//!
//! The controller owns the cameras, delay lines and auxiliary devices of a
//! setup and drives them from a single loop. Each [`tick`](Controller::tick)
//! does one of two things:
//!
//! ```text
//!              ┌──────────────── tick ────────────────┐
//!              │                                      │
//!   no plan / paused                            plan active
//!              │                                      │
//!   refresh every camera concurrently          plan.make_step()
//!   and wait for all of them                  ┌──────┼───────┐
//!              │                          Continue   Done   Failed
//!       Refreshed{ok, failed}              Stepped  PlanDone PlanFailed
//!                                                   (paused, plan kept)
//! ```
//!
//! Only one tick runs at a time; an overlapping call returns
//! [`TickOutcome::Skipped`]. Device I/O inside a step is the plan's business.
//! Shutdown is observed between ticks, never inside one.

use crate::cam::Cam;
use crate::delay_line::DelayLine;
use crate::plan::{Plan, PlanStatus, StepResult};
use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use pp_core::capabilities::{PulseShaper, RotationStage, Shutter};
use pp_core::error::{PpError, PpResult};
use pp_core::signal::SignalExtractor;
use pp_hardware::{build_devices, SiteConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

/// Default pause between loop iterations.
pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_millis(10);

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Idle refresh of all cameras finished.
    Refreshed { ok: usize, failed: usize },
    /// One plan step ran and the plan wants more.
    Stepped,
    /// The plan is exhausted; the controller paused.
    PlanDone,
    /// The plan failed; the controller paused and recorded the error.
    PlanFailed,
    /// Another tick was still running.
    Skipped,
}

/// Clears the in-flight flag when a tick ends, including on unwind.
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Controller {
    cams: Vec<Arc<Cam>>,
    delay_lines: Vec<Arc<DelayLine>>,
    shaper: Option<Arc<dyn PulseShaper>>,
    shutter: Option<Arc<dyn Shutter>>,
    rotation_stages: Vec<Arc<dyn RotationStage>>,

    plan: Mutex<Option<Box<dyn Plan>>>,
    paused: AtomicBool,
    running_step: AtomicBool,
    shutdown_requested: AtomicBool,
    interval: Duration,
    last_error: SyncMutex<Option<String>>,
    /// Per camera: whether the last idle refresh failed.
    refresh_failing: Vec<AtomicBool>,
}

impl Controller {
    /// Build a controller over one or two cameras and delay lines.
    ///
    /// A second camera follows the shot count of the first.
    pub fn new(cams: Vec<Arc<Cam>>, delay_lines: Vec<Arc<DelayLine>>) -> PpResult<Self> {
        if cams.is_empty() || cams.len() > 2 {
            return Err(PpError::Configuration(format!(
                "controller needs 1 or 2 cameras, got {}",
                cams.len()
            )));
        }
        if delay_lines.is_empty() || delay_lines.len() > 2 {
            return Err(PpError::Configuration(format!(
                "controller needs 1 or 2 delay lines, got {}",
                delay_lines.len()
            )));
        }
        if let [primary, secondary] = cams.as_slice() {
            primary.add_shots_follower(secondary.clone());
        }

        Ok(Self {
            refresh_failing: cams.iter().map(|_| AtomicBool::new(false)).collect(),
            cams,
            delay_lines,
            shaper: None,
            shutter: None,
            rotation_stages: Vec::new(),
            plan: Mutex::new(None),
            paused: AtomicBool::new(false),
            running_step: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            interval: DEFAULT_LOOP_INTERVAL,
            last_error: SyncMutex::new(None),
        })
    }

    /// Build every device of `config` and wrap it.
    pub async fn from_config(config: &SiteConfig) -> anyhow::Result<Self> {
        let devices = build_devices(config).await?;
        let extractor = SignalExtractor::new(config.signal.odd_shots);

        let mut cams = Vec::with_capacity(devices.cameras.len());
        for camera in devices.cameras {
            cams.push(Arc::new(Cam::new(camera, extractor).await?));
        }
        let mut delay_lines = Vec::with_capacity(devices.delay_lines.len());
        for stage in devices.delay_lines {
            delay_lines.push(Arc::new(DelayLine::new(stage).await?));
        }

        let mut controller = Self::new(cams, delay_lines)?
            .with_rotation_stages(devices.rotation_stages)
            .with_interval(Duration::from_millis(config.application.loop_interval_ms));
        if let Some(shaper) = devices.shaper {
            controller = controller.with_shaper(shaper);
        }
        if let Some(shutter) = devices.shutter {
            controller = controller.with_shutter(shutter);
        }
        info!(
            site = %config.application.name,
            cameras = controller.cams.len(),
            delay_lines = controller.delay_lines.len(),
            "Controller ready"
        );
        Ok(controller)
    }

    pub fn with_shaper(mut self, shaper: Arc<dyn PulseShaper>) -> Self {
        self.shaper = Some(shaper);
        self
    }

    pub fn with_shutter(mut self, shutter: Arc<dyn Shutter>) -> Self {
        self.shutter = Some(shutter);
        self
    }

    pub fn with_rotation_stages(mut self, stages: Vec<Arc<dyn RotationStage>>) -> Self {
        self.rotation_stages = stages;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn cams(&self) -> &[Arc<Cam>] {
        &self.cams
    }

    pub fn cam(&self) -> &Arc<Cam> {
        &self.cams[0]
    }

    pub fn delay_lines(&self) -> &[Arc<DelayLine>] {
        &self.delay_lines
    }

    pub fn delay_line(&self) -> &Arc<DelayLine> {
        &self.delay_lines[0]
    }

    pub fn shaper(&self) -> Option<&Arc<dyn PulseShaper>> {
        self.shaper.as_ref()
    }

    pub fn shutter(&self) -> Option<&Arc<dyn Shutter>> {
        self.shutter.as_ref()
    }

    pub fn rotation_stages(&self) -> &[Arc<dyn RotationStage>] {
        &self.rotation_stages
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    // =========================================================================
    // Plan lifecycle
    // =========================================================================

    /// Install `plan` and let the loop drive it.
    ///
    /// Rejected while another plan is running and not paused. A paused plan
    /// that has not ended is stopped and run through its cleanup first.
    pub async fn start_plan(&self, plan: Box<dyn Plan>) -> PpResult<()> {
        let mut slot = self.plan.lock().await;
        if let Some(current) = slot.as_mut() {
            if current.status() == PlanStatus::Running && !self.is_paused() {
                return Err(PpError::Plan(format!(
                    "plan '{}' is still running",
                    current.name()
                )));
            }
            wind_down(&mut **current).await;
        }
        info!(plan = %plan.name(), uid = %plan.meta().uid, "Plan installed");
        *slot = Some(plan);
        *self.last_error.lock() = None;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stop stepping the plan; the loop falls back to idle refreshes.
    pub async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        if let Some(plan) = self.plan.lock().await.as_mut() {
            plan.set_paused(true);
            info!(plan = %plan.name(), "Plan paused");
        }
    }

    pub async fn resume(&self) -> PpResult<()> {
        let mut slot = self.plan.lock().await;
        let plan = slot
            .as_mut()
            .ok_or_else(|| PpError::Plan("no plan to resume".into()))?;
        plan.set_paused(false);
        self.paused.store(false, Ordering::SeqCst);
        info!(plan = %plan.name(), status = %plan.status(), "Plan resumed");
        Ok(())
    }

    /// Ask the plan to stop. It winds down through its cleanup on the next
    /// ticks, so the controller is unpaused if needed.
    pub async fn stop_plan(&self) -> PpResult<()> {
        let mut slot = self.plan.lock().await;
        let plan = slot
            .as_mut()
            .ok_or_else(|| PpError::Plan("no plan to stop".into()))?;
        plan.request_stop();
        if !plan.status().is_terminal() {
            plan.set_paused(false);
            self.paused.store(false, Ordering::SeqCst);
        }
        info!(plan = %plan.name(), "Plan stop requested");
        Ok(())
    }

    /// Remove the plan. Fails while it is still running; a paused plan is
    /// wound down before it is handed back.
    pub async fn clear_plan(&self) -> PpResult<Option<Box<dyn Plan>>> {
        let mut slot = self.plan.lock().await;
        if let Some(plan) = slot.as_mut() {
            if plan.status() == PlanStatus::Running && !self.is_paused() {
                return Err(PpError::Plan(format!(
                    "plan '{}' is still running",
                    plan.name()
                )));
            }
            wind_down(&mut **plan).await;
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(slot.take())
    }

    pub async fn plan_status(&self) -> Option<PlanStatus> {
        self.plan.lock().await.as_ref().map(|plan| plan.status())
    }

    /// Inspect the installed plan.
    pub async fn with_plan<R>(&self, f: impl FnOnce(&dyn Plan) -> R) -> Option<R> {
        let slot = self.plan.lock().await;
        slot.as_deref().map(f)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Text of the error that halted the last plan.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    // =========================================================================
    // Loop
    // =========================================================================

    pub async fn tick(&self) -> TickOutcome {
        if self.running_step.swap(true, Ordering::SeqCst) {
            return TickOutcome::Skipped;
        }
        let _guard = TickGuard(&self.running_step);

        let mut slot = self.plan.lock().await;
        if slot.is_none() || self.is_paused() {
            drop(slot);
            return self.refresh_cams().await;
        }
        let Some(plan) = slot.as_mut() else {
            return TickOutcome::Skipped;
        };

        match plan.make_step().await {
            StepResult::Continue => TickOutcome::Stepped,
            StepResult::Done => {
                self.paused.store(true, Ordering::SeqCst);
                info!(plan = %plan.name(), status = %plan.status(), "Plan done");
                TickOutcome::PlanDone
            }
            StepResult::Failed(e) => {
                self.paused.store(true, Ordering::SeqCst);
                error!(plan = %plan.name(), error = %e, "Plan failed");
                *self.last_error.lock() = Some(format!("{:#}", e));
                TickOutcome::PlanFailed
            }
        }
    }

    /// Refresh every camera concurrently and wait for all of them.
    async fn refresh_cams(&self) -> TickOutcome {
        let results = join_all(self.cams.iter().map(|cam| cam.update())).await;

        let mut ok = 0;
        let mut failed = 0;
        for ((cam, result), failing) in self
            .cams
            .iter()
            .zip(results)
            .zip(self.refresh_failing.iter())
        {
            match result {
                Ok(_) => {
                    ok += 1;
                    if failing.swap(false, Ordering::SeqCst) {
                        info!(camera = %cam.name(), "Camera refresh recovered");
                    }
                }
                Err(e) => {
                    failed += 1;
                    if failing.swap(true, Ordering::SeqCst) {
                        debug!(camera = %cam.name(), error = %e, "Camera refresh still failing");
                    } else {
                        warn!(camera = %cam.name(), error = %e, "Camera refresh failed");
                    }
                }
            }
        }
        TickOutcome::Refreshed { ok, failed }
    }

    /// Run the loop on a tokio task until [`request_shutdown`](Self::request_shutdown).
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "Controller loop started");
            while !self.shutdown_requested.load(Ordering::SeqCst) {
                self.tick().await;
                sleep(self.interval).await;
            }
            info!("Controller loop stopped");
        })
    }

    /// End the loop after the current tick.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Stop the loop, wind down an unfinished plan and release every device.
    ///
    /// All devices are shut down even if some fail; the first error is
    /// returned.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.request_shutdown();
        if let Some(plan) = self.plan.lock().await.as_mut() {
            wind_down(&mut **plan).await;
        }
        let mut first_err: Option<anyhow::Error> = None;

        for cam in &self.cams {
            if let Err(e) = cam.camera().shutdown().await {
                warn!(camera = %cam.name(), error = %e, "Camera shutdown failed");
                first_err.get_or_insert(e);
            }
        }
        for dl in &self.delay_lines {
            if let Err(e) = dl.stage().shutdown().await {
                warn!(stage = %dl.name(), error = %e, "Delay line shutdown failed");
                first_err.get_or_insert(e);
            }
        }
        if let Some(shaper) = &self.shaper {
            if let Err(e) = shaper.shutdown().await {
                warn!(shaper = %shaper.name(), error = %e, "Shaper shutdown failed");
                first_err.get_or_insert(e);
            }
        }
        if let Some(shutter) = &self.shutter {
            if let Err(e) = shutter.shutdown().await {
                warn!(shutter = %shutter.name(), error = %e, "Shutter shutdown failed");
                first_err.get_or_insert(e);
            }
        }
        for stage in &self.rotation_stages {
            if let Err(e) = stage.shutdown().await {
                warn!(stage = %stage.name(), error = %e, "Rotation stage shutdown failed");
                first_err.get_or_insert(e);
            }
        }
        info!("Devices released");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Stop a plan that has not ended and step it through its cleanup.
async fn wind_down(plan: &mut dyn Plan) {
    if plan.status().is_terminal() {
        return;
    }
    info!(plan = %plan.name(), "Winding down unfinished plan");
    plan.set_paused(false);
    plan.request_stop();
    loop {
        match plan.make_step().await {
            StepResult::Continue => tokio::task::yield_now().await,
            StepResult::Done => break,
            StepResult::Failed(e) => {
                warn!(plan = %plan.name(), error = %e, "Plan cleanup failed");
                break;
            }
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("cams", &self.cams)
            .field("delay_lines", &self.delay_lines)
            .field("paused", &self.is_paused())
            .field("interval", &self.interval)
            .finish()
    }
}
