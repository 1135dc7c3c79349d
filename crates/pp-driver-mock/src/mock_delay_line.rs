//! Simulated optical delay line.

use crate::common::{ErrorConfig, MockMode, TimingConfig};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use pp_core::capabilities::{fs_to_mm, mm_to_fs, DelayStage};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{sleep, Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Motion {
    from_mm: f64,
    to_mm: f64,
    started: Instant,
    duration: Duration,
}

impl Motion {
    fn position_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started);
        if self.duration.is_zero() || elapsed >= self.duration {
            return self.to_mm;
        }
        let frac = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        self.from_mm + (self.to_mm - self.from_mm) * frac
    }

    fn finished(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.duration
    }
}

#[derive(Debug)]
struct StageState {
    position_mm: f64,
    home_mm: f64,
    speed_mm_per_s: f64,
    motion: Option<Motion>,
}

/// Mock delay line.
///
/// In `Instant` mode moves complete immediately; in timed modes the stage
/// travels at `speed_mm_per_s` and reports `is_moving() == true` until it
/// arrives. `moving_polls(n)` additionally makes the stage report moving for
/// exactly `n` polls after every move, which is how tests script slow motion
/// without a clock.
pub struct MockDelayLine {
    name: String,
    pos_sign: f64,
    state: Mutex<StageState>,
    moving_polls: u32,
    polls_left: AtomicU32,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl MockDelayLine {
    pub fn builder(name: impl Into<String>) -> MockDelayLineBuilder {
        MockDelayLineBuilder::new(name)
    }

    fn target_mm(&self, home_mm: f64, fs: f64) -> f64 {
        home_mm + fs_to_mm(fs) * self.pos_sign
    }

    fn fs_from_mm(&self, home_mm: f64, mm: f64) -> f64 {
        self.pos_sign * mm_to_fs(mm - home_mm)
    }

    /// Settle an arrived motion into the static position.
    fn current_mm(state: &mut StageState, now: Instant) -> f64 {
        if let Some(motion) = state.motion {
            if motion.finished(now) {
                state.position_mm = motion.to_mm;
                state.motion = None;
            } else {
                return motion.position_at(now);
            }
        }
        state.position_mm
    }
}

#[async_trait]
impl DelayStage for MockDelayLine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn position_fs(&self) -> Result<f64> {
        self.error_config.check_operation(&self.name, "position")?;
        let mut state = self.state.lock();
        let mm = Self::current_mm(&mut state, Instant::now());
        Ok(self.fs_from_mm(state.home_mm, mm))
    }

    async fn set_position_fs(&self, fs: f64, wait: bool) -> Result<()> {
        self.error_config.check_operation(&self.name, "move")?;
        if !fs.is_finite() {
            return Err(anyhow!("{}: invalid target {} fs", self.name, fs));
        }

        let duration = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let from_mm = Self::current_mm(&mut state, now);
            let to_mm = self.target_mm(state.home_mm, fs);
            let duration = if self.mode.is_timed() && state.speed_mm_per_s > 0.0 {
                Duration::from_secs_f64((to_mm - from_mm).abs() / state.speed_mm_per_s)
                    + self.timing.settling()
            } else {
                Duration::ZERO
            };

            tracing::debug!(
                stage = %self.name,
                from_mm,
                to_mm,
                "MockDelayLine: moving"
            );

            if duration.is_zero() {
                state.position_mm = to_mm;
                state.motion = None;
            } else {
                state.motion = Some(Motion {
                    from_mm,
                    to_mm,
                    started: now,
                    duration,
                });
            }
            duration
        };
        self.polls_left.store(self.moving_polls, Ordering::SeqCst);

        if wait {
            if !duration.is_zero() {
                sleep(duration).await;
            }
            self.polls_left.store(0, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn is_moving(&self) -> Result<bool> {
        self.error_config.check_operation(&self.name, "is_moving")?;
        let scripted = self
            .polls_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted {
            return Ok(true);
        }
        let mut state = self.state.lock();
        Self::current_mm(&mut state, Instant::now());
        Ok(state.motion.is_some())
    }

    async fn set_speed(&self, ps_per_s: f64) -> Result<()> {
        if ps_per_s <= 0.0 {
            return Err(anyhow!("{}: speed must be positive", self.name));
        }
        self.state.lock().speed_mm_per_s = fs_to_mm(ps_per_s * 1000.0);
        Ok(())
    }

    async fn position_mm(&self) -> Result<f64> {
        let mut state = self.state.lock();
        Ok(Self::current_mm(&mut state, Instant::now()))
    }

    async fn set_home_mm(&self, mm: f64) -> Result<()> {
        self.state.lock().home_mm = mm;
        tracing::info!(stage = %self.name, home_mm = mm, "MockDelayLine: home position set");
        Ok(())
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

pub struct MockDelayLineBuilder {
    name: String,
    position_mm: f64,
    home_mm: f64,
    pos_sign: f64,
    speed_mm_per_s: f64,
    moving_polls: u32,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
}

impl MockDelayLineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position_mm: 0.0,
            home_mm: 0.0,
            pos_sign: 1.0,
            speed_mm_per_s: 6.0,
            moving_polls: 0,
            mode: MockMode::Instant,
            timing: TimingConfig::delay_line(),
            error_config: ErrorConfig::none(),
        }
    }

    pub fn position_mm(mut self, mm: f64) -> Self {
        self.position_mm = mm;
        self
    }

    pub fn home_mm(mut self, mm: f64) -> Self {
        self.home_mm = mm;
        self
    }

    /// Direction of the delay axis relative to the stage axis (+1 or -1).
    pub fn pos_sign(mut self, sign: f64) -> Self {
        self.pos_sign = if sign < 0.0 { -1.0 } else { 1.0 };
        self
    }

    pub fn speed_mm_per_s(mut self, speed: f64) -> Self {
        self.speed_mm_per_s = speed;
        self
    }

    /// Report moving for exactly `polls` calls of `is_moving` after every move.
    pub fn moving_polls(mut self, polls: u32) -> Self {
        self.moving_polls = polls;
        self
    }

    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn timing_config(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    pub fn build(self) -> MockDelayLine {
        MockDelayLine {
            name: self.name,
            pos_sign: self.pos_sign,
            state: Mutex::new(StageState {
                position_mm: self.position_mm,
                home_mm: self.home_mm,
                speed_mm_per_s: self.speed_mm_per_s,
                motion: None,
            }),
            moving_polls: self.moving_polls,
            polls_left: AtomicU32::new(0),
            mode: self.mode,
            timing: self.timing,
            error_config: self.error_config,
        }
    }
}
