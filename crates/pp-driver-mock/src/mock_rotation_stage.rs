//! Simulated polarization rotation stage.

use crate::common::{ErrorConfig, MockMode, TimingConfig};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use pp_core::capabilities::RotationStage;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{sleep, Instant};

#[derive(Debug)]
struct RotatorState {
    degrees: f64,
    settled_at: Option<Instant>,
}

/// Mock rotation stage. Angles are kept in `[0, 360)`.
pub struct MockRotationStage {
    name: String,
    state: Mutex<RotatorState>,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
    shut_down: AtomicBool,
}

impl MockRotationStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RotatorState {
                degrees: 45.0,
                settled_at: None,
            }),
            mode: MockMode::Instant,
            timing: TimingConfig::rotator(),
            error_config: ErrorConfig::none(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RotationStage for MockRotationStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn degrees(&self) -> Result<f64> {
        Ok(self.state.lock().degrees)
    }

    async fn set_degrees(&self, deg: f64) -> Result<()> {
        self.error_config.check_operation(&self.name, "move")?;
        if !deg.is_finite() {
            return Err(anyhow!("{}: invalid angle {}", self.name, deg));
        }
        let settle = if self.mode.is_timed() {
            self.timing.settling()
        } else {
            tokio::time::Duration::ZERO
        };
        {
            let mut state = self.state.lock();
            state.degrees = deg.rem_euclid(360.0);
            state.settled_at = Some(Instant::now() + settle);
        }
        if !settle.is_zero() {
            sleep(self.timing.communication()).await;
        }
        Ok(())
    }

    async fn is_moving(&self) -> Result<bool> {
        let state = self.state.lock();
        Ok(state.settled_at.is_some_and(|t| Instant::now() < t))
    }

    async fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_angle_wraps() {
        let stage = MockRotationStage::new("Rot");
        assert_eq!(stage.degrees().await.unwrap(), 45.0);
        stage.set_degrees(370.0).await.unwrap();
        assert!((stage.degrees().await.unwrap() - 10.0).abs() < 1e-9);
        stage.set_degrees(-90.0).await.unwrap();
        assert!((stage.degrees().await.unwrap() - 270.0).abs() < 1e-9);
        assert!(!stage.is_moving().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_realistic_settling() {
        let stage = MockRotationStage::new("Rot").with_mode(MockMode::Realistic);
        stage.set_degrees(90.0).await.unwrap();
        assert!(stage.is_moving().await.unwrap());
        sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(!stage.is_moving().await.unwrap());
    }
}
