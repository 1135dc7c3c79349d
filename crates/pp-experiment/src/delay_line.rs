//! Delay line wrapper with a cached, observable position.

use anyhow::Result;
use pp_core::capabilities::DelayStage;
use std::sync::Arc;
use tokio::sync::watch;

pub struct DelayLine {
    stage: Arc<dyn DelayStage>,
    position: watch::Sender<f64>,
}

impl DelayLine {
    pub async fn new(stage: Arc<dyn DelayStage>) -> Result<Self> {
        let fs = stage.position_fs().await?;
        let (position, _) = watch::channel(fs);
        Ok(Self { stage, position })
    }

    pub fn name(&self) -> &str {
        self.stage.name()
    }

    pub fn stage(&self) -> &Arc<dyn DelayStage> {
        &self.stage
    }

    /// Move to `fs`. With `wait` the cached position is refreshed once the
    /// stage has settled.
    pub async fn set_pos(&self, fs: f64, wait: bool) -> Result<()> {
        self.stage.set_position_fs(fs, wait).await?;
        if wait {
            self.refresh_pos().await?;
        }
        Ok(())
    }

    /// Last known position in fs.
    pub fn pos(&self) -> f64 {
        *self.position.borrow()
    }

    pub async fn refresh_pos(&self) -> Result<f64> {
        let fs = self.stage.position_fs().await?;
        self.position.send_replace(fs);
        Ok(fs)
    }

    pub async fn is_moving(&self) -> Result<bool> {
        self.stage.is_moving().await
    }

    pub async fn set_speed(&self, ps_per_s: f64) -> Result<()> {
        self.stage.set_speed(ps_per_s).await
    }

    /// Make the current position the new time zero.
    pub async fn set_home(&self) -> Result<()> {
        let mm = self.stage.position_mm().await?;
        self.stage.set_home_mm(mm).await?;
        tracing::info!(stage = %self.name(), home_mm = mm, "Time zero set");
        self.refresh_pos().await?;
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.position.subscribe()
    }
}

impl std::fmt::Debug for DelayLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayLine")
            .field("name", &self.name())
            .field("pos", &self.pos())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pp_driver_mock::MockDelayLine;

    #[tokio::test]
    async fn test_position_is_cached_and_published() {
        let dl = DelayLine::new(Arc::new(MockDelayLine::builder("Delay").build()))
            .await
            .unwrap();
        let mut rx = dl.subscribe();
        assert_eq!(dl.pos(), 0.0);

        dl.set_pos(1500.0, true).await.unwrap();
        assert!((dl.pos() - 1500.0).abs() < 1e-6);
        assert!(rx.has_changed().unwrap());
        assert!((*rx.borrow_and_update() - 1500.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_non_waiting_move_keeps_cache_until_refresh() {
        let dl = DelayLine::new(Arc::new(MockDelayLine::builder("Delay").build()))
            .await
            .unwrap();
        dl.set_pos(-300.0, false).await.unwrap();
        assert_eq!(dl.pos(), 0.0);
        let fs = dl.refresh_pos().await.unwrap();
        assert!((fs + 300.0).abs() < 1e-6);
        assert_eq!(dl.pos(), fs);
    }

    #[tokio::test]
    async fn test_set_home_zeroes_position() {
        let dl = DelayLine::new(Arc::new(MockDelayLine::builder("Delay").build()))
            .await
            .unwrap();
        dl.set_pos(2000.0, true).await.unwrap();
        dl.set_home().await.unwrap();
        assert!(dl.pos().abs() < 1e-9);
        dl.set_pos(-2000.0, true).await.unwrap();
        assert!((dl.stage().position_mm().await.unwrap() - 0.0).abs() < 1e-9);
    }
}
