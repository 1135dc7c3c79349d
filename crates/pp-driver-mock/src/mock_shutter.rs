//! Simulated beam shutter.

use crate::common::ErrorConfig;
use anyhow::Result;
use async_trait::async_trait;
use pp_core::capabilities::Shutter;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct MockShutter {
    name: String,
    open: AtomicBool,
    error_config: ErrorConfig,
}

impl MockShutter {
    /// Shutters start open, matching the lab default.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            open: AtomicBool::new(true),
            error_config: ErrorConfig::none(),
        }
    }

    pub fn with_error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }
}

#[async_trait]
impl Shutter for MockShutter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_open(&self) -> Result<bool> {
        Ok(self.open.load(Ordering::SeqCst))
    }

    async fn open(&self) -> Result<()> {
        self.error_config.check_operation(&self.name, "open")?;
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.error_config.check_operation(&self.name, "close")?;
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Leaves the beam blocked.
    async fn shutdown(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_toggle() {
        let shutter = MockShutter::new("Shutter");
        assert!(shutter.is_open().await.unwrap());
        shutter.toggle().await.unwrap();
        assert!(!shutter.is_open().await.unwrap());
        shutter.toggle().await.unwrap();
        assert!(shutter.is_open().await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_closes() {
        let shutter = MockShutter::new("Shutter");
        shutter.shutdown().await.unwrap();
        assert!(!shutter.is_open().await.unwrap());
    }
}
