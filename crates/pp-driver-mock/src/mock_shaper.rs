//! Simulated acousto-optic pulse shaper.

use crate::common::ErrorConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use pp_core::capabilities::{PulseShaper, ShaperMasks, ShaperSettings};
use std::sync::atomic::{AtomicBool, Ordering};

/// Angular frequency step between shaper pixels in rad/fs.
const RAD_PER_FS_PER_PIXEL: f64 = 2.0e-4;

#[derive(Debug)]
struct ShaperState {
    masks: ShaperMasks,
    settings: ShaperSettings,
    uploads: u32,
}

/// Mock pulse shaper.
///
/// Keeps masks and settings in memory. `apply_settings` regenerates the
/// default waveform: one frame with the compensation phase, or two frames
/// (open, blocked) when chopping is enabled.
pub struct MockShaper {
    name: String,
    pixels: usize,
    state: Mutex<ShaperState>,
    error_config: ErrorConfig,
    shut_down: AtomicBool,
}

impl MockShaper {
    pub fn new(name: impl Into<String>, pixels: usize) -> Self {
        Self {
            name: name.into(),
            pixels,
            state: Mutex::new(ShaperState {
                masks: ShaperMasks::flat(pixels),
                settings: ShaperSettings::default(),
                uploads: 0,
            }),
            error_config: ErrorConfig::none(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    pub fn upload_count(&self) -> u32 {
        self.state.lock().uploads
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn default_masks(&self, settings: &ShaperSettings) -> ShaperMasks {
        let phase = if settings.dispersion_compensation {
            self.dispersion_phase([0.0, settings.gvd, settings.tod, settings.fod])
        } else {
            vec![0.0; self.pixels]
        };
        if settings.chopped {
            ShaperMasks {
                amplitude: vec![vec![1.0; self.pixels], vec![0.0; self.pixels]],
                phase: vec![phase.clone(), phase],
            }
        } else {
            ShaperMasks {
                amplitude: vec![vec![1.0; self.pixels]],
                phase: vec![phase],
            }
        }
    }
}

#[async_trait]
impl PulseShaper for MockShaper {
    fn name(&self) -> &str {
        &self.name
    }

    fn pixels(&self) -> usize {
        self.pixels
    }

    async fn masks(&self) -> Result<ShaperMasks> {
        Ok(self.state.lock().masks.clone())
    }

    async fn set_masks(&self, masks: ShaperMasks) -> Result<()> {
        self.error_config.check_operation(&self.name, "set_masks")?;
        if masks.amplitude.len() != masks.phase.len() {
            return Err(anyhow!(
                "{}: {} amplitude frames but {} phase frames",
                self.name,
                masks.amplitude.len(),
                masks.phase.len()
            ));
        }
        let bad_frame = masks
            .amplitude
            .iter()
            .chain(masks.phase.iter())
            .any(|frame| frame.len() != self.pixels);
        if bad_frame {
            return Err(anyhow!("{}: every frame needs {} pixels", self.name, self.pixels));
        }
        self.state.lock().masks = masks;
        Ok(())
    }

    async fn settings(&self) -> Result<ShaperSettings> {
        Ok(self.state.lock().settings)
    }

    async fn apply_settings(&self, settings: ShaperSettings) -> Result<()> {
        self.error_config.check_operation(&self.name, "apply_settings")?;
        let masks = self.default_masks(&settings);
        let mut state = self.state.lock();
        state.settings = settings;
        state.masks = masks;
        Ok(())
    }

    fn dispersion_phase(&self, coefs: [f64; 4]) -> Vec<f64> {
        let center = (self.pixels / 2) as f64;
        (0..self.pixels)
            .map(|px| {
                let dw = (px as f64 - center) * RAD_PER_FS_PER_PIXEL;
                coefs[0]
                    + coefs[1] * dw.powi(2) / 2.0
                    + coefs[2] * dw.powi(3) / 6.0
                    + coefs[3] * dw.powi(4) / 24.0
            })
            .collect()
    }

    async fn upload(&self) -> Result<()> {
        self.error_config.check_operation(&self.name, "upload")?;
        let mut state = self.state.lock();
        state.uploads += 1;
        tracing::debug!(
            shaper = %self.name,
            frames = state.masks.frames(),
            "MockShaper: waveform uploaded"
        );
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        tracing::debug!(shaper = %self.name, "MockShaper: shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_chopped_settings_give_two_frames() {
        let shaper = MockShaper::new("Shaper", 16);
        shaper
            .apply_settings(ShaperSettings {
                chopped: true,
                ..Default::default()
            })
            .await
            .unwrap();
        let masks = shaper.masks().await.unwrap();
        assert_eq!(masks.frames(), 2);
        assert!(masks.amplitude[1].iter().all(|a| *a == 0.0));
    }

    #[tokio::test]
    async fn test_dispersion_phase_is_even_for_gvd() {
        let shaper = MockShaper::new("Shaper", 9);
        let phase = shaper.dispersion_phase([0.0, 1000.0, 0.0, 0.0]);
        // Pixel 4 is the center: symmetric quadratic phase around it.
        assert_eq!(phase[4], 0.0);
        assert!((phase[2] - phase[6]).abs() < 1e-15);
        assert!(phase[0] > phase[2]);
    }

    #[tokio::test]
    async fn test_set_masks_validates_shape() {
        let shaper = MockShaper::new("Shaper", 4);
        let bad = ShaperMasks {
            amplitude: vec![vec![1.0; 3]],
            phase: vec![vec![0.0; 3]],
        };
        assert!(shaper.set_masks(bad).await.is_err());
        shaper.set_masks(ShaperMasks::flat(4)).await.unwrap();
        shaper.upload().await.unwrap();
        assert_eq!(shaper.upload_count(), 1);
    }
}
