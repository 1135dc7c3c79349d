//! Hardware capabilities used by the acquisition core.
//!
//! Each trait covers one kind of device the experiment talks to. Concrete
//! adapters (real hardware or the simulated ones in `pp-driver-mock`) implement
//! them; the controller and the plans only ever see `Arc<dyn Trait>`.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//!
//! Adapters own their internal locking. In particular a [`Camera`] must never
//! let `set_shots` interleave with an in-flight `read`.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn read_at(cam: &dyn Camera, stage: &dyn DelayStage, fs: f64) -> Result<DetectorReading> {
//!     stage.set_position_fs(fs, true).await?;
//!     cam.read().await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::reading::DetectorReading;

/// Speed of light in nm/fs.
pub const SPEED_OF_LIGHT_NM_PER_FS: f64 = 299.792_458;

/// Convert a stage displacement in mm into the pump-probe delay in fs.
///
/// The beam travels the displacement twice, hence the factor 2.
pub fn mm_to_fs(mm: f64) -> f64 {
    mm * 1e6 * 2.0 / SPEED_OF_LIGHT_NM_PER_FS
}

pub fn fs_to_mm(fs: f64) -> f64 {
    fs * SPEED_OF_LIGHT_NM_PER_FS / 2.0 / 1e6
}

// =============================================================================
// Camera
// =============================================================================

/// Line camera with two detector rows behind a spectrograph.
#[async_trait]
pub trait Camera: Send + Sync {
    fn name(&self) -> &str;

    /// Number of pixels per detector row.
    fn channels(&self) -> usize;

    fn ext_channels(&self) -> usize;

    /// Whether the spectrograph center wavelength can be moved.
    fn changeable_wavelength(&self) -> bool;

    async fn shots(&self) -> usize;

    /// Change the batch size. Waits for any in-flight read to finish.
    async fn set_shots(&self, shots: usize) -> Result<()>;

    /// Acquire one batch of `shots()` shots. May block for seconds.
    async fn read(&self) -> Result<DetectorReading>;

    /// Wavelength of every pixel in nm, for the current or a given center.
    async fn wavelength_axis(&self, center_nm: Option<f64>) -> Result<Vec<f64>>;

    async fn set_wavelength(&self, nm: f64) -> Result<()>;

    async fn wavelength(&self) -> Result<f64>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Delay stage
// =============================================================================

/// Optical delay line.
///
/// Positions are reported as pump-probe delays in femtoseconds relative to a
/// home position in mm: `fs = pos_sign * mm_to_fs(mm - home_mm)`.
#[async_trait]
pub trait DelayStage: Send + Sync {
    fn name(&self) -> &str;

    async fn position_fs(&self) -> Result<f64>;

    /// Start a move. With `wait` the call returns once the stage settled,
    /// otherwise immediately; poll [`DelayStage::is_moving`] afterwards.
    async fn set_position_fs(&self, fs: f64, wait: bool) -> Result<()>;

    async fn is_moving(&self) -> Result<bool>;

    async fn set_speed(&self, ps_per_s: f64) -> Result<()>;

    async fn position_mm(&self) -> Result<f64>;

    async fn set_home_mm(&self, mm: f64) -> Result<()>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Pulse shaper
// =============================================================================

/// Amplitude and phase per frame, `frames x pixels` each (row major).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShaperMasks {
    pub amplitude: Vec<Vec<f64>>,
    pub phase: Vec<Vec<f64>>,
}

impl ShaperMasks {
    pub fn frames(&self) -> usize {
        self.phase.len()
    }

    /// A single transparent frame (unit amplitude, flat phase).
    pub fn flat(pixels: usize) -> Self {
        Self {
            amplitude: vec![vec![1.0; pixels]],
            phase: vec![vec![0.0; pixels]],
        }
    }
}

/// Dispersion settings in fs^2, fs^3 and fs^4.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ShaperSettings {
    pub gvd: f64,
    pub tod: f64,
    pub fod: f64,
    pub dispersion_compensation: bool,
    pub chopped: bool,
}

#[async_trait]
pub trait PulseShaper: Send + Sync {
    fn name(&self) -> &str;

    fn pixels(&self) -> usize;

    async fn masks(&self) -> Result<ShaperMasks>;

    async fn set_masks(&self, masks: ShaperMasks) -> Result<()>;

    async fn settings(&self) -> Result<ShaperSettings>;

    /// Apply settings and regenerate the default waveform from them.
    async fn apply_settings(&self, settings: ShaperSettings) -> Result<()>;

    /// Spectral phase for Taylor coefficients `[phi0, gvd, tod, fod]`.
    fn dispersion_phase(&self, coefs: [f64; 4]) -> Vec<f64>;

    /// Push the current masks to the device.
    async fn upload(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Shutter / rotation stage
// =============================================================================

#[async_trait]
pub trait Shutter: Send + Sync {
    fn name(&self) -> &str;
    async fn is_open(&self) -> Result<bool>;
    async fn open(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;

    async fn toggle(&self) -> Result<()> {
        if self.is_open().await? {
            self.close().await
        } else {
            self.open().await
        }
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Polarization rotation stage.
#[async_trait]
pub trait RotationStage: Send + Sync {
    fn name(&self) -> &str;
    async fn degrees(&self) -> Result<f64>;
    async fn set_degrees(&self, deg: f64) -> Result<()>;
    async fn is_moving(&self) -> Result<bool>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
