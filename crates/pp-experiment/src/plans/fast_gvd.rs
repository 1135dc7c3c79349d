//! Fast dispersion scan with the pulse shaper.
//!
//! The shaper cycles through `2 * n` frames, two per scanned value: an even
//! frame with zero amplitude (pump blocked) and an odd frame carrying the
//! value's dispersion phase. One camera batch of `repeats * 2 * n` shots
//! therefore covers the whole list; shot `s` belongs to frame
//! `s % (2 * n)`. Each step reads one batch and accumulates
//! `1000 * log10(even / odd)` per value.

use crate::cam::Cam;
use crate::plan::into_pp_error;
use crate::scan::{Progress, ScanContext, ScanSteps};
use async_trait::async_trait;
use ndarray::{Array1, Array2, Axis};
use parking_lot::RwLock;
use pp_core::capabilities::{PulseShaper, ShaperMasks, ShaperSettings};
use pp_core::error::{PpError, PpResult};
use pp_core::reading::DetectorReading;
use pp_core::signal::nan_to_zero;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Largest batch the camera is asked for.
pub const MAX_TOTAL_SHOTS: usize = 10_000;

/// Which Taylor coefficient is scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GvdScanMode {
    #[default]
    Gvd,
    Tod,
    Fod,
}

impl GvdScanMode {
    fn coefficient_index(self) -> usize {
        match self {
            GvdScanMode::Gvd => 1,
            GvdScanMode::Tod => 2,
            GvdScanMode::Fod => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FastGvdConfig {
    /// Scanned values in units of 1000 fs^n.
    pub values: Vec<f64>,
    pub repeats: usize,
    pub mode: GvdScanMode,
    pub gvd: f64,
    pub tod: f64,
    pub fod: f64,
    /// Stop after this many batches; `None` runs until stopped.
    pub max_reads: Option<usize>,
}

impl FastGvdConfig {
    pub fn new(values: Vec<f64>, repeats: usize) -> Self {
        Self {
            values,
            repeats,
            mode: GvdScanMode::Gvd,
            gvd: 0.0,
            tod: 0.0,
            fod: 0.0,
            max_reads: None,
        }
    }

    pub fn frames(&self) -> usize {
        2 * self.values.len()
    }

    pub fn total_shots(&self) -> usize {
        self.repeats.saturating_mul(self.frames())
    }

    pub fn validate(&self) -> PpResult<()> {
        if self.values.is_empty() {
            return Err(PpError::Configuration("value list is empty".into()));
        }
        if self.repeats == 0 {
            return Err(PpError::Configuration("repeats must be positive".into()));
        }
        if self.total_shots() > MAX_TOTAL_SHOTS {
            return Err(PpError::Configuration(format!(
                "{} repeats x {} frames = {} shots exceeds the limit of {}",
                self.repeats,
                self.frames(),
                self.total_shots(),
                MAX_TOTAL_SHOTS
            )));
        }
        if self.max_reads == Some(0) {
            return Err(PpError::Configuration("max_reads must be positive".into()));
        }
        Ok(())
    }

    /// `[phi0, gvd, tod, fod]` in fs^n for the value at `index`.
    pub fn coefficients(&self, index: usize) -> [f64; 4] {
        let mut coefs = [0.0, self.gvd * 1000.0, self.tod * 1000.0, self.fod * 1000.0];
        if let Some(value) = self.values.get(index) {
            coefs[self.mode.coefficient_index()] = value * 1000.0;
        }
        coefs
    }
}

/// Accumulated data, one row per scanned value.
#[derive(Debug, Clone, Default)]
pub struct FastGvdResults {
    /// `(even + odd) / 2` of the latest batch.
    pub probe: Array2<f64>,
    /// Mean over all batches of `1000 * log10(even / odd)`.
    pub mean_signal: Array2<f64>,
    pub reads: usize,
}

pub struct FastGvdScan {
    name: String,
    cam: Arc<Cam>,
    shaper: Arc<dyn PulseShaper>,
    config: FastGvdConfig,
    saved_shots: Option<usize>,
    saved_settings: Option<ShaperSettings>,
    signal_sum: Array2<f64>,
    results: Arc<RwLock<FastGvdResults>>,
}

impl FastGvdScan {
    /// Validate `config` and remember the device state to restore later.
    ///
    /// Validation happens before any device is queried.
    pub async fn new(
        name: impl Into<String>,
        cam: Arc<Cam>,
        shaper: Arc<dyn PulseShaper>,
        config: FastGvdConfig,
    ) -> PpResult<Self> {
        config.validate()?;
        let saved_shots = cam.shots().await;
        let saved_settings = shaper.settings().await.map_err(into_pp_error)?;

        let rows = config.values.len();
        let pixels = cam.channels();
        Ok(Self {
            name: name.into(),
            cam,
            shaper,
            config,
            saved_shots: Some(saved_shots),
            saved_settings: Some(saved_settings),
            signal_sum: Array2::zeros((rows, pixels)),
            results: Arc::new(RwLock::new(FastGvdResults {
                probe: Array2::zeros((rows, pixels)),
                mean_signal: Array2::zeros((rows, pixels)),
                reads: 0,
            })),
        })
    }

    pub fn config(&self) -> &FastGvdConfig {
        &self.config
    }

    pub fn results(&self) -> Arc<RwLock<FastGvdResults>> {
        self.results.clone()
    }

    /// One frame pair per value: blocked even frame, shaped odd frame.
    pub fn build_masks(&self) -> ShaperMasks {
        let pixels = self.shaper.pixels();
        let mut masks = ShaperMasks::default();
        for index in 0..self.config.values.len() {
            let phase = self.shaper.dispersion_phase(self.config.coefficients(index));
            masks.amplitude.push(vec![0.0; pixels]);
            masks.phase.push(phase.clone());
            masks.amplitude.push(vec![1.0; pixels]);
            masks.phase.push(phase);
        }
        masks
    }

    fn accumulate(&mut self, reading: &DetectorReading) -> anyhow::Result<()> {
        let (probe, signal) = split_frames(reading, self.config.values.len())?;
        if signal.dim() != self.signal_sum.dim() {
            anyhow::bail!(
                "reading has {} pixels, expected {}",
                signal.ncols(),
                self.signal_sum.ncols()
            );
        }
        self.signal_sum += &signal;

        let mut results = self.results.write();
        results.reads += 1;
        results.mean_signal = &self.signal_sum / results.reads as f64;
        results.probe = probe;
        Ok(())
    }
}

/// Per-value `(probe, signal)` rows of one batch cycling through
/// `2 * values` frames.
pub fn split_frames(
    reading: &DetectorReading,
    values: usize,
) -> anyhow::Result<(Array2<f64>, Array2<f64>)> {
    let frames = 2 * values;
    let pixels = reading.pixels();
    if reading.shots() < frames {
        anyhow::bail!(
            "{} shots cannot cover {} shaper frames",
            reading.shots(),
            frames
        );
    }

    let mut probe = Array2::zeros((values, pixels));
    let mut signal = Array2::zeros((values, pixels));
    for value in 0..values {
        let even = frame_mean(reading, frames, 2 * value);
        let odd = frame_mean(reading, frames, 2 * value + 1);
        probe
            .row_mut(value)
            .assign(&((&even + &odd) / 2.0));
        let sig = ndarray::Zip::from(&even)
            .and(&odd)
            .map_collect(|e, o| nan_to_zero(1000.0 * (e / o).log10()));
        signal.row_mut(value).assign(&sig);
    }
    Ok((probe, signal))
}

fn frame_mean(reading: &DetectorReading, frames: usize, frame: usize) -> Array1<f64> {
    let rows: Vec<usize> = (0..reading.shots())
        .filter(|shot| shot % frames == frame)
        .collect();
    reading
        .channel_a()
        .select(Axis(0), &rows)
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(reading.pixels()))
}

#[async_trait]
impl ScanSteps for FastGvdScan {
    fn name(&self) -> &str {
        &self.name
    }

    fn shorthand(&self) -> &str {
        "fgvd"
    }

    /// Reads accumulate inside one scan until stopped or `max_reads`.
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
        self.shaper
            .apply_settings(ShaperSettings {
                gvd: self.config.gvd,
                tod: self.config.tod,
                fod: self.config.fod,
                dispersion_compensation: false,
                chopped: false,
            })
            .await?;
        self.shaper.set_masks(self.build_masks()).await?;
        self.shaper.upload().await?;
        self.cam.set_shots(self.config.total_shots()).await?;
        tracing::info!(
            plan = %self.name,
            values = self.config.values.len(),
            shots = self.config.total_shots(),
            mode = ?self.config.mode,
            "Shaper masks uploaded"
        );
        Ok(Progress::Complete)
    }

    async fn scan(&mut self, ctx: &mut ScanContext) -> anyhow::Result<Progress> {
        ctx.tracker.start_point();
        let reading = self.cam.read().await?;
        self.accumulate(&reading)?;

        let reads = self.results.read().reads;
        ctx.step_done(reads - 1);
        match self.config.max_reads {
            Some(max) if reads >= max => Ok(Progress::Complete),
            _ => Ok(Progress::Yield),
        }
    }

    async fn post_plan(&mut self, _ctx: &mut ScanContext) -> anyhow::Result<Progress> {
        let mut first_err: Option<anyhow::Error> = None;
        if let Some(shots) = self.saved_shots.take() {
            if let Err(e) = self.cam.set_shots(shots).await {
                first_err.get_or_insert(e);
            }
        }
        if let Some(settings) = self.saved_settings.take() {
            if let Err(e) = self.shaper.apply_settings(settings).await {
                first_err.get_or_insert(e);
            }
            if let Err(e) = self.shaper.upload().await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(Progress::Complete),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_shots_limit() {
        let config = FastGvdConfig::new(vec![0.0; 50], 100);
        assert_eq!(config.total_shots(), 10_000);
        assert!(config.validate().is_ok());

        let config = FastGvdConfig::new(vec![0.0; 51], 100);
        assert!(matches!(
            config.validate(),
            Err(PpError::Configuration(msg)) if msg.contains("10200")
        ));
        assert!(FastGvdConfig::new(vec![], 10).validate().is_err());
    }

    #[test]
    fn test_coefficients_replace_scanned_term() {
        let mut config = FastGvdConfig::new(vec![1.5, -2.0], 10);
        config.gvd = 0.1;
        config.tod = 0.2;
        config.fod = 0.3;
        assert_eq!(config.coefficients(0), [0.0, 1500.0, 200.0, 300.0]);

        config.mode = GvdScanMode::Tod;
        assert_eq!(config.coefficients(1), [0.0, 100.0, -2000.0, 300.0]);
    }

    #[test]
    fn test_split_frames() {
        // Two values, four frames, two repeats: rows 0..8, frame = row % 4.
        let levels = [100.0, 50.0, 10.0, 10.0];
        let a = Array2::from_shape_fn((8, 3), |(shot, _)| levels[shot % 4]);
        let reading = DetectorReading::new(
            a.clone(),
            a,
            Array2::zeros((8, 0)),
            vec![true; 8],
        )
        .unwrap();

        let (probe, signal) = split_frames(&reading, 2).unwrap();
        assert_eq!(probe.row(0).to_vec(), vec![75.0; 3]);
        assert_eq!(probe.row(1).to_vec(), vec![10.0; 3]);
        assert!((signal[[0, 0]] - 1000.0 * 2f64.log10()).abs() < 1e-9);
        assert_eq!(signal[[1, 2]], 0.0);
    }

    #[test]
    fn test_split_frames_needs_full_cycle() {
        let a = Array2::ones((3, 2));
        let reading =
            DetectorReading::new(a.clone(), a, Array2::zeros((3, 0)), vec![true; 3]).unwrap();
        assert!(split_frames(&reading, 2).is_err());
    }
}
