//! Simulated line camera with two detector rows.

use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ndarray::{Array1, Array2};
use parking_lot::Mutex as SyncMutex;
use pp_core::capabilities::Camera;
use pp_core::error::{DeviceError, DeviceErrorKind};
use pp_core::reading::DetectorReading;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

/// Pixel spacing of the simulated spectrograph in nm.
const NM_PER_PIXEL: f64 = 0.5;

/// How the simulated traces are generated.
#[derive(Debug, Clone)]
enum Source {
    /// Gaussian noise around fixed levels
    Noise {
        probe: f64,
        reference: f64,
        std_dev: f64,
    },
    /// Same row on every shot, even shots scaled by `even_gain`
    Pattern { row: Array1<f64>, even_gain: f64 },
}

/// Mock line camera.
///
/// Produces `shots x channels` traces for the probe and reference rows, an
/// alternating chopper vector and `ext_channels` auxiliary traces.
///
/// Reads and shot-count changes share one lock, so `set_shots` waits for an
/// in-flight `read` and the other way round.
///
/// # Example
///
/// ```rust,ignore
/// let cam = MockCamera::builder("Cam1")
///     .channels(8)
///     .shots(20)
///     .with_pattern(vec![100.0; 8], 1.05)
///     .build();
/// let reading = cam.read().await?;
/// assert_eq!(reading.shots(), 20);
/// ```
pub struct MockCamera {
    name: String,
    channels: usize,
    ext_channels: usize,
    /// Shot count, also the acquisition lock
    shots: Mutex<usize>,
    center_wavelength: SyncMutex<f64>,
    source: Source,
    chopper_first: bool,
    frame_data: bool,
    mode: MockMode,
    timing: TimingConfig,
    read_latency: Option<Duration>,
    error_config: ErrorConfig,
    rng: MockRng,
    read_count: AtomicU64,
    shut_down: AtomicBool,
}

impl MockCamera {
    pub fn builder(name: impl Into<String>) -> MockCameraBuilder {
        MockCameraBuilder::new(name)
    }

    /// Number of completed reads.
    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::SeqCst)
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(DeviceError::new(
                &self.name,
                DeviceErrorKind::Shutdown,
                "camera has been shut down",
            )
            .into());
        }
        self.error_config.check_operation(&self.name, operation)?;
        Ok(())
    }

    fn acquisition_time(&self, shots: usize) -> Duration {
        match self.read_latency {
            Some(latency) => latency,
            None if self.mode.is_timed() => self.timing.readout(shots),
            None => Duration::ZERO,
        }
    }

    fn generate(&self, shots: usize) -> Result<DetectorReading> {
        let (channel_a, channel_b) = match &self.source {
            Source::Noise {
                probe,
                reference,
                std_dev,
            } => {
                let mut a = vec![0.0; shots * self.channels];
                let mut b = vec![0.0; shots * self.channels];
                self.rng.fill_normal(&mut a, *probe, *std_dev);
                self.rng.fill_normal(&mut b, *reference, *std_dev);
                (
                    Array2::from_shape_vec((shots, self.channels), a)?,
                    Array2::from_shape_vec((shots, self.channels), b)?,
                )
            }
            Source::Pattern { row, even_gain } => {
                let a = Array2::from_shape_fn((shots, self.channels), |(shot, px)| {
                    let gain = if shot % 2 == 0 { *even_gain } else { 1.0 };
                    row[px] * gain
                });
                let b = Array2::from_shape_fn((shots, self.channels), |(_, px)| row[px]);
                (a, b)
            }
        };

        let mut aux = vec![0.0; shots * self.ext_channels];
        self.rng.fill_normal(&mut aux, 0.0, 1.0);
        let aux = Array2::from_shape_vec((shots, self.ext_channels), aux)?;

        let chopper = (0..shots)
            .map(|shot| (shot % 2 == 0) == self.chopper_first)
            .collect();

        Ok(DetectorReading::new(channel_a, channel_b, aux, chopper)?.with_frame_data(self.frame_data))
    }
}

#[async_trait]
impl Camera for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn ext_channels(&self) -> usize {
        self.ext_channels
    }

    fn changeable_wavelength(&self) -> bool {
        true
    }

    async fn shots(&self) -> usize {
        *self.shots.lock().await
    }

    async fn set_shots(&self, shots: usize) -> Result<()> {
        if shots == 0 {
            return Err(anyhow!("{}: shot count must be positive", self.name));
        }
        let mut current = self.shots.lock().await;
        self.check("set_shots")?;
        tracing::debug!(camera = %self.name, shots, "MockCamera: shots changed");
        *current = shots;
        Ok(())
    }

    async fn read(&self) -> Result<DetectorReading> {
        let shots = self.shots.lock().await;
        self.check("read")?;

        let duration = self.acquisition_time(*shots);
        if !duration.is_zero() {
            sleep(duration).await;
        }

        let reading = self.generate(*shots)?;
        self.read_count.fetch_add(1, Ordering::SeqCst);
        Ok(reading)
    }

    async fn wavelength_axis(&self, center_nm: Option<f64>) -> Result<Vec<f64>> {
        let center = center_nm.unwrap_or_else(|| *self.center_wavelength.lock());
        let half = (self.channels / 2) as f64;
        Ok((0..self.channels)
            .map(|px| (px as f64 - half) * NM_PER_PIXEL + center)
            .collect())
    }

    async fn set_wavelength(&self, nm: f64) -> Result<()> {
        self.check("set_wavelength")?;
        if nm <= 0.0 {
            return Err(anyhow!("{}: invalid center wavelength {} nm", self.name, nm));
        }
        if self.mode.is_timed() {
            sleep(self.timing.communication()).await;
        }
        *self.center_wavelength.lock() = nm;
        Ok(())
    }

    async fn wavelength(&self) -> Result<f64> {
        Ok(*self.center_wavelength.lock())
    }

    async fn shutdown(&self) -> Result<()> {
        self.shut_down.store(true, Ordering::SeqCst);
        tracing::debug!(camera = %self.name, "MockCamera: shut down");
        Ok(())
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

pub struct MockCameraBuilder {
    name: String,
    channels: usize,
    ext_channels: usize,
    shots: usize,
    center_wavelength: f64,
    source: Source,
    chopper_first: bool,
    frame_data: bool,
    mode: MockMode,
    timing: TimingConfig,
    read_latency: Option<Duration>,
    error_config: ErrorConfig,
    seed: Option<u64>,
}

impl MockCameraBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channels: 200,
            ext_channels: 3,
            shots: 20,
            center_wavelength: 300.0,
            source: Source::Noise {
                probe: 30.0,
                reference: 20.0,
                std_dev: 1.0,
            },
            chopper_first: true,
            frame_data: true,
            mode: MockMode::Instant,
            timing: TimingConfig::camera(),
            read_latency: None,
            error_config: ErrorConfig::none(),
            seed: None,
        }
    }

    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn ext_channels(mut self, ext_channels: usize) -> Self {
        self.ext_channels = ext_channels;
        self
    }

    pub fn shots(mut self, shots: usize) -> Self {
        self.shots = shots;
        self
    }

    pub fn center_wavelength(mut self, nm: f64) -> Self {
        self.center_wavelength = nm;
        self
    }

    /// Gaussian noise levels for probe and reference rows.
    pub fn noise(mut self, probe: f64, reference: f64, std_dev: f64) -> Self {
        self.source = Source::Noise {
            probe,
            reference,
            std_dev,
        };
        self
    }

    /// Deterministic traces: `row` on every shot of both rows, with even
    /// probe shots multiplied by `even_gain`. The row length sets `channels`.
    pub fn with_pattern(mut self, row: Vec<f64>, even_gain: f64) -> Self {
        self.channels = row.len();
        self.source = Source::Pattern {
            row: Array1::from(row),
            even_gain,
        };
        self
    }

    /// Chopper state of the first shot of every batch.
    pub fn chopper_first(mut self, open: bool) -> Self {
        self.chopper_first = open;
        self
    }

    pub fn frame_data(mut self, enabled: bool) -> Self {
        self.frame_data = enabled;
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

    /// Fixed duration of every read, regardless of mode and shot count.
    pub fn read_latency(mut self, latency: Duration) -> Self {
        self.read_latency = Some(latency);
        self
    }

    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> MockCamera {
        MockCamera {
            name: self.name,
            channels: self.channels,
            ext_channels: self.ext_channels,
            shots: Mutex::new(self.shots.max(1)),
            center_wavelength: SyncMutex::new(self.center_wavelength),
            source: self.source,
            chopper_first: self.chopper_first,
            frame_data: self.frame_data,
            mode: self.mode,
            timing: self.timing,
            read_latency: self.read_latency,
            error_config: self.error_config,
            rng: MockRng::new(self.seed),
            read_count: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_noise_reading_shapes() {
        let cam = MockCamera::builder("Cam").channels(16).shots(10).seed(1).build();
        let reading = cam.read().await.unwrap();

        assert_eq!(reading.shots(), 10);
        assert_eq!(reading.pixels(), 16);
        assert_eq!(reading.aux().dim(), (10, 3));
        assert_eq!(reading.chopper()[..4], [true, false, true, false]);
        assert_eq!(cam.read_count(), 1);
    }

    #[tokio::test]
    async fn test_pattern_reading() {
        let cam = MockCamera::builder("Cam")
            .shots(4)
            .with_pattern(vec![100.0; 8], 1.05)
            .chopper_first(false)
            .build();
        let reading = cam.read().await.unwrap();

        assert_eq!(cam.channels(), 8);
        assert!((reading.channel_a()[[0, 3]] - 105.0).abs() < 1e-9);
        assert_eq!(reading.channel_a()[[1, 3]], 100.0);
        assert_eq!(reading.channel_b()[[0, 3]], 100.0);
        assert!(!reading.chopper()[0]);
    }

    #[tokio::test]
    async fn test_set_shots() {
        let cam = MockCamera::builder("Cam").channels(4).build();
        cam.set_shots(50).await.unwrap();
        assert_eq!(cam.shots().await, 50);
        assert_eq!(cam.read().await.unwrap().shots(), 50);
        assert!(cam.set_shots(0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_shots_waits_for_read() {
        let cam = Arc::new(
            MockCamera::builder("Cam")
                .channels(4)
                .shots(10)
                .read_latency(Duration::from_millis(200))
                .build(),
        );

        let reader = {
            let cam = cam.clone();
            tokio::spawn(async move { cam.read().await })
        };
        tokio::task::yield_now().await;

        cam.set_shots(30).await.unwrap();
        // The in-flight read finished with the old shot count.
        let reading = reader.await.unwrap().unwrap();
        assert_eq!(reading.shots(), 10);
        assert_eq!(cam.shots().await, 30);
    }

    #[tokio::test]
    async fn test_wavelength_axis() {
        let cam = MockCamera::builder("Cam").channels(4).center_wavelength(500.0).build();
        let axis = cam.wavelength_axis(None).await.unwrap();
        assert_eq!(axis, vec![499.0, 499.5, 500.0, 500.5]);

        cam.set_wavelength(600.0).await.unwrap();
        assert_eq!(cam.wavelength().await.unwrap(), 600.0);
        assert_eq!(cam.wavelength_axis(Some(0.0)).await.unwrap()[2], 0.0);
    }

    #[tokio::test]
    async fn test_injected_read_failure() {
        let cam = MockCamera::builder("Cam")
            .channels(4)
            .error_config(ErrorConfig::scenario(ErrorScenario::FailAfterN {
                operation: "read",
                count: 1,
            }))
            .build();
        assert!(cam.read().await.is_ok());
        assert!(cam.read().await.is_err());
        assert_eq!(cam.read_count(), 1);
    }

    #[tokio::test]
    async fn test_read_after_shutdown_fails() {
        let cam = MockCamera::builder("Cam").channels(4).build();
        cam.shutdown().await.unwrap();
        let err = cam.read().await.unwrap_err();
        let device = err.downcast_ref::<DeviceError>().unwrap();
        assert_eq!(device.kind, DeviceErrorKind::Shutdown);
    }
}
