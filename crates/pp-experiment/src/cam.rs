//! Camera wrapper holding the live "last read".
//!
//! [`Cam`] owns a [`Camera`] adapter together with everything derived from
//! it: the stored background, the wavelength axes and the most recent
//! [`ProcessedRead`]. The last read is double buffered: a refresh builds a
//! complete new value and swaps the `Arc`, so readers never observe fields
//! from two different acquisitions.

use anyhow::Result;
use parking_lot::RwLock;
use pp_core::capabilities::Camera;
use pp_core::reading::{Background, DetectorReading};
use pp_core::signal::{ProcessedRead, SignalExtractor};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum CamEvent {
    ReadCompleted,
    ShotsChanged(usize),
    WavelengthChanged(f64),
}

#[derive(Debug, Clone, Default)]
struct Axes {
    wavelengths: Vec<f64>,
    wavenumbers: Vec<f64>,
    display_wavenumbers: bool,
}

impl Axes {
    fn from_wavelengths(wavelengths: Vec<f64>, display_wavenumbers: bool) -> Self {
        let wavenumbers = wavelengths.iter().map(|&wl| nm_to_wavenumber(wl)).collect();
        Self {
            wavelengths,
            wavenumbers,
            display_wavenumbers,
        }
    }
}

/// Wavenumber in cm^-1 of a wavelength in nm.
pub fn nm_to_wavenumber(nm: f64) -> f64 {
    if nm == 0.0 {
        0.0
    } else {
        1e7 / nm
    }
}

pub struct Cam {
    camera: Arc<dyn Camera>,
    extractor: SignalExtractor,
    last_read: RwLock<Arc<ProcessedRead>>,
    background: RwLock<Option<Background>>,
    axes: RwLock<Axes>,
    followers: RwLock<Vec<Arc<Cam>>>,
    events: broadcast::Sender<CamEvent>,
}

impl Cam {
    pub async fn new(camera: Arc<dyn Camera>, extractor: SignalExtractor) -> Result<Self> {
        let wavelengths = camera.wavelength_axis(None).await?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            last_read: RwLock::new(Arc::new(ProcessedRead::empty(camera.channels()))),
            background: RwLock::new(None),
            axes: RwLock::new(Axes::from_wavelengths(wavelengths, false)),
            followers: RwLock::new(Vec::new()),
            camera,
            extractor,
            events,
        })
    }

    pub fn name(&self) -> &str {
        self.camera.name()
    }

    pub fn camera(&self) -> &Arc<dyn Camera> {
        &self.camera
    }

    pub fn channels(&self) -> usize {
        self.camera.channels()
    }

    pub fn extractor(&self) -> SignalExtractor {
        self.extractor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CamEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: CamEvent) {
        let _ = self.events.send(event);
    }

    /// Acquire one batch with the stored background removed.
    pub async fn read(&self) -> Result<DetectorReading> {
        let reading = self.camera.read().await?;
        let background = self.background.read().clone();
        match background {
            Some(bg) => Ok(reading.subtract_background(&bg)?),
            None => Ok(reading),
        }
    }

    /// Extract `reading` and publish it as the new last read.
    pub fn process(&self, reading: &DetectorReading) -> Result<Arc<ProcessedRead>> {
        let processed = Arc::new(self.extractor.extract(reading)?);
        *self.last_read.write() = processed.clone();
        self.emit(CamEvent::ReadCompleted);
        Ok(processed)
    }

    /// Read, extract and swap in the result.
    pub async fn update(&self) -> Result<Arc<ProcessedRead>> {
        let reading = self.read().await?;
        self.process(&reading)
    }

    pub fn last_read(&self) -> Arc<ProcessedRead> {
        self.last_read.read().clone()
    }

    pub async fn shots(&self) -> usize {
        self.camera.shots().await
    }

    /// Change the shot count of this camera and of every follower.
    pub async fn set_shots(&self, shots: usize) -> Result<()> {
        self.camera.set_shots(shots).await?;
        self.emit(CamEvent::ShotsChanged(shots));
        tracing::debug!(camera = %self.name(), shots, "Shots changed");

        let followers = self.followers.read().clone();
        for follower in followers {
            follower.camera.set_shots(shots).await?;
            follower.emit(CamEvent::ShotsChanged(shots));
        }
        Ok(())
    }

    /// Let `follower` mirror every shot change of this camera.
    pub fn add_shots_follower(&self, follower: Arc<Cam>) {
        self.followers.write().push(follower);
    }

    /// Record the mean of one raw acquisition as background.
    pub async fn record_background(&self) -> Result<Background> {
        let reading = self.camera.read().await?;
        let background = Background::from_reading(&reading);
        *self.background.write() = Some(background.clone());
        tracing::info!(camera = %self.name(), shots = reading.shots(), "Background recorded");
        Ok(background)
    }

    pub fn clear_background(&self) {
        *self.background.write() = None;
    }

    pub fn background(&self) -> Option<Background> {
        self.background.read().clone()
    }

    /// Move the spectrograph and recompute the axes.
    pub async fn set_wavelength(&self, nm: f64) -> Result<()> {
        self.camera.set_wavelength(nm).await?;
        let wavelengths = self.camera.wavelength_axis(Some(nm)).await?;
        {
            let mut axes = self.axes.write();
            *axes = Axes::from_wavelengths(wavelengths, axes.display_wavenumbers);
        }
        self.emit(CamEvent::WavelengthChanged(nm));
        Ok(())
    }

    pub fn wavelengths(&self) -> Vec<f64> {
        self.axes.read().wavelengths.clone()
    }

    pub fn wavenumbers(&self) -> Vec<f64> {
        self.axes.read().wavenumbers.clone()
    }

    pub fn set_display_wavenumbers(&self, enabled: bool) {
        self.axes.write().display_wavenumbers = enabled;
    }

    /// The axis plots use: wavenumbers or wavelengths.
    pub fn display_axis(&self) -> Vec<f64> {
        let axes = self.axes.read();
        if axes.display_wavenumbers {
            axes.wavenumbers.clone()
        } else {
            axes.wavelengths.clone()
        }
    }
}

impl std::fmt::Debug for Cam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cam")
            .field("name", &self.name())
            .field("channels", &self.channels())
            .field("background", &self.background.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pp_driver_mock::MockCamera;

    async fn pattern_cam(gain: f64) -> Cam {
        let camera = MockCamera::builder("Cam")
            .with_pattern(vec![100.0; 8], gain)
            .shots(20)
            .build();
        Cam::new(Arc::new(camera), SignalExtractor::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_update_swaps_last_read() {
        let cam = pattern_cam(1.05).await;
        let before = cam.last_read();
        assert_eq!(before.shots, 0);

        let fresh = cam.update().await.unwrap();
        let after = cam.last_read();
        assert!(Arc::ptr_eq(&fresh, &after));
        assert_eq!(after.shots, 20);
        assert!((after.differential_signal[0] - 21.189).abs() < 1e-2);
        // The old buffer is untouched.
        assert_eq!(before.shots, 0);
    }

    #[tokio::test]
    async fn test_background_is_subtracted() {
        let cam = pattern_cam(1.0).await;
        let bg = cam.record_background().await.unwrap();
        assert_eq!(bg.pixels(), 8);

        let reading = cam.read().await.unwrap();
        assert!(reading.channel_a().iter().all(|v| v.abs() < 1e-9));

        cam.clear_background();
        let reading = cam.read().await.unwrap();
        assert!(reading.channel_a().iter().all(|v| (v - 100.0).abs() < 1e-9));
    }

    #[tokio::test]
    async fn test_wavelength_change_updates_axes() {
        let cam = pattern_cam(1.0).await;
        let mut rx = cam.subscribe();
        cam.set_wavelength(500.0).await.unwrap();

        let wl = cam.wavelengths();
        assert_eq!(wl.len(), 8);
        assert_eq!(wl[4], 500.0);
        assert!((cam.wavenumbers()[4] - 20_000.0).abs() < 1e-9);
        assert_eq!(rx.recv().await.unwrap(), CamEvent::WavelengthChanged(500.0));

        assert_eq!(cam.display_axis(), wl);
        cam.set_display_wavenumbers(true);
        assert_eq!(cam.display_axis(), cam.wavenumbers());
    }

    #[tokio::test]
    async fn test_follower_mirrors_shots() {
        let primary = pattern_cam(1.0).await;
        let follower = Arc::new(pattern_cam(1.0).await);
        primary.add_shots_follower(follower.clone());
        let mut rx = follower.subscribe();

        primary.set_shots(64).await.unwrap();
        assert_eq!(primary.shots().await, 64);
        assert_eq!(follower.shots().await, 64);
        assert_eq!(rx.recv().await.unwrap(), CamEvent::ShotsChanged(64));
    }

    #[test]
    fn test_wavenumber_conversion() {
        assert_eq!(nm_to_wavenumber(1000.0), 10_000.0);
        assert_eq!(nm_to_wavenumber(0.0), 0.0);
    }
}
