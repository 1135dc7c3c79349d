//! Device construction from a [`SiteConfig`].
//!
//! Replaces a process-wide hardware registry: every call builds a fresh,
//! independent set of adapters, selected by the `driver` string of each entry.

use crate::config::{CameraConfig, DelayLineConfig, SiteConfig};
use pp_core::capabilities::{Camera, DelayStage, PulseShaper, RotationStage, Shutter};
use pp_core::error::{PpError, PpResult};
use pp_driver_mock::{
    MockCamera, MockDelayLine, MockRotationStage, MockShaper, MockShutter, TimingConfig,
};
use std::sync::Arc;

/// Adapters of one setup, ready to be handed to the controller.
#[derive(Clone)]
pub struct DeviceSet {
    pub cameras: Vec<Arc<dyn Camera>>,
    pub delay_lines: Vec<Arc<dyn DelayStage>>,
    pub shaper: Option<Arc<dyn PulseShaper>>,
    pub shutter: Option<Arc<dyn Shutter>>,
    pub rotation_stages: Vec<Arc<dyn RotationStage>>,
}

impl std::fmt::Debug for DeviceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSet")
            .field(
                "cameras",
                &self.cameras.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field(
                "delay_lines",
                &self.delay_lines.iter().map(|d| d.name()).collect::<Vec<_>>(),
            )
            .field("shaper", &self.shaper.as_ref().map(|s| s.name()))
            .field("shutter", &self.shutter.as_ref().map(|s| s.name()))
            .field("rotation_stages", &self.rotation_stages.len())
            .finish()
    }
}

/// Build every device named in `config`.
///
/// The configuration is validated first, so an invalid file never touches
/// hardware.
pub async fn build_devices(config: &SiteConfig) -> PpResult<DeviceSet> {
    config.validate()?;

    let cameras = config
        .cameras
        .iter()
        .map(build_camera)
        .collect::<PpResult<Vec<_>>>()?;
    let delay_lines = config
        .delay_lines
        .iter()
        .map(build_delay_line)
        .collect::<PpResult<Vec<_>>>()?;

    let shaper = match &config.shaper {
        Some(cfg) => match cfg.driver.as_str() {
            "mock_shaper" => {
                Some(Arc::new(MockShaper::new(&cfg.name, cfg.pixels)) as Arc<dyn PulseShaper>)
            }
            other => return Err(unknown_driver(&cfg.name, other)),
        },
        None => None,
    };

    let shutter = match &config.shutter {
        Some(cfg) => match cfg.driver.as_str() {
            "mock_shutter" => Some(Arc::new(MockShutter::new(&cfg.name)) as Arc<dyn Shutter>),
            other => return Err(unknown_driver(&cfg.name, other)),
        },
        None => None,
    };

    let rotation_stages = config
        .rotation_stages
        .iter()
        .map(|cfg| match cfg.driver.as_str() {
            "mock_rotation_stage" => {
                Ok(Arc::new(MockRotationStage::new(&cfg.name)) as Arc<dyn RotationStage>)
            }
            other => Err(unknown_driver(&cfg.name, other)),
        })
        .collect::<PpResult<Vec<_>>>()?;

    tracing::info!(
        cameras = cameras.len(),
        delay_lines = delay_lines.len(),
        shaper = shaper.is_some(),
        shutter = shutter.is_some(),
        rotation_stages = rotation_stages.len(),
        "Devices built"
    );

    Ok(DeviceSet {
        cameras,
        delay_lines,
        shaper,
        shutter,
        rotation_stages,
    })
}

fn build_camera(cfg: &CameraConfig) -> PpResult<Arc<dyn Camera>> {
    match cfg.driver.as_str() {
        "mock_camera" => {
            let timing = TimingConfig {
                readout_ms_per_shot: cfg.readout_ms_per_shot,
                ..TimingConfig::camera()
            };
            let cam = MockCamera::builder(&cfg.name)
                .channels(cfg.pixels)
                .ext_channels(cfg.ext_channels)
                .shots(cfg.shots)
                .center_wavelength(cfg.center_wavelength)
                .mode(cfg.mode)
                .timing_config(timing)
                .build();
            Ok(Arc::new(cam))
        }
        other => Err(unknown_driver(&cfg.name, other)),
    }
}

fn build_delay_line(cfg: &DelayLineConfig) -> PpResult<Arc<dyn DelayStage>> {
    match cfg.driver.as_str() {
        "mock_delay_line" => {
            let dl = MockDelayLine::builder(&cfg.name)
                .home_mm(cfg.home_mm)
                .position_mm(cfg.home_mm)
                .pos_sign(cfg.pos_sign)
                .speed_mm_per_s(cfg.speed_mm_per_s)
                .mode(cfg.mode)
                .build();
            Ok(Arc::new(dl))
        }
        other => Err(unknown_driver(&cfg.name, other)),
    }
}

fn unknown_driver(device: &str, driver: &str) -> PpError {
    PpError::Configuration(format!("device '{}': unknown driver '{}'", device, driver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ShaperConfig, ShutterConfig};

    #[tokio::test]
    async fn test_build_mock_site() {
        let devices = build_devices(&SiteConfig::mock()).await.unwrap();
        assert_eq!(devices.cameras.len(), 1);
        assert_eq!(devices.delay_lines.len(), 1);
        assert!(devices.shaper.is_none());
        assert_eq!(devices.cameras[0].name(), "MockCam");
        assert_eq!(devices.cameras[0].shots().await, 20);
    }

    #[tokio::test]
    async fn test_build_full_site() {
        let mut config = SiteConfig::mock();
        config.cameras.push(CameraConfig::mock("MockCam2"));
        config.shaper = Some(ShaperConfig {
            name: "Shaper".into(),
            driver: "mock_shaper".into(),
            pixels: 128,
        });
        config.shutter = Some(ShutterConfig {
            name: "Shutter".into(),
            driver: "mock_shutter".into(),
        });

        let devices = build_devices(&config).await.unwrap();
        assert_eq!(devices.cameras.len(), 2);
        assert_eq!(devices.shaper.as_ref().map(|s| s.pixels()), Some(128));
        assert!(devices.shutter.is_some());
    }

    #[tokio::test]
    async fn test_invalid_config_builds_nothing() {
        let mut config = SiteConfig::mock();
        config.cameras.clear();
        assert!(matches!(
            build_devices(&config).await,
            Err(PpError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_two_builds_are_independent() {
        let mut config = SiteConfig::mock();
        config.cameras[0].mode = pp_driver_mock::MockMode::Instant;
        let a = build_devices(&config).await.unwrap();
        let b = build_devices(&config).await.unwrap();
        a.cameras[0].set_shots(100).await.unwrap();
        assert_eq!(b.cameras[0].shots().await, 20);
    }
}
