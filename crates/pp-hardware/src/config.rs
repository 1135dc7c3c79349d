//! Site configuration.
//!
//! One TOML file describes the devices of a setup. It is loaded with figment
//! and can be overridden through `PP_` prefixed environment variables, with
//! `__` separating nested keys:
//!
//! ```text
//! PP_APPLICATION__LOG_LEVEL=debug
//! PP_SIGNAL__ODD_SHOTS=reject
//! ```
//!
//! # Example
//! ```no_run
//! use pp_hardware::config::SiteConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SiteConfig::load_from("config/site.toml")?;
//! println!("{} camera(s)", config.cameras.len());
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use pp_core::error::{PpError, PpResult};
use pp_core::logging::parse_log_level;
use pp_core::signal::OddShotPolicy;
use pp_driver_mock::MockMode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Environment prefix for overrides.
pub const ENV_PREFIX: &str = "PP_";

pub const CAMERA_DRIVERS: &[&str] = &["mock_camera"];
pub const DELAY_LINE_DRIVERS: &[&str] = &["mock_delay_line"];
pub const SHAPER_DRIVERS: &[&str] = &["mock_shaper"];
pub const SHUTTER_DRIVERS: &[&str] = &["mock_shutter"];
pub const ROTATION_STAGE_DRIVERS: &[&str] = &["mock_rotation_stage"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub signal: SignalConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub delay_lines: Vec<DelayLineConfig>,
    #[serde(default)]
    pub shaper: Option<ShaperConfig>,
    #[serde(default)]
    pub shutter: Option<ShutterConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rotation_stages: Vec<RotationStageConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where plans write scan data and metadata
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,
    /// Sleep between controller loop ticks
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            data_directory: default_data_directory(),
            loop_interval_ms: default_loop_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Handling of the unmatched last shot of odd-sized batches
    #[serde(default)]
    pub odd_shots: OddShotPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub name: String,
    #[serde(default = "default_camera_driver")]
    pub driver: String,
    #[serde(default = "default_shots")]
    pub shots: usize,
    #[serde(default = "default_pixels")]
    pub pixels: usize,
    #[serde(default = "default_ext_channels")]
    pub ext_channels: usize,
    #[serde(default = "default_readout_ms_per_shot")]
    pub readout_ms_per_shot: f64,
    #[serde(default = "default_center_wavelength")]
    pub center_wavelength: f64,
    /// Simulation mode of mock drivers
    #[serde(default = "default_mock_mode")]
    pub mode: MockMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayLineConfig {
    pub name: String,
    #[serde(default = "default_delay_line_driver")]
    pub driver: String,
    #[serde(default = "default_speed")]
    pub speed_mm_per_s: f64,
    /// Stage position of time zero
    #[serde(default)]
    pub home_mm: f64,
    /// +1 or -1, direction of the delay axis
    #[serde(default = "default_pos_sign")]
    pub pos_sign: f64,
    #[serde(default = "default_mock_mode")]
    pub mode: MockMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaperConfig {
    pub name: String,
    #[serde(default = "default_shaper_driver")]
    pub driver: String,
    #[serde(default = "default_shaper_pixels")]
    pub pixels: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutterConfig {
    pub name: String,
    #[serde(default = "default_shutter_driver")]
    pub driver: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationStageConfig {
    pub name: String,
    #[serde(default = "default_rotation_stage_driver")]
    pub driver: String,
}

// Default value functions
fn default_app_name() -> String {
    "pump-probe".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_directory() -> PathBuf {
    PathBuf::from("data")
}

fn default_loop_interval_ms() -> u64 {
    10
}

fn default_camera_driver() -> String {
    "mock_camera".to_string()
}

fn default_shots() -> usize {
    20
}

fn default_pixels() -> usize {
    200
}

fn default_ext_channels() -> usize {
    3
}

fn default_readout_ms_per_shot() -> f64 {
    1.0
}

fn default_center_wavelength() -> f64 {
    300.0
}

fn default_mock_mode() -> MockMode {
    MockMode::Realistic
}

fn default_delay_line_driver() -> String {
    "mock_delay_line".to_string()
}

fn default_speed() -> f64 {
    6.0
}

fn default_pos_sign() -> f64 {
    1.0
}

fn default_shaper_driver() -> String {
    "mock_shaper".to_string()
}

fn default_shaper_pixels() -> usize {
    400
}

fn default_shutter_driver() -> String {
    "mock_shutter".to_string()
}

fn default_rotation_stage_driver() -> String {
    "mock_rotation_stage".to_string()
}

impl CameraConfig {
    pub fn mock(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: default_camera_driver(),
            shots: default_shots(),
            pixels: default_pixels(),
            ext_channels: default_ext_channels(),
            readout_ms_per_shot: default_readout_ms_per_shot(),
            center_wavelength: default_center_wavelength(),
            mode: default_mock_mode(),
        }
    }
}

impl DelayLineConfig {
    pub fn mock(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: default_delay_line_driver(),
            speed_mm_per_s: default_speed(),
            home_mm: 0.0,
            pos_sign: default_pos_sign(),
            mode: default_mock_mode(),
        }
    }
}

impl SiteConfig {
    /// One simulated camera and one simulated delay line.
    pub fn mock() -> Self {
        Self {
            application: ApplicationConfig::default(),
            signal: SignalConfig::default(),
            cameras: vec![CameraConfig::mock("MockCam")],
            delay_lines: vec![DelayLineConfig::mock("MockDelay")],
            shaper: None,
            shutter: None,
            rotation_stages: Vec::new(),
        }
    }

    /// Figment layering: the TOML file, then `PP_` variables.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Self::figment_with_prefix(path, ENV_PREFIX)
    }

    pub fn figment_with_prefix<P: AsRef<Path>>(path: P, env_prefix: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(env_prefix).split("__"))
    }

    /// Load and validate a site file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> PpResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PpError::Configuration(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        Self::extract(Self::figment(path))
    }

    pub fn extract(figment: Figment) -> PpResult<Self> {
        let config: SiteConfig = figment
            .extract()
            .map_err(|e| PpError::Configuration(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        tracing::debug!(
            cameras = config.cameras.len(),
            delay_lines = config.delay_lines.len(),
            "Site configuration loaded"
        );
        Ok(config)
    }

    pub fn to_toml(&self) -> PpResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PpError::Configuration(format!("Failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> PpResult<()> {
        parse_log_level(&self.application.log_level)?;

        if self.application.loop_interval_ms == 0 {
            return Err(invalid("loop_interval_ms must be at least 1"));
        }
        if !(1..=2).contains(&self.cameras.len()) {
            return Err(invalid(format!(
                "expected one or two cameras, found {}",
                self.cameras.len()
            )));
        }
        if !(1..=2).contains(&self.delay_lines.len()) {
            return Err(invalid(format!(
                "expected one or two delay lines, found {}",
                self.delay_lines.len()
            )));
        }

        for cam in &self.cameras {
            check_driver(&cam.name, &cam.driver, CAMERA_DRIVERS)?;
            if cam.shots == 0 {
                return Err(invalid(format!("camera '{}': shots must be positive", cam.name)));
            }
            if cam.pixels == 0 {
                return Err(invalid(format!("camera '{}': pixels must be positive", cam.name)));
            }
        }
        for dl in &self.delay_lines {
            check_driver(&dl.name, &dl.driver, DELAY_LINE_DRIVERS)?;
            if dl.pos_sign.abs() != 1.0 {
                return Err(invalid(format!(
                    "delay line '{}': pos_sign must be 1 or -1",
                    dl.name
                )));
            }
            if dl.speed_mm_per_s <= 0.0 {
                return Err(invalid(format!(
                    "delay line '{}': speed must be positive",
                    dl.name
                )));
            }
        }
        if let Some(shaper) = &self.shaper {
            check_driver(&shaper.name, &shaper.driver, SHAPER_DRIVERS)?;
        }
        if let Some(shutter) = &self.shutter {
            check_driver(&shutter.name, &shutter.driver, SHUTTER_DRIVERS)?;
        }
        for rs in &self.rotation_stages {
            check_driver(&rs.name, &rs.driver, ROTATION_STAGE_DRIVERS)?;
        }

        let mut names = HashSet::new();
        for name in self.device_names() {
            if !names.insert(name) {
                return Err(invalid(format!("Duplicate device name: {}", name)));
            }
        }
        Ok(())
    }

    /// Names of every configured device.
    pub fn device_names(&self) -> impl Iterator<Item = &str> {
        self.cameras
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.delay_lines.iter().map(|d| d.name.as_str()))
            .chain(self.shaper.iter().map(|s| s.name.as_str()))
            .chain(self.shutter.iter().map(|s| s.name.as_str()))
            .chain(self.rotation_stages.iter().map(|r| r.name.as_str()))
    }
}

fn invalid(msg: impl Into<String>) -> PpError {
    PpError::Configuration(msg.into())
}

fn check_driver(device: &str, driver: &str, known: &[&str]) -> PpResult<()> {
    if known.contains(&driver) {
        Ok(())
    } else {
        Err(invalid(format!(
            "device '{}': unknown driver '{}'. Must be one of: {}",
            device,
            driver,
            known.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_config_is_valid() {
        let config = SiteConfig::mock();
        assert!(config.validate().is_ok());
        assert_eq!(config.application.loop_interval_ms, 10);
        assert_eq!(config.signal.odd_shots, OddShotPolicy::Truncate);
    }

    #[test]
    fn test_rejects_three_cameras() {
        let mut config = SiteConfig::mock();
        config.cameras = vec![
            CameraConfig::mock("A"),
            CameraConfig::mock("B"),
            CameraConfig::mock("C"),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let mut config = SiteConfig::mock();
        config.delay_lines[0].name = config.cameras[0].name.clone();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate device name"));
    }

    #[test]
    fn test_rejects_unknown_driver() {
        let mut config = SiteConfig::mock();
        config.cameras[0].driver = "stresing".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_log_level_and_zero_shots() {
        let mut config = SiteConfig::mock();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = SiteConfig::mock();
        config.cameras[0].shots = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip_of_mock() {
        let config = SiteConfig::mock();
        let text = config.to_toml().unwrap();
        let parsed: SiteConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
