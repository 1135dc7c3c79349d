//! Simulated hardware for pump-probe acquisition.
//!
//! Every device implements the matching `pp-core` capability trait, so the
//! controller and the plans run unchanged against real adapters or these
//! mocks. All waiting uses `tokio::time`, which lets tests drive timing with a
//! paused clock.
//!
//! # Available Mock Drivers
//!
//! - [`MockCamera`] - line camera with probe/reference rows, chopper and aux channels
//! - [`MockDelayLine`] - optical delay line with honest `is_moving` reporting
//! - [`MockShaper`] - pulse shaper keeping masks and dispersion settings
//! - [`MockShutter`] - open/close shutter
//! - [`MockRotationStage`] - polarization rotator
//!
//! # Performance Characteristics (Realistic mode)
//!
//! - MockCamera: 1 ms per shot readout (1 kHz laser)
//! - MockDelayLine: 6 mm/s travel, 50 ms settling
//! - MockRotationStage: 30 ms settling

pub mod common;
mod mock_camera;
mod mock_delay_line;
mod mock_rotation_stage;
mod mock_shaper;
mod mock_shutter;

pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};

pub use mock_camera::{MockCamera, MockCameraBuilder};
pub use mock_delay_line::{MockDelayLine, MockDelayLineBuilder};
pub use mock_rotation_stage::MockRotationStage;
pub use mock_shaper::MockShaper;
pub use mock_shutter::MockShutter;
