//! `pp-core`
//!
//! Shared building blocks of the pump-probe acquisition stack:
//!
//! - [`reading::DetectorReading`]: one immutable batch of shot-resolved traces
//! - [`signal::SignalExtractor`]: turns a reading into means, noise and the
//!   chopper-locked differential signal
//! - [`capabilities`]: the device traits implemented by hardware adapters
//! - [`error::PpError`]: library error type
//! - [`logging`]: tracing subscriber setup

pub mod capabilities;
pub mod error;
pub mod logging;
pub mod reading;
pub mod signal;

pub use capabilities::{Camera, DelayStage, PulseShaper, RotationStage, Shutter};
pub use error::{DeviceError, DeviceErrorKind, PpError, PpResult};
pub use reading::{Background, DetectorReading};
pub use signal::{OddShotPolicy, ProcessedRead, SignalExtractor};
