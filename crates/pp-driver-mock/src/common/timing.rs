//! Timing configuration for realistic mode.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimingConfig {
    /// Readout time per laser shot in milliseconds (camera)
    pub readout_ms_per_shot: f64,
    /// Settling time after a move in milliseconds (stage, rotator)
    pub settling_time_ms: u64,
    /// Per-command latency in milliseconds (serial, network)
    pub communication_delay_ms: u64,
}

impl TimingConfig {
    /// Line camera at 1 kHz: one millisecond per shot.
    pub fn camera() -> Self {
        Self {
            readout_ms_per_shot: 1.0,
            settling_time_ms: 0,
            communication_delay_ms: 2,
        }
    }

    pub fn delay_line() -> Self {
        Self {
            readout_ms_per_shot: 0.0,
            settling_time_ms: 50,
            communication_delay_ms: 5,
        }
    }

    pub fn rotator() -> Self {
        Self {
            readout_ms_per_shot: 0.0,
            settling_time_ms: 30,
            communication_delay_ms: 3,
        }
    }

    /// Time to acquire `shots` shots.
    pub fn readout(&self, shots: usize) -> Duration {
        Duration::from_secs_f64(self.readout_ms_per_shot * shots as f64 / 1000.0)
    }

    pub fn settling(&self) -> Duration {
        Duration::from_millis(self.settling_time_ms)
    }

    pub fn communication(&self) -> Duration {
        Duration::from_millis(self.communication_delay_ms)
    }
}
