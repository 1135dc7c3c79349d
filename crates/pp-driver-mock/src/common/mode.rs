//! Operational modes for mock devices.
//!
//! - **Instant**: no delays, deterministic data where the device supports it
//! - **Realistic**: readout and motion take wall-clock time
//! - **Chaos**: realistic timing plus random failures

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockMode {
    /// Zero delays - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests and demos
    Realistic,
    /// Hardware-like timing with injected failures
    Chaos,
}

impl MockMode {
    /// Whether simulated operations should sleep.
    pub fn is_timed(self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode() {
        assert_eq!(MockMode::default(), MockMode::Instant);
        assert!(!MockMode::Instant.is_timed());
        assert!(MockMode::Chaos.is_timed());
    }
}
