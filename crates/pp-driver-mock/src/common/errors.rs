//! Error injection for simulated devices.
//!
//! Every simulated operation calls [`ErrorConfig::check_operation`] first;
//! failures come back as structured [`DeviceError`]s so the controller sees
//! exactly what a real adapter would report.

use super::rng::MockRng;
use parking_lot::Mutex;
use pp_core::error::{DeviceError, DeviceErrorKind};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0), `"*"` matches every operation
    failure_rates: Arc<HashMap<&'static str, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    rng: Arc<MockRng>,
    state: Arc<Mutex<ErrorState>>,
}

#[derive(Debug, Clone)]
pub enum ErrorScenario {
    /// Fail every call after `count` successful ones
    FailAfterN {
        operation: &'static str,
        count: u32,
    },
    /// Fail exactly the `nth` call (1-based), succeed otherwise
    FailOnNth {
        operation: &'static str,
        nth: u32,
    },
    /// Time out on every call of an operation
    Timeout { operation: &'static str },
    /// Lose communication on the first call; every later call fails too
    CommunicationLoss,
    /// Latch a hardware fault on the first call
    HardwareFault { code: u32 },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<&'static str, u32>,
    communication_lost: bool,
    hardware_fault_code: u32,
}

impl ErrorConfig {
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Uniform random failures of every operation.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    pub fn with_rates(rates: HashMap<&'static str, f64>) -> Self {
        Self::build(rates, Vec::new(), None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Decide whether `operation` on `device` fails this time.
    pub fn check_operation(
        &self,
        device: &str,
        operation: &'static str,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(DeviceError::new(
                device,
                DeviceErrorKind::Communication,
                "Communication lost",
            ));
        }
        if state.hardware_fault_code != 0 {
            return Err(DeviceError::new(
                device,
                DeviceErrorKind::Hardware,
                format!("Hardware fault: {}", state.hardware_fault_code),
            ));
        }

        let counts_operation = self.scenarios.iter().any(|s| {
            matches!(s,
                ErrorScenario::FailAfterN { operation: op, .. }
                | ErrorScenario::FailOnNth { operation: op, .. } if *op == operation)
        });
        let call = if counts_operation {
            let current = state.operation_counts.entry(operation).or_insert(0);
            *current += 1;
            *current
        } else {
            0
        };

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN {
                    operation: op,
                    count,
                } if *op == operation && call > *count => {
                    return Err(DeviceError::new(
                        device,
                        DeviceErrorKind::Hardware,
                        format!("Injected failure after {} operations", count),
                    ));
                }
                ErrorScenario::FailOnNth { operation: op, nth }
                    if *op == operation && call == *nth =>
                {
                    return Err(DeviceError::new(
                        device,
                        DeviceErrorKind::Hardware,
                        format!("Injected failure on call {}", nth),
                    ));
                }
                ErrorScenario::Timeout { operation: op } if *op == operation => {
                    return Err(DeviceError::new(
                        device,
                        DeviceErrorKind::Timeout,
                        format!("Operation '{}' timed out", operation),
                    ));
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(DeviceError::new(
                        device,
                        DeviceErrorKind::Communication,
                        "Communication lost",
                    ));
                }
                ErrorScenario::HardwareFault { code } => {
                    state.hardware_fault_code = *code;
                    return Err(DeviceError::new(
                        device,
                        DeviceErrorKind::Hardware,
                        format!("Hardware fault: {}", code),
                    ));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);

        if self.rng.should_fail(rate) {
            return Err(DeviceError::new(
                device,
                DeviceErrorKind::Communication,
                format!("Random failure on operation '{}'", operation),
            ));
        }

        Ok(())
    }

    /// Clear counters and latched faults.
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
