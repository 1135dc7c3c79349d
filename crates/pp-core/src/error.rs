//! Error types shared across the acquisition stack.
//!
//! `PpError` is the library-level error. Device adapters report failures
//! through the structured [`DeviceError`], which carries the device name and a
//! coarse [`DeviceErrorKind`] so callers can decide between retrying (idle
//! refresh) and aborting (active plan).
//!
//! ## Error Categories
//!
//! 1. **Configuration** - `Configuration`, `InvalidArgument`
//!    - Raised before any device is touched (plan construction, config load)
//!    - Recovery: fix the parameters and build again
//!
//! 2. **Device** - `Device`
//!    - Raised by camera / delay line / shaper adapters
//!    - Recovery: retry locally in idle mode, abort the plan otherwise
//!
//! 3. **Persistence** - `Storage`, `Io`, `Serialization`
//!    - Raised by scan stores and metadata writers
//!    - Previously written data stays valid; nothing is rolled back

use thiserror::Error;

// =============================================================================
// Device Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    Communication,
    Timeout,
    Hardware,
    InvalidParameter,
    Shutdown,
}

impl std::fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DeviceErrorKind::Communication => "communication",
            DeviceErrorKind::Timeout => "timeout",
            DeviceErrorKind::Hardware => "hardware",
            DeviceErrorKind::InvalidParameter => "invalid_parameter",
            DeviceErrorKind::Shutdown => "shutdown",
        };
        write!(f, "{}", label)
    }
}

#[derive(Error, Debug, Clone)]
#[error("Device '{device}' {kind} error: {message}")]
pub struct DeviceError {
    pub device: String,
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(
        device: impl Into<String>,
        kind: DeviceErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            kind,
            message: message.into(),
        }
    }

    /// Transient failures are worth another attempt on the next idle tick.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            DeviceErrorKind::Communication | DeviceErrorKind::Timeout
        )
    }
}

/// Convenience alias for results using the library error type.
pub type PpResult<T> = std::result::Result<T, PpError>;

/// Primary error type of the acquisition core.
#[derive(Error, Debug)]
pub enum PpError {
    /// Adapter-level failure (serial timeout, acquisition fault).
    #[error("{0}")]
    Device(#[from] DeviceError),

    /// Plan or site parameters failed validation.
    ///
    /// Raised synchronously by constructors so that an invalid plan never
    /// reaches the scheduler.
    ///
    /// # Example
    ///
    /// ```rust
    /// use pp_core::error::PpError;
    ///
    /// fn check_shots(total: usize) -> Result<(), PpError> {
    ///     if total > 10_000 {
    ///         return Err(PpError::Configuration(format!(
    ///             "{} shots requested, at most 10000 supported",
    ///             total
    ///         )));
    ///     }
    ///     Ok(())
    /// }
    /// assert!(check_shots(20_000).is_err());
    /// ```
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A value handed to a pure function violates its contract
    /// (shape mismatch, odd shot count under the reject policy).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Scan store rejected an operation (duplicate key, closed store).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Plan lifecycle misuse (starting while another plan runs, ...).
    #[error("Plan error: {0}")]
    Plan(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PpError {
    /// Whether the error came from a device and looks recoverable by retrying.
    pub fn is_transient_device_error(&self) -> bool {
        matches!(self, PpError::Device(e) if e.is_transient())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_display() {
        let err = DeviceError::new("MockCam", DeviceErrorKind::Timeout, "no trigger");
        assert_eq!(
            err.to_string(),
            "Device 'MockCam' timeout error: no trigger"
        );
        assert!(err.is_transient());
    }

    #[test]
    fn test_hardware_fault_not_transient() {
        let err: PpError =
            DeviceError::new("Stage", DeviceErrorKind::Hardware, "limit switch").into();
        assert!(!err.is_transient_device_error());
    }

    #[test]
    fn test_configuration_message() {
        let err = PpError::Configuration("too many shots".into());
        assert!(err.to_string().contains("too many shots"));
    }
}
