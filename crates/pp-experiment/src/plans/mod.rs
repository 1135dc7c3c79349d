//! Concrete experiment plans.
//!
//! Each plan implements [`ScanSteps`](crate::scan::ScanSteps) and is run by
//! wrapping it in a [`ScanRunner`](crate::scan::ScanRunner):
//!
//! ```rust,ignore
//! let plan = PumpProbePlan::new("sample", cam, delay_line, delays, 1000, store)?;
//! controller
//!     .start_plan(Box::new(ScanRunner::new(plan).with_max_scan(5)))
//!     .await?;
//! ```

pub mod adaptive_time_zero;
pub mod fast_gvd;
pub mod pump_probe;

pub use adaptive_time_zero::{AdaptiveTimeZeroConfig, AdaptiveTimeZeroPlan, ReadMode, TimeZeroHandle};
pub use fast_gvd::{FastGvdConfig, FastGvdResults, FastGvdScan, GvdScanMode};
pub use pump_probe::{PumpProbePlan, PumpProbeResults};
