//! `pp-experiment`
//!
//! Experiment control on top of the capability traits of `pp-core`:
//!
//! - [`cam::Cam`] / [`delay_line::DelayLine`]: device wrappers with cached,
//!   observable state
//! - [`plan`]: the [`Plan`](plan::Plan) trait, status and events
//! - [`scan::ScanRunner`]: multi-scan phase machine driving [`scan::ScanSteps`]
//! - [`plans`]: pump-probe, fast GVD and adaptive time-zero plans
//! - [`storage`]: append-only scan result stores
//! - [`controller::Controller`]: the polling loop tying it together

pub mod cam;
pub mod controller;
pub mod delay_line;
pub mod plan;
pub mod plans;
pub mod scan;
pub mod storage;

pub use cam::{Cam, CamEvent};
pub use controller::{Controller, TickOutcome};
pub use delay_line::DelayLine;
pub use plan::{Plan, PlanEvent, PlanMeta, PlanStatus, StepResult, TimeTracker};
pub use scan::{Progress, ScanContext, ScanRunner, ScanSteps};
pub use storage::{JsonLinesStore, MemoryStore, ScanKey, ScanStore};
