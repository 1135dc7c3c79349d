//! `pp-hardware`
//!
//! Site configuration and device construction.
//!
//! - [`config::SiteConfig`]: figment-loaded description of a setup
//! - [`factory::build_devices`]: turns a configuration into adapters

pub mod config;
pub mod factory;

pub use config::SiteConfig;
pub use factory::{build_devices, DeviceSet};
