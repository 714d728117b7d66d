//! Process configuration for the controller binary
//!
//! Layered with figment: defaults, then `.kubext/config.yaml`, then
//! `KUBEXT_*` environment overrides. The cluster-held controller
//! configuration is watched separately by the controller itself.

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
