//! Infrastructure layer module
//!
//! Process-level plumbing for the controller binary:
//! - Configuration loading and validation
//! - Logging setup
//!
//! The cluster adapters implementing the domain ports live under `adapters`.

pub mod config;
pub mod logging;
