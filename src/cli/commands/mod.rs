//! CLI command implementations.

pub mod controller;
pub mod lint;
