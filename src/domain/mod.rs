//! Domain layer for the workflow controller
//!
//! Resource models, errors and the cluster port. Nothing here performs I/O.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{
    ControllerConfigError, ControllerError, ControllerResult, DocumentError, TemplateError,
    ValidationError,
};
