//! Kubext - workflow controller
//!
//! Kubext reconciles workflow resources, multi-step and DAG-structured jobs,
//! into pods. It watches workflows and the pods it created, walks each
//! workflow's template graph, creates the pods that are ready to run, and
//! records node and workflow status back on the resource.
//!
//! # Architecture
//!
//! This crate follows Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): resource models, errors and the cluster port
//! - **Adapter Layer** (`adapters`): the in-memory cluster
//! - **Service Layer** (`services`): caches, queues, validation and reconciliation
//! - **Infrastructure Layer** (`infrastructure`): settings and logging
//! - **CLI Layer** (`cli`): command-line interface
//!
//! # Example
//!
//! ```ignore
//! use kubext::adapters::memory::MemoryCluster;
//! use kubext::services::WorkflowController;
//! use kubext::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cluster = MemoryCluster::new();
//!     WorkflowController::new(cluster.clients(), Config::default())
//!         .run(CancellationToken::new())
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use domain::models::{
    Config, ControllerConfig, LoggingConfig, NodePhase, NodeStatus, RateLimitConfig,
    RequeueConfig, Workflow,
};
pub use domain::ports::{ClusterClients, ClusterError, ResourceClient};
pub use domain::{ControllerError, ValidationError};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{validate_workflow, ValidateOpts, WorkflowController, WorkflowOperator};
