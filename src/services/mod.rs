//! Controller services: caches, queues, validation and reconciliation.

pub mod arguments;
pub mod completion_labeler;
pub mod config_watcher;
pub mod controller;
pub mod dependency_resolver;
pub mod informer;
pub mod lifecycle;
pub mod operator;
pub mod substitution;
pub mod validation;
pub mod work_queue;

pub use completion_labeler::{completion_channel, CompletionLabeler, CompletionSender};
pub use config_watcher::{parse_config, ConfigHandle, ConfigWatcher};
pub use controller::WorkflowController;
pub use dependency_resolver::DependencyResolver;
pub use informer::{EventHandler, Informer, Store};
pub use lifecycle::{
    formulate_resubmit_workflow, resume_workflow, retry_workflow, suspend_workflow,
};
pub use operator::{build_pod, PassOutcome, WorkflowOperator};
pub use validation::{validate_workflow, ValidateOpts};
pub use work_queue::{QueueConfig, WorkQueue};
