//! Domain errors for the workflow controller.

use thiserror::Error;

use crate::domain::ports::ClusterError;

/// Structural problems with a single template's wire form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template type unspecified. choose one of: container, steps, script, resource, dag")]
    Unspecified,

    #[error("multiple template types specified")]
    MultipleKinds,

    #[error("valueFrom not specified")]
    ValueFromNotSpecified,

    #[error("multiple valueFrom sources specified")]
    MultipleValueFrom,
}

/// A stored workflow that does not decode into the typed model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DocumentError(pub String);

impl From<serde_json::Error> for DocumentError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

impl From<serde_yaml::Error> for DocumentError {
    fn from(err: serde_yaml::Error) -> Self {
        Self(err.to_string())
    }
}

/// Rejection of a workflow by the validator.
///
/// The message names the offending field and the broken rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0}")]
    Invalid(String),

    #[error("{location}: failed to resolve {{{{{tag}}}}}")]
    Unresolved { location: String, tag: String },
}

impl ValidationError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Problems with the cluster-held controller configuration.
#[derive(Debug, Error)]
pub enum ControllerConfigError {
    #[error("configmap '{0}' does not have key '{key}'", key = crate::domain::models::constants::CONFIG_MAP_KEY)]
    MissingKey(String),

    #[error("failed to parse controller configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("executorImage is required in controller configuration")]
    MissingExecutorImage,
}

/// The sidecar's environment is missing a mandatory variable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionEnvError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),
}

/// Failures of a reconciliation pass or a lifecycle operation.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("failed to decode workflow: {0}")]
    Document(#[from] DocumentError),

    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Config(#[from] ControllerConfigError),

    #[error("controller configuration has not been loaded")]
    ConfigNotLoaded,

    #[error("workflow {name} is {phase}: {reason}")]
    InvalidPhase {
        name: String,
        phase: String,
        reason: &'static str,
    },

    #[error("workflow {workflow} cannot be retried with node {node} in {phase} phase")]
    NodeNotRetryable {
        workflow: String,
        node: String,
        phase: String,
    },
    #[error("cache for {0} failed to sync")]
    CacheSync(&'static str),

    #[error("completion channel closed")]
    CompletionChannelClosed,
}

pub type ControllerResult<T> = Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_message_keeps_braces() {
        let err = ValidationError::Unresolved {
            location: "templates.a.steps[0].b".into(),
            tag: "steps.c.outputs.result".into(),
        };
        assert_eq!(
            err.to_string(),
            "templates.a.steps[0].b: failed to resolve {{steps.c.outputs.result}}"
        );
    }

    #[test]
    fn test_missing_key_names_config_key() {
        let err = ControllerConfigError::MissingKey("workflow-controller-configmap".into());
        assert_eq!(
            err.to_string(),
            "configmap 'workflow-controller-configmap' does not have key 'config'"
        );
    }
}
