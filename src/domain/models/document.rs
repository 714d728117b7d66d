//! Workflow documents as stored in the cluster.
//!
//! The cluster holds whatever the user submitted, which may not decode into
//! a [`Workflow`]. The cache and queues carry [`WorkflowResource`]s, which
//! only require valid metadata, and the reconciler converts them with
//! [`WorkflowDocument::from`] before acting.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::meta::ObjectMeta;
use super::workflow::Workflow;
use crate::domain::errors::DocumentError;

/// A workflow resource with typed metadata and an untyped body
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResource {
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Everything except `metadata`: `apiVersion`, `kind`, `spec`, `status`
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl WorkflowResource {
    /// Phase recorded in `status.phase`, read without decoding the spec.
    pub fn phase(&self) -> Option<&str> {
        self.body.get("status")?.get("phase")?.as_str()
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, DocumentError> {
        let value: Value = serde_yaml::from_str(yaml)?;
        Ok(serde_json::from_value(value)?)
    }
}

impl TryFrom<&Workflow> for WorkflowResource {
    type Error = DocumentError;

    fn try_from(wf: &Workflow) -> Result<Self, Self::Error> {
        Ok(serde_json::from_value(serde_json::to_value(wf)?)?)
    }
}

impl TryFrom<&WorkflowResource> for Workflow {
    type Error = DocumentError;

    fn try_from(resource: &WorkflowResource) -> Result<Self, Self::Error> {
        Ok(serde_json::from_value(serde_json::to_value(resource)?)?)
    }
}

/// Outcome of decoding a stored workflow
#[derive(Debug, Clone)]
pub enum WorkflowDocument {
    /// The body did not decode; the reconciler fails it without walking the graph
    Raw {
        resource: WorkflowResource,
        error: DocumentError,
    },
    Parsed(Box<Workflow>),
}

impl From<WorkflowResource> for WorkflowDocument {
    fn from(resource: WorkflowResource) -> Self {
        match Workflow::try_from(&resource) {
            Ok(wf) => Self::Parsed(Box::new(wf)),
            Err(error) => Self::Raw { resource, error },
        }
    }
}
