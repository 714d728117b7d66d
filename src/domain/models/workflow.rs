//! The workflow resource and its node graph.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::constants::{API_VERSION, LABEL_KEY_COMPLETED, WORKFLOW_KIND};
use super::meta::{ObjectMeta, OwnerReference};
use super::template::{Arguments, Inputs, Outputs, Template, Volume};

/// A user-submitted graph of templates plus the controller's view of its progress
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: WorkflowSpec,
    #[serde(default)]
    pub status: WorkflowStatus,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    WORKFLOW_KIND.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    #[serde(default)]
    pub templates: Vec<Template>,

    /// Name of the template run first
    #[serde(default)]
    pub entrypoint: String,

    /// Global arguments, visible as `managed.parameters.*`
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub arguments: Arguments,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Claims created for the lifetime of the workflow
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,

    /// Template invoked once the main graph finishes, whatever its outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_exit: Option<String>,

    /// Cap on concurrently active pods across the whole workflow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i64>,

    /// Stops new nodes from being scheduled while set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeClaimTemplate {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    /// Unset until the first reconciliation pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<NodePhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Node id to node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub nodes: BTreeMap<String, NodeStatus>,

    /// Volumes backed by the claims created from `volumeClaimTemplates`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub persistent_volume_claims: Vec<Volume>,
}

/// Phase of a node, and of the workflow as a whole
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodePhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Skipped,
    Failed,
    Error,
}

impl NodePhase {
    pub const fn is_completed(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Skipped | Self::Failed | Self::Error
        )
    }

    pub const fn is_successful(self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Skipped => "Skipped",
            Self::Failed => "Failed",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[default]
    Pod,
    Steps,
    StepGroup,
    #[serde(rename = "DAG")]
    Dag,
    Retry,
    Skipped,
}

/// One instantiated vertex of the running graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: String,

    /// Fully qualified name, unique within the workflow
    pub name: String,

    #[serde(default)]
    pub display_name: String,

    #[serde(rename = "type", default)]
    pub node_type: NodeType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,

    #[serde(default)]
    pub phase: NodePhase,

    /// Id of the nearest enclosing steps or DAG node
    #[serde(
        rename = "boundaryID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub boundary_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Inputs>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,

    /// Ids of child nodes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

impl NodeStatus {
    pub const fn completed(&self) -> bool {
        self.phase.is_completed()
    }

    pub const fn successful(&self) -> bool {
        self.phase.is_successful()
    }

    /// A failed or errored attempt may be retried.
    pub const fn can_retry(&self) -> bool {
        self.completed() && !self.successful()
    }
}

impl Workflow {
    /// Derive the id of a node from its name.
    ///
    /// The root node keeps the workflow name; every other node gets a short
    /// content hash so ids stay valid pod names.
    pub fn node_id(&self, node_name: &str) -> String {
        node_id_for(&self.metadata.name, node_name)
    }

    pub fn template(&self, name: &str) -> Option<&Template> {
        self.spec.templates.iter().find(|t| t.name == name)
    }

    pub fn node_by_name(&self, node_name: &str) -> Option<&NodeStatus> {
        self.status.nodes.get(&self.node_id(node_name))
    }

    pub fn key(&self) -> String {
        self.metadata.key()
    }

    pub fn is_labeled_completed(&self) -> bool {
        self.metadata.label(LABEL_KEY_COMPLETED) == Some("true")
    }

    pub fn is_suspended(&self) -> bool {
        self.spec.suspend.unwrap_or(false)
    }

    /// Name of the node the exit handler runs under.
    pub fn on_exit_node_name(&self) -> String {
        format!("{}.onExit", self.metadata.name)
    }

    /// Owner reference making dependents garbage-collected with the workflow
    pub fn controller_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone(),
            controller: true,
            block_owner_deletion: true,
        }
    }
}

/// Node id for `node_name` in the workflow called `workflow_name`.
pub fn node_id_for(workflow_name: &str, node_name: &str) -> String {
    if node_name == workflow_name {
        return workflow_name.to_string();
    }
    let digest = Sha256::digest(node_name.as_bytes());
    let hash = hex::encode(digest);
    format!("{workflow_name}-{}", &hash[..10])
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_WORLD: &str = r#"
apiVersion: workflows.kubext.io/v1alpha1
kind: Workflow
metadata:
  name: hello-world
spec:
  entrypoint: whalesay
  templates:
  - name: whalesay
    metadata:
      annotations:
        annotationKey1: "annotationValue1"
      labels:
        labelKey1: "labelValue1"
    container:
      image: docker/whalesay:latest
      command: [cowsay]
      args: ["hello world"]
"#;

    #[test]
    fn test_parse_hello_world() {
        let wf: Workflow = serde_yaml::from_str(HELLO_WORLD).unwrap();
        assert_eq!(wf.metadata.name, "hello-world");
        assert_eq!(wf.spec.entrypoint, "whalesay");
        assert!(wf.status.phase.is_none());
        let tmpl = wf.template("whalesay").unwrap();
        assert!(tmpl.is_leaf());
        assert_eq!(tmpl.metadata.labels["labelKey1"], "labelValue1");
    }

    #[test]
    fn test_node_id_is_stable_and_distinct() {
        let wf: Workflow = serde_yaml::from_str(HELLO_WORLD).unwrap();
        assert_eq!(wf.node_id("hello-world"), "hello-world");

        let a = wf.node_id("hello-world[0].a");
        let b = wf.node_id("hello-world[0].b");
        assert_ne!(a, b);
        assert_eq!(a, wf.node_id("hello-world[0].a"));
        assert!(a.starts_with("hello-world-"));
        assert_eq!(a.len(), "hello-world-".len() + 10);
    }

    #[test]
    fn test_phase_predicates() {
        assert!(!NodePhase::Running.is_completed());
        assert!(NodePhase::Skipped.is_successful());
        assert!(NodePhase::Error.is_completed());
        assert!(!NodePhase::Failed.is_successful());
    }

    #[test]
    fn test_node_type_wire_names() {
        assert_eq!(serde_json::to_string(&NodeType::Dag).unwrap(), "\"DAG\"");
        assert_eq!(serde_json::to_string(&NodeType::StepGroup).unwrap(), "\"StepGroup\"");
    }
}
