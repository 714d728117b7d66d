//! Templates and the values that flow between them.
//!
//! The wire format carries the five template bodies as optional fields.
//! [`Template::body`] converts them into a [`TemplateBody`] so code that
//! executes templates matches on exactly one kind.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::errors::TemplateError;

/// A named unit of work: either a leaf executed as a pod, or a group of
/// invocations of other templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Inputs::is_empty")]
    pub inputs: Inputs,

    #[serde(default, skip_serializing_if = "Outputs::is_empty")]
    pub outputs: Outputs,

    /// Extra labels and annotations applied to the pod of a leaf template
    #[serde(default, skip_serializing_if = "TemplateMetadata::is_empty")]
    pub metadata: TemplateMetadata,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<Container>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<Script>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceTemplate>,

    /// Sequential stages, each a set of invocations run in parallel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Vec<WorkflowStep>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dag: Option<DagTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    /// Maximum number of concurrently active children of a group template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_strategy: Option<RetryStrategy>,
}

/// Discriminant of a template body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    Container,
    Script,
    Resource,
    Steps,
    Dag,
}

impl TemplateKind {
    /// Leaf templates run as a single pod.
    pub const fn is_leaf(self) -> bool {
        matches!(self, Self::Container | Self::Script | Self::Resource)
    }
}

impl fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Container => "Container",
            Self::Script => "Script",
            Self::Resource => "Resource",
            Self::Steps => "Steps",
            Self::Dag => "DAG",
        };
        write!(f, "{s}")
    }
}

/// Exactly one template body, borrowed from a [`Template`]
#[derive(Debug, Clone, Copy)]
pub enum TemplateBody<'a> {
    Container(&'a Container),
    Script(&'a Script),
    Resource(&'a ResourceTemplate),
    Steps(&'a [Vec<WorkflowStep>]),
    Dag(&'a DagTemplate),
}

impl TemplateBody<'_> {
    pub const fn kind(&self) -> TemplateKind {
        match self {
            Self::Container(_) => TemplateKind::Container,
            Self::Script(_) => TemplateKind::Script,
            Self::Resource(_) => TemplateKind::Resource,
            Self::Steps(_) => TemplateKind::Steps,
            Self::Dag(_) => TemplateKind::Dag,
        }
    }
}

impl Template {
    /// Resolve the single body this template declares.
    pub fn body(&self) -> Result<TemplateBody<'_>, TemplateError> {
        let mut bodies = Vec::with_capacity(1);
        if let Some(container) = &self.container {
            bodies.push(TemplateBody::Container(container));
        }
        if let Some(script) = &self.script {
            bodies.push(TemplateBody::Script(script));
        }
        if let Some(resource) = &self.resource {
            bodies.push(TemplateBody::Resource(resource));
        }
        if let Some(steps) = self.steps.as_deref().filter(|steps| !steps.is_empty()) {
            bodies.push(TemplateBody::Steps(steps));
        }
        if let Some(dag) = &self.dag {
            bodies.push(TemplateBody::Dag(dag));
        }

        match bodies.as_slice() {
            [body] => Ok(*body),
            [] => Err(TemplateError::Unspecified),
            _ => Err(TemplateError::MultipleKinds),
        }
    }

    pub fn kind(&self) -> Option<TemplateKind> {
        self.body().ok().map(|body| body.kind())
    }

    pub fn is_leaf(&self) -> bool {
        self.kind().is_some_and(TemplateKind::is_leaf)
    }

    /// The container a leaf template's pod runs, if it has one of its own.
    pub fn main_container(&self) -> Option<&Container> {
        match self.body().ok()? {
            TemplateBody::Container(container) => Some(container),
            TemplateBody::Script(script) => Some(&script.container),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl TemplateMetadata {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<Value>,
}

impl EnvVar {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            value_from: None,
        }
    }

    /// Env var populated from the pod's own metadata through the downward API.
    pub fn field_ref(name: impl Into<String>, field_path: &str) -> Self {
        Self {
            name: name.into(),
            value: None,
            value_from: Some(serde_json::json!({ "fieldRef": { "fieldPath": field_path } })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

/// A volume definition. Only the name is interpreted; the source is
/// passed through to the pod untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    #[serde(flatten)]
    pub source: serde_json::Map<String, Value>,
}

impl Volume {
    pub fn new(name: impl Into<String>, source: Value) -> Self {
        let source = match source {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            name: name.into(),
            source,
        }
    }
}

/// A container whose command is run against an inline source file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    #[serde(flatten)]
    pub container: Container,
    #[serde(default)]
    pub source: String,
}

/// A manifest applied to the cluster by the sidecar
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplate {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub manifest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_condition: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inputs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl Inputs {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.artifacts.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outputs {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
    /// Standard output of a script template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl Outputs {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.artifacts.is_empty() && self.result.is_none()
    }
}

/// Arguments bound to a template's inputs at an invocation site
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arguments {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl Arguments {
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty() && self.artifacts.is_empty()
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn artifact(&self, name: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    #[serde(default)]
    pub name: String,

    #[serde(
        default,
        deserialize_with = "deserialize_scalar",
        skip_serializing_if = "Option::is_none"
    )]
    pub default: Option<String>,

    #[serde(
        default,
        deserialize_with = "deserialize_scalar",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueFrom>,
}

impl Parameter {
    pub fn with_value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            ..Self::default()
        }
    }
}

/// Accept any YAML scalar where a string is expected.
fn deserialize_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Str(String),
        Int(i64),
        Float(f64),
        Bool(bool),
    }

    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|scalar| match scalar {
        Scalar::Str(s) => s,
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
        Scalar::Bool(b) => b.to_string(),
    }))
}

/// Wire form of an output parameter's source: at most one field may be set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueFrom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jq_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    /// Reference to a step or task output, e.g. `{{steps.a.outputs.parameters.b}}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

/// Where an output parameter's value comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource<'a> {
    Path(&'a str),
    JqFilter(&'a str),
    JsonPath(&'a str),
    Parameter(&'a str),
}

impl OutputSource<'_> {
    /// Whether the source can be produced by a template of `kind`.
    pub const fn valid_for(&self, kind: TemplateKind) -> bool {
        match (self, kind) {
            (Self::Path(_), TemplateKind::Container | TemplateKind::Script)
            | (Self::JqFilter(_) | Self::JsonPath(_), TemplateKind::Resource)
            | (Self::Parameter(_), TemplateKind::Steps | TemplateKind::Dag) => true,
            _ => false,
        }
    }
}

impl ValueFrom {
    pub fn source(&self) -> Result<OutputSource<'_>, TemplateError> {
        let mut sources = Vec::with_capacity(1);
        if let Some(path) = self.path.as_deref() {
            sources.push(OutputSource::Path(path));
        }
        if let Some(filter) = self.jq_filter.as_deref() {
            sources.push(OutputSource::JqFilter(filter));
        }
        if let Some(path) = self.json_path.as_deref() {
            sources.push(OutputSource::JsonPath(path));
        }
        if let Some(parameter) = self.parameter.as_deref() {
            sources.push(OutputSource::Parameter(parameter));
        }

        match sources.as_slice() {
            [source] => Ok(*source),
            [] => Err(TemplateError::ValueFromNotSpecified),
            _ => Err(TemplateError::MultipleValueFrom),
        }
    }
}

/// A file or directory produced or consumed by a template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    #[serde(default)]
    pub name: String,

    /// Location inside the container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<i32>,

    /// Reference to an upstream output artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    #[serde(flatten)]
    pub location: ArtifactLocation,
}

impl Artifact {
    pub fn has_location(&self) -> bool {
        self.location.is_set()
    }
}

/// Where an artifact lives outside the pod. At most one field is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifactory: Option<ArtifactoryArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<RawArtifact>,
}

impl ArtifactLocation {
    pub const fn is_set(&self) -> bool {
        self.s3.is_some()
            || self.git.is_some()
            || self.http.is_some()
            || self.artifactory.is_some()
            || self.raw.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Bucket {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key_secret: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_secret: Option<SecretKeySelector>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Artifact {
    #[serde(flatten)]
    pub bucket: S3Bucket,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitArtifact {
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpArtifact {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactoryArtifact {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawArtifact {
    pub data: String,
}

/// One invocation inside a step group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub template: String,
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub arguments: Arguments,
    /// Expands the step into one invocation per item
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub with_items: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DagTemplate {
    #[serde(default)]
    pub tasks: Vec<DagTask>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagTask {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub template: String,
    #[serde(default, skip_serializing_if = "Arguments::is_empty")]
    pub arguments: Arguments,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub with_items: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStrategy {
    /// Retries after the first attempt; unlimited when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i32>,
}

/// Render a `withItems` entry the way it appears in node names and `{{item}}`.
///
/// Returns `None` for composite values, which are not accepted as items.
pub fn item_to_string(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
