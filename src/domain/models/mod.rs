pub mod config;
pub mod constants;
pub mod controller_config;
pub mod document;
pub mod meta;
pub mod pod;
pub mod selector;
pub mod template;
pub mod workflow;

pub use config::{Config, LoggingConfig, RateLimitConfig, RequeueConfig};
pub use controller_config::{
    ArtifactRepository, ArtifactoryArtifactRepository, ControllerConfig, S3ArtifactRepository,
};
pub use document::{WorkflowDocument, WorkflowResource};
pub use meta::{split_meta_namespace_key, ObjectMeta, OwnerReference};
pub use pod::{
    ConfigMap, ExecutionControl, ExecutionUnitEnv, PersistentVolumeClaim, Pod, PodKey, PodPhase,
    PodSpec, PodStatus,
};
pub use selector::{FieldRequirement, FieldSelector, LabelSelector, Requirement};
pub use template::{
    Arguments, Artifact, ArtifactLocation, Container, DagTask, DagTemplate, EnvVar, Inputs,
    OutputSource, Outputs, Parameter, ResourceTemplate, RetryStrategy, S3Artifact, S3Bucket,
    Script, Template, TemplateBody, TemplateKind, ValueFrom, Volume, VolumeMount, WorkflowStep,
};
pub use workflow::{
    node_id_for, NodePhase, NodeStatus, NodeType, VolumeClaimTemplate, Workflow, WorkflowSpec,
    WorkflowStatus,
};
