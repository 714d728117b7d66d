//! Well-known label, annotation, container and variable names.
//!
//! These form the contract between the controller, the execution-unit
//! sidecar and external tooling. Changing any of them breaks running
//! workflows.

/// API group used as the prefix of every controller-owned key
pub const API_GROUP: &str = "workflows.kubext.io";
/// `apiVersion` written on workflows and owner references
pub const API_VERSION: &str = "workflows.kubext.io/v1alpha1";
/// Kind of the workflow resource
pub const WORKFLOW_KIND: &str = "Workflow";

/// Namespace the controller is installed in by default
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "kube-system";

/// Key in the configuration resource holding the YAML blob
pub const CONFIG_MAP_KEY: &str = "config";

pub const MAIN_CONTAINER_NAME: &str = "main";
pub const INIT_CONTAINER_NAME: &str = "init";
pub const WAIT_CONTAINER_NAME: &str = "wait";

/// Downward-API volume exposing pod annotations to the sidecar
pub const POD_METADATA_VOLUME_NAME: &str = "podmetadata";
pub const POD_METADATA_ANNOTATIONS_VOLUME_PATH: &str = "annotations";
pub const POD_METADATA_MOUNT_PATH: &str = "/kubext/podmetadata";

/// Scratch volume shared by init and main containers for scripts and manifests
pub const STAGING_VOLUME_NAME: &str = "kubext-staging";
pub const EXECUTOR_STAGING_EMPTY_DIR: &str = "/kubext/staging";
pub const EXECUTOR_SCRIPT_SOURCE_PATH: &str = "/kubext/staging/script";
pub const EXECUTOR_RESOURCE_MANIFEST_PATH: &str = "/tmp/manifest.yaml";
pub const EXECUTOR_ARTIFACT_BASE_DIR: &str = "/kubext/inputs/artifacts";
/// Scratch volume the init container downloads input artifacts into
pub const INPUT_ARTIFACTS_VOLUME_NAME: &str = "input-artifacts";
pub const EXECUTOR_COMMAND: &str = "kubextexec";

pub const ANNOTATION_KEY_NODE_NAME: &str = "workflows.kubext.io/node-name";
/// Written by the sidecar when artifact handling fails
pub const ANNOTATION_KEY_NODE_MESSAGE: &str = "workflows.kubext.io/node-message";
/// JSON-encoded template the sidecar executes
pub const ANNOTATION_KEY_TEMPLATE: &str = "workflows.kubext.io/template";
/// JSON-encoded outputs written back by the sidecar
pub const ANNOTATION_KEY_OUTPUTS: &str = "workflows.kubext.io/outputs";
/// Execution control parameters obeyed by the sidecar
pub const ANNOTATION_KEY_EXECUTION_CONTROL: &str = "workflows.kubext.io/execution";

pub const LABEL_KEY_CONTROLLER_INSTANCE_ID: &str = "workflows.kubext.io/controller-instanceid";
/// Resources labeled `completed=true` are ignored by the controller
pub const LABEL_KEY_COMPLETED: &str = "workflows.kubext.io/completed";
/// Name of the workflow owning a pod
pub const LABEL_KEY_WORKFLOW: &str = "workflows.kubext.io/workflow";
pub const LABEL_KEY_PHASE: &str = "workflows.kubext.io/phase";

pub const ENV_VAR_POD_NAME: &str = "KUBEXT_POD_NAME";
pub const ENV_VAR_NAMESPACE: &str = "KUBEXT_NAMESPACE";
pub const ENV_VAR_POD_IP: &str = "KUBEXT_POD_IP";

pub const GLOBAL_VAR_WORKFLOW_NAME: &str = "managed.name";
pub const GLOBAL_VAR_WORKFLOW_NAMESPACE: &str = "managed.namespace";
pub const GLOBAL_VAR_WORKFLOW_UID: &str = "managed.uid";
/// Only bound while the exit handler runs
pub const GLOBAL_VAR_WORKFLOW_STATUS: &str = "managed.status";
pub const GLOBAL_VAR_WORKFLOW_PARAMETERS_PREFIX: &str = "managed.parameters.";
pub const LOCAL_VAR_POD_NAME: &str = "pod.name";
