use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::template::S3Bucket;

/// Runtime configuration read from the cluster's configuration resource
///
/// Swapped as a whole whenever the resource changes; reconciliation passes
/// hold an `Arc` to the snapshot they started with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Image of the init and wait sidecars. Required.
    #[serde(default)]
    pub executor_image: String,

    /// Resource requirements applied to the sidecar containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_resources: Option<serde_json::Value>,

    /// Default location for output artifacts that do not name one
    #[serde(default)]
    pub artifact_repository: ArtifactRepository,

    /// Restrict the controller to one namespace; all namespaces when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Only handle workflows labeled with this instance id
    #[serde(
        rename = "instanceID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub instance_id: Option<String>,

    /// Extra labels a workflow must carry to be handled
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRepository {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3ArtifactRepository>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifactory: Option<ArtifactoryArtifactRepository>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3ArtifactRepository {
    #[serde(flatten)]
    pub bucket: S3Bucket,
    /// Prefix prepended to generated artifact keys
    #[serde(default)]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactoryArtifactRepository {
    #[serde(rename = "repoURL", default)]
    pub repo_url: String,
}
