use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::domain::models::{
    ConfigMap, FieldSelector, LabelSelector, ObjectMeta, PersistentVolumeClaim, Pod,
    WorkflowResource,
};

/// Errors returned by the cluster API
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("{kind} {key} was modified: the object has been changed since it was read")]
    Conflict { kind: &'static str, key: String },

    #[error("watch closed: {0}")]
    WatchClosed(String),

    #[error("cluster API error: {0}")]
    Api(String),
}

impl ClusterError {
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// A kind of object stored by the cluster API
pub trait Resource: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Value of a field path, for field selectors.
    fn field(&self, path: &str) -> Option<String> {
        match path {
            "metadata.name" => Some(self.meta().name.clone()),
            "metadata.namespace" => Some(self.meta().namespace.clone()),
            _ => None,
        }
    }
}

impl Resource for WorkflowResource {
    const KIND: &'static str = "Workflow";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Resource for Pod {
    const KIND: &'static str = "Pod";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn field(&self, path: &str) -> Option<String> {
        match path {
            "status.phase" => Some(self.status.phase.to_string()),
            "metadata.name" => Some(self.metadata.name.clone()),
            "metadata.namespace" => Some(self.metadata.namespace.clone()),
            _ => None,
        }
    }
}

impl Resource for ConfigMap {
    const KIND: &'static str = "ConfigMap";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Resource for PersistentVolumeClaim {
    const KIND: &'static str = "PersistentVolumeClaim";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Scope of a list or watch call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListParams {
    /// All namespaces when unset
    pub namespace: Option<String>,
    pub labels: LabelSelector,
    pub fields: FieldSelector,
}

impl ListParams {
    pub fn namespaced(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn labels(mut self, labels: LabelSelector) -> Self {
        self.labels = labels;
        self
    }

    #[must_use]
    pub fn fields(mut self, fields: FieldSelector) -> Self {
        self.fields = fields;
        self
    }

    pub fn matches<K: Resource>(&self, obj: &K) -> bool {
        let meta = obj.meta();
        self.namespace
            .as_deref()
            .is_none_or(|ns| ns == meta.namespace)
            && self.labels.matches(&meta.labels)
            && self.fields.matches(|path| obj.field(path))
    }
}

/// Result of a list call. Watches resume from `resource_version`.
#[derive(Debug, Clone)]
pub struct ObjectList<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// A change observed on a watch
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    /// Carries the last state of the object
    Deleted(K),
    /// The watch can no longer be trusted; the caller must relist
    Error(ClusterError),
}

/// Client for one resource kind
#[async_trait]
pub trait ResourceClient<K: Resource>: Send + Sync {
    /// List objects matching `params`
    async fn list(&self, params: &ListParams) -> ClusterResult<ObjectList<K>>;

    /// Stream changes after `resource_version` for objects matching `params`.
    ///
    /// An object that stops matching is reported as deleted, and one that
    /// starts matching as added.
    async fn watch(
        &self,
        params: &ListParams,
        resource_version: &str,
    ) -> ClusterResult<BoxStream<'static, WatchEvent<K>>>;

    async fn get(&self, namespace: &str, name: &str) -> ClusterResult<K>;

    /// Create an object. An empty name with `generateName` set gets a generated name.
    async fn create(&self, obj: &K) -> ClusterResult<K>;

    /// Replace an object, failing with `Conflict` if its resource version is stale
    async fn update(&self, obj: &K) -> ClusterResult<K>;

    async fn delete(&self, namespace: &str, name: &str) -> ClusterResult<()>;
}

/// The cluster clients the controller is constructed with
#[derive(Clone)]
pub struct ClusterClients {
    pub workflows: Arc<dyn ResourceClient<WorkflowResource>>,
    pub pods: Arc<dyn ResourceClient<Pod>>,
    pub config_maps: Arc<dyn ResourceClient<ConfigMap>>,
    pub claims: Arc<dyn ResourceClient<PersistentVolumeClaim>>,
}
