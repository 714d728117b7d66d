//! In-memory cluster used by tests and by the binary's local mode.
//!
//! Implements the [`ResourceClient`] port with resource versions,
//! optimistic concurrency and selector-aware watches.

pub mod client;
pub mod simulator;

use std::sync::Arc;

pub use client::MemoryClient;
pub use simulator::PodSimulator;

use crate::domain::models::{ConfigMap, PersistentVolumeClaim, Pod, WorkflowResource};
use crate::domain::ports::{ClusterClients, ResourceClient};

/// One in-memory store per resource kind the controller uses
#[derive(Default, Clone)]
pub struct MemoryCluster {
    pub workflows: Arc<MemoryClient<WorkflowResource>>,
    pub pods: Arc<MemoryClient<Pod>>,
    pub config_maps: Arc<MemoryClient<ConfigMap>>,
    pub claims: Arc<MemoryClient<PersistentVolumeClaim>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clients(&self) -> ClusterClients {
        ClusterClients {
            workflows: self.workflows.clone() as Arc<dyn ResourceClient<WorkflowResource>>,
            pods: self.pods.clone() as Arc<dyn ResourceClient<Pod>>,
            config_maps: self.config_maps.clone() as Arc<dyn ResourceClient<ConfigMap>>,
            claims: self.claims.clone() as Arc<dyn ResourceClient<PersistentVolumeClaim>>,
        }
    }
}
