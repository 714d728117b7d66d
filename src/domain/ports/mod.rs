//! Port trait definitions (Hexagonal Architecture)
//!
//! The controller talks to the cluster only through [`ResourceClient`].
//! Adapters implement it; the in-memory adapter backs tests and local runs.

pub mod cluster;

pub use cluster::{
    ClusterClients, ClusterError, ClusterResult, ListParams, ObjectList, Resource,
    ResourceClient, WatchEvent,
};
