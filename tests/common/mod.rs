//! Common test utilities for integration tests
//!
//! Provides an in-memory cluster with a running controller, and polling
//! helpers for observing workflows reach a phase.

use std::time::Duration;

use kubext::adapters::memory::{MemoryCluster, PodSimulator};
use kubext::domain::models::constants::CONFIG_MAP_KEY;
use kubext::domain::models::{ConfigMap, ObjectMeta, WorkflowResource};
use kubext::domain::ports::ResourceClient;
use kubext::domain::ControllerResult;
use kubext::{Config, WorkflowController};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const NAMESPACE: &str = "default";

/// A controller running against an in-memory cluster
pub struct TestController {
    pub cluster: MemoryCluster,
    cancel: CancellationToken,
    controller: JoinHandle<ControllerResult<()>>,
}

/// Settings with short resync periods and few workers
pub fn fast_settings() -> Config {
    Config {
        workflow_workers: 2,
        pod_workers: 2,
        workflow_resync_secs: 1,
        pod_resync_secs: 1,
        ..Config::default()
    }
}

impl TestController {
    /// Store a controller configuration and start the controller, with the
    /// pod simulator when `simulate` is set.
    pub async fn start(simulate: bool) -> Self {
        let cluster = MemoryCluster::new();
        let settings = fast_settings();
        let config_map = ConfigMap {
            metadata: ObjectMeta::named(&settings.namespace, &settings.config_map),
            data: [(
                CONFIG_MAP_KEY.to_string(),
                "executorImage: kubext/kubextexec:test\n".to_string(),
            )]
            .into_iter()
            .collect(),
        };
        cluster.config_maps.create(&config_map).await.unwrap();

        let cancel = CancellationToken::new();
        if simulate {
            let sim = PodSimulator::new(cluster.pods.clone(), Duration::from_millis(20));
            tokio::spawn(sim.run(cancel.clone()));
        }
        let controller =
            tokio::spawn(WorkflowController::new(cluster.clients(), settings).run(cancel.clone()));

        Self {
            cluster,
            cancel,
            controller,
        }
    }

    pub async fn submit(&self, yaml: &str) -> WorkflowResource {
        let mut resource = WorkflowResource::from_yaml(yaml).unwrap();
        if resource.metadata.namespace.is_empty() {
            resource.metadata.namespace = NAMESPACE.to_string();
        }
        self.cluster.workflows.create(&resource).await.unwrap()
    }

    /// Poll until the workflow's phase is `phase`, or panic after `timeout`.
    pub async fn wait_for_phase(
        &self,
        name: &str,
        phase: &str,
        timeout: Duration,
    ) -> WorkflowResource {
        let workflows = &self.cluster.workflows;
        let reached = wait_for(
            move || async move {
                let wf = workflows.get(NAMESPACE, name).await.unwrap();
                wf.phase() == Some(phase)
            },
            timeout,
        )
        .await;
        let wf = self.cluster.workflows.get(NAMESPACE, name).await.unwrap();
        assert!(
            reached,
            "workflow {name} did not reach {phase}; status: {:?}",
            wf.body.get("status")
        );
        wf
    }

    /// Cancel the controller and wait for it to stop cleanly.
    pub async fn stop(self) {
        self.cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), self.controller)
            .await
            .expect("controller did not stop")
            .expect("controller task panicked");
        assert!(result.is_ok(), "controller returned {result:?}");
    }
}

/// Wait for a condition to be true with timeout
///
/// Polls the predicate every 20ms until it returns true or timeout is reached.
pub async fn wait_for<F, Fut>(mut predicate: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate().await
}
