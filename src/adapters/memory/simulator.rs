use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::models::constants::{
    ANNOTATION_KEY_OUTPUTS, ANNOTATION_KEY_TEMPLATE, LABEL_KEY_COMPLETED,
};
use crate::domain::models::{LabelSelector, Outputs, Pod, PodPhase, Requirement, Template};
use crate::domain::ports::{ClusterResult, ListParams, ResourceClient};

/// Stands in for a kubelet and the execution sidecar when running against
/// the in-memory cluster.
///
/// Each step moves pending pods to running and running pods to succeeded,
/// writing the outputs their template declares.
pub struct PodSimulator {
    pods: Arc<dyn ResourceClient<Pod>>,
    interval: Duration,
}

impl PodSimulator {
    pub fn new(pods: Arc<dyn ResourceClient<Pod>>, interval: Duration) -> Self {
        Self { pods, interval }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.step().await {
                        warn!(error = %err, "pod simulator step failed");
                    }
                }
            }
        }
    }

    /// Advance every incomplete pod by one phase. Returns how many moved.
    pub async fn step(&self) -> ClusterResult<usize> {
        let params = ListParams::default().labels(LabelSelector::new().with(
            Requirement::Equals(LABEL_KEY_COMPLETED.to_string(), "false".to_string()),
        ));
        let mut advanced = 0;
        for mut pod in self.pods.list(&params).await?.items {
            match pod.status.phase {
                PodPhase::Pending => {
                    pod.status.phase = PodPhase::Running;
                    pod.status.start_time = Some(Utc::now());
                }
                PodPhase::Running => {
                    pod.status.phase = PodPhase::Succeeded;
                    if let Some(outputs) = simulated_outputs(&pod) {
                        pod.metadata
                            .annotations
                            .insert(ANNOTATION_KEY_OUTPUTS.to_string(), outputs);
                    }
                }
                _ => continue,
            }
            match self.pods.update(&pod).await {
                Ok(updated) => {
                    debug!(pod = %updated.metadata.key(), phase = %updated.status.phase, "simulated pod transition");
                    advanced += 1;
                }
                Err(err) if err.is_conflict() || err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(advanced)
    }
}

/// Outputs a successful run of the pod's template would report: each output
/// parameter takes its default, and scripts print nothing.
fn simulated_outputs(pod: &Pod) -> Option<String> {
    let template: Template =
        serde_json::from_str(pod.metadata.annotation(ANNOTATION_KEY_TEMPLATE)?).ok()?;
    let mut outputs = Outputs {
        parameters: template.outputs.parameters.clone(),
        artifacts: template.outputs.artifacts.clone(),
        result: template.script.as_ref().map(|_| String::new()),
    };
    for param in &mut outputs.parameters {
        param.value = Some(param.default.clone().unwrap_or_default());
    }
    if outputs.is_empty() {
        return None;
    }
    serde_json::to_string(&outputs).ok()
}
