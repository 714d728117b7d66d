//! Folding observed pods back into node status.

use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{info, warn};

use super::context::{Intent, Operation};
use crate::domain::models::constants::{
    ANNOTATION_KEY_NODE_MESSAGE, ANNOTATION_KEY_NODE_NAME, ANNOTATION_KEY_OUTPUTS,
};
use crate::domain::models::{NodePhase, NodeStatus, NodeType, Outputs, Pod, PodPhase};

const DEADLINE_EXCEEDED: &str = "Step exceeded its deadline";

impl Operation {
    /// Update active pod nodes from `pods`, the workflow's pods as listed
    /// from the cluster.
    pub(super) fn reconcile_pods(&mut self, pods: &[Pod], now: DateTime<Utc>) {
        let mut seen = HashSet::with_capacity(pods.len());
        for pod in pods {
            let Some(node_name) = pod.metadata.annotation(ANNOTATION_KEY_NODE_NAME) else {
                continue;
            };
            let id = self.wf.node_id(node_name);
            let Some(node) = self.wf.status.nodes.get_mut(&id) else {
                continue;
            };
            seen.insert(id);
            if !node.completed() && assess_node_status(pod, node, now) {
                info!(workflow = %self.key, node = %node.name, phase = %node.phase, "observed pod progress");
                self.updated = true;
            }
            if node.completed() {
                self.completed_pods.insert(pod.metadata.name.clone());
            }
        }

        // A pod that disappeared without being observed to finish leaves
        // nothing to infer its outcome from
        for (id, node) in &mut self.wf.status.nodes {
            if node.node_type != NodeType::Pod || node.completed() || seen.contains(id) {
                continue;
            }
            warn!(workflow = %self.key, node = %node.name, "pod deleted");
            node.phase = NodePhase::Error;
            node.message = Some("pod deleted".to_string());
            node.finished_at = Some(now);
            self.updated = true;
        }

        self.enforce_deadlines(now);
    }

    /// Fail active pod nodes whose template deadline has passed and signal
    /// their pods. Pods still within their deadline schedule a revisit.
    fn enforce_deadlines(&mut self, now: DateTime<Utc>) {
        let mut expired = Vec::new();
        let mut remaining = Vec::new();
        for node in self.wf.status.nodes.values() {
            if node.node_type != NodeType::Pod || node.completed() {
                continue;
            }
            let Some(deadline) = self.deadline(node) else {
                continue;
            };
            if deadline <= now {
                expired.push((node.name.clone(), node.id.clone()));
            } else if let Ok(left) = (deadline - now).to_std() {
                remaining.push(left);
            }
        }

        for left in remaining {
            self.request_requeue(left);
        }
        for (node_name, pod_name) in expired {
            warn!(workflow = %self.key, node = %node_name, "node exceeded its deadline");
            self.mark_node_phase(&node_name, NodePhase::Failed, Some(DEADLINE_EXCEEDED.to_string()));
            self.intents.push(Intent::SignalDeadline { pod_name });
        }
    }

    fn deadline(&self, node: &NodeStatus) -> Option<DateTime<Utc>> {
        let secs = node
            .template_name
            .as_deref()
            .and_then(|name| self.wf.template(name))
            .and_then(|tmpl| tmpl.active_deadline_seconds)?;
        let started = node.started_at?;
        started.checked_add_signed(TimeDelta::try_seconds(secs)?)
    }
}

/// Apply what `pod` reports to `node`. Returns whether anything changed.
pub(super) fn assess_node_status(pod: &Pod, node: &mut NodeStatus, now: DateTime<Utc>) -> bool {
    let (mut phase, mut message) = match pod.status.phase {
        PodPhase::Pending => (
            NodePhase::Running,
            pod.status.message.clone().or_else(|| pod.status.reason.clone()),
        ),
        PodPhase::Running => (NodePhase::Running, None),
        PodPhase::Succeeded => (NodePhase::Succeeded, None),
        PodPhase::Failed => (NodePhase::Failed, Some(failed_reason(pod))),
        PodPhase::Unknown => (
            NodePhase::Error,
            Some(format!(
                "Unexpected pod phase for {}: {}",
                pod.metadata.name, pod.status.phase
            )),
        ),
    };

    let mut updated = false;
    if node.outputs.is_none() {
        if let Some(raw) = pod.metadata.annotation(ANNOTATION_KEY_OUTPUTS) {
            match serde_json::from_str::<Outputs>(raw) {
                Ok(outputs) => {
                    node.outputs = Some(outputs);
                    updated = true;
                }
                Err(err) => {
                    phase = NodePhase::Error;
                    message = Some(format!("failed to decode outputs: {err}"));
                }
            }
        }
    }
    if node.phase != phase {
        node.phase = phase;
        updated = true;
    }
    if message.is_some() && node.message != message {
        node.message = message;
        updated = true;
    }
    if node.completed() && node.finished_at.is_none() {
        node.finished_at = Some(now);
        updated = true;
    }
    updated
}

fn failed_reason(pod: &Pod) -> String {
    pod.metadata
        .annotation(ANNOTATION_KEY_NODE_MESSAGE)
        .map(str::to_string)
        .or_else(|| pod.status.message.clone())
        .unwrap_or_else(|| "failed".to_string())
}
