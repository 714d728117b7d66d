//! Operations on whole workflows requested from outside the reconcile loop:
//! resubmitting, retrying, suspending and resuming.

use std::collections::BTreeMap;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::domain::models::constants::{LABEL_KEY_COMPLETED, LABEL_KEY_PHASE};
use crate::domain::models::{
    NodePhase, NodeStatus, NodeType, ObjectMeta, Workflow, WorkflowResource, WorkflowStatus,
};
use crate::domain::ports::{ClusterClients, ResourceClient};
use crate::domain::{ControllerError, ControllerResult};

/// Labels the controller owns; a resubmitted workflow starts without them
const CONTROLLER_LABELS: [&str; 2] = [LABEL_KEY_COMPLETED, LABEL_KEY_PHASE];

/// Whether `node_name` is the exit handler node `exit_name` or one of its
/// descendants (`.step`, `[group]` or `(attempt)` suffixes).
fn in_exit_handler(node_name: &str, exit_name: &str) -> bool {
    node_name
        .strip_prefix(exit_name)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(['.', '[', '(']))
}

/// Build a fresh workflow from `wf` for submission.
///
/// The copy runs the same spec under a generated name. In memoized mode the
/// copy is named up front and reuses the outcomes of pods that succeeded,
/// which requires `wf` to have failed. Exit handler nodes are never carried:
/// a resubmitted workflow always runs its exit handler again.
pub fn formulate_resubmit_workflow(wf: &Workflow, memoized: bool) -> ControllerResult<Workflow> {
    if memoized && !matches!(wf.status.phase, Some(NodePhase::Failed | NodePhase::Error)) {
        return Err(ControllerError::InvalidPhase {
            name: wf.metadata.name.clone(),
            phase: phase_name(wf),
            reason: "only Failed or Error workflows can be resubmitted in memoized mode",
        });
    }

    let generate_name = wf
        .metadata
        .generate_name
        .clone()
        .unwrap_or_else(|| format!("{}-", wf.metadata.name));
    let mut labels = wf.metadata.labels.clone();
    labels.retain(|key, _| !CONTROLLER_LABELS.contains(&key.as_str()));

    let mut resubmitted = Workflow {
        api_version: wf.api_version.clone(),
        kind: wf.kind.clone(),
        metadata: ObjectMeta {
            generate_name: Some(generate_name.clone()),
            namespace: wf.metadata.namespace.clone(),
            labels,
            annotations: wf.metadata.annotations.clone(),
            ..ObjectMeta::default()
        },
        spec: wf.spec.clone(),
        status: WorkflowStatus::default(),
    };
    if !memoized {
        return Ok(resubmitted);
    }

    let suffix = Uuid::new_v4().simple().to_string();
    resubmitted.metadata.name = format!("{generate_name}{}", &suffix[..5]);
    let exit_name = wf.on_exit_node_name();
    let now = Utc::now();
    let mut nodes = BTreeMap::new();
    for node in wf.status.nodes.values() {
        if node.node_type != NodeType::Pod
            || !node.successful()
            || in_exit_handler(&node.name, &exit_name)
        {
            continue;
        }
        let Some(rest) = node.name.strip_prefix(wf.metadata.name.as_str()) else {
            continue;
        };
        let name = format!("{}{rest}", resubmitted.metadata.name);
        let id = resubmitted.node_id(&name);
        let carried = NodeStatus {
            id: id.clone(),
            name,
            node_type: NodeType::Skipped,
            phase: NodePhase::Skipped,
            boundary_id: None,
            message: Some(format!("original pod: {}", node.id)),
            started_at: Some(now),
            finished_at: Some(now),
            children: Vec::new(),
            ..node.clone()
        };
        nodes.insert(id, carried);
    }
    resubmitted.status.nodes = nodes;
    Ok(resubmitted)
}

/// Rerun the failed parts of a finished workflow in place.
///
/// Successful nodes are kept. Failed and errored nodes, and the whole exit
/// handler subtree, are dropped along with their pods, so the next pass
/// recreates them. A node still running means the workflow is not finished
/// and cannot be retried.
pub async fn retry_workflow(clients: &ClusterClients, wf: &Workflow) -> ControllerResult<Workflow> {
    if !matches!(wf.status.phase, Some(NodePhase::Failed | NodePhase::Error)) {
        return Err(ControllerError::InvalidPhase {
            name: wf.metadata.name.clone(),
            phase: phase_name(wf),
            reason: "only Failed or Error workflows can be retried",
        });
    }

    let exit_name = wf.on_exit_node_name();
    let mut kept = BTreeMap::new();
    let mut dropped_pods = Vec::new();
    for (id, node) in &wf.status.nodes {
        match node.phase {
            NodePhase::Succeeded | NodePhase::Skipped
                if !in_exit_handler(&node.name, &exit_name) =>
            {
                kept.insert(id.clone(), node.clone());
                continue;
            }
            NodePhase::Succeeded | NodePhase::Skipped | NodePhase::Failed | NodePhase::Error => {}
            NodePhase::Pending | NodePhase::Running => {
                return Err(ControllerError::NodeNotRetryable {
                    workflow: wf.metadata.name.clone(),
                    node: node.name.clone(),
                    phase: node.phase.to_string(),
                });
            }
        }
        if node.node_type == NodeType::Pod {
            dropped_pods.push(node.id.clone());
        }
    }

    for pod in &dropped_pods {
        match clients.pods.delete(&wf.metadata.namespace, pod).await {
            Ok(()) => info!(workflow = %wf.key(), pod = %pod, "deleted pod of retried node"),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
    }

    let mut retried = wf.clone();
    retried.status.nodes = kept;
    retried.status.phase = Some(NodePhase::Running);
    retried.status.message = None;
    retried.status.finished_at = None;
    retried.metadata.labels.remove(LABEL_KEY_COMPLETED);
    retried
        .metadata
        .labels
        .insert(LABEL_KEY_PHASE.to_string(), NodePhase::Running.to_string());

    let stored = clients
        .workflows
        .update(&WorkflowResource::try_from(&retried)?)
        .await?;
    info!(workflow = %wf.key(), dropped_pods = dropped_pods.len(), "workflow retried");
    Ok(Workflow::try_from(&stored)?)
}

/// Stop a running workflow from scheduling new nodes. Running pods finish.
pub async fn suspend_workflow(
    workflows: &dyn ResourceClient<WorkflowResource>,
    namespace: &str,
    name: &str,
) -> ControllerResult<()> {
    update_with_retry(workflows, namespace, name, |wf| {
        if wf.is_labeled_completed() {
            return Err(ControllerError::InvalidPhase {
                name: wf.metadata.name.clone(),
                phase: phase_name(wf),
                reason: "cannot suspend completed workflows",
            });
        }
        Ok(wf.spec.suspend.replace(true) != Some(true))
    })
    .await
}

/// Let a suspended workflow schedule new nodes again.
pub async fn resume_workflow(
    workflows: &dyn ResourceClient<WorkflowResource>,
    namespace: &str,
    name: &str,
) -> ControllerResult<()> {
    update_with_retry(workflows, namespace, name, |wf| {
        Ok(wf.spec.suspend.take().is_some())
    })
    .await
}

/// Read-modify-write a workflow, rereading on conflict.
///
/// `mutate` returns whether it changed anything; unchanged workflows are not
/// written.
async fn update_with_retry<F>(
    workflows: &dyn ResourceClient<WorkflowResource>,
    namespace: &str,
    name: &str,
    mutate: F,
) -> ControllerResult<()>
where
    F: Fn(&mut Workflow) -> ControllerResult<bool> + Send + Sync,
{
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(10))
        .with_max_elapsed_time(Some(Duration::from_secs(5)))
        .build();
    let mutate = &mutate;

    backoff::future::retry(policy, || async move {
        let resource = workflows
            .get(namespace, name)
            .await
            .map_err(|err| backoff::Error::permanent(err.into()))?;
        let mut wf = Workflow::try_from(&resource)
            .map_err(|err| backoff::Error::permanent(ControllerError::from(err)))?;
        if !mutate(&mut wf).map_err(backoff::Error::permanent)? {
            return Ok(());
        }
        let updated = WorkflowResource::try_from(&wf)
            .map_err(|err| backoff::Error::permanent(ControllerError::from(err)))?;
        match workflows.update(&updated).await {
            Ok(_) => {
                info!(workflow = %wf.key(), suspend = wf.is_suspended(), "workflow updated");
                Ok(())
            }
            Err(err) if err.is_conflict() => Err(backoff::Error::transient(err.into())),
            Err(err) => Err(backoff::Error::permanent(err.into())),
        }
    })
    .await
}

fn phase_name(wf: &Workflow) -> String {
    wf.status
        .phase
        .map_or_else(|| "Pending".to_string(), |phase| phase.to_string())
}
