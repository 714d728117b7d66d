//! The per-workflow reconciler.
//!
//! A pass reads the workflow's pods, walks the template graph from the
//! entrypoint, applies the pod writes the walk asked for and persists the
//! resulting status with a single update. Passes are idempotent: rerunning
//! one against the same cluster state changes nothing.

mod context;
mod dag;
mod pod;
mod reconcile;
mod scope;
mod steps;

use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

pub use self::pod::{build_pod, PodBuildError};

use self::context::{Intent, Operation};
use crate::domain::models::constants::{
    ANNOTATION_KEY_EXECUTION_CONTROL, LABEL_KEY_COMPLETED, LABEL_KEY_PHASE, LABEL_KEY_WORKFLOW,
};
use crate::domain::models::template::item_to_string;
use crate::domain::models::{
    ControllerConfig, ExecutionControl, LabelSelector, NodePhase, PersistentVolumeClaim, PodKey,
    Requirement, Volume, Workflow, WorkflowDocument, WorkflowResource,
};
use crate::domain::ports::{ClusterClients, ListParams};
use crate::domain::{ControllerError, ControllerResult};
use crate::services::substitution::{substitute, Scope};
use crate::services::validation::{validate_workflow, ValidateOpts};

/// What a pass leaves for the worker that ran it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassOutcome {
    /// Revisit the workflow after this long even without new events
    pub requeue_after: Option<Duration>,
    /// Pods to label completed, now that their final state is persisted
    pub completed_pods: Vec<PodKey>,
}

/// Drives workflows forward against the cluster
#[derive(Clone)]
pub struct WorkflowOperator {
    clients: ClusterClients,
}

impl WorkflowOperator {
    pub fn new(clients: ClusterClients) -> Self {
        Self { clients }
    }

    /// Run one pass over a stored workflow document.
    pub async fn operate_document(
        &self,
        document: WorkflowDocument,
        config: &ControllerConfig,
    ) -> ControllerResult<PassOutcome> {
        match document {
            WorkflowDocument::Parsed(wf) => self.operate(*wf, config).await,
            WorkflowDocument::Raw { resource, error } => {
                self.fail_raw_document(resource, &error.to_string()).await?;
                Ok(PassOutcome::default())
            }
        }
    }

    /// Run one reconciliation pass over `wf`.
    pub async fn operate(
        &self,
        wf: Workflow,
        config: &ControllerConfig,
    ) -> ControllerResult<PassOutcome> {
        let mut op = Operation::new(wf);
        if op.wf.is_labeled_completed() {
            debug!(workflow = %op.key, "workflow already completed");
            return Ok(PassOutcome::default());
        }
        debug!(workflow = %op.key, "processing workflow");

        if op.wf.status.phase.is_none() {
            op.mark_workflow_phase(NodePhase::Running, false, None);
            if let Err(err) = validate_workflow(&op.wf, ValidateOpts::default()) {
                let message = format!("invalid spec: {err}");
                warn!(workflow = %op.key, %message, "rejecting workflow");
                op.mark_workflow_phase(NodePhase::Failed, true, Some(message));
                return self.persist(op).await;
            }
        }
        op.set_global_parameters();

        if let Err(err) = self.create_claims(&mut op).await {
            error!(workflow = %op.key, error = %err, "failed to create volume claims");
            op.mark_workflow_phase(NodePhase::Error, true, Some(err.to_string()));
            return self.persist(op).await;
        }

        let params = ListParams::namespaced(op.wf.metadata.namespace.clone()).labels(
            LabelSelector::new().with(Requirement::Equals(
                LABEL_KEY_WORKFLOW.to_string(),
                op.wf.metadata.name.clone(),
            )),
        );
        let pods = self.clients.pods.list(&params).await?;
        op.reconcile_pods(&pods.items, Utc::now());
        op.count_active_pods();

        let completion = op.execute_graph();
        self.apply_intents(&mut op, config).await;

        if let Some(completion) = completion {
            if let Err(err) = self.delete_claims(&mut op).await {
                error!(workflow = %op.key, error = %err, "failed to delete volume claims");
            }
            info!(workflow = %op.key, phase = %completion.phase, "workflow completed");
            op.mark_workflow_phase(completion.phase, true, completion.message);
        }
        self.persist(op).await
    }

    async fn persist(&self, op: Operation) -> ControllerResult<PassOutcome> {
        let namespace = op.wf.metadata.namespace.clone();
        if op.updated {
            let resource = WorkflowResource::try_from(&op.wf)?;
            self.clients.workflows.update(&resource).await?;
            info!(workflow = %op.key, "workflow update successful");
        }
        Ok(PassOutcome {
            requeue_after: op.requeue_after,
            completed_pods: op
                .completed_pods
                .into_iter()
                .map(|name| PodKey::new(namespace.clone(), name))
                .collect(),
        })
    }

    async fn apply_intents(&self, op: &mut Operation, config: &ControllerConfig) {
        for intent in std::mem::take(&mut op.intents) {
            match intent {
                Intent::CreatePod {
                    node_name,
                    template,
                } => {
                    let pod = match build_pod(&op.wf, &node_name, &template, config) {
                        Ok(pod) => pod,
                        Err(err) => {
                            warn!(workflow = %op.key, node = %node_name, error = %err, "failed to build pod");
                            op.mark_node_phase(&node_name, NodePhase::Error, Some(err.to_string()));
                            continue;
                        }
                    };
                    match self.clients.pods.create(&pod).await {
                        Ok(created) => {
                            info!(workflow = %op.key, node = %node_name, pod = %created.metadata.name, "created pod");
                        }
                        Err(err) if err.is_already_exists() => {
                            debug!(workflow = %op.key, node = %node_name, "pod already exists");
                        }
                        Err(err) => {
                            warn!(workflow = %op.key, node = %node_name, error = %err, "failed to create pod");
                            op.mark_node_phase(
                                &node_name,
                                NodePhase::Error,
                                Some(format!("failed to create pod: {err}")),
                            );
                        }
                    }
                }
                Intent::SignalDeadline { pod_name } => {
                    if let Err(err) = self.signal_deadline(&op.wf.metadata.namespace, &pod_name).await {
                        warn!(workflow = %op.key, pod = %pod_name, error = %err, "failed to signal deadline");
                    }
                }
            }
        }
    }

    async fn signal_deadline(&self, namespace: &str, pod_name: &str) -> ControllerResult<()> {
        let mut pod = match self.clients.pods.get(namespace, pod_name).await {
            Ok(pod) => pod,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let control = ExecutionControl {
            deadline: Some(Utc::now()),
        };
        let encoded = serde_json::to_string(&control).map_err(|source| ControllerError::Encode {
            what: "execution control",
            source,
        })?;
        pod.metadata
            .annotations
            .insert(ANNOTATION_KEY_EXECUTION_CONTROL.to_string(), encoded);
        self.clients.pods.update(&pod).await?;
        Ok(())
    }

    /// Create one claim per volume claim template, once per workflow.
    async fn create_claims(&self, op: &mut Operation) -> ControllerResult<()> {
        let templates = &op.wf.spec.volume_claim_templates;
        if templates.is_empty() || op.wf.status.persistent_volume_claims.len() == templates.len() {
            return Ok(());
        }
        let mut volumes = Vec::with_capacity(templates.len());
        for claim_tmpl in templates {
            let ref_name = claim_tmpl.metadata.name.clone();
            let mut claim = PersistentVolumeClaim {
                metadata: claim_tmpl.metadata.clone(),
                spec: claim_tmpl.spec.clone(),
            };
            claim.metadata.name = format!("{}-{ref_name}", op.wf.metadata.name);
            claim.metadata.namespace.clone_from(&op.wf.metadata.namespace);
            claim.metadata.owner_references = vec![op.wf.controller_ref()];
            info!(workflow = %op.key, claim = %claim.metadata.name, "creating volume claim");
            match self.clients.claims.create(&claim).await {
                Ok(_) => {}
                Err(err) if err.is_already_exists() => {
                    debug!(workflow = %op.key, claim = %claim.metadata.name, "volume claim already exists");
                }
                Err(err) => return Err(err.into()),
            }
            volumes.push(Volume::new(
                ref_name,
                serde_json::json!({ "persistentVolumeClaim": { "claimName": claim.metadata.name } }),
            ));
        }
        op.wf.status.persistent_volume_claims = volumes;
        op.updated = true;
        Ok(())
    }

    /// Delete the workflow's claims. Claims that fail to delete stay recorded.
    async fn delete_claims(&self, op: &mut Operation) -> ControllerResult<()> {
        if op.wf.status.persistent_volume_claims.is_empty() {
            return Ok(());
        }
        let namespace = op.wf.metadata.namespace.clone();
        let mut remaining = Vec::new();
        let mut first_err = None;
        for volume in std::mem::take(&mut op.wf.status.persistent_volume_claims) {
            let claim_name = volume
                .source
                .get("persistentVolumeClaim")
                .and_then(|claim| claim.get("claimName"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let Some(claim_name) = claim_name else {
                continue;
            };
            info!(workflow = %op.key, claim = %claim_name, "deleting volume claim");
            match self.clients.claims.delete(&namespace, &claim_name).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    remaining.push(volume);
                    first_err.get_or_insert(err);
                }
            }
        }
        op.wf.status.persistent_volume_claims = remaining;
        op.updated = true;
        first_err.map_or(Ok(()), |err| Err(err.into()))
    }

    /// Fail a stored workflow whose body does not decode, by patching its raw form.
    async fn fail_raw_document(
        &self,
        mut resource: WorkflowResource,
        error: &str,
    ) -> ControllerResult<()> {
        if resource.metadata.label(LABEL_KEY_COMPLETED) == Some("true") {
            return Ok(());
        }
        let message = format!("invalid spec: {error}");
        warn!(workflow = %resource.metadata.key(), %message, "failing undecodable workflow");

        let now = Value::String(Utc::now().to_rfc3339());
        let status = resource
            .body
            .entry("status")
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !status.is_object() {
            *status = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(status) = status {
            status.insert("phase".to_string(), Value::String(NodePhase::Failed.to_string()));
            status.insert("message".to_string(), Value::String(message));
            status.entry("startedAt").or_insert_with(|| now.clone());
            status.insert("finishedAt".to_string(), now);
        }
        resource
            .metadata
            .labels
            .insert(LABEL_KEY_COMPLETED.to_string(), "true".to_string());
        resource
            .metadata
            .labels
            .insert(LABEL_KEY_PHASE.to_string(), NodePhase::Failed.to_string());
        self.clients.workflows.update(&resource).await?;
        Ok(())
    }
}

/// Expand a `withItems` invocation into one `(name, invocation)` per item,
/// with `{{item}}` substituted. Invocations without items pass through.
fn expand_items<T>(name: &str, items: &[Value], invocation: &T) -> Result<Vec<(String, T)>, String>
where
    T: Clone + Serialize + DeserializeOwned,
{
    if items.is_empty() {
        return Ok(vec![(name.to_string(), invocation.clone())]);
    }
    let mut expanded = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let Some(value) = item_to_string(item) else {
            return Err(format!(
                "withItems[{i}] expected string, number, or boolean. received: {item}"
            ));
        };
        let scope = Scope::from([("item".to_string(), value.clone())]);
        let substituted = substitute(invocation, &scope, false).map_err(|err| err.to_string())?;
        expanded.push((format!("{name}({i}:{value})"), substituted));
    }
    Ok(expanded)
}
