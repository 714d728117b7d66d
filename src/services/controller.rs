//! Wires caches, queues and workers into a running controller.
//!
//! Three informers feed the controller: one over the configuration resource,
//! one over unfinished workflows and one over started, unlabeled pods.
//! Workflow events enqueue the workflow key. Pod events enqueue the pod key;
//! pod workers translate it into the owning workflow's key, so pods only
//! ever wake up their workflow. Workflow workers run reconciliation passes.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::completion_labeler::{completion_channel, CompletionSender};
use super::config_watcher::{ConfigHandle, ConfigWatcher};
use super::informer::{
    deletion_handling_key, meta_namespace_key, DeletedObject, EnqueueHandler, EventHandler,
    Informer, Store,
};
use super::operator::WorkflowOperator;
use super::work_queue::{QueueConfig, WorkQueue};
use crate::domain::models::constants::{
    LABEL_KEY_COMPLETED, LABEL_KEY_CONTROLLER_INSTANCE_ID, LABEL_KEY_WORKFLOW,
};
use crate::domain::models::{
    Config, ControllerConfig, FieldRequirement, FieldSelector, LabelSelector, Pod, Requirement,
    WorkflowDocument, WorkflowResource,
};
use crate::domain::ports::{ClusterClients, ListParams, Resource};
use crate::domain::{ControllerError, ControllerResult};

/// Label requirement segregating controller instances: workflows and pods
/// must carry the configured instance id, or no instance id when none is set.
pub fn instance_requirement(config: &ControllerConfig) -> Requirement {
    match &config.instance_id {
        Some(id) => Requirement::Equals(LABEL_KEY_CONTROLLER_INSTANCE_ID.to_string(), id.clone()),
        None => Requirement::DoesNotExist(LABEL_KEY_CONTROLLER_INSTANCE_ID.to_string()),
    }
}

/// Scope of the workflow cache: unfinished workflows of this instance
pub fn workflow_list_params(config: &ControllerConfig) -> ListParams {
    let mut labels = LabelSelector::new()
        .with(Requirement::NotIn(
            LABEL_KEY_COMPLETED.to_string(),
            vec!["true".to_string()],
        ))
        .with(instance_requirement(config));
    for (key, value) in &config.match_labels {
        labels.push(Requirement::Equals(key.clone(), value.clone()));
    }
    ListParams {
        namespace: config.namespace.clone(),
        labels,
        fields: FieldSelector::new(),
    }
}

/// Scope of the pod cache: started pods not yet labeled completed
pub fn pod_list_params(config: &ControllerConfig) -> ListParams {
    ListParams {
        namespace: config.namespace.clone(),
        labels: LabelSelector::new()
            .with(Requirement::Equals(
                LABEL_KEY_COMPLETED.to_string(),
                "false".to_string(),
            ))
            .with(instance_requirement(config)),
        fields: FieldSelector::new().with(FieldRequirement::NotEquals(
            "status.phase".to_string(),
            "Pending".to_string(),
        )),
    }
}

/// Key of the workflow owning `pod`, if it carries the workflow label
fn owning_workflow_key(pod: &Pod) -> Option<String> {
    pod.metadata
        .label(LABEL_KEY_WORKFLOW)
        .map(|name| format!("{}/{name}", pod.metadata.namespace))
}

/// Pod events are keyed by pod; a deleted pod can no longer be looked up,
/// so its workflow is woken directly.
struct PodEventHandler {
    pod_queue: Arc<WorkQueue>,
    wf_queue: Arc<WorkQueue>,
}

impl EventHandler<Pod> for PodEventHandler {
    fn on_add(&self, obj: &Pod) {
        self.pod_queue.add(meta_namespace_key(obj));
    }

    fn on_update(&self, _old: &Pod, new: &Pod) {
        self.pod_queue.add(meta_namespace_key(new));
    }

    fn on_delete(&self, obj: &DeletedObject<Pod>) {
        let Some(key) = owning_workflow_key(obj.object()) else {
            warn!(pod = %deletion_handling_key(obj), "deleted pod has no workflow label");
            return;
        };
        self.wf_queue.add(key);
    }
}

/// State shared by the workers
struct Workers {
    operator: WorkflowOperator,
    config: ConfigHandle,
    workflows: Arc<Store<WorkflowResource>>,
    pods: Arc<Store<Pod>>,
    wf_queue: Arc<WorkQueue>,
    pod_queue: Arc<WorkQueue>,
    completions: CompletionSender,
    max_requeues: u32,
}

impl Workers {
    async fn run_workflow_worker(self: Arc<Self>) {
        while let Some(key) = self.wf_queue.get().await {
            self.process_workflow(&key).await;
            self.wf_queue.done(&key);
        }
    }

    async fn run_pod_worker(self: Arc<Self>) {
        while let Some(key) = self.pod_queue.get().await {
            self.process_pod(&key);
            self.pod_queue.done(&key);
        }
    }

    async fn process_workflow(&self, key: &str) {
        let Some(resource) = self.workflows.get_by_key(key) else {
            debug!(workflow = %key, "workflow no longer cached");
            self.wf_queue.forget(key);
            return;
        };
        let Some(config) = self.config.current() else {
            warn!(workflow = %key, error = %ControllerError::ConfigNotLoaded, "skipping pass");
            self.wf_queue.add_rate_limited(key);
            return;
        };

        match self
            .operator
            .operate_document(WorkflowDocument::from(resource), &config)
            .await
        {
            Ok(outcome) => {
                self.wf_queue.forget(key);
                for pod in outcome.completed_pods {
                    if let Err(err) = self.completions.send(pod).await {
                        error!(workflow = %key, error = %err, "failed to queue completed pod");
                    }
                }
                if let Some(after) = outcome.requeue_after {
                    debug!(workflow = %key, after_ms = after.as_millis(), "requeue requested");
                    self.wf_queue.add_after(key, after);
                }
            }
            Err(err) => self.handle_error(key, &err),
        }
    }

    /// Requeue a failed pass with backoff, up to the configured attempts.
    fn handle_error(&self, key: &str, err: &ControllerError) {
        let attempts = self.wf_queue.num_requeues(key);
        if attempts < self.max_requeues {
            warn!(workflow = %key, error = %err, attempts, "reconciliation failed, requeueing");
            self.wf_queue.add_rate_limited(key);
        } else {
            error!(workflow = %key, error = %err, attempts, "reconciliation failed, dropping key");
            self.wf_queue.forget(key);
        }
    }

    fn process_pod(&self, key: &str) {
        let Some(pod) = self.pods.get_by_key(key) else {
            debug!(pod = %key, "pod no longer cached");
            return;
        };
        match owning_workflow_key(&pod) {
            Some(wf_key) => self.wf_queue.add(wf_key),
            None => warn!(pod = %key, label = LABEL_KEY_WORKFLOW, "watched pod has no workflow label"),
        }
    }
}

/// The workflow controller
pub struct WorkflowController {
    clients: ClusterClients,
    settings: Config,
}

impl WorkflowController {
    pub const fn new(clients: ClusterClients, settings: Config) -> Self {
        Self { clients, settings }
    }

    /// Run until `cancel` fires.
    ///
    /// Blocks until the first valid controller configuration is loaded, then
    /// starts the caches and, once both have synced, the workers.
    pub async fn run(self, cancel: CancellationToken) -> ControllerResult<()> {
        let settings = &self.settings;
        // Cancelled with `cancel`, or on its own when a cache fails to list
        let stop = cancel.child_token();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let watcher = Arc::new(ConfigWatcher::new());
        let config_handle = watcher.handle();
        let mut config_informer = Informer::new(
            "configmap",
            Arc::clone(&self.clients.config_maps),
            ListParams::namespaced(settings.namespace.clone()).fields(
                FieldSelector::new().with(FieldRequirement::Equals(
                    "metadata.name".to_string(),
                    settings.config_map.clone(),
                )),
            ),
            Duration::from_secs(settings.workflow_resync_secs),
        );
        config_informer.add_event_handler(watcher);
        tasks.push(spawn_informer(Arc::new(config_informer), stop.clone()));

        info!(configmap = %settings.config_map, namespace = %settings.namespace, "waiting for controller configuration");
        let Some(config) = config_handle.wait_ready(&stop).await else {
            return finish(&cancel, &stop, tasks, "configmap").await;
        };

        let wf_queue = WorkQueue::new(QueueConfig::new(
            "workflows",
            &settings.rate_limit,
            &settings.requeue,
        ));
        let pod_queue = WorkQueue::new(QueueConfig::new(
            "pods",
            &settings.rate_limit,
            &settings.requeue,
        ));

        let mut wf_informer = Informer::new(
            "workflows",
            Arc::clone(&self.clients.workflows),
            workflow_list_params(&config),
            Duration::from_secs(settings.workflow_resync_secs),
        );
        wf_informer.add_event_handler(Arc::new(EnqueueHandler::new(Arc::clone(&wf_queue))));
        let mut pod_informer = Informer::new(
            "pods",
            Arc::clone(&self.clients.pods),
            pod_list_params(&config),
            Duration::from_secs(settings.pod_resync_secs),
        );
        pod_informer.add_event_handler(Arc::new(PodEventHandler {
            pod_queue: Arc::clone(&pod_queue),
            wf_queue: Arc::clone(&wf_queue),
        }));

        let workflows = wf_informer.store();
        let pods = pod_informer.store();
        let wf_informer = Arc::new(wf_informer);
        let pod_informer = Arc::new(pod_informer);
        tasks.push(spawn_informer(Arc::clone(&wf_informer), stop.clone()));
        tasks.push(spawn_informer(Arc::clone(&pod_informer), stop.clone()));

        for (cache, synced) in [
            ("workflows", wf_informer.wait_for_sync(&stop).await),
            ("pods", pod_informer.wait_for_sync(&stop).await),
        ] {
            if !synced {
                wf_queue.shutdown();
                pod_queue.shutdown();
                return finish(&cancel, &stop, tasks, cache).await;
            }
        }

        let (completions, labeler) = completion_channel(
            Arc::clone(&self.clients.pods),
            settings.completed_pods_capacity,
        );
        tasks.push(tokio::spawn(labeler.run(stop.clone())));

        let workers = Arc::new(Workers {
            operator: WorkflowOperator::new(self.clients.clone()),
            config: config_handle,
            workflows,
            pods,
            wf_queue: Arc::clone(&wf_queue),
            pod_queue: Arc::clone(&pod_queue),
            completions,
            max_requeues: settings.requeue.max_requeues,
        });
        for _ in 0..settings.workflow_workers {
            tasks.push(tokio::spawn(Arc::clone(&workers).run_workflow_worker()));
        }
        for _ in 0..settings.pod_workers {
            tasks.push(tokio::spawn(Arc::clone(&workers).run_pod_worker()));
        }
        drop(workers);
        info!(
            workflow_workers = settings.workflow_workers,
            pod_workers = settings.pod_workers,
            "controller started"
        );

        stop.cancelled().await;
        info!("shutting down controller");
        wf_queue.shutdown();
        pod_queue.shutdown();
        join_all(tasks).await;
        info!("controller stopped");
        Ok(())
    }
}

/// Stop everything after startup was cut short. Cancellation by the caller
/// is a clean exit; anything else means `cache` failed to list.
async fn finish(
    cancel: &CancellationToken,
    stop: &CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    cache: &'static str,
) -> ControllerResult<()> {
    stop.cancel();
    join_all(tasks).await;
    if cancel.is_cancelled() {
        Ok(())
    } else {
        Err(ControllerError::CacheSync(cache))
    }
}

/// Run an informer. A failed initial listing stops the whole controller.
fn spawn_informer<K: Resource>(
    informer: Arc<Informer<K>>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = informer.run(stop.clone()).await {
            error!(error = %err, "informer failed");
            stop.cancel();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ObjectMeta;
    use std::collections::BTreeMap;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_workflow_selector() {
        let config = ControllerConfig {
            instance_id: Some("a".into()),
            match_labels: labels(&[("tier", "batch")]),
            ..ControllerConfig::default()
        };
        let params = workflow_list_params(&config);
        assert_eq!(
            params.labels.to_string(),
            "workflows.kubext.io/completed notin (true),workflows.kubext.io/controller-instanceid=a,tier=batch"
        );
        assert!(params.namespace.is_none());
    }

    #[test]
    fn test_pod_selector_without_instance() {
        let config = ControllerConfig {
            namespace: Some("argo".into()),
            ..ControllerConfig::default()
        };
        let params = pod_list_params(&config);
        assert_eq!(
            params.labels.to_string(),
            "workflows.kubext.io/completed=false,!workflows.kubext.io/controller-instanceid"
        );
        assert_eq!(params.fields.to_string(), "status.phase!=Pending");
        assert_eq!(params.namespace.as_deref(), Some("argo"));
    }

    #[test]
    fn test_owning_workflow_key() {
        let mut pod = Pod::default();
        pod.metadata.namespace = "default".into();
        assert_eq!(owning_workflow_key(&pod), None);
        pod.metadata
            .labels
            .insert(LABEL_KEY_WORKFLOW.into(), "hello".into());
        assert_eq!(owning_workflow_key(&pod).as_deref(), Some("default/hello"));
    }

    #[test]
    fn test_deleted_pod_wakes_its_workflow_only() {
        let handler = PodEventHandler {
            pod_queue: WorkQueue::new(QueueConfig::default()),
            wf_queue: WorkQueue::new(QueueConfig::default()),
        };

        let mut orphan = Pod::default();
        orphan.metadata = ObjectMeta::named("default", "orphan");
        handler.on_delete(&DeletedObject::Final(orphan));
        assert!(handler.wf_queue.is_empty());
        assert!(handler.pod_queue.is_empty());

        let mut owned = Pod::default();
        owned.metadata = ObjectMeta::named("default", "hello-1234");
        owned
            .metadata
            .labels
            .insert(LABEL_KEY_WORKFLOW.into(), "hello".into());
        handler.on_delete(&DeletedObject::Tombstone {
            key: "default/hello-1234".into(),
            last_known: owned,
        });
        assert_eq!(handler.wf_queue.len(), 1);
        assert!(handler.pod_queue.is_empty());
    }
}
