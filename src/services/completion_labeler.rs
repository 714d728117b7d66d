//! Labels finished pods as completed, off the reconciliation path.
//!
//! Workers hand pod keys to a bounded channel once the workflow status that
//! records the pod's outcome has been persisted. A single background loop
//! drains the channel and sets the `completed` label, which drops the pod
//! out of the controller's pod cache.
//!
//! A full channel blocks the sender rather than dropping the key: a pod that
//! is never labeled keeps generating events for its workflow.

use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::models::constants::LABEL_KEY_COMPLETED;
use crate::domain::models::{Pod, PodKey};
use crate::domain::ports::{ClusterError, ClusterResult, ResourceClient};
use crate::domain::{ControllerError, ControllerResult};

/// Give up on a single pod after this long
const MAX_LABEL_ELAPSED: Duration = Duration::from_secs(30);

/// Create the channel between the workers and the labeler.
pub fn completion_channel(
    pods: Arc<dyn ResourceClient<Pod>>,
    capacity: usize,
) -> (CompletionSender, CompletionLabeler) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CompletionSender { tx }, CompletionLabeler { pods, rx })
}

/// Worker side of the completion channel
#[derive(Clone)]
pub struct CompletionSender {
    tx: mpsc::Sender<PodKey>,
}

impl CompletionSender {
    /// Queue a pod for labeling, waiting for room if the channel is full.
    pub async fn send(&self, key: PodKey) -> ControllerResult<()> {
        match self.tx.try_send(key) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(key)) => {
                warn!(pod = %key, "completion channel full, waiting");
                self.tx
                    .send(key)
                    .await
                    .map_err(|_| ControllerError::CompletionChannelClosed)
            }
            Err(TrySendError::Closed(_)) => Err(ControllerError::CompletionChannelClosed),
        }
    }
}

/// Background consumer of the completion channel
pub struct CompletionLabeler {
    pods: Arc<dyn ResourceClient<Pod>>,
    rx: mpsc::Receiver<PodKey>,
}

impl CompletionLabeler {
    /// Label pods until cancelled or every sender is gone.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("completion labeler started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                key = self.rx.recv() => match key {
                    Some(key) => {
                        if let Err(err) = label_completed(self.pods.as_ref(), &key).await {
                            error!(pod = %key, error = %err, "failed to label pod completed");
                        }
                    }
                    None => break,
                },
            }
        }
        info!("completion labeler stopped");
    }
}

/// Set `completed=true` on a pod. Pods already labeled or gone count as done.
///
/// Conflicts and API errors are retried with exponential backoff.
pub async fn label_completed(pods: &dyn ResourceClient<Pod>, key: &PodKey) -> ClusterResult<()> {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(50))
        .with_max_elapsed_time(Some(MAX_LABEL_ELAPSED))
        .build();

    backoff::future::retry(policy, || async move {
        let mut pod = match pods.get(&key.namespace, &key.name).await {
            Ok(pod) => pod,
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(retryable(err)),
        };
        if pod.metadata.label(LABEL_KEY_COMPLETED) == Some("true") {
            debug!(pod = %key, "pod already labeled completed");
            return Ok(());
        }
        pod.metadata
            .labels
            .insert(LABEL_KEY_COMPLETED.to_string(), "true".to_string());
        match pods.update(&pod).await {
            Ok(_) => {
                debug!(pod = %key, "labeled pod completed");
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(retryable(err)),
        }
    })
    .await
}

fn retryable(err: ClusterError) -> backoff::Error<ClusterError> {
    if err.is_conflict() {
        debug!(error = %err, "conflict labeling pod, retrying");
    } else {
        warn!(error = %err, "error labeling pod, retrying");
    }
    backoff::Error::transient(err)
}
