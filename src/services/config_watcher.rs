//! Follows the cluster-held controller configuration.
//!
//! The watcher is an [`EventHandler`] for the configuration resource. Each
//! valid revision replaces the published snapshot; invalid revisions and
//! deletions are logged and the last good snapshot stays in effect.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::informer::{DeletedObject, EventHandler};
use crate::domain::models::constants::CONFIG_MAP_KEY;
use crate::domain::models::{ConfigMap, ControllerConfig};
use crate::domain::ControllerConfigError;

/// Decode the controller configuration stored under the `config` key.
pub fn parse_config(config_map: &ConfigMap) -> Result<ControllerConfig, ControllerConfigError> {
    let raw = config_map
        .data
        .get(CONFIG_MAP_KEY)
        .ok_or_else(|| ControllerConfigError::MissingKey(config_map.metadata.name.clone()))?;
    let config: ControllerConfig = serde_yaml::from_str(raw)?;
    if config.executor_image.is_empty() {
        return Err(ControllerConfigError::MissingExecutorImage);
    }
    Ok(config)
}

pub struct ConfigWatcher {
    current: watch::Sender<Option<Arc<ControllerConfig>>>,
}

impl Default for ConfigWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigWatcher {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self { current }
    }

    /// Read side handed to the workers
    pub fn handle(&self) -> ConfigHandle {
        ConfigHandle {
            current: self.current.subscribe(),
        }
    }

    fn apply(&self, config_map: &ConfigMap) {
        match parse_config(config_map) {
            Ok(config) => {
                info!(
                    configmap = %config_map.metadata.key(),
                    executor_image = %config.executor_image,
                    instance_id = config.instance_id.as_deref().unwrap_or(""),
                    "controller configuration updated"
                );
                self.current.send_replace(Some(Arc::new(config)));
            }
            Err(err) => {
                error!(configmap = %config_map.metadata.key(), error = %err, "ignoring invalid controller configuration");
            }
        }
    }
}

impl EventHandler<ConfigMap> for ConfigWatcher {
    fn on_add(&self, obj: &ConfigMap) {
        self.apply(obj);
    }

    fn on_update(&self, old: &ConfigMap, new: &ConfigMap) {
        if old.data != new.data || self.current.borrow().is_none() {
            self.apply(new);
        }
    }

    fn on_delete(&self, obj: &DeletedObject<ConfigMap>) {
        warn!(configmap = %obj.object().metadata.key(), "controller configuration deleted, keeping last known configuration");
    }
}

/// Snapshot access to the current controller configuration
#[derive(Clone)]
pub struct ConfigHandle {
    current: watch::Receiver<Option<Arc<ControllerConfig>>>,
}

impl ConfigHandle {
    /// The configuration in effect now, if one has been loaded
    pub fn current(&self) -> Option<Arc<ControllerConfig>> {
        self.current.borrow().clone()
    }

    /// Wait for the first valid configuration. `None` if cancelled first.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Option<Arc<ControllerConfig>> {
        let mut current = self.current.clone();
        tokio::select! {
            res = current.wait_for(Option::is_some) => res.ok().and_then(|config| config.clone()),
            () = cancel.cancelled() => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ObjectMeta;

    fn config_map(data: &str) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.metadata = ObjectMeta::named("kube-system", "workflow-controller-configmap");
        cm.data.insert(CONFIG_MAP_KEY.to_string(), data.to_string());
        cm
    }

    #[test]
    fn test_parse_config_requires_key() {
        let mut cm = config_map("executorImage: a");
        cm.data.clear();
        assert!(matches!(
            parse_config(&cm),
            Err(ControllerConfigError::MissingKey(_))
        ));
    }

    #[test]
    fn test_parse_config_requires_executor_image() {
        assert!(matches!(
            parse_config(&config_map("instanceID: a")),
            Err(ControllerConfigError::MissingExecutorImage)
        ));
        assert!(matches!(
            parse_config(&config_map("executorImage: [unclosed")),
            Err(ControllerConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_update_keeps_last_good_config() {
        let watcher = ConfigWatcher::new();
        let handle = watcher.handle();
        assert!(handle.current().is_none());

        let good = config_map("executorImage: kubext/executor:v1");
        watcher.on_add(&good);
        let cancel = CancellationToken::new();
        let config = handle.wait_ready(&cancel).await.unwrap();
        assert_eq!(config.executor_image, "kubext/executor:v1");

        let bad = config_map("instanceID: only");
        watcher.on_update(&good, &bad);
        assert_eq!(handle.current().unwrap().executor_image, "kubext/executor:v1");

        watcher.on_delete(&DeletedObject::Final(bad));
        assert!(handle.current().is_some());

        let newer = config_map("executorImage: kubext/executor:v2");
        watcher.on_update(&good, &newer);
        assert_eq!(handle.current().unwrap().executor_image, "kubext/executor:v2");
    }

    #[tokio::test]
    async fn test_wait_ready_returns_none_when_cancelled() {
        let watcher = ConfigWatcher::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(watcher.handle().wait_ready(&cancel).await.is_none());
    }
}
