//! Watch-backed local cache of one resource kind.
//!
//! An [`Informer`] lists the objects matching its [`ListParams`], keeps them
//! in a [`Store`], and follows a watch to keep the store current. Every
//! change is passed to the registered [`EventHandler`]s. When the watch
//! breaks it relists, reporting objects that vanished in between as
//! [`DeletedObject::Tombstone`]s. Every resync period all cached objects are
//! redelivered as updates so handlers can recover from dropped work.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::work_queue::WorkQueue;
use crate::domain::ports::{ClusterResult, ListParams, Resource, ResourceClient, WatchEvent};

/// `namespace/name` of an object
pub fn meta_namespace_key<K: Resource>(obj: &K) -> String {
    obj.meta().key()
}

/// A deleted object as delivered to handlers
#[derive(Debug, Clone)]
pub enum DeletedObject<K> {
    /// Observed on the watch, with the object's final state
    Final(K),
    /// Noticed missing on relist; the state may be stale
    Tombstone { key: String, last_known: K },
}

impl<K: Resource> DeletedObject<K> {
    pub const fn object(&self) -> &K {
        match self {
            Self::Final(obj) | Self::Tombstone { last_known: obj, .. } => obj,
        }
    }
}

/// Key of a deleted object, usable whether or not its final state is known
pub fn deletion_handling_key<K: Resource>(deleted: &DeletedObject<K>) -> String {
    match deleted {
        DeletedObject::Final(obj) => meta_namespace_key(obj),
        DeletedObject::Tombstone { key, .. } => key.clone(),
    }
}

/// Reacts to changes in an informer's cache. Called on the informer's task,
/// so implementations must not block.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &DeletedObject<K>);
}

/// Enqueues the key of every changed object
pub struct EnqueueHandler {
    queue: Arc<WorkQueue>,
}

impl EnqueueHandler {
    pub const fn new(queue: Arc<WorkQueue>) -> Self {
        Self { queue }
    }
}

impl<K: Resource> EventHandler<K> for EnqueueHandler {
    fn on_add(&self, obj: &K) {
        self.queue.add(meta_namespace_key(obj));
    }

    fn on_update(&self, _old: &K, new: &K) {
        self.queue.add(meta_namespace_key(new));
    }

    fn on_delete(&self, obj: &DeletedObject<K>) {
        self.queue.add(deletion_handling_key(obj));
    }
}

/// Read-mostly snapshot of the cached objects, keyed by `namespace/name`
pub struct Store<K> {
    items: RwLock<HashMap<String, K>>,
}

impl<K: Resource> Default for Store<K> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Resource> Store<K> {
    /// A copy of the cached object, so callers never share state with the cache.
    pub fn get_by_key(&self, key: &str) -> Option<K> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn list(&self) -> Vec<K> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, obj: K) -> Option<K> {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(meta_namespace_key(&obj), obj)
    }

    fn remove(&self, key: &str) -> Option<K> {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Swap in a fresh listing, returning what it replaced.
    fn replace(&self, items: Vec<K>) -> HashMap<String, K> {
        let fresh = items
            .into_iter()
            .map(|obj| (meta_namespace_key(&obj), obj))
            .collect();
        std::mem::replace(
            &mut *self.items.write().unwrap_or_else(PoisonError::into_inner),
            fresh,
        )
    }
}

pub struct Informer<K: Resource> {
    name: &'static str,
    client: Arc<dyn ResourceClient<K>>,
    params: ListParams,
    resync_period: Duration,
    store: Arc<Store<K>>,
    handlers: Vec<Arc<dyn EventHandler<K>>>,
    synced: watch::Sender<bool>,
}

impl<K: Resource> Informer<K> {
    pub fn new(
        name: &'static str,
        client: Arc<dyn ResourceClient<K>>,
        params: ListParams,
        resync_period: Duration,
    ) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            name,
            client,
            params,
            resync_period,
            store: Arc::new(Store::default()),
            handlers: Vec::new(),
            synced,
        }
    }

    /// Register a handler. Must be called before [`Informer::run`].
    pub fn add_event_handler(&mut self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.push(handler);
    }

    pub fn store(&self) -> Arc<Store<K>> {
        Arc::clone(&self.store)
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait for the first listing to land in the store. `false` if cancelled first.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        let mut synced = self.synced.subscribe();
        tokio::select! {
            res = synced.wait_for(|done| *done) => res.is_ok(),
            () = cancel.cancelled() => false,
        }
    }

    /// Keep the store in sync until cancelled.
    ///
    /// Failing to establish the initial listing is returned as an error;
    /// later failures are retried with backoff.
    pub async fn run(&self, cancel: CancellationToken) -> ClusterResult<()> {
        let mut resource_version = self.list_and_replace().await?;
        self.synced.send_replace(true);
        info!(informer = self.name, objects = self.store.len(), "cache synced");

        let mut resync = interval_at(Instant::now() + self.resync_period, self.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match self.client.watch(&self.params, &resource_version).await {
                Ok(mut events) => loop {
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        _ = resync.tick() => self.resync(),
                        event = events.next() => match event {
                            Some(WatchEvent::Error(err)) => {
                                warn!(informer = self.name, error = %err, "watch failed, relisting");
                                break;
                            }
                            Some(event) => self.apply(event),
                            None => {
                                debug!(informer = self.name, "watch closed, relisting");
                                break;
                            }
                        },
                    }
                },
                Err(err) => warn!(informer = self.name, error = %err, "watch failed, relisting"),
            }

            match self.relist(&cancel).await {
                Some(version) => resource_version = version,
                None => return Ok(()),
            }
        }
    }

    async fn relist(&self, cancel: &CancellationToken) -> Option<String> {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_secs(30))
            .with_max_elapsed_time(None)
            .build();
        loop {
            match self.list_and_replace().await {
                Ok(version) => return Some(version),
                Err(err) => {
                    let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
                    warn!(informer = self.name, error = %err, delay_ms = delay.as_millis(), "relist failed");
                    tokio::select! {
                        () = cancel.cancelled() => return None,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn list_and_replace(&self) -> ClusterResult<String> {
        let list = self.client.list(&self.params).await?;
        let mut previous = self.store.replace(list.items.clone());

        for obj in &list.items {
            match previous.remove(&meta_namespace_key(obj)) {
                Some(old) => self.handlers.iter().for_each(|h| h.on_update(&old, obj)),
                None => self.handlers.iter().for_each(|h| h.on_add(obj)),
            }
        }
        for (key, last_known) in previous {
            let deleted = DeletedObject::Tombstone { key, last_known };
            self.handlers.iter().for_each(|h| h.on_delete(&deleted));
        }
        Ok(list.resource_version)
    }

    fn apply(&self, event: WatchEvent<K>) {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                match self.store.insert(obj.clone()) {
                    Some(old) => self.handlers.iter().for_each(|h| h.on_update(&old, &obj)),
                    None => self.handlers.iter().for_each(|h| h.on_add(&obj)),
                }
            }
            WatchEvent::Deleted(obj) => {
                self.store.remove(&meta_namespace_key(&obj));
                let deleted = DeletedObject::Final(obj);
                self.handlers.iter().for_each(|h| h.on_delete(&deleted));
            }
            WatchEvent::Error(_) => {}
        }
    }

    fn resync(&self) {
        let objects = self.store.list();
        debug!(informer = self.name, objects = objects.len(), "resync");
        for obj in &objects {
            self.handlers.iter().for_each(|h| h.on_update(obj, obj));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryClient;
    use crate::domain::models::{LabelSelector, ObjectMeta, Pod, Requirement};
    use crate::services::work_queue::QueueConfig;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl EventHandler<Pod> for Recorder {
        fn on_add(&self, obj: &Pod) {
            self.events.lock().unwrap().push(format!("add {}", obj.metadata.name));
        }

        fn on_update(&self, _old: &Pod, new: &Pod) {
            self.events.lock().unwrap().push(format!("update {}", new.metadata.name));
        }

        fn on_delete(&self, obj: &DeletedObject<Pod>) {
            self.events
                .lock()
                .unwrap()
                .push(format!("delete {}", deletion_handling_key(obj)));
        }
    }

    fn pod(name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata = ObjectMeta::named("default", name);
        pod.metadata.labels.insert("app".into(), "x".into());
        pod
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met");
    }

    #[tokio::test]
    async fn test_informer_tracks_changes() {
        let client = Arc::new(MemoryClient::<Pod>::new());
        client.create(&pod("existing")).await.unwrap();

        let params = ListParams::default().labels(
            LabelSelector::new().with(Requirement::Equals("app".into(), "x".into())),
        );
        let recorder = Arc::new(Recorder::default());
        let mut informer = Informer::new("pods", client.clone(), params, Duration::from_secs(3600));
        informer.add_event_handler(recorder.clone());
        let informer = Arc::new(informer);
        let store = informer.store();

        let cancel = CancellationToken::new();
        let task = {
            let informer = informer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { informer.run(cancel).await })
        };
        assert!(informer.wait_for_sync(&cancel).await);
        assert!(store.get_by_key("default/existing").is_some());

        let created = client.create(&pod("new")).await.unwrap();
        wait_until(|| store.get_by_key("default/new").is_some()).await;

        let mut relabeled = created;
        relabeled.metadata.labels.insert("app".into(), "y".into());
        client.update(&relabeled).await.unwrap();
        wait_until(|| store.get_by_key("default/new").is_none()).await;

        cancel.cancel();
        task.await.unwrap().unwrap();

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["add existing", "add new", "delete default/new"]);
    }

    #[tokio::test]
    async fn test_resync_redelivers_cached_objects() {
        let client = Arc::new(MemoryClient::<Pod>::new());
        client.create(&pod("a")).await.unwrap();
        let queue = WorkQueue::new(QueueConfig::default());

        let mut informer = Informer::new(
            "pods",
            client.clone(),
            ListParams::default(),
            Duration::from_millis(20),
        );
        informer.add_event_handler(Arc::new(EnqueueHandler::new(queue.clone())));
        let informer = Arc::new(informer);
        let cancel = CancellationToken::new();
        let task = {
            let informer = informer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { informer.run(cancel).await })
        };

        let key = queue.get().await.unwrap();
        assert_eq!(key, "default/a");
        queue.done(&key);

        // Nothing changed, but the resync hands the key out again.
        let key = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "default/a");

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn test_tombstone_key() {
        let deleted = DeletedObject::Tombstone {
            key: "default/gone".to_string(),
            last_known: pod("stale-name"),
        };
        assert_eq!(deletion_handling_key(&deleted), "default/gone");
        assert_eq!(deleted.object().metadata.name, "stale-name");
    }
}
