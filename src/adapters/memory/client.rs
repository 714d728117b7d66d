use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::domain::models::ObjectMeta;
use crate::domain::ports::{
    ClusterError, ClusterResult, ListParams, ObjectList, Resource, ResourceClient, WatchEvent,
};

/// Changes kept for watches resuming from an older resource version
const HISTORY_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
struct Change<K> {
    version: u64,
    old: Option<K>,
    new: Option<K>,
}

impl<K: Resource> Change<K> {
    /// How this change looks to a watcher scoped by `params`.
    fn event_for(&self, params: &ListParams) -> Option<WatchEvent<K>> {
        let matched_before = self.old.as_ref().is_some_and(|o| params.matches(o));
        let matches_now = self.new.as_ref().is_some_and(|n| params.matches(n));
        match (matched_before, matches_now) {
            (false, true) => self.new.clone().map(WatchEvent::Added),
            (true, true) => self.new.clone().map(WatchEvent::Modified),
            (true, false) => self
                .new
                .clone()
                .or_else(|| self.old.clone())
                .map(WatchEvent::Deleted),
            (false, false) => None,
        }
    }
}

struct State<K> {
    objects: BTreeMap<String, K>,
    version: u64,
    history: VecDeque<Change<K>>,
    /// Newest version no longer present in `history`
    compacted: u64,
}

/// Watchable in-memory store for one resource kind
pub struct MemoryClient<K: Resource> {
    state: Mutex<State<K>>,
    changes: broadcast::Sender<Change<K>>,
}

impl<K: Resource> Default for MemoryClient<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> MemoryClient<K> {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(HISTORY_LIMIT);
        Self {
            state: Mutex::new(State {
                objects: BTreeMap::new(),
                version: 0,
                history: VecDeque::new(),
                compacted: 0,
            }),
            changes,
        }
    }

    fn state(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a change. Must be called with the state lock held so watchers
    /// subscribing under the same lock never miss or repeat a change.
    fn record(&self, state: &mut State<K>, old: Option<K>, new: Option<K>) {
        let change = Change {
            version: state.version,
            old,
            new,
        };
        if state.history.len() == HISTORY_LIMIT {
            if let Some(dropped) = state.history.pop_front() {
                state.compacted = dropped.version;
            }
        }
        state.history.push_back(change.clone());
        // No receivers is fine.
        let _ = self.changes.send(change);
    }

    fn not_found(meta: &ObjectMeta) -> ClusterError {
        ClusterError::NotFound {
            kind: K::KIND,
            key: meta.key(),
        }
    }
}

fn object_key(namespace: &str, name: &str) -> String {
    ObjectMeta::named(namespace, name).key()
}

fn generated_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..5].to_string()
}

#[async_trait]
impl<K: Resource> ResourceClient<K> for MemoryClient<K> {
    async fn list(&self, params: &ListParams) -> ClusterResult<ObjectList<K>> {
        let state = self.state();
        let items = state
            .objects
            .values()
            .filter(|obj| params.matches(*obj))
            .cloned()
            .collect();
        Ok(ObjectList {
            items,
            resource_version: state.version.to_string(),
        })
    }

    async fn watch(
        &self,
        params: &ListParams,
        resource_version: &str,
    ) -> ClusterResult<BoxStream<'static, WatchEvent<K>>> {
        let (replay, rx) = {
            let state = self.state();
            let since = if resource_version.is_empty() {
                state.version
            } else {
                resource_version.parse::<u64>().map_err(|_| {
                    ClusterError::Api(format!("invalid resource version {resource_version:?}"))
                })?
            };
            if since < state.compacted {
                return Err(ClusterError::Api(format!(
                    "too old resource version: {since} ({})",
                    state.compacted
                )));
            }
            let replay: Vec<Change<K>> = state
                .history
                .iter()
                .filter(|change| change.version > since)
                .cloned()
                .collect();
            (replay, self.changes.subscribe())
        };

        let live = stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(change) => Some((Ok(change), rx)),
                Err(RecvError::Lagged(missed)) => Some((
                    Err(ClusterError::WatchClosed(format!(
                        "watcher fell behind by {missed} changes"
                    ))),
                    rx,
                )),
                Err(RecvError::Closed) => None,
            }
        });

        let params = params.clone();
        let events = stream::iter(replay.into_iter().map(Ok))
            .chain(live)
            .filter_map(move |item| {
                let event = match item {
                    Ok(change) => change.event_for(&params),
                    Err(err) => Some(WatchEvent::Error(err)),
                };
                futures::future::ready(event)
            })
            .boxed();
        Ok(events)
    }

    async fn get(&self, namespace: &str, name: &str) -> ClusterResult<K> {
        self.state()
            .objects
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: K::KIND,
                key: object_key(namespace, name),
            })
    }

    async fn create(&self, obj: &K) -> ClusterResult<K> {
        let mut obj = obj.clone();
        {
            let meta = obj.meta_mut();
            if meta.name.is_empty() {
                let Some(prefix) = meta.generate_name.clone() else {
                    return Err(ClusterError::Api(format!(
                        "{}: name or generateName is required",
                        K::KIND
                    )));
                };
                meta.name = format!("{prefix}{}", generated_suffix());
            }
        }

        let mut state = self.state();
        let key = obj.meta().key();
        if state.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists { kind: K::KIND, key });
        }
        state.version += 1;
        let meta = obj.meta_mut();
        meta.resource_version = state.version.to_string();
        meta.uid = Uuid::new_v4().to_string();
        meta.creation_timestamp = Some(Utc::now());

        state.objects.insert(key, obj.clone());
        self.record(&mut state, None, Some(obj.clone()));
        Ok(obj)
    }

    async fn update(&self, obj: &K) -> ClusterResult<K> {
        let mut state = self.state();
        let key = obj.meta().key();
        let Some(existing) = state.objects.get(&key).cloned() else {
            return Err(Self::not_found(obj.meta()));
        };
        let requested = &obj.meta().resource_version;
        if !requested.is_empty() && *requested != existing.meta().resource_version {
            return Err(ClusterError::Conflict { kind: K::KIND, key });
        }

        state.version += 1;
        let mut updated = obj.clone();
        let meta = updated.meta_mut();
        meta.resource_version = state.version.to_string();
        meta.uid.clone_from(&existing.meta().uid);
        meta.creation_timestamp = existing.meta().creation_timestamp;

        state.objects.insert(key, updated.clone());
        self.record(&mut state, Some(existing), Some(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let mut state = self.state();
        let key = object_key(namespace, name);
        let Some(old) = state.objects.remove(&key) else {
            return Err(ClusterError::NotFound { kind: K::KIND, key });
        };
        state.version += 1;
        self.record(&mut state, Some(old), None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{LabelSelector, Pod, PodPhase, Requirement};

    fn pod(name: &str, completed: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata = ObjectMeta::named("default", name);
        pod.metadata
            .labels
            .insert("completed".to_string(), completed.to_string());
        pod
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let client = MemoryClient::<Pod>::new();
        let created = client.create(&pod("a", "false")).await.unwrap();
        assert!(!created.metadata.uid.is_empty());
        assert_eq!(created.metadata.resource_version, "1");

        let err = client.create(&pod("a", "false")).await.unwrap_err();
        assert!(err.is_already_exists());

        assert_eq!(client.get("default", "a").await.unwrap(), created);
        client.delete("default", "a").await.unwrap();
        assert!(client.get("default", "a").await.unwrap_err().is_not_found());
        assert!(client.delete("default", "a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_generate_name() {
        let client = MemoryClient::<Pod>::new();
        let mut template = Pod::default();
        template.metadata.namespace = "default".into();
        template.metadata.generate_name = Some("hello-".into());
        let created = client.create(&template).await.unwrap();
        assert!(created.metadata.name.starts_with("hello-"));
        assert_eq!(created.metadata.name.len(), "hello-".len() + 5);
    }

    #[tokio::test]
    async fn test_update_rejects_stale_version() {
        let client = MemoryClient::<Pod>::new();
        let created = client.create(&pod("a", "false")).await.unwrap();

        let mut first = created.clone();
        first.status.phase = PodPhase::Running;
        client.update(&first).await.unwrap();

        let mut stale = created;
        stale.status.phase = PodPhase::Failed;
        assert!(client.update(&stale).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_watch_reports_selector_transitions() {
        let client = MemoryClient::<Pod>::new();
        let params = ListParams::default().labels(
            LabelSelector::new().with(Requirement::Equals("completed".into(), "false".into())),
        );
        let list = client.list(&params).await.unwrap();
        let mut events = client.watch(&params, &list.resource_version).await.unwrap();

        let created = client.create(&pod("a", "false")).await.unwrap();
        let mut done = created.clone();
        done.metadata
            .labels
            .insert("completed".into(), "true".into());
        client.update(&done).await.unwrap();
        client.create(&pod("b", "true")).await.unwrap();
        client.create(&pod("c", "false")).await.unwrap();

        assert!(matches!(events.next().await, Some(WatchEvent::Added(p)) if p.metadata.name == "a"));
        assert!(matches!(events.next().await, Some(WatchEvent::Deleted(p)) if p.metadata.name == "a"));
        assert!(matches!(events.next().await, Some(WatchEvent::Added(p)) if p.metadata.name == "c"));
    }

    #[tokio::test]
    async fn test_watch_replays_from_resource_version() {
        let client = MemoryClient::<Pod>::new();
        let params = ListParams::default();
        let list = client.list(&params).await.unwrap();
        client.create(&pod("a", "false")).await.unwrap();

        let mut events = client.watch(&params, &list.resource_version).await.unwrap();
        assert!(matches!(events.next().await, Some(WatchEvent::Added(p)) if p.metadata.name == "a"));
    }
}
