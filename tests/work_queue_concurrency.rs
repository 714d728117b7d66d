//! Several workers draining one queue while producers keep re-adding the
//! same keys: a key is never held by two workers at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kubext::services::{QueueConfig, WorkQueue};

const WORKERS: usize = 8;
const KEYS: usize = 5;
const ROUNDS: usize = 200;

#[derive(Default)]
struct Tracker {
    active: Mutex<HashMap<String, usize>>,
    overlaps: AtomicUsize,
    processed: AtomicUsize,
}

impl Tracker {
    fn enter(&self, key: &str) {
        let mut active = self.active.lock().unwrap();
        let count = active.entry(key.to_string()).or_default();
        *count += 1;
        if *count > 1 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn exit(&self, key: &str) {
        let mut active = self.active.lock().unwrap();
        if let Some(count) = active.get_mut(key) {
            *count -= 1;
        }
        self.processed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_key_never_processed_by_two_workers() {
    let queue = WorkQueue::new(QueueConfig::default());
    let tracker = Arc::new(Tracker::default());

    let workers: Vec<_> = (0..WORKERS)
        .map(|_| {
            let queue = queue.clone();
            let tracker = tracker.clone();
            tokio::spawn(async move {
                while let Some(key) = queue.get().await {
                    tracker.enter(&key);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    tracker.exit(&key);
                    queue.done(&key);
                }
            })
        })
        .collect();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for round in 0..ROUNDS {
                    queue.add(format!("default/wf-{}", (round + p) % KEYS));
                    if round % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    // Let the workers drain every dirty key before stopping them
    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let idle = tracker.active.lock().unwrap().values().all(|c| *c == 0);
            if queue.is_empty() && idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "queue did not drain");

    queue.shutdown();
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(tracker.overlaps.load(Ordering::SeqCst), 0);
    let processed = tracker.processed.load(Ordering::SeqCst);
    assert!(processed >= KEYS, "processed only {processed} keys");
}
