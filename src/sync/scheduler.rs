//! Background scheduler draining the sync queue.
//!
//! Runs a poll loop that attempts due tasks concurrently, reports outcomes
//! back to the queue, and invalidates each completed task's declared tags so
//! dependent entries refetch lazily. High-priority enqueues and explicit
//! "sync now" requests wake the loop immediately instead of waiting for the
//! next poll.

use crate::cache::key::QueryKey;
use crate::cache::store::{CacheStore, EntryStatus};
use crate::config::SyncConfig;
use crate::remote::RemoteSource;
use crate::sync::queue::{SyncQueue, SyncTask, TaskDisposition};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info};

pub struct SyncScheduler {
    queue: SyncQueue,
    store: CacheStore,
    remote: Arc<dyn RemoteSource>,
    config: SyncConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl SyncScheduler {
    pub fn new(
        queue: SyncQueue,
        store: CacheStore,
        remote: Arc<dyn RemoteSource>,
        config: SyncConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            store,
            remote,
            config,
            shutdown_rx,
        }
    }

    /// Main loop: tick, then sleep until the next poll or an out-of-band
    /// kick, whichever comes first.
    pub async fn run(&self) {
        info!("Starting sync scheduler");
        loop {
            if *self.shutdown_rx.borrow() {
                info!("Sync scheduler received shutdown signal");
                break;
            }

            self.tick().await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = self.queue.kicked() => {
                    debug!("Out-of-band tick requested");
                }
            }
        }
        info!("Sync scheduler stopped");
    }

    /// Attempt up to `max_concurrent_syncs` due tasks concurrently.
    ///
    /// Returns the number of tasks attempted. Also callable on demand for
    /// "sync now".
    pub async fn tick(&self) -> usize {
        let now = Instant::now();
        self.queue.gc_expired(now).await;

        let batch = self.queue.select_next_batch(now, self.config.max_concurrent_syncs).await;
        if batch.is_empty() {
            return 0;
        }
        let attempted = batch.len();
        debug!(batch_size = attempted, "Attempting sync batch");

        let results: Vec<_> = stream::iter(batch)
            .map(|task| {
                let remote = self.remote.clone();
                async move {
                    let result = remote.fetch(&task.operation, &task.params).await;
                    (task, result)
                }
            })
            .buffer_unordered(self.config.max_concurrent_syncs)
            .collect()
            .await;

        for (task, result) in results {
            let outcome = result.as_ref().map(|_| ()).map_err(|e| e.clone());
            let disposition = self
                .queue
                .handle_outcome(task.id, outcome, Instant::now())
                .await;

            if disposition == TaskDisposition::Completed {
                if let Ok(data) = result {
                    self.write_back(&task, data).await;
                }
                if !task.invalidates.is_empty() {
                    self.store.invalidate(&task.invalidates).await;
                }
            }
        }
        attempted
    }

    /// Refresh the cache entry matching a completed task, if one exists.
    ///
    /// This is what makes a refetch task (e.g. after a conflict) actually
    /// repair the entry instead of just confirming the remote succeeded.
    async fn write_back(&self, task: &SyncTask, data: serde_json::Value) {
        let key = QueryKey::new(&task.operation, task.params.clone());
        if let Some(entry) = self.store.get(&key).await {
            let tags: Vec<_> = entry.tags.into_iter().collect();
            self.store.put(key, data, tags, EntryStatus::Fulfilled).await;
        }
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::QueryKey;
    use crate::cache::store::EntryStatus;
    use crate::cache::tags::Tag;
    use crate::config::Config;
    use crate::error::SyncError;
    use crate::sync::queue::{TaskSpec, TaskState};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedRemote {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl RemoteSource for ScriptedRemote {
        async fn fetch(&self, _operation: &str, _params: &Value) -> Result<Value, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SyncError::Network("down".into()))
            } else {
                Ok(json!({"ok": true}))
            }
        }
    }

    fn scheduler(
        store: CacheStore,
        fail: bool,
    ) -> (SyncScheduler, Arc<ScriptedRemote>, watch::Sender<bool>) {
        let config = Config::default().sync;
        let remote = Arc::new(ScriptedRemote {
            calls: AtomicUsize::new(0),
            fail,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = SyncQueue::new(config.clone());
        (
            SyncScheduler::new(queue, store, remote.clone(), config, shutdown_rx),
            remote,
            shutdown_tx,
        )
    }

    #[tokio::test]
    async fn test_tick_completes_task_and_invalidates_tags() {
        let store = CacheStore::new();
        let listing = QueryKey::bare("getPosts");
        store
            .put(
                listing.clone(),
                json!([]),
                vec![Tag::list("Post")],
                EntryStatus::Fulfilled,
            )
            .await;

        let (scheduler, remote, _shutdown) = scheduler(store.clone(), false);
        let id = scheduler
            .queue()
            .enqueue(TaskSpec::new("createPost", json!({})).invalidates(vec![Tag::list("Post")]))
            .await;

        assert_eq!(scheduler.tick().await, 1);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            scheduler.queue().task(id).await.unwrap().state,
            TaskState::Completed
        );
        assert!(store.get(&listing).await.unwrap().stale);
    }

    #[tokio::test]
    async fn test_failed_task_backs_off() {
        let store = CacheStore::new();
        let (scheduler, remote, _shutdown) = scheduler(store, true);
        let id = scheduler
            .queue()
            .enqueue(TaskSpec::new("createPost", json!({})))
            .await;

        assert_eq!(scheduler.tick().await, 1);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);

        let task = scheduler.queue().task(id).await.unwrap();
        assert_eq!(task.state, TaskState::Queued);
        assert_eq!(task.retry_count, 1);

        // Backed off: an immediate second tick attempts nothing.
        assert_eq!(scheduler.tick().await, 0);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pause_suppresses_ticks() {
        let store = CacheStore::new();
        let (scheduler, remote, _shutdown) = scheduler(store, false);
        scheduler
            .queue()
            .enqueue(TaskSpec::new("createPost", json!({})))
            .await;

        scheduler.queue().pause().await;
        assert_eq!(scheduler.tick().await, 0);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);

        scheduler.queue().resume().await;
        assert_eq!(scheduler.tick().await, 1);
    }

    #[tokio::test]
    async fn test_high_priority_enqueue_wakes_run_loop() {
        let store = CacheStore::new();
        let mut config = Config::default().sync;
        // Long poll interval: only the kick can explain a prompt attempt.
        config.poll_interval = Duration::from_secs(30);

        let remote = Arc::new(ScriptedRemote {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = SyncQueue::new(config.clone());
        let scheduler = Arc::new(SyncScheduler::new(
            queue.clone(),
            store,
            remote.clone(),
            config.clone(),
            shutdown_rx,
        ));

        let runner = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run().await })
        };

        // Let the loop finish its first (empty) tick and park on select.
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue
            .enqueue(
                TaskSpec::new("markNotificationRead", json!({}))
                    .priority(config.high_priority_threshold),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);

        shutdown_tx.send(true).ok();
        queue.kick();
        runner.await.unwrap();
    }
}
