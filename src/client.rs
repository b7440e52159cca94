//! Client facade tying the cache core together.
//!
//! Construction wires the store, executor, patcher, scheduler, and
//! subscription manager and spawns the background loops. Everything is
//! explicitly injected; there is no global instance. Consumers use three
//! surfaces: reactive reads (`query` + `subscribe`), optimistic writes
//! (`mutate`), and manual invalidation for cross-cutting events like logout.

use crate::cache::key::QueryKey;
use crate::cache::optimistic::OptimisticPatcher;
use crate::cache::query::QueryExecutor;
use crate::cache::store::{CacheStore, EntryStatus};
use crate::cache::subscription::{SubscriptionHandle, SubscriptionManager};
use crate::cache::tags::Tag;
use crate::config::Config;
use crate::error::SyncError;
use crate::metrics::{create_metrics, SharedMetrics};
use crate::remote::{AuthContext, PushEvent, RealtimeChannel, RemoteSource};
use crate::sync::queue::{SyncQueue, TaskId, TaskReport, TaskSpec};
use crate::sync::scheduler::SyncScheduler;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Options for a single read.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Bypass a fresh cached entry and hit the remote.
    pub force_refetch: bool,
    /// Per-query TTL override.
    pub ttl: Option<Duration>,
}

/// Result of a read: last known data, entry status, and the error if the
/// fetch failed. A rejected fetch still carries prior data so consumers can
/// keep rendering it.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub data: Option<Value>,
    pub status: EntryStatus,
    pub error: Option<SyncError>,
}

type TransformFn = Box<dyn Fn(&mut Value) + Send + Sync>;
type ReconcileFn = Box<dyn Fn(&mut Value, &Value) + Send + Sync>;

/// A write against the remote, optionally with an optimistic local effect.
///
/// The optimistic transform runs against the target keys before the network
/// round trip; `reconcile` folds the authoritative response back into those
/// keys on success (replacing temporary entries rather than duplicating
/// them); declared tags are invalidated after the commit.
pub struct Mutation {
    operation: String,
    params: Value,
    targets: Vec<QueryKey>,
    transform: Option<TransformFn>,
    reconcile: Option<ReconcileFn>,
    invalidates: Vec<Tag>,
}

impl Mutation {
    pub fn new(operation: impl Into<String>, params: Value) -> Self {
        Self {
            operation: operation.into(),
            params,
            targets: Vec::new(),
            transform: None,
            reconcile: None,
            invalidates: Vec::new(),
        }
    }

    /// Speculative transform applied to `targets` before the remote write.
    pub fn optimistic<F>(mut self, targets: Vec<QueryKey>, transform: F) -> Self
    where
        F: Fn(&mut Value) + Send + Sync + 'static,
    {
        self.targets = targets;
        self.transform = Some(Box::new(transform));
        self
    }

    /// Fold the server response into each target key after success.
    pub fn reconcile<F>(mut self, reconcile: F) -> Self
    where
        F: Fn(&mut Value, &Value) + Send + Sync + 'static,
    {
        self.reconcile = Some(Box::new(reconcile));
        self
    }

    pub fn invalidates(mut self, tags: Vec<Tag>) -> Self {
        self.invalidates = tags;
        self
    }
}

/// Shared cache-synchronization client.
pub struct SyncClient {
    store: CacheStore,
    executor: QueryExecutor,
    patcher: OptimisticPatcher,
    subscriptions: SubscriptionManager,
    queue: SyncQueue,
    remote: Arc<dyn RemoteSource>,
    auth: AuthContext,
    config: Config,
    metrics: SharedMetrics,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncClient {
    /// Build the full core and start its background loops: the sync
    /// scheduler, the eviction sweep, and the push-event handler.
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        channel: Option<Arc<dyn RealtimeChannel>>,
        auth: AuthContext,
        config: Config,
    ) -> Arc<Self> {
        let store = CacheStore::new();
        let executor = QueryExecutor::new(store.clone());
        let patcher = OptimisticPatcher::new(store.clone());
        let queue = SyncQueue::new(config.sync.clone());
        let metrics = create_metrics();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (push_tx, push_rx) = mpsc::channel(64);
        let subscriptions =
            SubscriptionManager::new(store.clone(), config.cache.clone(), channel, push_tx);

        let scheduler = SyncScheduler::new(
            queue.clone(),
            store.clone(),
            remote.clone(),
            config.sync.clone(),
            shutdown_rx.clone(),
        );
        tokio::spawn(async move { scheduler.run().await });

        {
            let subscriptions = subscriptions.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move { subscriptions.run_eviction_loop(shutdown_rx).await });
        }

        spawn_push_loop(store.clone(), metrics.clone(), push_rx, shutdown_rx.clone());

        // Periodic gauge refresh for hosts scraping the registry.
        {
            let store = store.clone();
            let queue = queue.clone();
            let metrics = metrics.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    metrics.update_cache_metrics(store.len().await);
                    metrics.update_queue_metrics(&queue.stats().await);
                }
            });
        }

        info!(user = %auth.user_id, "Sync client started");
        Arc::new(Self {
            store,
            executor,
            patcher,
            subscriptions,
            queue,
            remote,
            auth,
            config,
            metrics,
            shutdown_tx,
        })
    }

    /// Reactive read. Registers the declared tags for the resulting entry.
    pub async fn query(
        &self,
        operation: &str,
        params: Value,
        tags: Vec<Tag>,
        options: QueryOptions,
    ) -> QueryResult {
        let key = QueryKey::new(operation, params);
        let ttl = options.ttl.unwrap_or(self.config.cache.ttl);

        let served_from_cache = !options.force_refetch
            && self
                .store
                .get(&key)
                .await
                .map(|e| e.is_fresh(ttl))
                .unwrap_or(false);

        let fetcher = {
            let remote = self.remote.clone();
            let operation = operation.to_string();
            let params = key.params().clone();
            move || async move { remote.fetch(&operation, &params).await }
        };

        match self
            .executor
            .execute(&key, tags, ttl, options.force_refetch, fetcher)
            .await
        {
            Ok(data) => {
                let outcome = if served_from_cache { "hit" } else { "fetch" };
                self.metrics.query_total.with_label_values(&[outcome]).inc();
                QueryResult {
                    data: Some(data),
                    status: EntryStatus::Fulfilled,
                    error: None,
                }
            }
            Err(err) => {
                self.metrics
                    .query_total
                    .with_label_values(&["rejected"])
                    .inc();
                // Stale-while-revalidate: keep serving the last known data.
                let data = self.store.get(&key).await.and_then(|e| e.data);
                QueryResult {
                    data,
                    status: EntryStatus::Rejected,
                    error: Some(err),
                }
            }
        }
    }

    /// Optimistic write: apply → remote → reconcile + commit, or rollback.
    ///
    /// On a conflict the affected keys are additionally marked stale and a
    /// high-priority refetch is enqueued, so the local view converges on the
    /// server's state instead of blindly retrying the write.
    pub async fn mutate(&self, mutation: Mutation) -> Result<Value, SyncError> {
        let patch = match &mutation.transform {
            Some(transform) => {
                self.metrics.patches_applied_total.inc();
                Some(self.patcher.apply(&mutation.targets, transform).await)
            }
            None => None,
        };

        match self.remote.fetch(&mutation.operation, &mutation.params).await {
            Ok(data) => {
                if let Some(reconcile) = &mutation.reconcile {
                    for key in patch
                        .as_ref()
                        .map(|p| p.target_keys.as_slice())
                        .unwrap_or(&mutation.targets)
                    {
                        self.store.mutate(key, |value| reconcile(value, &data)).await;
                    }
                }
                if let Some(patch) = &patch {
                    self.patcher.commit(patch).await?;
                    self.metrics.patches_committed_total.inc();
                }
                if !mutation.invalidates.is_empty() {
                    self.invalidate(&mutation.invalidates).await;
                }
                Ok(data)
            }
            Err(err) => {
                if let Some(patch) = &patch {
                    self.patcher.rollback(patch).await?;
                    self.metrics.patches_rolled_back_total.inc();
                }
                if matches!(err, SyncError::Conflict(_)) {
                    self.recover_from_conflict(&mutation.targets).await;
                }
                warn!(operation = %mutation.operation, error = %err, "Mutation failed");
                Err(err)
            }
        }
    }

    /// Optimistic state diverged from the server: force the affected keys
    /// back to authoritative data via high-priority refetch tasks.
    async fn recover_from_conflict(&self, targets: &[QueryKey]) {
        self.store.mark_stale(targets).await;
        for key in targets {
            let spec = TaskSpec::new(key.operation(), key.params().clone())
                .priority(self.config.sync.high_priority_threshold);
            let task_id = self.queue.enqueue(spec).await;
            debug!(cache_key = %key, task_id, "Enqueued conflict refetch");
        }
    }

    /// Manual cache invalidation for cross-cutting events (e.g. logout).
    pub async fn invalidate(&self, tags: &[Tag]) -> Vec<QueryKey> {
        self.metrics.invalidations_total.inc();
        self.store.invalidate(tags).await
    }

    /// Subscribe and read in one step, the way a mounting view consumes a
    /// query. The handle must be passed back to `unsubscribe` on teardown.
    pub async fn watch_query(
        &self,
        operation: &str,
        params: Value,
        tags: Vec<Tag>,
        options: QueryOptions,
    ) -> (QueryResult, SubscriptionHandle) {
        let key = QueryKey::new(operation, params.clone());
        let handle = self.subscriptions.subscribe(&key).await;
        let result = self.query(operation, params, tags, options).await;
        (result, handle)
    }

    /// Register a consumer for a key; drives eviction and real-time attach.
    pub async fn subscribe(&self, key: &QueryKey) -> SubscriptionHandle {
        self.subscriptions.subscribe(key).await
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.subscriptions.unsubscribe(handle).await
    }

    /// Enqueue a background remote operation.
    pub async fn enqueue_sync(&self, spec: TaskSpec) -> TaskId {
        self.queue.enqueue(spec).await
    }

    /// Request an immediate scheduler pass.
    pub fn sync_now(&self) {
        self.queue.kick();
    }

    pub async fn pause_sync(&self) {
        self.queue.pause().await;
    }

    pub async fn resume_sync(&self) {
        self.queue.resume().await;
    }

    /// Status of one task, while it is within the retention window.
    pub async fn sync_task_report(&self, id: TaskId) -> Option<TaskReport> {
        self.queue.task_report(id).await
    }

    /// Tasks that exhausted their retries; never silently dropped.
    pub async fn failed_sync_tasks(&self) -> Vec<TaskReport> {
        self.queue.failed_tasks().await
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Stop the background loops. Pending in-flight fetches still run to
    /// completion.
    pub fn shutdown(&self) {
        info!("Sync client shutting down");
        self.shutdown_tx.send(true).ok();
        self.queue.kick();
    }
}

/// Apply pushed events to the store: patch entries carrying the entity's
/// specific tag in place, then mark listings of that type stale.
fn spawn_push_loop(
    store: CacheStore,
    metrics: SharedMetrics,
    mut push_rx: mpsc::Receiver<PushEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = push_rx.recv() => {
                    let Some(event) = event else { break };
                    apply_push_event(&store, &event).await;
                    metrics.push_events_total.inc();
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

async fn apply_push_event(store: &CacheStore, event: &PushEvent) {
    let entity_tag = Tag::entity(&event.entity_type, &event.entity_id);
    let keys = store.resolve_tags(&[entity_tag]).await;
    for key in &keys {
        store
            .mutate(key, |data| merge_entity(data, &event.entity_id, &event.payload))
            .await;
    }
    store.invalidate(&[Tag::list(&event.entity_type)]).await;
    debug!(
        entity_type = %event.entity_type,
        entity_id = %event.entity_id,
        patched = keys.len(),
        "Push event applied"
    );
}

/// Shallow-merge `payload` into the entity with the matching id, whether the
/// cached value is the entity itself or a listing containing it.
fn merge_entity(data: &mut Value, entity_id: &str, payload: &Value) {
    match data {
        Value::Object(_) => {
            if data.get("id").and_then(Value::as_str) == Some(entity_id) {
                merge_fields(data, payload);
            }
        }
        Value::Array(items) => {
            for item in items {
                if item.get("id").and_then(Value::as_str) == Some(entity_id) {
                    merge_fields(item, payload);
                }
            }
        }
        _ => {}
    }
}

fn merge_fields(target: &mut Value, payload: &Value) {
    if let (Value::Object(target), Value::Object(payload)) = (target, payload) {
        for (field, value) in payload {
            target.insert(field.clone(), value.clone());
        }
    }
}
