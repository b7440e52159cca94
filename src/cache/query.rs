//! Fetch execution with request deduplication.
//!
//! Concurrent reads for the same key share a single in-flight fetch: the
//! first caller becomes the leader and spawns the fetch to completion, later
//! callers subscribe to the leader's outcome. The fetch task outlives an
//! abandoned caller on purpose: a duplicate caller may still be depending on
//! the dedup contract, so network work is never cancelled midway.

use crate::cache::key::QueryKey;
use crate::cache::store::{CacheStore, EntryStatus};
use crate::cache::tags::Tag;
use crate::error::SyncError;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

type FetchOutcome = Result<Value, SyncError>;
type InflightRx = watch::Receiver<Option<FetchOutcome>>;

/// Deduplicating fetch executor over a shared [`CacheStore`].
#[derive(Clone)]
pub struct QueryExecutor {
    store: CacheStore,
    inflight: Arc<DashMap<QueryKey, InflightRx>>,
}

impl QueryExecutor {
    pub fn new(store: CacheStore) -> Self {
        Self {
            store,
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Execute a read for `key`.
    ///
    /// A fresh cached entry resolves immediately without invoking `fetcher`
    /// unless `force_refetch` is set. If an identical fetch is already in
    /// flight, the caller joins it instead of fetching again. On completion
    /// the in-flight marker is cleared before the outcome is broadcast, so a
    /// failed fetch can never leave a dangling dedup lock.
    pub async fn execute<F, Fut>(
        &self,
        key: &QueryKey,
        tags: Vec<Tag>,
        ttl: Duration,
        force_refetch: bool,
        fetcher: F,
    ) -> FetchOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchOutcome> + Send + 'static,
    {
        if !force_refetch {
            if let Some(entry) = self.store.get(key).await {
                if entry.is_fresh(ttl) {
                    if let Some(data) = entry.data {
                        debug!(cache_key = %key, "Cache HIT (fresh)");
                        return Ok(data);
                    }
                }
            }
        }

        let mut rx = match self.inflight.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                debug!(cache_key = %key, "Joining in-flight fetch");
                occupied.get().clone()
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(rx.clone());
                self.spawn_fetch(key.clone(), tags, fetcher(), tx);
                rx
            }
        };

        await_outcome(&mut rx).await
    }

    /// Run the fetch to completion in its own task and broadcast the result.
    fn spawn_fetch<Fut>(
        &self,
        key: QueryKey,
        tags: Vec<Tag>,
        fut: Fut,
        tx: watch::Sender<Option<FetchOutcome>>,
    ) where
        Fut: Future<Output = FetchOutcome> + Send + 'static,
    {
        let store = self.store.clone();
        let inflight = self.inflight.clone();

        tokio::spawn(async move {
            store.mark_loading(&key).await;
            debug!(cache_key = %key, "Cache MISS, fetching from remote");

            let result = fut.await;
            match &result {
                Ok(data) => {
                    store
                        .put(key.clone(), data.clone(), tags, EntryStatus::Fulfilled)
                        .await;
                }
                Err(err) => {
                    store.put_error(&key, err).await;
                }
            }

            // Clear the marker before resolving waiters so a follow-up
            // execute is never suppressed by a finished fetch.
            inflight.remove(&key);
            let _ = tx.send(Some(result));
        });
    }

    /// Number of fetches currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

/// Wait for a broadcast fetch outcome on a watch channel.
async fn await_outcome(rx: &mut InflightRx) -> FetchOutcome {
    loop {
        {
            let value = rx.borrow_and_update();
            if let Some(outcome) = value.as_ref() {
                return outcome.clone();
            }
        }
        if rx.changed().await.is_err() {
            // Sender dropped; the last value it sent is still readable.
            let value = rx.borrow().clone();
            return value.unwrap_or_else(|| {
                Err(SyncError::Internal("in-flight fetch abandoned".into()))
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn feed_key() -> QueryKey {
        QueryKey::bare("getFeed")
    }

    #[tokio::test]
    async fn test_concurrent_executes_fetch_once() {
        // P1: N concurrent identical reads, one fetcher invocation.
        let executor = QueryExecutor::new(CacheStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = feed_key();

        let make_fetcher = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(json!([{"id": "1"}]))
            }
        };

        let ttl = Duration::from_secs(60);
        let (a, b, c) = tokio::join!(
            executor.execute(&key, vec![], ttl, false, make_fetcher(calls.clone())),
            executor.execute(&key, vec![], ttl, false, make_fetcher(calls.clone())),
            executor.execute(&key, vec![], ttl, false, make_fetcher(calls.clone())),
        );

        assert_eq!(a.unwrap(), json!([{"id": "1"}]));
        assert_eq!(b.unwrap(), json!([{"id": "1"}]));
        assert_eq!(c.unwrap(), json!([{"id": "1"}]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(executor.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_fresh_entry_skips_fetcher() {
        let store = CacheStore::new();
        let executor = QueryExecutor::new(store.clone());
        let key = feed_key();
        store
            .put(key.clone(), json!(["cached"]), vec![], EntryStatus::Fulfilled)
            .await;

        let result = executor
            .execute(&key, vec![], Duration::from_secs(60), false, || async {
                panic!("fetcher must not run for a fresh entry")
            })
            .await;
        assert_eq!(result.unwrap(), json!(["cached"]));
    }

    #[tokio::test]
    async fn test_force_refetch_bypasses_fresh_entry() {
        let store = CacheStore::new();
        let executor = QueryExecutor::new(store.clone());
        let key = feed_key();
        store
            .put(key.clone(), json!(["old"]), vec![], EntryStatus::Fulfilled)
            .await;

        let result = executor
            .execute(&key, vec![], Duration::from_secs(60), true, || async {
                Ok(json!(["new"]))
            })
            .await;
        assert_eq!(result.unwrap(), json!(["new"]));
        assert_eq!(
            store.get(&key).await.unwrap().data.unwrap(),
            json!(["new"])
        );
    }

    #[tokio::test]
    async fn test_stale_entry_refetches() {
        let store = CacheStore::new();
        let executor = QueryExecutor::new(store.clone());
        let key = feed_key();
        store
            .put(
                key.clone(),
                json!(["old"]),
                vec![Tag::list("Post")],
                EntryStatus::Fulfilled,
            )
            .await;
        store.invalidate(&[Tag::list("Post")]).await;

        let result = executor
            .execute(
                &key,
                vec![Tag::list("Post")],
                Duration::from_secs(60),
                false,
                || async { Ok(json!(["refetched"])) },
            )
            .await;
        assert_eq!(result.unwrap(), json!(["refetched"]));
        assert!(!store.get(&key).await.unwrap().stale);
    }

    #[tokio::test]
    async fn test_failure_clears_inflight_and_preserves_data() {
        let store = CacheStore::new();
        let executor = QueryExecutor::new(store.clone());
        let key = feed_key();
        store
            .put(key.clone(), json!(["old"]), vec![], EntryStatus::Fulfilled)
            .await;
        store.mark_stale(&[key.clone()]).await;

        let result = executor
            .execute(&key, vec![], Duration::from_secs(60), false, || async {
                Err(SyncError::Network("unreachable".into()))
            })
            .await;
        assert!(matches!(result, Err(SyncError::Network(_))));
        assert_eq!(executor.inflight_count(), 0);

        let entry = store.get(&key).await.unwrap();
        assert_eq!(entry.status, EntryStatus::Rejected);
        assert_eq!(entry.data.unwrap(), json!(["old"]));

        // The dedup lock is gone: a retry invokes the fetcher again.
        let result = executor
            .execute(&key, vec![], Duration::from_secs(60), false, || async {
                Ok(json!(["recovered"]))
            })
            .await;
        assert_eq!(result.unwrap(), json!(["recovered"]));
    }

    #[tokio::test]
    async fn test_abandoned_caller_does_not_cancel_fetch() {
        let store = CacheStore::new();
        let executor = QueryExecutor::new(store.clone());
        let key = feed_key();

        let caller = tokio::spawn({
            let executor = executor.clone();
            let key = key.clone();
            async move {
                executor
                    .execute(&key, vec![], Duration::from_secs(60), false, || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(json!(["done"]))
                    })
                    .await
            }
        });
        // Abandon the caller mid-fetch; the spawned fetch keeps running.
        tokio::time::sleep(Duration::from_millis(5)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            store.get(&key).await.unwrap().data.unwrap(),
            json!(["done"])
        );
        assert_eq!(executor.inflight_count(), 0);
    }
}
