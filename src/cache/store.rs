//! Keyed entry store owning cache-entry lifecycle.
//!
//! All entry mutation funnels through this type: consumers never touch entry
//! data directly, which keeps tag registration and entry state consistent.
//! The tag index lives behind the same lock as the entries, so a `put` that
//! re-registers tags is atomic with respect to every other mutation.

use crate::cache::key::QueryKey;
use crate::cache::tags::{Tag, TagIndex};
use crate::error::SyncError;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Uninitialized,
    Loading,
    Fulfilled,
    Rejected,
}

/// One cached entry: last known data plus bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub data: Option<Value>,
    pub status: EntryStatus,
    /// Set by invalidation; the entry still serves `data` but the next read
    /// must refetch.
    pub stale: bool,
    pub tags: HashSet<Tag>,
    pub last_fetched_at: Option<Instant>,
    pub subscriber_count: usize,
    pub error: Option<String>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            data: None,
            status: EntryStatus::Uninitialized,
            stale: false,
            tags: HashSet::new(),
            last_fetched_at: None,
            subscriber_count: 0,
            error: None,
        }
    }

    /// Whether the entry can serve a read without refetching.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        if self.status != EntryStatus::Fulfilled || self.stale {
            return false;
        }
        match self.last_fetched_at {
            Some(at) => at.elapsed() < ttl,
            None => false,
        }
    }
}

/// Result of an in-place data transform.
#[derive(Debug, Clone, PartialEq)]
pub enum MutateOutcome {
    /// The transform ran; holds the pre-transform value for undo capture.
    Replaced(Value),
    /// Absent entry, empty data, or rejected entry: nothing was touched.
    NothingToPatch,
}

struct StoreInner {
    entries: HashMap<QueryKey, CacheEntry>,
    tag_index: TagIndex,
}

/// Shared entry store. Cheap to clone; all clones see the same state.
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                entries: HashMap::new(),
                tag_index: TagIndex::new(),
            })),
        }
    }

    pub async fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.inner.read().await.entries.get(key).cloned()
    }

    /// Decode the entry's data into a concrete type.
    pub async fn get_data_as<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
        let entry = self.get(key).await?;
        let data = entry.data?;
        serde_json::from_value(data).ok()
    }

    /// Upsert authoritative data. Refreshes the fetch timestamp, clears the
    /// stale flag, and re-registers tags (old tags missing from the new set
    /// are unregistered for this key).
    pub async fn put(&self, key: QueryKey, data: Value, tags: Vec<Tag>, status: EntryStatus) {
        let mut inner = self.inner.write().await;
        let new_tags: HashSet<Tag> = tags.into_iter().collect();

        inner.tag_index.unregister(&key);
        for tag in &new_tags {
            inner.tag_index.register(tag.clone(), key.clone());
        }

        let entry = inner
            .entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::new);
        entry.data = Some(data);
        entry.status = status;
        entry.stale = false;
        entry.error = None;
        entry.tags = new_tags;
        entry.last_fetched_at = Some(Instant::now());

        debug!(cache_key = %key, ?status, "Entry stored");
    }

    /// Transition an entry into `Loading` without dropping prior data, so
    /// consumers keep rendering the stale value during the refetch.
    pub async fn mark_loading(&self, key: &QueryKey) {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::new);
        entry.status = EntryStatus::Loading;
    }

    /// Record a fetch failure. Prior data is preserved for
    /// stale-while-revalidate reads.
    pub async fn put_error(&self, key: &QueryKey, error: &SyncError) {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::new);
        entry.status = EntryStatus::Rejected;
        entry.error = Some(error.to_string());
        debug!(cache_key = %key, error = %error, "Entry rejected");
    }

    /// Mark every entry depending on any of the tags as stale.
    ///
    /// Data is retained; the next read of a stale key triggers a real
    /// refetch. Returns the affected keys.
    pub async fn invalidate(&self, tags: &[Tag]) -> Vec<QueryKey> {
        let mut inner = self.inner.write().await;
        let keys: Vec<QueryKey> = inner.tag_index.resolve(tags).into_iter().collect();
        for key in &keys {
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.stale = true;
            }
        }
        debug!(tags = tags.len(), affected = keys.len(), "Invalidated tags");
        keys
    }

    /// Mark specific keys stale directly (conflict recovery path).
    pub async fn mark_stale(&self, keys: &[QueryKey]) {
        let mut inner = self.inner.write().await;
        for key in keys {
            if let Some(entry) = inner.entries.get_mut(key) {
                entry.stale = true;
            }
        }
    }

    /// Apply an in-place transform to the entry's data, returning the
    /// previous value for undo capture.
    ///
    /// Absent entries, entries with no data, and rejected entries are left
    /// untouched and reported as `NothingToPatch`.
    pub async fn mutate<F>(&self, key: &QueryKey, f: F) -> MutateOutcome
    where
        F: FnOnce(&mut Value),
    {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.entries.get_mut(key) else {
            return MutateOutcome::NothingToPatch;
        };
        if entry.status == EntryStatus::Rejected {
            return MutateOutcome::NothingToPatch;
        }
        let Some(data) = entry.data.as_mut() else {
            return MutateOutcome::NothingToPatch;
        };

        let previous = data.clone();
        f(data);
        MutateOutcome::Replaced(previous)
    }

    /// Remove an entry entirely (eviction path); unregisters its tags.
    pub async fn remove(&self, key: &QueryKey) -> bool {
        let mut inner = self.inner.write().await;
        inner.tag_index.unregister(key);
        let removed = inner.entries.remove(key).is_some();
        if removed {
            debug!(cache_key = %key, "Entry evicted");
        }
        removed
    }

    /// Increment the subscriber count, creating a placeholder entry for a
    /// key that has not been read yet.
    pub async fn add_subscriber(&self, key: &QueryKey) -> usize {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::new);
        entry.subscriber_count += 1;
        entry.subscriber_count
    }

    /// Decrement the subscriber count, saturating at zero.
    pub async fn remove_subscriber(&self, key: &QueryKey) -> usize {
        let mut inner = self.inner.write().await;
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
                entry.subscriber_count
            }
            None => 0,
        }
    }

    /// Keys with no subscribers whose TTL has elapsed.
    ///
    /// Entries that were never fetched do not expire here; they are cleaned
    /// up when their last subscriber detaches.
    pub async fn evictable_keys(&self, ttl: Duration) -> Vec<QueryKey> {
        let inner = self.inner.read().await;
        inner
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.subscriber_count == 0
                    && entry
                        .last_fetched_at
                        .map(|at| at.elapsed() >= ttl)
                        .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Resolve keys depending on any of the given tags without mutating.
    pub async fn resolve_tags(&self, tags: &[Tag]) -> Vec<QueryKey> {
        let inner = self.inner.read().await;
        inner.tag_index.resolve(tags).into_iter().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}
