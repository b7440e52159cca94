//! Consumer subscriptions, entry eviction, and real-time feed attachment.
//!
//! Each active consumer of a key holds a subscription handle. The entry's
//! subscriber count drives two things: eviction (an entry is only evictable
//! once its count is zero and its TTL has elapsed) and the real-time channel
//! lifecycle (attached lazily on the first subscriber, torn down with the
//! last one, so idle topics never leak open channels).

use crate::cache::key::QueryKey;
use crate::cache::store::CacheStore;
use crate::config::CacheConfig;
use crate::remote::{PushEvent, RealtimeChannel};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Proof of an active subscription; pass back to `unsubscribe`.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    key: QueryKey,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

struct ManagerInner {
    /// Live handle ids, to make double-unsubscribe harmless.
    live_handles: HashSet<u64>,
    /// Forwarding task per attached topic.
    attachments: HashMap<QueryKey, JoinHandle<()>>,
}

/// Tracks active consumers per entry key.
#[derive(Clone)]
pub struct SubscriptionManager {
    store: CacheStore,
    config: CacheConfig,
    channel: Option<Arc<dyn RealtimeChannel>>,
    push_tx: mpsc::Sender<PushEvent>,
    next_handle: Arc<AtomicU64>,
    inner: Arc<Mutex<ManagerInner>>,
}

impl SubscriptionManager {
    pub fn new(
        store: CacheStore,
        config: CacheConfig,
        channel: Option<Arc<dyn RealtimeChannel>>,
        push_tx: mpsc::Sender<PushEvent>,
    ) -> Self {
        Self {
            store,
            config,
            channel,
            push_tx,
            next_handle: Arc::new(AtomicU64::new(1)),
            inner: Arc::new(Mutex::new(ManagerInner {
                live_handles: HashSet::new(),
                attachments: HashMap::new(),
            })),
        }
    }

    /// Register a consumer for `key`.
    ///
    /// The first subscriber for a key lazily attaches the real-time channel
    /// to that key's topic.
    pub async fn subscribe(&self, key: &QueryKey) -> SubscriptionHandle {
        let count = self.store.add_subscriber(key).await;
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock().await;
        inner.live_handles.insert(id);

        if count == 1 {
            if let Some(channel) = &self.channel {
                if !inner.attachments.contains_key(key) {
                    match channel.subscribe(key.canonical()).await {
                        Ok(subscription) => {
                            let task = spawn_forwarder(subscription.events, self.push_tx.clone());
                            inner.attachments.insert(key.clone(), task);
                            debug!(cache_key = %key, "Real-time topic attached");
                        }
                        Err(err) => {
                            warn!(cache_key = %key, error = %err, "Real-time attach failed");
                        }
                    }
                }
            }
        }

        debug!(cache_key = %key, subscribers = count, "Subscribed");
        SubscriptionHandle {
            id,
            key: key.clone(),
        }
    }

    /// Drop a consumer. When the last subscriber detaches, the real-time
    /// topic is torn down; the entry itself stays until its TTL elapses.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut inner = self.inner.lock().await;
        if !inner.live_handles.remove(&handle.id) {
            warn!(cache_key = %handle.key, "Unsubscribe with stale handle ignored");
            return;
        }

        let count = self.store.remove_subscriber(&handle.key).await;
        if count == 0 {
            if let Some(task) = inner.attachments.remove(&handle.key) {
                task.abort();
                debug!(cache_key = %handle.key, "Real-time topic detached");
            }
        }
        debug!(cache_key = %handle.key, subscribers = count, "Unsubscribed");
    }

    /// Remove entries whose last subscriber is gone and whose TTL elapsed.
    ///
    /// Entries with any active subscriber are never evicted, regardless of
    /// age.
    pub async fn evict_expired(&self) -> usize {
        let keys = self.store.evictable_keys(self.config.ttl).await;
        let mut evicted = 0;
        for key in keys {
            if self.store.remove(&key).await {
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, "Eviction sweep removed expired entries");
        }
        evicted
    }

    /// Periodic eviction sweep; runs until the shutdown signal flips.
    pub async fn run_eviction_loop(&self, shutdown_rx: watch::Receiver<bool>) {
        info!("Starting eviction sweep loop");
        loop {
            if *shutdown_rx.borrow() {
                info!("Eviction loop received shutdown signal");
                break;
            }
            tokio::time::sleep(self.config.eviction_sweep_interval).await;
            self.evict_expired().await;
        }
    }

    /// Number of currently attached real-time topics.
    pub async fn attachment_count(&self) -> usize {
        self.inner.lock().await.attachments.len()
    }
}

/// Forward pushed events into the client's handling loop. Aborting the task
/// drops the channel subscription, which detaches the topic.
fn spawn_forwarder(
    mut events: mpsc::Receiver<PushEvent>,
    push_tx: mpsc::Sender<PushEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if push_tx.send(event).await.is_err() {
                break;
            }
        }
    })
}
