//! External collaborator seams: remote data source, real-time push channel,
//! and the read-only auth context.
//!
//! The core never constructs transport requests itself; collaborators
//! implement these traits and are injected into [`crate::client::SyncClient`].

use crate::error::SyncError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Remote data source for reads and writes.
///
/// Reads are assumed idempotent; writes are not and must never be silently
/// retried without the caller having settled the optimistic patch first.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch(&self, operation: &str, params: &Value) -> Result<Value, SyncError>;
}

/// A push event delivered by the real-time channel.
///
/// Delivered at-most-once per change; ordering across different entities is
/// not guaranteed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
}

/// An active topic subscription. Dropping it detaches the topic.
pub struct RealtimeSubscription {
    pub events: mpsc::Receiver<PushEvent>,
}

/// Real-time push channel.
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<RealtimeSubscription, SyncError>;
}

/// Read-only current-user identity.
///
/// Consumed to scope query parameters and to fill optimistic payload
/// defaults (e.g. the author of a speculative post). Never mutated here.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
}

impl AuthContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}
