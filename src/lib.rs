//! Feedsync - reactive client-side cache synchronization core
//!
//! Keeps locally held copies of server-owned entities (posts, comments,
//! likes, notifications, follow relationships) consistent with a remote data
//! source, with:
//! - Tag-based partial invalidation
//! - Request deduplication and stale-while-revalidate reads
//! - Rollback-safe optimistic mutation
//! - Background re-synchronization with priority, retry, and backoff
//! - Real-time push patching over an external channel
//!
//! UI rendering, transport construction, and persistence are the host
//! application's concern; it injects implementations of the seams in
//! [`remote`] and consumes the [`client::SyncClient`] facade.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod remote;
pub mod sync;
pub mod telemetry;

pub use cache::{
    CacheEntry, CacheStore, EntryStatus, MutateOutcome, OptimisticPatch, OptimisticPatcher,
    QueryExecutor, QueryKey, SubscriptionHandle, SubscriptionManager, Tag, TagId, TagIndex,
};
pub use client::{Mutation, QueryOptions, QueryResult, SyncClient};
pub use config::{CacheConfig, Config, SyncConfig};
pub use error::SyncError;
pub use metrics::{create_metrics, Metrics, SharedMetrics};
pub use remote::{AuthContext, PushEvent, RealtimeChannel, RealtimeSubscription, RemoteSource};
pub use sync::{QueueStats, SyncQueue, SyncScheduler, SyncTask, TaskId, TaskReport, TaskSpec, TaskState};
