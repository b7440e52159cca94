//! Cache core for feedsync.
//!
//! This module provides the client-side caching infrastructure:
//! - Structured entry keys and tag-based dependency tracking
//! - The keyed entry store owning entry lifecycle
//! - A deduplicating query executor with stale-while-revalidate reads
//! - Optimistic patching with rollback-safe per-key undo ordering
//! - Subscription tracking driving eviction and real-time attachment

pub mod key;
pub mod optimistic;
pub mod query;
pub mod store;
pub mod subscription;
pub mod tags;

pub use key::QueryKey;
pub use optimistic::{OptimisticPatch, OptimisticPatcher, PatchId};
pub use query::QueryExecutor;
pub use store::{CacheEntry, CacheStore, EntryStatus, MutateOutcome};
pub use subscription::{SubscriptionHandle, SubscriptionManager};
pub use tags::{Tag, TagId, TagIndex};
