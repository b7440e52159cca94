//! Optimistic mutation with rollback-safe undo tracking.
//!
//! A patch applies a speculative transform to one or more entries before the
//! remote write resolves, capturing each entry's pre-patch value. Patches on
//! the same key form an ordered stack: rolling back a patch that is no
//! longer on top splices it out and re-parents the snapshot of the patch
//! applied after it, so a later patch's effect is never clobbered by an
//! earlier patch's undo.
//!
//! Every applied patch must be terminated by exactly one of `commit` or
//! `rollback`. Violations of that contract surface as hard errors.

use crate::cache::key::QueryKey;
use crate::cache::store::{CacheStore, MutateOutcome};
use crate::error::SyncError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub type PatchId = u64;

/// Handle for a speculative mutation returned by [`OptimisticPatcher::apply`].
#[derive(Debug, Clone)]
pub struct OptimisticPatch {
    pub id: PatchId,
    /// Keys the patch actually touched (keys with nothing to patch are
    /// skipped at apply time and carry no undo record).
    pub target_keys: Vec<QueryKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatchPhase {
    Pending,
    Committed,
    RolledBack,
}

struct PatchRecord {
    phase: PatchPhase,
    /// Captured pre-patch value per touched key.
    undo: HashMap<QueryKey, Value>,
}

#[derive(Default)]
struct PatcherInner {
    records: HashMap<PatchId, PatchRecord>,
    /// Pending patches per key, bottom to top in application order.
    stacks: HashMap<QueryKey, Vec<PatchId>>,
}

/// Applies speculative mutations and settles them on remote completion.
#[derive(Clone)]
pub struct OptimisticPatcher {
    store: CacheStore,
    next_id: Arc<AtomicU64>,
    inner: Arc<Mutex<PatcherInner>>,
}

impl OptimisticPatcher {
    pub fn new(store: CacheStore) -> Self {
        Self {
            store,
            next_id: Arc::new(AtomicU64::new(1)),
            inner: Arc::new(Mutex::new(PatcherInner::default())),
        }
    }

    /// Apply `transform` to each target key, capturing pre-patch values.
    ///
    /// The store mutations all happen before this returns, so the caller's
    /// UI reflects the change before any network round trip. Keys where the
    /// store reports nothing to patch are skipped, never an error.
    pub async fn apply<F>(&self, target_keys: &[QueryKey], transform: F) -> OptimisticPatch
    where
        F: Fn(&mut Value),
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;

        let mut undo = HashMap::new();
        let mut touched = Vec::new();
        for key in target_keys {
            match self.store.mutate(key, &transform).await {
                MutateOutcome::Replaced(previous) => {
                    undo.insert(key.clone(), previous);
                    inner.stacks.entry(key.clone()).or_default().push(id);
                    touched.push(key.clone());
                }
                MutateOutcome::NothingToPatch => {
                    debug!(cache_key = %key, patch_id = id, "Nothing to patch, skipping key");
                }
            }
        }

        inner.records.insert(
            id,
            PatchRecord {
                phase: PatchPhase::Pending,
                undo,
            },
        );

        debug!(patch_id = id, keys = touched.len(), "Optimistic patch applied");
        OptimisticPatch {
            id,
            target_keys: touched,
        }
    }

    /// Mark a patch as superseded by authoritative data.
    ///
    /// Does not touch entry data: the caller is expected to have written the
    /// real server response into the store already. Committing twice, or
    /// committing a rolled-back patch, breaks the apply/settle contract.
    pub async fn commit(&self, patch: &OptimisticPatch) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        let record = inner.records.get_mut(&patch.id).ok_or_else(|| {
            SyncError::ContractViolation(format!("commit of unknown patch {}", patch.id))
        })?;

        match record.phase {
            PatchPhase::Pending => {
                record.phase = PatchPhase::Committed;
                for key in &patch.target_keys {
                    remove_from_stack(&mut inner.stacks, key, patch.id);
                }
                debug!(patch_id = patch.id, "Patch committed");
                Ok(())
            }
            PatchPhase::Committed => Err(SyncError::ContractViolation(format!(
                "patch {} already committed",
                patch.id
            ))),
            PatchPhase::RolledBack => Err(SyncError::ContractViolation(format!(
                "cannot commit rolled-back patch {}",
                patch.id
            ))),
        }
    }

    /// Revert a patch's effect.
    ///
    /// No-op for committed patches. For the topmost patch on a key the
    /// captured value is restored; for a patch buried under later ones the
    /// patch is spliced out and the next patch up inherits its snapshot, so
    /// later effects survive. Rolling back twice is a contract violation.
    pub async fn rollback(&self, patch: &OptimisticPatch) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        let record = inner.records.get(&patch.id).ok_or_else(|| {
            SyncError::ContractViolation(format!("rollback of unknown patch {}", patch.id))
        })?;

        match record.phase {
            PatchPhase::Committed => {
                debug!(patch_id = patch.id, "Rollback of committed patch ignored");
                return Ok(());
            }
            PatchPhase::RolledBack => {
                return Err(SyncError::ContractViolation(format!(
                    "patch {} already rolled back",
                    patch.id
                )));
            }
            PatchPhase::Pending => {}
        }

        let undo = inner
            .records
            .get(&patch.id)
            .map(|r| r.undo.clone())
            .unwrap_or_default();

        let inner = &mut *inner;
        for (key, previous) in undo {
            let Some(stack) = inner.stacks.get_mut(&key) else {
                continue;
            };
            let Some(pos) = stack.iter().position(|&id| id == patch.id) else {
                continue;
            };

            if pos == stack.len() - 1 {
                // Topmost patch on this key: restore the captured value.
                stack.pop();
                if stack.is_empty() {
                    inner.stacks.remove(&key);
                }
                self.store
                    .mutate(&key, |data| {
                        *data = previous.clone();
                    })
                    .await;
            } else {
                // Buried patch: splice it out and hand its snapshot to the
                // patch applied right after it. Current data keeps the later
                // patch's effect.
                let above = stack[pos + 1];
                stack.remove(pos);
                if let Some(above_record) = inner.records.get_mut(&above) {
                    above_record.undo.insert(key.clone(), previous);
                }
            }
        }

        if let Some(record) = inner.records.get_mut(&patch.id) {
            record.phase = PatchPhase::RolledBack;
        }
        debug!(patch_id = patch.id, "Patch rolled back");
        Ok(())
    }

    /// Number of patches applied but not yet committed or rolled back.
    pub async fn pending_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .records
            .values()
            .filter(|r| r.phase == PatchPhase::Pending)
            .count()
    }
}

fn remove_from_stack(
    stacks: &mut HashMap<QueryKey, Vec<PatchId>>,
    key: &QueryKey,
    id: PatchId,
) {
    if let Some(stack) = stacks.get_mut(key) {
        stack.retain(|&p| p != id);
        if stack.is_empty() {
            stacks.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::EntryStatus;
    use serde_json::json;

    async fn store_with_likes(likes: u64) -> (CacheStore, QueryKey) {
        let store = CacheStore::new();
        let key = QueryKey::new("getPost", json!({"id": "1"}));
        store
            .put(
                key.clone(),
                json!({"id": "1", "likes": likes}),
                vec![],
                EntryStatus::Fulfilled,
            )
            .await;
        (store, key)
    }

    async fn likes(store: &CacheStore, key: &QueryKey) -> u64 {
        store.get(key).await.unwrap().data.unwrap()["likes"]
            .as_u64()
            .unwrap()
    }

    #[tokio::test]
    async fn test_apply_is_synchronous_and_rollback_restores() {
        let (store, key) = store_with_likes(1).await;
        let patcher = OptimisticPatcher::new(store.clone());

        let patch = patcher
            .apply(&[key.clone()], |data| data["likes"] = json!(2))
            .await;
        assert_eq!(likes(&store, &key).await, 2);

        patcher.rollback(&patch).await.unwrap();
        assert_eq!(likes(&store, &key).await, 1);
    }

    #[tokio::test]
    async fn test_out_of_order_rollback_keeps_later_patch() {
        // P3: rollback of A after B leaves B's post-patch value.
        let (store, key) = store_with_likes(10).await;
        let patcher = OptimisticPatcher::new(store.clone());

        let a = patcher
            .apply(&[key.clone()], |data| data["likes"] = json!(11))
            .await;
        let b = patcher
            .apply(&[key.clone()], |data| data["likes"] = json!(12))
            .await;

        patcher.rollback(&a).await.unwrap();
        assert_eq!(likes(&store, &key).await, 12);

        // Rolling back B afterwards lands on the original value, not A's
        // intermediate state.
        patcher.rollback(&b).await.unwrap();
        assert_eq!(likes(&store, &key).await, 10);
    }

    #[tokio::test]
    async fn test_rollback_after_commit_is_noop() {
        // P4
        let (store, key) = store_with_likes(1).await;
        let patcher = OptimisticPatcher::new(store.clone());

        let patch = patcher
            .apply(&[key.clone()], |data| data["likes"] = json!(5))
            .await;
        patcher.commit(&patch).await.unwrap();

        patcher.rollback(&patch).await.unwrap();
        assert_eq!(likes(&store, &key).await, 5);
    }

    #[tokio::test]
    async fn test_double_rollback_is_contract_violation() {
        let (store, key) = store_with_likes(1).await;
        let patcher = OptimisticPatcher::new(store.clone());

        let patch = patcher
            .apply(&[key.clone()], |data| data["likes"] = json!(2))
            .await;
        patcher.rollback(&patch).await.unwrap();

        let err = patcher.rollback(&patch).await.unwrap_err();
        assert!(matches!(err, SyncError::ContractViolation(_)));
    }

    #[tokio::test]
    async fn test_commit_after_rollback_is_contract_violation() {
        let (store, key) = store_with_likes(1).await;
        let patcher = OptimisticPatcher::new(store.clone());

        let patch = patcher
            .apply(&[key.clone()], |data| data["likes"] = json!(2))
            .await;
        patcher.rollback(&patch).await.unwrap();

        let err = patcher.commit(&patch).await.unwrap_err();
        assert!(matches!(err, SyncError::ContractViolation(_)));

        let err = patcher.commit(&patch).await.unwrap_err();
        assert!(matches!(err, SyncError::ContractViolation(_)));
    }

    #[tokio::test]
    async fn test_absent_target_is_skipped() {
        let (store, key) = store_with_likes(1).await;
        let patcher = OptimisticPatcher::new(store.clone());
        let missing = QueryKey::new("getPost", json!({"id": "nope"}));

        let patch = patcher
            .apply(&[key.clone(), missing.clone()], |data| {
                data["likes"] = json!(2)
            })
            .await;
        assert_eq!(patch.target_keys, vec![key.clone()]);
        assert!(store.get(&missing).await.is_none());

        patcher.rollback(&patch).await.unwrap();
        assert_eq!(likes(&store, &key).await, 1);
    }

    #[tokio::test]
    async fn test_optimistic_list_insert_rolls_back_clean() {
        let store = CacheStore::new();
        let list_key = QueryKey::bare("getPosts");
        store
            .put(
                list_key.clone(),
                json!([{"id": "1"}]),
                vec![],
                EntryStatus::Fulfilled,
            )
            .await;
        let patcher = OptimisticPatcher::new(store.clone());

        let patch = patcher
            .apply(&[list_key.clone()], |data| {
                data.as_array_mut()
                    .unwrap()
                    .push(json!({"id": "temp-1", "pending": true}));
            })
            .await;
        assert_eq!(
            store.get(&list_key).await.unwrap().data.unwrap(),
            json!([{"id": "1"}, {"id": "temp-1", "pending": true}])
        );

        patcher.rollback(&patch).await.unwrap();
        assert_eq!(
            store.get(&list_key).await.unwrap().data.unwrap(),
            json!([{"id": "1"}])
        );
    }
}
