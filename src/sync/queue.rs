//! Queue of pending remote operations.
//!
//! Tasks carry a priority, a retry budget, and an exponential-backoff
//! schedule. Failed tasks stay queued until their budget is exhausted, at
//! which point they are surfaced as permanently failed rather than silently
//! dropped. Settled tasks are garbage-collected after a retention window so
//! callers can still query their outcome for a while.

use crate::cache::tags::Tag;
use crate::config::SyncConfig;
use crate::error::SyncError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

pub type TaskId = u64;

/// State machine for one task: `Queued → Attempting → {Completed |
/// Queued(retry) | FailedPermanently}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Queued,
    Attempting,
    Completed,
    FailedPermanently,
}

/// A pending remote operation tracked by the scheduler.
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub id: TaskId,
    pub operation: String,
    pub params: Value,
    pub priority: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub state: TaskState,
    /// Tags invalidated when this task completes successfully.
    pub invalidates: Vec<Tag>,
    pub created_at: Instant,
    pub last_attempt_at: Option<Instant>,
    pub next_attempt_at: Instant,
    pub completed_at: Option<Instant>,
    /// Wall-clock completion time, for surfaced reports.
    pub completed_wall: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Parameters for enqueueing a task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub operation: String,
    pub params: Value,
    pub priority: i64,
    /// Overrides the configured default retry budget when set.
    pub max_retries: Option<u32>,
    pub invalidates: Vec<Tag>,
}

impl TaskSpec {
    pub fn new(operation: impl Into<String>, params: Value) -> Self {
        Self {
            operation: operation.into(),
            params,
            priority: 0,
            max_retries: None,
            invalidates: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn invalidates(mut self, tags: Vec<Tag>) -> Self {
        self.invalidates = tags;
        self
    }
}

/// Outcome classification after an attempt is reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDisposition {
    Completed,
    Retrying { delay: Duration },
    FailedPermanently,
}

/// Surfaced view of a task, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub operation: String,
    pub priority: i64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub state: TaskState,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskReport {
    fn from_task(task: &SyncTask) -> Self {
        Self {
            id: task.id,
            operation: task.operation.clone(),
            priority: task.priority,
            retry_count: task.retry_count,
            max_retries: task.max_retries,
            state: task.state,
            error: task.error.clone(),
            completed_at: task.completed_wall,
        }
    }
}

/// Statistics about the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub due: usize,
    pub attempting: usize,
    pub completed: usize,
    pub failed: usize,
}

struct QueueInner {
    tasks: HashMap<TaskId, SyncTask>,
    next_id: TaskId,
    paused: bool,
}

/// Shared task queue. Clones see the same state.
#[derive(Clone)]
pub struct SyncQueue {
    config: SyncConfig,
    inner: Arc<Mutex<QueueInner>>,
    /// Signalled when a high-priority task lands, for an out-of-band tick.
    kick: Arc<Notify>,
}

impl SyncQueue {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(QueueInner {
                tasks: HashMap::new(),
                next_id: 1,
                paused: false,
            })),
            kick: Arc::new(Notify::new()),
        }
    }

    /// Add a task. High-priority tasks signal an immediate tick instead of
    /// waiting for the next periodic cycle.
    pub async fn enqueue(&self, spec: TaskSpec) -> TaskId {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id;
        inner.next_id += 1;

        let now = Instant::now();
        let high_priority = spec.priority >= self.config.high_priority_threshold;
        let task = SyncTask {
            id,
            operation: spec.operation,
            params: spec.params,
            priority: spec.priority,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(self.config.default_max_retries),
            state: TaskState::Queued,
            invalidates: spec.invalidates,
            created_at: now,
            last_attempt_at: None,
            next_attempt_at: now,
            completed_at: None,
            completed_wall: None,
            error: None,
        };

        debug!(
            task_id = id,
            operation = %task.operation,
            priority = task.priority,
            "Task enqueued"
        );
        inner.tasks.insert(id, task);
        drop(inner);

        if high_priority {
            self.kick.notify_one();
        }
        id
    }

    /// Claim up to `max` due tasks, priority descending, ties broken by the
    /// earliest previous attempt (creation order if never attempted).
    /// Claimed tasks transition to `Attempting`.
    pub async fn select_next_batch(&self, now: Instant, max: usize) -> Vec<SyncTask> {
        let mut inner = self.inner.lock().await;
        if inner.paused {
            return Vec::new();
        }

        let mut due: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Queued && t.next_attempt_at <= now)
            .map(|t| t.id)
            .collect();

        due.sort_by(|a, b| {
            let ta = &inner.tasks[a];
            let tb = &inner.tasks[b];
            tb.priority
                .cmp(&ta.priority)
                .then_with(|| {
                    let ka = ta.last_attempt_at.unwrap_or(ta.created_at);
                    let kb = tb.last_attempt_at.unwrap_or(tb.created_at);
                    ka.cmp(&kb)
                })
                .then_with(|| ta.id.cmp(&tb.id))
        });
        due.truncate(max);

        let mut batch = Vec::with_capacity(due.len());
        for id in due {
            if let Some(task) = inner.tasks.get_mut(&id) {
                task.state = TaskState::Attempting;
                task.last_attempt_at = Some(now);
                batch.push(task.clone());
            }
        }
        batch
    }

    /// Report an attempt's result and settle or reschedule the task.
    ///
    /// Non-retryable errors fail the task permanently regardless of budget.
    /// Retryable errors back the task off exponentially until the budget is
    /// exhausted.
    pub async fn handle_outcome(
        &self,
        id: TaskId,
        result: Result<(), SyncError>,
        now: Instant,
    ) -> TaskDisposition {
        let mut inner = self.inner.lock().await;
        let Some(task) = inner.tasks.get_mut(&id) else {
            return TaskDisposition::Completed;
        };

        match result {
            Ok(()) => {
                task.state = TaskState::Completed;
                task.completed_at = Some(now);
                task.completed_wall = Some(Utc::now());
                task.error = None;
                debug!(task_id = id, operation = %task.operation, "Task completed");
                TaskDisposition::Completed
            }
            Err(err) => {
                task.error = Some(err.to_string());
                task.retry_count += 1;

                if !err.is_retryable() || task.retry_count >= task.max_retries {
                    task.state = TaskState::FailedPermanently;
                    task.completed_at = Some(now);
                    task.completed_wall = Some(Utc::now());
                    warn!(
                        task_id = id,
                        operation = %task.operation,
                        retry_count = task.retry_count,
                        error = %err,
                        "Task failed permanently"
                    );
                    TaskDisposition::FailedPermanently
                } else {
                    let delay = self.backoff_delay(task.retry_count);
                    task.state = TaskState::Queued;
                    task.next_attempt_at = now + delay;
                    warn!(
                        task_id = id,
                        operation = %task.operation,
                        retry_count = task.retry_count,
                        retry_ms = delay.as_millis() as u64,
                        error = %err,
                        "Task failed, backing off"
                    );
                    TaskDisposition::Retrying { delay }
                }
            }
        }
    }

    /// Backoff for the nth failure (1-based): `min(base * 2^(n-1), max)`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        let delay = self.config.base_delay * (1u32 << exponent);
        delay.min(self.config.max_delay)
    }

    /// Drop settled tasks older than the retention window.
    pub async fn gc_expired(&self, now: Instant) -> usize {
        let retention = self.config.retention;
        let mut inner = self.inner.lock().await;
        let before = inner.tasks.len();
        inner.tasks.retain(|_, task| {
            !matches!(
                task.state,
                TaskState::Completed | TaskState::FailedPermanently
            ) || task
                .completed_at
                .map(|at| now.duration_since(at) < retention)
                .unwrap_or(true)
        });
        let removed = before - inner.tasks.len();
        if removed > 0 {
            debug!(removed, "Garbage-collected settled tasks");
        }
        removed
    }

    /// Stop handing out tasks; already-attempting tasks run to completion.
    pub async fn pause(&self) {
        self.inner.lock().await.paused = true;
        info!("Sync queue paused");
    }

    pub async fn resume(&self) {
        self.inner.lock().await.paused = false;
        info!("Sync queue resumed");
        self.kick.notify_one();
    }

    /// Wait until something requests an out-of-band tick.
    pub async fn kicked(&self) {
        self.kick.notified().await;
    }

    /// Request an out-of-band tick ("sync now").
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    pub async fn task(&self, id: TaskId) -> Option<SyncTask> {
        self.inner.lock().await.tasks.get(&id).cloned()
    }

    pub async fn task_report(&self, id: TaskId) -> Option<TaskReport> {
        self.inner
            .lock()
            .await
            .tasks
            .get(&id)
            .map(TaskReport::from_task)
    }

    /// Permanently failed tasks still inside the retention window.
    pub async fn failed_tasks(&self) -> Vec<TaskReport> {
        self.inner
            .lock()
            .await
            .tasks
            .values()
            .filter(|t| t.state == TaskState::FailedPermanently)
            .map(TaskReport::from_task)
            .collect()
    }

    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let mut stats = QueueStats {
            total: inner.tasks.len(),
            queued: 0,
            due: 0,
            attempting: 0,
            completed: 0,
            failed: 0,
        };
        for task in inner.tasks.values() {
            match task.state {
                TaskState::Queued => {
                    stats.queued += 1;
                    if task.next_attempt_at <= now {
                        stats.due += 1;
                    }
                }
                TaskState::Attempting => stats.attempting += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::FailedPermanently => stats.failed += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn queue() -> SyncQueue {
        SyncQueue::new(SyncConfig {
            max_concurrent_syncs: 4,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            default_max_retries: 3,
            retention: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(50),
            high_priority_threshold: 100,
        })
    }

    #[tokio::test]
    async fn test_backoff_monotonic_and_capped() {
        // P5: 1000, 2000, 4000, ... capped at max_delay.
        let q = queue();
        assert_eq!(q.backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(q.backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(q.backoff_delay(3), Duration::from_millis(4000));
        assert_eq!(q.backoff_delay(4), Duration::from_millis(8000));
        assert_eq!(q.backoff_delay(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_backoff_applied_to_next_attempt() {
        let q = queue();
        let id = q
            .enqueue(TaskSpec::new("createPost", json!({"body": "hi"})))
            .await;
        let now = Instant::now();

        let batch = q.select_next_batch(now, 4).await;
        assert_eq!(batch.len(), 1);

        let disposition = q
            .handle_outcome(id, Err(SyncError::Network("down".into())), now)
            .await;
        assert_eq!(
            disposition,
            TaskDisposition::Retrying {
                delay: Duration::from_millis(1000)
            }
        );

        // Not due again before the delay elapses.
        assert!(q
            .select_next_batch(now + Duration::from_millis(999), 4)
            .await
            .is_empty());
        assert_eq!(
            q.select_next_batch(now + Duration::from_millis(1000), 4)
                .await
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_is_surfaced() {
        // Scenario D: 3 failures with max_retries=3, no fourth attempt.
        let q = queue();
        let id = q
            .enqueue(TaskSpec::new("createPost", json!({})).max_retries(3))
            .await;

        let mut now = Instant::now();
        for attempt in 1..=3u32 {
            now += Duration::from_secs(60);
            let batch = q.select_next_batch(now, 4).await;
            assert_eq!(batch.len(), 1, "attempt {attempt} should be selectable");
            q.handle_outcome(id, Err(SyncError::Network("down".into())), now)
                .await;
        }

        let task = q.task(id).await.unwrap();
        assert_eq!(task.state, TaskState::FailedPermanently);
        assert_eq!(task.retry_count, 3);

        // Never attempted a fourth time, however long we wait.
        assert!(q
            .select_next_batch(now + Duration::from_secs(3600), 4)
            .await
            .is_empty());

        let failed = q.failed_tasks().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, id);
        assert!(failed[0].error.as_ref().unwrap().contains("down"));
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let q = queue();
        let id = q.enqueue(TaskSpec::new("createPost", json!({}))).await;
        let now = Instant::now();
        q.select_next_batch(now, 4).await;

        let disposition = q
            .handle_outcome(id, Err(SyncError::Permission("nope".into())), now)
            .await;
        assert_eq!(disposition, TaskDisposition::FailedPermanently);
    }

    #[tokio::test]
    async fn test_priority_ordering_with_ties() {
        let q = queue();
        let low = q
            .enqueue(TaskSpec::new("a", json!({})).priority(1))
            .await;
        let first_high = q
            .enqueue(TaskSpec::new("b", json!({})).priority(5))
            .await;
        let second_high = q
            .enqueue(TaskSpec::new("c", json!({})).priority(5))
            .await;

        let batch = q
            .select_next_batch(Instant::now() + Duration::from_millis(1), 3)
            .await;
        let ids: Vec<TaskId> = batch.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![first_high, second_high, low]);
    }

    #[tokio::test]
    async fn test_gc_respects_retention() {
        let q = queue();
        let id = q.enqueue(TaskSpec::new("a", json!({}))).await;
        let now = Instant::now();
        q.select_next_batch(now, 1).await;
        q.handle_outcome(id, Ok(()), now).await;

        assert_eq!(q.gc_expired(now + Duration::from_secs(3599)).await, 0);
        assert_eq!(q.gc_expired(now + Duration::from_secs(3601)).await, 1);
        assert!(q.task(id).await.is_none());
    }

    #[tokio::test]
    async fn test_pause_blocks_selection() {
        let q = queue();
        q.enqueue(TaskSpec::new("a", json!({}))).await;
        q.pause().await;
        assert!(q
            .select_next_batch(Instant::now() + Duration::from_secs(1), 4)
            .await
            .is_empty());
        q.resume().await;
        assert_eq!(
            q.select_next_batch(Instant::now() + Duration::from_secs(1), 4)
                .await
                .len(),
            1
        );
    }
}
