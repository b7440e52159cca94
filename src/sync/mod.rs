//! Background synchronization: the pending-operation queue and the
//! scheduler loop that drains it with priority ordering, exponential
//! backoff, and a retention window for settled tasks.

pub mod queue;
pub mod scheduler;

pub use queue::{QueueStats, SyncQueue, SyncTask, TaskId, TaskReport, TaskSpec, TaskState};
pub use scheduler::SyncScheduler;
