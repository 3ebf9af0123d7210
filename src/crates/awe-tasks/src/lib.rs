//! # awe-tasks - Durable human task queue
//!
//! Persistence boundary for human work items in the awe workflow engine.
//! When the engine reaches an activity performed by a person it does not
//! block; it enqueues a [`HumanTask`] and suspends the owning token until
//! the task is completed or rejected through this crate.
//!
//! The crate is split from `awe-core` so storage backends can be swapped
//! without touching the engine:
//!
//! - [`TaskStore`] - the pluggable persistence trait (CRUD + atomic status
//!   transitions + priority-ordered listing by role)
//! - [`InMemoryTaskStore`] - reference implementation backed by a
//!   thread-safe map; used by tests and single-process deployments
//! - [`TaskQueue`] - store wrapper that broadcasts completion signals so a
//!   running engine can wake the suspended token
//!
//! # Task lifecycle
//!
//! ```text
//! pending ──assign──▶ assigned ──start──▶ in_progress ──complete──▶ completed
//!    │                                         │
//!    │ due_at passes                           └────reject────▶ rejected
//!    ▼
//! expired
//! ```
//!
//! Any transition not drawn above is rejected with
//! [`TaskTransitionError`]. Replaying `complete` on an already completed
//! task is a no-op so that delivery retries stay idempotent.
//!
//! # Quick start
//!
//! ```rust
//! use awe_tasks::{HumanTask, TaskPriority, TaskQueue, InMemoryTaskStore};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = TaskQueue::new(Arc::new(InMemoryTaskStore::new()));
//!
//! let task = HumanTask::new("activity-1", "Review claim", "token-1", "wf-1", "qc")
//!     .with_priority(TaskPriority::High);
//! let id = queue.create(task).await?;
//!
//! queue.assign(&id, "alice", None).await?;
//! queue.start(&id).await?;
//! queue.complete(&id, serde_json::json!({"approved": true})).await?;
//! # Ok(())
//! # }
//! ```

pub mod queue;
pub mod store;
pub mod task;

pub use queue::{QueueStats, TaskQueue, TaskSignal, TaskSignalOutcome};
pub use store::{InMemoryTaskStore, TaskFilter, TaskStore, TaskStoreError};
pub use task::{HumanTask, TaskPriority, TaskStatus, TaskTransitionError};
