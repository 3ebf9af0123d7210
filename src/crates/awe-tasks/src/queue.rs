//! Task queue with engine wakeup signals.
//!
//! [`TaskQueue`] wraps a [`TaskStore`] and broadcasts a [`TaskSignal`]
//! whenever a task reaches `completed` or `rejected`, so an engine holding
//! a suspended token can wake it. A broadcast channel is used because
//! several engines (parent and sub-workflow runs) may share one queue;
//! each subscriber filters signals by the token ids it owns.
//!
//! The queue is an injected collaborator with explicit construction, never
//! process-wide ambient state; tests build one around an
//! [`InMemoryTaskStore`](crate::InMemoryTaskStore).

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::store::{TaskFilter, TaskStore, TaskStoreError};
use crate::task::{HumanTask, TaskStatus};

/// Why a suspended token is being woken.
#[derive(Debug, Clone)]
pub enum TaskSignalOutcome {
    /// Task completed; the token absorbs these outputs.
    Completed(Value),
    /// Task rejected; the token absorbs `{rejection_reason}`.
    Rejected(String),
    /// Task expired (deadline passed or owning run cancelled).
    Expired,
}

/// Wakeup notification for the engine owning `token_id`.
#[derive(Debug, Clone)]
pub struct TaskSignal {
    pub task_id: String,
    pub token_id: String,
    pub workflow_id: String,
    pub outcome: TaskSignalOutcome,
}

/// Aggregate queue counters for the stats surface.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub rejected: usize,
    pub expired: usize,
}

impl QueueStats {
    fn from_counts(counts: HashMap<TaskStatus, usize>) -> Self {
        let get = |s| counts.get(&s).copied().unwrap_or(0);
        Self {
            pending: get(TaskStatus::Pending),
            assigned: get(TaskStatus::Assigned),
            in_progress: get(TaskStatus::InProgress),
            completed: get(TaskStatus::Completed),
            rejected: get(TaskStatus::Rejected),
            expired: get(TaskStatus::Expired),
        }
    }
}

/// Store wrapper that signals task resolution to subscribed engines.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    signals: broadcast::Sender<TaskSignal>,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        let (signals, _) = broadcast::channel(256);
        Self { store, signals }
    }

    /// The underlying store, for read-only surfaces (CLI, REST).
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Subscribe to task resolution signals. Subscribers filter by the
    /// token ids they own.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskSignal> {
        self.signals.subscribe()
    }

    pub async fn create(&self, task: HumanTask) -> Result<String, TaskStoreError> {
        let task = self.store.create(task).await?;
        debug!(task_id = %task.id, role = %task.role_id, priority = %task.priority, "task enqueued");
        Ok(task.id)
    }

    pub async fn get(&self, id: &str) -> Result<HumanTask, TaskStoreError> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<HumanTask>, TaskStoreError> {
        self.store.list(filter).await
    }

    pub async fn assign(
        &self,
        id: &str,
        assignee: &str,
        assigner: Option<String>,
    ) -> Result<HumanTask, TaskStoreError> {
        self.store.assign(id, assignee, assigner).await
    }

    pub async fn start(&self, id: &str) -> Result<HumanTask, TaskStoreError> {
        self.store.start(id).await
    }

    /// Complete a task and wake the owning token. Replaying a completion
    /// is a no-op: the stored outputs are kept and no signal is re-sent.
    pub async fn complete(&self, id: &str, outputs: Value) -> Result<HumanTask, TaskStoreError> {
        let (task, applied) = self.store.complete(id, outputs).await?;
        if applied {
            self.send(&task, TaskSignalOutcome::Completed(
                task.outputs.clone().unwrap_or(Value::Null),
            ));
        }
        Ok(task)
    }

    /// Reject a task with a reason and wake the owning token.
    pub async fn reject(&self, id: &str, reason: &str) -> Result<HumanTask, TaskStoreError> {
        let task = self.store.reject(id, reason).await?;
        self.send(&task, TaskSignalOutcome::Rejected(reason.to_string()));
        Ok(task)
    }

    /// Expire a single task (cancelled token). No wakeup: the owner is
    /// already gone.
    pub async fn expire(&self, id: &str) -> Result<HumanTask, TaskStoreError> {
        self.store.expire(id).await
    }

    /// Expire overdue pending tasks and signal their owners.
    pub async fn expire_overdue(&self) -> Result<Vec<HumanTask>, TaskStoreError> {
        let expired = self.store.expire_overdue(Utc::now()).await?;
        for task in &expired {
            self.send(task, TaskSignalOutcome::Expired);
        }
        Ok(expired)
    }

    pub async fn pending_by_role(&self, role_id: &str) -> Result<Vec<HumanTask>, TaskStoreError> {
        self.store.pending_by_role(role_id).await
    }

    pub async fn stats(&self) -> Result<QueueStats, TaskStoreError> {
        Ok(QueueStats::from_counts(self.store.counts().await?))
    }

    fn send(&self, task: &HumanTask, outcome: TaskSignalOutcome) {
        // Send fails only when no engine is subscribed; the task record
        // still holds the outcome for later pickup.
        let _ = self.signals.send(TaskSignal {
            task_id: task.id.clone(),
            token_id: task.token_id.clone(),
            workflow_id: task.workflow_id.clone(),
            outcome,
        });
    }
}
