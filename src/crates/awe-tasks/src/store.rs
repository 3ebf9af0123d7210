//! Pluggable task persistence.
//!
//! [`TaskStore`] is the storage abstraction the engine is written against.
//! Implementations supply CRUD, atomic status transitions, and the
//! priority-ordered role listing; [`InMemoryTaskStore`] is the reference
//! implementation used in tests and single-process deployments. Database
//! backends implement the same trait out of tree.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::task::{HumanTask, TaskStatus, TaskTransitionError};

/// Errors surfaced by task stores.
#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task already exists: {0}")]
    AlreadyExists(String),

    #[error(transparent)]
    Transition(#[from] TaskTransitionError),

    /// Backend-specific failure (connection lost, serialization, ...)
    #[error("task store backend error: {0}")]
    Backend(String),
}

/// Filter for [`TaskStore::list`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub role_id: Option<String>,
    pub assignee_id: Option<String>,
    pub workflow_id: Option<String>,
    pub token_id: Option<String>,
}

impl TaskFilter {
    fn matches(&self, task: &HumanTask) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self
                .role_id
                .as_ref()
                .map_or(true, |r| &task.role_id == r)
            && self
                .assignee_id
                .as_ref()
                .map_or(true, |a| task.assignee_id.as_ref() == Some(a))
            && self
                .workflow_id
                .as_ref()
                .map_or(true, |w| &task.workflow_id == w)
            && self
                .token_id
                .as_ref()
                .map_or(true, |t| &task.token_id == t)
    }
}

/// Storage backend for human tasks.
///
/// All transition methods are atomic with respect to concurrent calls on
/// the same task: either the transition applies fully or the task is left
/// untouched and an error is returned.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task. Fails if the id already exists.
    async fn create(&self, task: HumanTask) -> Result<HumanTask, TaskStoreError>;

    async fn get(&self, id: &str) -> Result<HumanTask, TaskStoreError>;

    async fn list(&self, filter: TaskFilter) -> Result<Vec<HumanTask>, TaskStoreError>;

    async fn assign(
        &self,
        id: &str,
        assignee: &str,
        assigner: Option<String>,
    ) -> Result<HumanTask, TaskStoreError>;

    async fn start(&self, id: &str) -> Result<HumanTask, TaskStoreError>;

    /// Complete a task. Returns the task and whether this call performed
    /// the transition (`false` on an idempotent replay).
    async fn complete(&self, id: &str, outputs: Value)
        -> Result<(HumanTask, bool), TaskStoreError>;

    async fn reject(&self, id: &str, reason: &str) -> Result<HumanTask, TaskStoreError>;

    async fn expire(&self, id: &str) -> Result<HumanTask, TaskStoreError>;

    /// Expire every pending task whose `due_at` is before `now`; returns
    /// the expired tasks.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<HumanTask>, TaskStoreError>;

    /// Pending tasks for a role, priority descending then creation time
    /// ascending.
    async fn pending_by_role(&self, role_id: &str) -> Result<Vec<HumanTask>, TaskStoreError>;

    /// Count tasks per status.
    async fn counts(&self) -> Result<HashMap<TaskStatus, usize>, TaskStoreError>;
}

/// Sort pending work: priority first (critical > low), then age.
pub(crate) fn pending_order(a: &HumanTask, b: &HumanTask) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// In-memory [`TaskStore`] backed by `Arc<RwLock<HashMap>>`.
///
/// Ephemeral: all tasks are lost when the process exits. Intended for
/// tests, demos and single-process runs.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<String, HumanTask>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all tasks. Test isolation helper.
    pub async fn clear(&self) {
        self.tasks.write().await.clear();
    }

    async fn update_with<F, T>(&self, id: &str, f: F) -> Result<(HumanTask, T), TaskStoreError>
    where
        F: FnOnce(&mut HumanTask) -> Result<T, TaskTransitionError>,
    {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| TaskStoreError::NotFound(id.to_string()))?;
        let out = f(task)?;
        Ok((task.clone(), out))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: HumanTask) -> Result<HumanTask, TaskStoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(TaskStoreError::AlreadyExists(task.id));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get(&self, id: &str) -> Result<HumanTask, TaskStoreError> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TaskStoreError::NotFound(id.to_string()))
    }

    async fn list(&self, filter: TaskFilter) -> Result<Vec<HumanTask>, TaskStoreError> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<HumanTask> = tasks.values().filter(|t| filter.matches(t)).cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn assign(
        &self,
        id: &str,
        assignee: &str,
        assigner: Option<String>,
    ) -> Result<HumanTask, TaskStoreError> {
        let (task, ()) = self
            .update_with(id, |t| t.assign(assignee, assigner))
            .await?;
        Ok(task)
    }

    async fn start(&self, id: &str) -> Result<HumanTask, TaskStoreError> {
        let (task, ()) = self.update_with(id, |t| t.start()).await?;
        Ok(task)
    }

    async fn complete(
        &self,
        id: &str,
        outputs: Value,
    ) -> Result<(HumanTask, bool), TaskStoreError> {
        self.update_with(id, |t| t.complete(outputs)).await
    }

    async fn reject(&self, id: &str, reason: &str) -> Result<HumanTask, TaskStoreError> {
        let (task, ()) = self.update_with(id, |t| t.reject(reason)).await?;
        Ok(task)
    }

    async fn expire(&self, id: &str) -> Result<HumanTask, TaskStoreError> {
        let (task, ()) = self.update_with(id, |t| t.expire()).await?;
        Ok(task)
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<HumanTask>, TaskStoreError> {
        let mut tasks = self.tasks.write().await;
        let mut expired = Vec::new();
        for task in tasks.values_mut() {
            if task.is_overdue(now) {
                task.expire()?;
                expired.push(task.clone());
            }
        }
        Ok(expired)
    }

    async fn pending_by_role(&self, role_id: &str) -> Result<Vec<HumanTask>, TaskStoreError> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<HumanTask> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.role_id == role_id)
            .cloned()
            .collect();
        out.sort_by(pending_order);
        Ok(out)
    }

    async fn counts(&self) -> Result<HashMap<TaskStatus, usize>, TaskStoreError> {
        let tasks = self.tasks.read().await;
        let mut counts = HashMap::new();
        for task in tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;
    use serde_json::json;

    fn task(role: &str, priority: TaskPriority) -> HumanTask {
        HumanTask::new("act", "Act", "tok", "wf", role).with_priority(priority)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemoryTaskStore::new();
        let t = store.create(task("qc", TaskPriority::Normal)).await.unwrap();
        let got = store.get(&t.id).await.unwrap();
        assert_eq!(got.id, t.id);
        assert_eq!(got.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_duplicate_fails() {
        let store = InMemoryTaskStore::new();
        let t = store.create(task("qc", TaskPriority::Normal)).await.unwrap();
        let err = store.create(t).await.unwrap_err();
        assert!(matches!(err, TaskStoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_pending_by_role_ordering() {
        let store = InMemoryTaskStore::new();
        // Insert out of priority order; creation times are strictly increasing
        let low = store.create(task("qc", TaskPriority::Low)).await.unwrap();
        let critical = store
            .create(task("qc", TaskPriority::Critical))
            .await
            .unwrap();
        let normal_1 = store.create(task("qc", TaskPriority::Normal)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let normal_2 = store.create(task("qc", TaskPriority::Normal)).await.unwrap();
        let _other_role = store.create(task("ops", TaskPriority::High)).await.unwrap();

        let pending = store.pending_by_role("qc").await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![
            critical.id.as_str(),
            normal_1.id.as_str(),
            normal_2.id.as_str(),
            low.id.as_str(),
        ]);

        // Pairwise: priority descending, then created_at ascending
        for pair in pending.windows(2) {
            assert!(
                pair[0].priority > pair[1].priority
                    || (pair[0].priority == pair[1].priority
                        && pair[0].created_at <= pair[1].created_at)
            );
        }
    }

    #[tokio::test]
    async fn test_assigned_tasks_leave_the_role_queue() {
        let store = InMemoryTaskStore::new();
        let t = store.create(task("qc", TaskPriority::High)).await.unwrap();
        store.assign(&t.id, "alice", None).await.unwrap();
        assert!(store.pending_by_role("qc").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_requires_in_progress() {
        let store = InMemoryTaskStore::new();
        let t = store.create(task("qc", TaskPriority::Normal)).await.unwrap();
        let err = store.complete(&t.id, json!({})).await.unwrap_err();
        assert!(matches!(err, TaskStoreError::Transition(_)));
    }

    #[tokio::test]
    async fn test_complete_idempotent_replay() {
        let store = InMemoryTaskStore::new();
        let t = store.create(task("qc", TaskPriority::Normal)).await.unwrap();
        store.assign(&t.id, "alice", None).await.unwrap();
        store.start(&t.id).await.unwrap();

        let (_, applied) = store.complete(&t.id, json!({"ok": true})).await.unwrap();
        assert!(applied);
        let (replayed, applied) = store.complete(&t.id, json!({"ok": false})).await.unwrap();
        assert!(!applied);
        assert_eq!(replayed.outputs, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_expire_overdue() {
        let store = InMemoryTaskStore::new();
        let overdue = task("qc", TaskPriority::Normal)
            .with_due_at(Utc::now() - chrono::Duration::hours(1));
        let fresh = task("qc", TaskPriority::Normal);
        let overdue = store.create(overdue).await.unwrap();
        let fresh = store.create(fresh).await.unwrap();

        let expired = store.expire_overdue(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, overdue.id);
        assert_eq!(store.get(&fresh.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let store = InMemoryTaskStore::new();
        let a = store.create(task("qc", TaskPriority::Normal)).await.unwrap();
        let _b = store.create(task("ops", TaskPriority::Normal)).await.unwrap();
        store.assign(&a.id, "alice", None).await.unwrap();

        let by_assignee = store
            .list(TaskFilter {
                assignee_id: Some("alice".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_assignee.len(), 1);
        assert_eq!(by_assignee[0].id, a.id);

        let by_status = store
            .list(TaskFilter {
                status: Some(TaskStatus::Pending),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_status.len(), 1);
    }

    #[tokio::test]
    async fn test_counts() {
        let store = InMemoryTaskStore::new();
        let a = store.create(task("qc", TaskPriority::Normal)).await.unwrap();
        let _b = store.create(task("qc", TaskPriority::Normal)).await.unwrap();
        store.assign(&a.id, "alice", None).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.get(&TaskStatus::Pending), Some(&1));
        assert_eq!(counts.get(&TaskStatus::Assigned), Some(&1));
    }
}
