//! Human task records and their status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Status of a human task.
///
/// Transitions are enforced by [`HumanTask`]: `pending -> assigned ->
/// in_progress -> (completed | rejected)`, plus `pending -> expired` when
/// the due date passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the role queue, nobody owns it yet
    Pending,
    /// Assigned to a user but not started
    Assigned,
    /// Being worked on
    InProgress,
    /// Finished with outputs
    Completed,
    /// Explicitly declined with a reason
    Rejected,
    /// Due date passed before the task was picked up
    Expired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Expired)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Priority of a human task.
///
/// Derives `Ord` so that `Critical > High > Normal > Low`; the queue sorts
/// pending work by priority descending, then creation time ascending.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Illegal task state transition.
///
/// Rejected by the queue without touching the task or the owning token.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("cannot {action} task {task_id}: status is {status}")]
pub struct TaskTransitionError {
    pub task_id: String,
    pub action: &'static str,
    pub status: TaskStatus,
}

/// Persistent record of a suspended human activity.
///
/// Created by the engine's human strategy when a token reaches a human
/// activity; survives engine instances. `inputs` is a snapshot of the
/// resolved activity inputs at suspension time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanTask {
    /// Unique task identifier
    pub id: String,

    /// Activity node this task was created for
    pub activity_id: String,

    /// Human-readable activity name, denormalized for listings
    pub activity_name: String,

    /// Token suspended on this task
    pub token_id: String,

    /// Workflow the token belongs to
    pub workflow_id: String,

    /// Current status
    pub status: TaskStatus,

    /// Queue priority
    pub priority: TaskPriority,

    /// Role whose queue this task appears in
    pub role_id: String,

    /// User the task is assigned to, once assigned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,

    /// Who created the task (engine run id or user)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    /// Who performed the assignment
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_by: Option<String>,

    /// Snapshot of resolved activity inputs
    pub inputs: Value,

    /// Outputs recorded on completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,

    /// Rejection reason, when rejected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Deadline after which a still-pending task expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,

    /// Optional form schema describing the expected outputs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub form_schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl HumanTask {
    /// Create a pending task with a generated id.
    pub fn new(
        activity_id: impl Into<String>,
        activity_name: impl Into<String>,
        token_id: impl Into<String>,
        workflow_id: impl Into<String>,
        role_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            activity_id: activity_id.into(),
            activity_name: activity_name.into(),
            token_id: token_id.into(),
            workflow_id: workflow_id.into(),
            status: TaskStatus::Pending,
            priority: TaskPriority::Normal,
            role_id: role_id.into(),
            assignee_id: None,
            created_by: None,
            assigned_by: None,
            inputs: Value::Object(Default::default()),
            outputs: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            due_at: None,
            form_schema: None,
            tags: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }

    pub fn with_form_schema(mut self, schema: Value) -> Self {
        self.form_schema = Some(schema);
        self
    }

    pub fn with_created_by(mut self, creator: impl Into<String>) -> Self {
        self.created_by = Some(creator.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    fn transition_error(&self, action: &'static str) -> TaskTransitionError {
        TaskTransitionError {
            task_id: self.id.clone(),
            action,
            status: self.status,
        }
    }

    /// `pending | assigned -> assigned`. Re-assignment of an assigned task
    /// is allowed; it replaces the assignee and stays `assigned`.
    pub fn assign(
        &mut self,
        assignee: impl Into<String>,
        assigner: Option<String>,
    ) -> Result<(), TaskTransitionError> {
        match self.status {
            TaskStatus::Pending | TaskStatus::Assigned => {
                let now = Utc::now();
                self.status = TaskStatus::Assigned;
                self.assignee_id = Some(assignee.into());
                self.assigned_by = assigner;
                self.assigned_at = Some(now);
                self.updated_at = now;
                Ok(())
            }
            _ => Err(self.transition_error("assign")),
        }
    }

    /// `assigned -> in_progress`. Starting is explicit; assignment alone
    /// never moves a task to `in_progress`.
    pub fn start(&mut self) -> Result<(), TaskTransitionError> {
        match self.status {
            TaskStatus::Assigned => {
                let now = Utc::now();
                self.status = TaskStatus::InProgress;
                self.started_at = Some(now);
                self.updated_at = now;
                Ok(())
            }
            _ => Err(self.transition_error("start")),
        }
    }

    /// `in_progress -> completed`. Completing an already completed task is
    /// an idempotent no-op; the first outputs win.
    ///
    /// Returns `true` when the call performed the transition.
    pub fn complete(&mut self, outputs: Value) -> Result<bool, TaskTransitionError> {
        match self.status {
            TaskStatus::InProgress => {
                let now = Utc::now();
                self.status = TaskStatus::Completed;
                self.outputs = Some(outputs);
                self.completed_at = Some(now);
                self.updated_at = now;
                Ok(true)
            }
            TaskStatus::Completed => Ok(false),
            _ => Err(self.transition_error("complete")),
        }
    }

    /// `in_progress -> rejected`.
    pub fn reject(&mut self, reason: impl Into<String>) -> Result<(), TaskTransitionError> {
        match self.status {
            TaskStatus::InProgress => {
                let now = Utc::now();
                self.status = TaskStatus::Rejected;
                self.rejection_reason = Some(reason.into());
                self.completed_at = Some(now);
                self.updated_at = now;
                Ok(())
            }
            _ => Err(self.transition_error("reject")),
        }
    }

    /// `pending -> expired`. Used for overdue tasks and for tasks whose
    /// owning token was cancelled.
    pub fn expire(&mut self) -> Result<(), TaskTransitionError> {
        match self.status {
            TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::InProgress => {
                self.status = TaskStatus::Expired;
                self.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(self.transition_error("expire")),
        }
    }

    /// Whether a pending task is past its deadline.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.due_at.map(|due| due < now).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> HumanTask {
        HumanTask::new("act-1", "Review", "tok-1", "wf-1", "qc")
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut t = task();
        assert_eq!(t.status, TaskStatus::Pending);

        t.assign("alice", Some("bob".into())).unwrap();
        assert_eq!(t.status, TaskStatus::Assigned);
        assert_eq!(t.assignee_id.as_deref(), Some("alice"));
        assert_eq!(t.assigned_by.as_deref(), Some("bob"));

        t.start().unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);
        assert!(t.started_at.is_some());

        assert!(t.complete(json!({"approved": true})).unwrap());
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.outputs, Some(json!({"approved": true})));
    }

    #[test]
    fn test_assign_does_not_start() {
        let mut t = task();
        t.assign("alice", None).unwrap();
        // Completing without an explicit start is illegal
        let err = t.complete(json!({})).unwrap_err();
        assert_eq!(err.action, "complete");
        assert_eq!(err.status, TaskStatus::Assigned);
    }

    #[test]
    fn test_reassignment_stays_assigned() {
        let mut t = task();
        t.assign("alice", None).unwrap();
        t.assign("carol", Some("bob".into())).unwrap();
        assert_eq!(t.status, TaskStatus::Assigned);
        assert_eq!(t.assignee_id.as_deref(), Some("carol"));
    }

    #[test]
    fn test_complete_is_idempotent() {
        let mut t = task();
        t.assign("alice", None).unwrap();
        t.start().unwrap();
        assert!(t.complete(json!({"n": 1})).unwrap());
        // Replay keeps the first outputs and reports no transition
        assert!(!t.complete(json!({"n": 2})).unwrap());
        assert_eq!(t.outputs, Some(json!({"n": 1})));
    }

    #[test]
    fn test_reject_records_reason() {
        let mut t = task();
        t.assign("alice", None).unwrap();
        t.start().unwrap();
        t.reject("incomplete documents").unwrap();
        assert_eq!(t.status, TaskStatus::Rejected);
        assert_eq!(t.rejection_reason.as_deref(), Some("incomplete documents"));
    }

    #[test]
    fn test_terminal_states_are_frozen() {
        let mut t = task();
        t.assign("alice", None).unwrap();
        t.start().unwrap();
        t.reject("no").unwrap();
        assert!(t.assign("dave", None).is_err());
        assert!(t.start().is_err());
        assert!(t.complete(json!({})).is_err());
        assert!(t.expire().is_err());
    }

    #[test]
    fn test_overdue_detection() {
        let mut t = task().with_due_at(Utc::now() - chrono::Duration::minutes(5));
        assert!(t.is_overdue(Utc::now()));
        t.expire().unwrap();
        assert_eq!(t.status, TaskStatus::Expired);
        assert!(!t.is_overdue(Utc::now()));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_status_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        let p: TaskPriority = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(p, TaskPriority::Critical);
    }
}
