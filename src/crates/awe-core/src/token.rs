//! Execution tokens
//!
//! A token is the engine's cursor through the workflow graph. It carries
//! the run-local data map, an append-only history of everything that
//! happened to it, and its fork lineage. Tokens are owned by the run;
//! the engine is the only writer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle state of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Active,
    /// Suspended on exactly one outstanding handle (human task,
    /// sub-workflow run, or fork)
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl TokenStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// What a waiting token is suspended on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suspension {
    /// Outstanding human task id
    HumanTask(String),
    /// Nested run id
    SubWorkflow(Uuid),
    /// Child tokens spawned by a parallel fork
    Fork { children: Vec<Uuid> },
}

/// Recorded history actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Created,
    Entered,
    Exited,
    Dispatched,
    Suspended,
    Resumed,
    Forked,
    Joined,
    RetryScheduled,
    StatusChanged,
}

/// One append-only history record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<Uuid>,
    pub action: HistoryAction,
    pub timestamp: DateTime<Utc>,
    /// Free-form measurements (durations, model usage, retry counts)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analytics: Option<Value>,
}

/// The runtime cursor moving through a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub current_node_id: Uuid,
    pub status: TokenStatus,
    /// Run-local name/value data, seeded from the run inputs
    pub data: Map<String, Value>,
    pub history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_token_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspension: Option<Suspension>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when the token terminated at an end event (as opposed to being
    /// absorbed by a join or failing)
    #[serde(default)]
    pub reached_end: bool,
}

impl Token {
    /// Create an active token at `node`, recording `created`.
    pub fn new(workflow_id: Uuid, node: Uuid, data: Map<String, Value>) -> Self {
        let mut token = Self {
            id: Uuid::new_v4(),
            workflow_id,
            current_node_id: node,
            status: TokenStatus::Active,
            data,
            history: Vec::new(),
            parent_token_id: None,
            suspension: None,
            created_at: Utc::now(),
            finished_at: None,
            reached_end: false,
        };
        token.record(HistoryAction::Created, Some(node), None);
        token
    }

    /// Append a history entry. Timestamps are forced strictly monotonic
    /// per token even when the clock does not advance between calls.
    pub fn record(&mut self, action: HistoryAction, node_id: Option<Uuid>, analytics: Option<Value>) {
        let mut timestamp = Utc::now();
        if let Some(last) = self.history.last() {
            if timestamp <= last.timestamp {
                timestamp = last.timestamp + Duration::nanoseconds(1);
            }
        }
        self.history.push(HistoryEntry {
            node_id,
            action,
            timestamp,
            analytics,
        });
    }

    /// Advance to the next node: records `exited` then `entered` and
    /// resets the status to active.
    pub fn move_to(&mut self, next: Uuid) {
        self.record(HistoryAction::Exited, Some(self.current_node_id), None);
        self.current_node_id = next;
        self.status = TokenStatus::Active;
        self.record(HistoryAction::Entered, Some(next), None);
    }

    /// Change status, recording the transition.
    pub fn update_status(&mut self, status: TokenStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        if status.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.record(
            HistoryAction::StatusChanged,
            Some(self.current_node_id),
            Some(Value::String(format!("{status:?}").to_lowercase())),
        );
    }

    /// Shallow-merge a partial map into token data.
    pub fn merge_data(&mut self, partial: &Map<String, Value>) {
        for (k, v) in partial {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Suspend on a single outstanding handle. A waiting token does not
    /// advance until [`resume`](Self::resume) clears the handle.
    pub fn suspend(&mut self, suspension: Suspension) {
        debug_assert!(self.suspension.is_none(), "token already suspended");
        self.suspension = Some(suspension);
        self.status = TokenStatus::Waiting;
        self.record(HistoryAction::Suspended, Some(self.current_node_id), None);
    }

    /// Wake a waiting token, absorbing `outputs` into its data.
    pub fn resume(&mut self, outputs: Option<&Map<String, Value>>) {
        self.suspension = None;
        self.status = TokenStatus::Active;
        if let Some(outputs) = outputs {
            self.merge_data(outputs);
        }
        self.record(HistoryAction::Resumed, Some(self.current_node_id), None);
    }

    /// Fork into one child per target node. Children share a snapshot of
    /// the parent data and point back via `parent_token_id`; the parent
    /// suspends until every child reaches a join node or terminates.
    pub fn fork(&mut self, targets: &[Uuid]) -> Vec<Token> {
        let children: Vec<Token> = targets
            .iter()
            .map(|&target| {
                let mut child = Token::new(self.workflow_id, target, self.data.clone());
                child.parent_token_id = Some(self.id);
                child
            })
            .collect();
        let child_ids = children.iter().map(|c| c.id).collect();
        self.record(HistoryAction::Forked, Some(self.current_node_id), None);
        self.suspend(Suspension::Fork {
            children: child_ids,
        });
        children
    }
}
