//! Error types for workflow loading and execution
//!
//! This module defines all errors the engine can surface. All errors
//! implement `std::error::Error` via the `thiserror` crate.
//!
//! # Error Hierarchy
//!
//! ```text
//! WorkflowError
//! ├── Validation      - Malformed workflow document (load boundary)
//! ├── Reference       - Dangling node/context/edge id (load boundary)
//! ├── Decision        - Hit-policy violation or malformed expression
//! ├── NoValidEdge     - No outbound edge selectable after routing
//! ├── Strategy        - Actor strategy failure (retryable)
//! ├── Timeout         - Activity SLA exceeded (treated as Strategy)
//! ├── ContextSchema   - Context write violates declared schema
//! ├── TaskTransition  - Illegal human task transition
//! ├── TaskStore       - Task persistence failure
//! ├── Cancelled       - Run cancelled (terminal, not failed)
//! ├── Serialization   - JSON errors
//! ├── Yaml            - YAML document errors
//! └── Io              - File I/O
//! ```
//!
//! Token-level failures (`Decision`, `NoValidEdge`, exhausted `Strategy`)
//! fail the enclosing token; the engine then either reroutes via a
//! compensation edge or fails the run. Load-boundary errors
//! (`Validation`, `Reference`) never reach the engine.

use thiserror::Error;

use crate::decision::DecisionError;

/// Convenience result type using [`WorkflowError`]
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// All errors surfaced by workflow loading and execution.
#[derive(Error, Debug)]
pub enum WorkflowError {
    /// Workflow document is malformed. Returned to the caller at the load
    /// boundary; never reaches a running engine.
    #[error("workflow validation failed: {0}")]
    Validation(String),

    /// A node, context or edge id does not resolve. Aborts the load.
    #[error("dangling {kind} reference: '{id}'")]
    Reference {
        /// What kind of entity the id was expected to name
        kind: &'static str,
        /// The unresolved id
        id: String,
    },

    /// Decision table evaluation failed; fails the enclosing token.
    #[error("decision node '{node}' failed: {source}")]
    Decision {
        node: String,
        #[source]
        source: DecisionError,
    },

    /// Routing found no selectable outbound edge; fails the enclosing
    /// token.
    #[error("no valid outbound edge from node '{node}'")]
    NoValidEdge { node: String },

    /// An actor strategy signalled failure. Retried per policy; after
    /// exhaustion the enclosing token fails.
    #[error("activity '{activity}' failed: {reason}")]
    Strategy { activity: String, reason: String },

    /// Activity exceeded its SLA deadline. Treated as a retryable
    /// strategy failure.
    #[error("activity '{activity}' timed out after {elapsed_ms}ms")]
    Timeout { activity: String, elapsed_ms: u64 },

    /// A context write violated the declared schema. The write is
    /// discarded; the caller surfaces it as a strategy failure.
    #[error("context '{context}' rejected write: {reason}")]
    ContextSchema { context: String, reason: String },

    /// Illegal human task transition, rejected by the queue. Does not
    /// affect the token.
    #[error(transparent)]
    TaskTransition(#[from] awe_tasks::TaskTransitionError),

    /// Task store backend failure.
    #[error("task store error: {0}")]
    TaskStore(#[from] awe_tasks::TaskStoreError),

    /// Run was cancelled. Terminal, not failed.
    #[error("run cancelled")]
    Cancelled,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkflowError {
    /// Dangling reference helper.
    pub fn reference(kind: &'static str, id: impl Into<String>) -> Self {
        Self::Reference {
            kind,
            id: id.into(),
        }
    }

    /// Strategy failure helper.
    pub fn strategy(activity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Strategy {
            activity: activity.into(),
            reason: reason.into(),
        }
    }

    /// Whether the engine may retry the operation that produced this
    /// error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Strategy { .. } | Self::Timeout { .. } | Self::ContextSchema { .. }
        )
    }
}
