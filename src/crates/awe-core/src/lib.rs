//! # awe-core - Agentic workflow execution engine
//!
//! A token-propagating interpreter over typed workflow graphs whose nodes
//! are heterogeneous work units: activities performed by humans, AI
//! agents, robots or applications; decision nodes encoding DMN-style rule
//! tables; and lifecycle events. Nodes are connected by conditional edges
//! and collaborate through named shared contexts.
//!
//! ## Execution model
//!
//! A **run** starts with one token at each start event (or at the graph's
//! source nodes). The engine repeatedly picks an active token, resolves
//! its current node, dispatches to the strategy for the node's actor
//! kind, merges the strategy's outputs into token data and write-bound
//! contexts, and selects outbound edges:
//!
//! - exactly one edge: follow it
//! - several true conditions: **fork** the token into siblings
//! - a node with two or more inbound edges: **join** siblings back into
//!   their parent
//! - a human activity: **suspend** the token on a queued task until it
//!   completes or is rejected
//!
//! The run terminates when no token is active or waiting.
//!
//! ```text
//!                ┌──────────────────────────────────────┐
//!                │               Engine                 │
//!                │  start() · step() · cancel()         │
//!                └───────┬──────────────────┬───────────┘
//!                        │                  │
//!                        ▼                  ▼
//!            ┌───────────────────┐   ┌───────────────────┐
//!            │  Actor strategies │   │ Decision evaluator │
//!            │  app · ai · robot │   │  six hit policies  │
//!            │  · human (queue)  │   └─────────┬─────────┘
//!            └─────────┬─────────┘             │
//!                      ▼                       ▼
//!            ┌───────────────────────────────────────────┐
//!            │   Context store (per-context RW locks)    │
//!            │ shared_state · message_passing ·          │
//!            │ blackboard · event_sourcing               │
//!            └───────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use awe_core::{document, engine::{Engine, EngineOptions}};
//! use awe_tasks::InMemoryTaskStore;
//! use std::sync::Arc;
//!
//! let workflow = Arc::new(document::load_path("claims.json")?);
//! let options = EngineOptions::new(Arc::new(InMemoryTaskStore::new()));
//! let mut engine = Engine::new(workflow, options)?;
//!
//! engine.start(serde_json::json!({"claim_id": "c-42"}))?;
//! let status = engine.run_to_quiescence().await?;
//! ```
//!
//! ## Modules
//!
//! - [`graph`] - typed workflow model (activities, edges, contexts, rules)
//! - [`document`] - strict JSON/YAML loading with reference validation
//! - [`expr`] - the fixed condition expression language
//! - [`decision`] - decision tables and hit policies
//! - [`context`] - shared context store and sync patterns
//! - [`token`] - execution cursors with append-only history
//! - [`strategy`] - one strategy per actor kind
//! - [`llm`] - the [`ChatModel`](llm::ChatModel) provider contract
//! - [`retry`] - exponential backoff policy
//! - [`engine`] - run lifecycle and token scheduler
//! - [`error`] - the error taxonomy

pub mod context;
pub mod decision;
pub mod document;
pub mod engine;
pub mod error;
pub mod expr;
pub mod graph;
pub mod llm;
pub mod retry;
pub mod strategy;
pub mod token;

pub use context::{ContextEvent, ContextStore};
pub use decision::{DecisionError, DecisionOutcome};
pub use engine::{Engine, EngineOptions, RunStatus};
pub use error::{Result, WorkflowError};
pub use expr::{Expr, Scope};
pub use graph::{
    AccessMode, Activity, ActorType, ContextDecl, DecisionNode, DecisionTable, Edge, Event,
    EventKind, HitPolicy, NodeRef, SyncPattern, Workflow, WorkflowDocument,
};
pub use llm::{ChatModel, ChatRequest, ChatResponse, UsageMetadata};
pub use retry::RetryPolicy;
pub use strategy::{ContextView, StrategyMetrics, StrategyOutcome, StrategyStatus};
pub use token::{HistoryAction, HistoryEntry, Suspension, Token, TokenStatus};
