//! Workflow execution engine
//!
//! The engine interprets a [`Workflow`] by propagating tokens: pick an
//! active token, resolve its current node, dispatch to the strategy for
//! the node's actor kind, merge the outputs into token data and
//! write-bound contexts, then select outbound edges. Multiple true edges
//! fork the token; a node with two or more inbound edges joins sibling
//! tokens back into their parent; human activities suspend the token on a
//! queued task until the task completes or is rejected.
//!
//! # Run lifecycle
//!
//! ```text
//! start(inputs) ──▶ running ──┬──▶ completed   (a token reached an end event)
//!                             ├──▶ failed      (token failure, no compensation)
//!                             ├──▶ waiting     (every live token is suspended)
//!                             └──▶ cancelled
//! ```
//!
//! [`Engine::step`] performs one unit of work; [`Engine::run_to_quiescence`]
//! loops until the run is terminal or every token waits. Cancellation is
//! cooperative: the flag is observed at step boundaries and before each
//! strategy call. Independent strategy calls — active tokens whose
//! write-bound context sets do not intersect — are dispatched
//! concurrently inside one step batch.

use futures::future::join_all;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use awe_tasks::{TaskQueue, TaskSignal, TaskSignalOutcome, TaskStore};

use crate::context::ContextStore;
use crate::decision;
use crate::error::{Result, WorkflowError};
use crate::expr::Expr;
use crate::graph::{Activity, Edge, EventKind, NodeRef, Workflow};
use crate::llm::ChatModel;
use crate::retry::RetryPolicy;
use crate::strategy::{ContextView, Strategies, StrategyStatus};
use crate::token::{HistoryAction, Suspension, Token, TokenStatus};

/// Terminal and intermediate run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Waiting,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Waiting => "waiting",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Construction options for an [`Engine`].
pub struct EngineOptions {
    /// Model credential; recorded for diagnostics. Absence of a `model`
    /// puts the AI strategy in simulation mode regardless.
    pub credential: Option<String>,
    /// Chat model used by the AI-agent strategy
    pub model: Option<Box<dyn ChatModel>>,
    /// Robot controller endpoint; absent means simulation
    pub robot_endpoint: Option<String>,
    /// Default retry policy; activities override per-node
    pub retry: RetryPolicy,
    /// Pluggable task persistence
    pub task_store: Arc<dyn TaskStore>,
}

impl EngineOptions {
    pub fn new(task_store: Arc<dyn TaskStore>) -> Self {
        Self {
            credential: None,
            model: None,
            robot_endpoint: None,
            retry: RetryPolicy::default(),
            task_store,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_model(mut self, model: Box<dyn ChatModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_robot_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.robot_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

struct ForkState {
    outstanding: HashSet<Uuid>,
    join_node: Option<Uuid>,
    arrivals: Vec<Arrival>,
}

struct Arrival {
    token_id: Uuid,
    data: Map<String, Value>,
    arrived_at: chrono::DateTime<chrono::Utc>,
}

struct SubRun {
    engine: Engine,
    parent_token: Uuid,
}

/// Token-propagating interpreter over one workflow.
pub struct Engine {
    workflow: Arc<Workflow>,
    library: HashMap<Uuid, Arc<Workflow>>,
    contexts: ContextStore,
    strategies: Strategies,
    queue: TaskQueue,
    signals: broadcast::Receiver<TaskSignal>,
    model: Option<Box<dyn ChatModel>>,
    robot_endpoint: Option<String>,
    retry: RetryPolicy,
    run_id: Option<Uuid>,
    tokens: HashMap<Uuid, Token>,
    token_order: Vec<Uuid>,
    forks: HashMap<Uuid, ForkState>,
    subruns: HashMap<Uuid, SubRun>,
    /// Failure count per token at its current node; cleared on success
    attempts: HashMap<Uuid, usize>,
    cancelled: bool,
    run_failed: bool,
}

impl Engine {
    /// Build an engine for one workflow. Contexts are initialized (and
    /// their schemas compiled) here, so schema errors surface before any
    /// token moves.
    pub fn new(workflow: Arc<Workflow>, options: EngineOptions) -> Result<Self> {
        let queue = TaskQueue::new(options.task_store);
        Self::with_queue(workflow, queue, options.model, options.robot_endpoint, options.retry)
    }

    /// Build an engine that shares an existing queue (and its wakeup
    /// channel) with other engines and surfaces. `options.task_store` is
    /// ignored; the queue's store is authoritative.
    pub fn with_shared_queue(
        workflow: Arc<Workflow>,
        queue: TaskQueue,
        options: EngineOptions,
    ) -> Result<Self> {
        Self::with_queue(workflow, queue, options.model, options.robot_endpoint, options.retry)
    }

    fn with_queue(
        workflow: Arc<Workflow>,
        queue: TaskQueue,
        model: Option<Box<dyn ChatModel>>,
        robot_endpoint: Option<String>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let contexts = ContextStore::new(workflow.id(), workflow.contexts())?;
        let strategies = Strategies::new(model.clone(), robot_endpoint.clone(), queue.clone());
        let signals = queue.subscribe();
        Ok(Self {
            workflow,
            library: HashMap::new(),
            contexts,
            strategies,
            queue,
            signals,
            model,
            robot_endpoint,
            retry,
            run_id: None,
            tokens: HashMap::new(),
            token_order: Vec::new(),
            forks: HashMap::new(),
            subruns: HashMap::new(),
            attempts: HashMap::new(),
            cancelled: false,
            run_failed: false,
        })
    }

    /// Register a workflow definition that activities may expand into via
    /// `expands_to`.
    pub fn register_workflow(&mut self, workflow: Arc<Workflow>) {
        self.library.insert(workflow.id(), workflow);
    }

    /// The task queue this engine listens on. External surfaces complete
    /// and reject tasks through this handle so the engine gets woken.
    pub fn queue(&self) -> TaskQueue {
        self.queue.clone()
    }

    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn run_id(&self) -> Option<Uuid> {
        self.run_id
    }

    /// Start a run: one token per start node, seeded with `inputs`.
    pub fn start(&mut self, inputs: Value) -> Result<Uuid> {
        if self.run_id.is_some() {
            return Err(WorkflowError::Validation("run already started".into()));
        }
        let data = match inputs {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".into(), other);
                map
            }
        };
        let run_id = Uuid::new_v4();
        for &node in self.workflow.start_nodes() {
            let token = Token::new(self.workflow.id(), node, data.clone());
            self.token_order.push(token.id);
            self.tokens.insert(token.id, token);
        }
        info!(run_id = %run_id, workflow = %self.workflow.name(), tokens = self.token_order.len(), "run started");
        self.run_id = Some(run_id);
        Ok(run_id)
    }

    /// Snapshot of every token ever created for this run.
    pub fn tokens(&self) -> Vec<Token> {
        self.token_order
            .iter()
            .filter_map(|id| self.tokens.get(id))
            .cloned()
            .collect()
    }

    /// Current run status, derived from token states.
    pub fn status(&self) -> RunStatus {
        if self.run_id.is_none() {
            return RunStatus::Running;
        }
        let mut any_active = false;
        let mut any_waiting = false;
        let mut any_end = false;
        let mut any_failed = false;
        for token in self.tokens.values() {
            match token.status {
                TokenStatus::Active => any_active = true,
                TokenStatus::Waiting => any_waiting = true,
                TokenStatus::Failed => any_failed = true,
                TokenStatus::Completed => any_end |= token.reached_end,
                TokenStatus::Cancelled => {}
            }
        }
        if any_active {
            return RunStatus::Running;
        }
        if any_waiting {
            return RunStatus::Waiting;
        }
        if self.run_failed || any_failed {
            return RunStatus::Failed;
        }
        if self.cancelled {
            return RunStatus::Cancelled;
        }
        if any_end {
            return RunStatus::Completed;
        }
        // Every token was absorbed or completed without an end event.
        RunStatus::Completed
    }

    /// Cooperative cancellation: active tokens become `cancelled`,
    /// waiting tokens cancel their outstanding suspensions (human tasks
    /// expire, sub-runs cancel).
    pub fn cancel(
        &mut self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
        self.cancelled = true;
        let ids: Vec<Uuid> = self.token_order.clone();
        for id in ids {
            let Some(token) = self.tokens.get(&id) else { continue };
            if token.status.is_terminal() {
                continue;
            }
            if let Some(suspension) = token.suspension.clone() {
                match suspension {
                    Suspension::HumanTask(task_id) => {
                        if let Err(e) = self.queue.expire(&task_id).await {
                            warn!(task_id = %task_id, error = %e, "failed to expire task of cancelled token");
                        }
                    }
                    Suspension::SubWorkflow(run_id) => {
                        if let Some(subrun) = self.subruns.get_mut(&run_id) {
                            subrun.engine.cancel().await?;
                        }
                    }
                    Suspension::Fork { .. } => {}
                }
            }
            if let Some(token) = self.tokens.get_mut(&id) {
                token.update_status(TokenStatus::Cancelled);
            }
        }
        info!(run_id = ?self.run_id, "run cancelled");
        Ok(())
        })
    }

    /// Process one unit of work. Returns whether any progress was made.
    pub async fn step(&mut self) -> Result<bool> {
        if self.run_id.is_none() {
            return Err(WorkflowError::Validation("run not started".into()));
        }
        let mut progressed = self.drain_signals().await?;
        progressed |= self.pump_subruns().await?;
        if self.cancelled {
            return Ok(progressed);
        }
        let _ = self.queue.expire_overdue().await?;

        let Some(token_id) = self.next_active() else {
            return Ok(progressed);
        };
        self.advance(token_id).await?;
        Ok(true)
    }

    /// Loop steps until the run is terminal or every token waits.
    /// Independent strategy calls inside one iteration run concurrently.
    pub async fn run_to_quiescence(&mut self) -> Result<RunStatus> {
        loop {
            let mut progressed = self.drain_signals().await?;
            progressed |= self.pump_subruns().await?;
            if !self.cancelled {
                progressed |= self.step_batch().await?;
                if !progressed {
                    progressed = self.step().await?;
                }
            }
            let status = self.status();
            match status {
                RunStatus::Running if progressed => continue,
                RunStatus::Running => return Ok(RunStatus::Waiting),
                other => return Ok(other),
            }
        }
    }

    /// Block until a task signal for this run arrives, then absorb it.
    /// Used by long-running hosts between quiescent phases.
    pub async fn wait_for_signal(&mut self) -> Result<bool> {
        match self.signals.recv().await {
            Ok(signal) => self.apply_signal(signal).await,
            Err(broadcast::error::RecvError::Lagged(_)) => Ok(false),
            Err(broadcast::error::RecvError::Closed) => Ok(false),
        }
    }

    fn next_active(&self) -> Option<Uuid> {
        self.token_order
            .iter()
            .find(|id| {
                self.tokens
                    .get(id)
                    .map(|t| t.status == TokenStatus::Active)
                    .unwrap_or(false)
            })
            .copied()
    }

    // -----------------------------------------------------------------
    // Task signal handling
    // -----------------------------------------------------------------

    async fn drain_signals(&mut self) -> Result<bool> {
        let mut progressed = false;
        loop {
            match self.signals.try_recv() {
                Ok(signal) => progressed |= self.apply_signal(signal).await?,
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(missed = n, "task signal receiver lagged");
                }
                Err(broadcast::error::TryRecvError::Closed) => break,
            }
        }
        Ok(progressed)
    }

    async fn apply_signal(&mut self, signal: TaskSignal) -> Result<bool> {
        let Ok(token_id) = Uuid::parse_str(&signal.token_id) else {
            return Ok(false);
        };
        let Some(token) = self.tokens.get(&token_id) else {
            return Ok(false);
        };
        match &token.suspension {
            Some(Suspension::HumanTask(task_id)) if *task_id == signal.task_id => {}
            _ => return Ok(false),
        }

        let outputs = match signal.outcome {
            TaskSignalOutcome::Completed(Value::Object(map)) => map,
            TaskSignalOutcome::Completed(other) => {
                let mut map = Map::new();
                if !other.is_null() {
                    map.insert("result".into(), other);
                }
                map
            }
            TaskSignalOutcome::Rejected(reason) => {
                let mut map = Map::new();
                map.insert("rejection_reason".into(), Value::String(reason));
                map
            }
            TaskSignalOutcome::Expired => {
                let mut map = Map::new();
                map.insert("rejection_reason".into(), Value::String("task expired".into()));
                map
            }
        };

        debug!(token_id = %token_id, task_id = %signal.task_id, "waking token");
        let (node, bindings) = {
            let token = self.tokens.get_mut(&token_id).expect("token just looked up");
            token.resume(Some(&outputs));
            let node = token.current_node_id;
            let bindings = match self.workflow.node(&node) {
                Some(NodeRef::Activity(a)) => a.context_bindings.clone(),
                _ => Vec::new(),
            };
            (node, bindings)
        };
        // Human outputs propagate to write-bound contexts like any other
        // strategy outputs.
        if let Err(e) = self.contexts.apply_outputs(&bindings, &outputs).await {
            warn!(error = %e, "context write from human task outputs rejected");
        }
        self.route(token_id, node).await?;
        Ok(true)
    }

    // -----------------------------------------------------------------
    // Sub-workflow pumping
    // -----------------------------------------------------------------

    async fn pump_subruns(&mut self) -> Result<bool> {
        let run_ids: Vec<Uuid> = self.subruns.keys().copied().collect();
        let mut progressed = false;
        for run_id in run_ids {
            let Some(subrun) = self.subruns.get_mut(&run_id) else { continue };
            let status = {
                // Boxed to break the async recursion cycle.
                let fut: std::pin::Pin<
                    Box<dyn std::future::Future<Output = Result<RunStatus>> + Send + '_>,
                > = Box::pin(subrun.engine.run_to_quiescence());
                fut.await?
            };
            match status {
                RunStatus::Waiting | RunStatus::Running => {}
                terminal => {
                    let subrun = self.subruns.remove(&run_id).expect("subrun present");
                    let parent_token = subrun.parent_token;
                    progressed = true;
                    self.finish_subrun(parent_token, terminal, subrun.engine)
                        .await?;
                }
            }
        }
        Ok(progressed)
    }

    async fn finish_subrun(
        &mut self,
        parent_token: Uuid,
        status: RunStatus,
        child: Engine,
    ) -> Result<()> {
        match status {
            RunStatus::Completed => {
                // Child run behaves like a single-sibling fork: merge the
                // terminal data of end-event tokens (or of all completed
                // tokens when the child graph has no end events), last
                // writer wins.
                let mut merged = Map::new();
                let all = child.tokens();
                let mut finished: Vec<Token> = if all.iter().any(|t| t.reached_end) {
                    all.into_iter().filter(|t| t.reached_end).collect()
                } else {
                    all.into_iter()
                        .filter(|t| t.status == TokenStatus::Completed)
                        .collect()
                };
                finished.sort_by(|a, b| {
                    a.finished_at
                        .cmp(&b.finished_at)
                        .then(a.id.cmp(&b.id))
                });
                for token in finished {
                    for (k, v) in token.data {
                        merged.insert(k, v);
                    }
                }
                let node = {
                    let token = self
                        .tokens
                        .get_mut(&parent_token)
                        .expect("parent of subrun");
                    token.resume(Some(&merged));
                    token.current_node_id
                };
                self.route(parent_token, node).await?;
            }
            RunStatus::Failed => {
                let activity = self
                    .tokens
                    .get(&parent_token)
                    .map(|t| t.current_node_id)
                    .unwrap_or_default();
                if let Some(token) = self.tokens.get_mut(&parent_token) {
                    token.resume(None);
                }
                self.fail_token(parent_token, &format!("sub-workflow at node {activity} failed"))
                    .await?;
            }
            _ => {
                if let Some(token) = self.tokens.get_mut(&parent_token) {
                    token.resume(None);
                    token.update_status(TokenStatus::Cancelled);
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Token advancement
    // -----------------------------------------------------------------

    async fn advance(&mut self, token_id: Uuid) -> Result<()> {
        let node_id = self
            .tokens
            .get(&token_id)
            .map(|t| t.current_node_id)
            .ok_or_else(|| WorkflowError::reference("token", token_id.to_string()))?;

        // A node with two or more inbound edges joins sibling tokens.
        if self.is_join_arrival(&token_id, &node_id) {
            return self.arrive_at_join(token_id, node_id).await;
        }

        let workflow = Arc::clone(&self.workflow);
        let node = workflow
            .node(&node_id)
            .ok_or_else(|| WorkflowError::reference("node", node_id.to_string()))?;

        match node {
            NodeRef::Event(event) => {
                {
                    let token = self.tokens.get_mut(&token_id).expect("token present");
                    token.record(
                        HistoryAction::Dispatched,
                        Some(node_id),
                        Some(serde_json::json!({ "event": event.name })),
                    );
                }
                match event.kind {
                    EventKind::Start | EventKind::Intermediate => {
                        self.route(token_id, node_id).await
                    }
                    EventKind::End => {
                        {
                            let token =
                                self.tokens.get_mut(&token_id).expect("token present");
                            token.reached_end = true;
                            token.update_status(TokenStatus::Completed);
                        }
                        debug!(token_id = %token_id, "token reached end event");
                        self.after_terminal(token_id).await
                    }
                }
            }
            NodeRef::Decision(decision_node) => {
                self.evaluate_decision(token_id, decision_node).await
            }
            NodeRef::Activity(activity) => {
                if activity.expands_to.is_some() {
                    self.dispatch_subworkflow(token_id, activity).await
                } else {
                    self.dispatch_activity(token_id, activity).await
                }
            }
        }
    }

    async fn evaluate_decision(
        &mut self,
        token_id: Uuid,
        node: &crate::graph::DecisionNode,
    ) -> Result<()> {
        let scope = self.decision_scope(&token_id).await;
        match decision::evaluate(&node.decision_table, &scope) {
            Ok(outcome) => {
                if !outcome.edges.is_empty() {
                    let mut targets = Vec::new();
                    for edge_id in &outcome.edges {
                        let target = self
                            .workflow
                            .edge(edge_id)
                            .filter(|e| e.source_id == node.id)
                            .map(|e| e.target_id);
                        match target {
                            Some(target) => targets.push(target),
                            None => {
                                return self
                                    .fail_token(
                                        token_id,
                                        &format!("decision rule names unknown edge {edge_id}"),
                                    )
                                    .await
                            }
                        }
                    }
                    self.follow(token_id, node.id, targets).await
                } else {
                    if !outcome.outputs.is_empty() {
                        let token = self.tokens.get_mut(&token_id).expect("token present");
                        token.merge_data(&outcome.outputs);
                        token.record(
                            HistoryAction::Dispatched,
                            Some(node.id),
                            Some(Value::Object(outcome.outputs.clone())),
                        );
                    }
                    self.route(token_id, node.id).await
                }
            }
            Err(source) => {
                let error = WorkflowError::Decision {
                    node: node.name.clone(),
                    source,
                };
                warn!(token_id = %token_id, error = %error, "decision failed");
                self.fail_token(token_id, &error.to_string()).await
            }
        }
    }

    async fn dispatch_activity(&mut self, token_id: Uuid, activity: &Activity) -> Result<()> {
        loop {
            if self.cancelled {
                return Ok(());
            }
            let view = self.build_view(activity).await?;
            let token = self.tokens.get(&token_id).expect("token present").clone();

            let outcome = self.execute_with_sla(activity, &token, &view).await?;
            match outcome.status {
                StrategyStatus::Ok => {
                    let applied = self
                        .contexts
                        .apply_outputs(&activity.context_bindings, &outcome.outputs)
                        .await;
                    match applied {
                        Ok(()) => {
                            self.attempts.remove(&token_id);
                            let token = self.tokens.get_mut(&token_id).expect("token present");
                            token.merge_data(&outcome.outputs);
                            token.record(
                                HistoryAction::Dispatched,
                                Some(activity.id),
                                Some(outcome.metrics.to_analytics()),
                            );
                            return self.route(token_id, activity.id).await;
                        }
                        Err(e) => {
                            // Context schema rejection surfaces as a
                            // retryable strategy failure; the context is
                            // untouched.
                            if !self.note_failure(token_id, activity, &e.to_string()).await? {
                                return Ok(());
                            }
                        }
                    }
                }
                StrategyStatus::Suspend => {
                    self.attempts.remove(&token_id);
                    let task_id = outcome.suspension.unwrap_or_default();
                    let token = self.tokens.get_mut(&token_id).expect("token present");
                    token.record(
                        HistoryAction::Dispatched,
                        Some(activity.id),
                        Some(outcome.metrics.to_analytics()),
                    );
                    token.suspend(Suspension::HumanTask(task_id));
                    return Ok(());
                }
                StrategyStatus::Failed => {
                    let reason = outcome
                        .failure
                        .unwrap_or_else(|| "strategy failure".to_string());
                    if !self.note_failure(token_id, activity, &reason).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Record a strategy failure against the token's persistent attempt
    /// counter: schedule a backoff retry, or fail the token when the
    /// policy is exhausted. Returns `true` when the caller may attempt
    /// again.
    async fn note_failure(
        &mut self,
        token_id: Uuid,
        activity: &Activity,
        reason: &str,
    ) -> Result<bool> {
        let policy = self.retry.overridden(activity.retry.as_ref());
        let attempts = {
            let counter = self.attempts.entry(token_id).or_insert(0);
            *counter += 1;
            *counter
        };
        if policy.should_retry(attempts) {
            let delay = policy.delay(attempts - 1);
            debug!(activity = %activity.name, attempts, delay_ms = delay.as_millis() as u64, %reason, "retrying");
            if let Some(token) = self.tokens.get_mut(&token_id) {
                token.record(
                    HistoryAction::RetryScheduled,
                    Some(activity.id),
                    Some(serde_json::json!({ "attempt": attempts, "reason": reason })),
                );
            }
            tokio::time::sleep(delay).await;
            Ok(true)
        } else {
            self.attempts.remove(&token_id);
            let error = WorkflowError::strategy(&activity.name, reason);
            warn!(activity = %activity.name, attempts, "retries exhausted");
            self.fail_token(token_id, &error.to_string()).await?;
            Ok(false)
        }
    }

    async fn execute_with_sla(
        &self,
        activity: &Activity,
        token: &Token,
        view: &ContextView,
    ) -> Result<crate::strategy::StrategyOutcome> {
        let strategy = self.strategies.for_actor(activity.actor_type);
        match activity.sla {
            Some(sla) => {
                let budget = Duration::from_millis(sla.max_duration_ms);
                match tokio::time::timeout(budget, strategy.execute(activity, token, view)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Ok(crate::strategy::StrategyOutcome::failed(
                        WorkflowError::Timeout {
                            activity: activity.name.clone(),
                            elapsed_ms: sla.max_duration_ms,
                        }
                        .to_string(),
                        Default::default(),
                    )),
                }
            }
            None => strategy.execute(activity, token, view).await,
        }
    }

    async fn dispatch_subworkflow(&mut self, token_id: Uuid, activity: &Activity) -> Result<()> {
        let target = activity.expands_to.expect("checked by caller");
        let Some(definition) = self.library.get(&target).cloned() else {
            let reason = format!("unknown sub-workflow {target}");
            return self.fail_token(token_id, &reason).await;
        };
        let mut child = Engine::with_queue(
            definition,
            self.queue.clone(),
            self.model.clone(),
            self.robot_endpoint.clone(),
            self.retry,
        )?;
        child.library = self.library.clone();
        let data = self
            .tokens
            .get(&token_id)
            .map(|t| t.data.clone())
            .unwrap_or_default();
        let run_id = child.start(Value::Object(data))?;

        let token = self.tokens.get_mut(&token_id).expect("token present");
        token.record(
            HistoryAction::Dispatched,
            Some(activity.id),
            Some(serde_json::json!({ "sub_workflow": target, "run_id": run_id })),
        );
        token.suspend(Suspension::SubWorkflow(run_id));
        self.subruns.insert(
            run_id,
            SubRun {
                engine: child,
                parent_token: token_id,
            },
        );
        Ok(())
    }

    // -----------------------------------------------------------------
    // Routing, fork and join
    // -----------------------------------------------------------------

    /// Select outbound edges from `node` and advance the token: one true
    /// edge moves it, several fork it, none falls back to the default
    /// edge, and an empty selection fails the token with `NoValidEdge`.
    async fn route(&mut self, token_id: Uuid, node: Uuid) -> Result<()> {
        let edges: Vec<Edge> = self
            .workflow
            .outbound(&node)
            .filter(|e| !e.is_compensation)
            .cloned()
            .collect();

        if edges.is_empty() {
            // Nothing downstream: the token completes without an end
            // event.
            let token = self.tokens.get_mut(&token_id).expect("token present");
            token.update_status(TokenStatus::Completed);
            return self.after_terminal(token_id).await;
        }
        // A single outbound edge is followed unconditionally.
        if edges.len() == 1 {
            return self.follow(token_id, node, vec![edges[0].target_id]).await;
        }

        let scope = self.decision_scope(&token_id).await;
        let mut selected: Vec<Uuid> = Vec::new();
        for edge in edges.iter().filter(|e| !e.is_default) {
            let follow = match &edge.condition {
                // Conditions were syntax-checked at load time.
                Some(condition) => Expr::parse_condition(condition)
                    .map(|e| e.eval(None, &scope))
                    .unwrap_or(false),
                None => true,
            };
            if follow {
                selected.push(edge.target_id);
            }
        }
        if selected.is_empty() {
            if let Some(default) = edges.iter().find(|e| e.is_default) {
                selected.push(default.target_id);
            }
        }
        if selected.is_empty() {
            let error = WorkflowError::NoValidEdge {
                node: node.to_string(),
            };
            return self.fail_token(token_id, &error.to_string()).await;
        }
        self.follow(token_id, node, selected).await
    }

    async fn follow(&mut self, token_id: Uuid, _from: Uuid, targets: Vec<Uuid>) -> Result<()> {
        if targets.len() == 1 {
            let token = self.tokens.get_mut(&token_id).expect("token present");
            token.move_to(targets[0]);
            return Ok(());
        }
        // Multiple true edges fork the token into siblings.
        let token = self.tokens.get_mut(&token_id).expect("token present");
        let children = token.fork(&targets);
        let outstanding: HashSet<Uuid> = children.iter().map(|c| c.id).collect();
        debug!(parent = %token_id, children = children.len(), "token forked");
        self.forks.insert(
            token_id,
            ForkState {
                outstanding,
                join_node: None,
                arrivals: Vec::new(),
            },
        );
        for child in children {
            self.token_order.push(child.id);
            self.tokens.insert(child.id, child);
        }
        Ok(())
    }

    fn is_join_arrival(&self, token_id: &Uuid, node: &Uuid) -> bool {
        if self.workflow.inbound_count(node) < 2 {
            return false;
        }
        self.tokens
            .get(token_id)
            .and_then(|t| t.parent_token_id)
            .map(|parent| self.forks.contains_key(&parent))
            .unwrap_or(false)
    }

    /// A sibling reached a join node: absorb it and, once every sibling
    /// of the fork has arrived or terminated, wake the parent with the
    /// coalesced data (last writer wins by arrival time, ties by token
    /// id).
    async fn arrive_at_join(&mut self, token_id: Uuid, node: Uuid) -> Result<()> {
        let parent_id = self
            .tokens
            .get(&token_id)
            .and_then(|t| t.parent_token_id)
            .expect("join arrival has a parent");
        {
            let token = self.tokens.get_mut(&token_id).expect("token present");
            token.record(HistoryAction::Joined, Some(node), None);
            token.update_status(TokenStatus::Completed);
        }
        let data = self.tokens.get(&token_id).expect("token present").data.clone();
        let fork = self.forks.get_mut(&parent_id).expect("fork state present");
        fork.outstanding.remove(&token_id);
        fork.join_node.get_or_insert(node);
        fork.arrivals.push(Arrival {
            token_id,
            data,
            arrived_at: chrono::Utc::now(),
        });
        self.try_complete_fork(parent_id).await
    }

    /// A forked sibling ended without reaching the join node.
    fn after_terminal(
        &mut self,
        token_id: Uuid,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let Some(parent_id) = self.tokens.get(&token_id).and_then(|t| t.parent_token_id) else {
                return Ok(());
            };
            if let Some(fork) = self.forks.get_mut(&parent_id) {
                fork.outstanding.remove(&token_id);
                return self.try_complete_fork(parent_id).await;
            }
            Ok(())
        })
    }

    async fn try_complete_fork(&mut self, parent_id: Uuid) -> Result<()> {
        let done = self
            .forks
            .get(&parent_id)
            .map(|f| f.outstanding.is_empty())
            .unwrap_or(false);
        if !done {
            return Ok(());
        }
        let mut fork = self.forks.remove(&parent_id).expect("fork state present");
        fork.arrivals.sort_by(|a, b| {
            a.arrived_at
                .cmp(&b.arrived_at)
                .then(a.token_id.cmp(&b.token_id))
        });
        let mut merged = Map::new();
        for arrival in &fork.arrivals {
            for (k, v) in &arrival.data {
                merged.insert(k.clone(), v.clone());
            }
        }
        match fork.join_node {
            Some(join_node) => {
                debug!(parent = %parent_id, join = %join_node, "fork joined");
                let token = self.tokens.get_mut(&parent_id).expect("parent present");
                token.resume(Some(&merged));
                token.record(HistoryAction::Joined, Some(join_node), None);
                token.move_to(join_node);
                Ok(())
            }
            None => {
                // Every sibling terminated at an end event; the parent
                // absorbs their data and finishes.
                {
                    let token = self.tokens.get_mut(&parent_id).expect("parent present");
                    token.resume(Some(&merged));
                    token.update_status(TokenStatus::Completed);
                }
                // The parent may itself be a fork sibling, which recurses
                // back through after_terminal.
                self.after_terminal(parent_id).await
            }
        }
    }

    // -----------------------------------------------------------------
    // Failure propagation
    // -----------------------------------------------------------------

    /// Fail a token: reroute via a compensation edge when one leaves the
    /// current node, otherwise fail the token and the run.
    async fn fail_token(&mut self, token_id: Uuid, reason: &str) -> Result<()> {
        let node = self
            .tokens
            .get(&token_id)
            .map(|t| t.current_node_id)
            .unwrap_or_default();
        let compensation = self
            .workflow
            .outbound(&node)
            .find(|e| e.is_compensation)
            .map(|e| e.target_id);

        if let Some(target) = compensation {
            info!(token_id = %token_id, %reason, "rerouting via compensation edge");
            let token = self.tokens.get_mut(&token_id).expect("token present");
            token.merge_data(&{
                let mut m = Map::new();
                m.insert("failure_reason".into(), Value::String(reason.to_string()));
                m
            });
            token.move_to(target);
            return Ok(());
        }

        warn!(token_id = %token_id, %reason, "token failed; failing run");
        if let Some(token) = self.tokens.get_mut(&token_id) {
            token.record(
                HistoryAction::StatusChanged,
                Some(node),
                Some(serde_json::json!({ "failure": reason })),
            );
            token.update_status(TokenStatus::Failed);
        }
        self.run_failed = true;

        // Default policy: a token-level failure fails the run. Remaining
        // live tokens are cancelled and their suspensions released.
        let others: Vec<Uuid> = self
            .token_order
            .iter()
            .filter(|id| **id != token_id)
            .copied()
            .collect();
        for id in others {
            let Some(token) = self.tokens.get(&id) else { continue };
            if token.status.is_terminal() {
                continue;
            }
            if let Some(Suspension::HumanTask(task_id)) = token.suspension.clone() {
                let _ = self.queue.expire(&task_id).await;
            }
            if let Some(token) = self.tokens.get_mut(&id) {
                token.update_status(TokenStatus::Cancelled);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Scopes and views
    // -----------------------------------------------------------------

    /// Consistent snapshot of token data plus every context, used for
    /// decision tables and edge conditions.
    async fn decision_scope(&self, token_id: &Uuid) -> crate::expr::MapScope {
        let mut root = Map::new();
        // Contexts first, token data second: token names shadow context
        // fields.
        let mut named = Map::new();
        for (decl, value) in self.contexts.snapshot_all().await {
            if let Value::Object(fields) = &value {
                for (k, v) in fields {
                    root.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
            named.insert(decl.name, value);
        }
        for (k, v) in &named {
            root.entry(k.clone()).or_insert_with(|| v.clone());
        }
        if let Some(token) = self.tokens.get(token_id) {
            for (k, v) in &token.data {
                root.insert(k.clone(), v.clone());
            }
        }
        crate::expr::MapScope::new(Value::Object(root))
    }

    /// Read snapshot of an activity's bound contexts, draining
    /// message-passing queues for `read`/`read_write` bindings.
    async fn build_view(&self, activity: &Activity) -> Result<ContextView> {
        let mut bindings: Vec<_> = activity
            .context_bindings
            .iter()
            .filter(|b| b.access_mode.reads())
            .collect();
        // Ascending id order matches the store's lock ordering.
        bindings.sort_by_key(|b| b.context_id);

        let mut entries = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let decl = self
                .workflow
                .context(&binding.context_id)
                .ok_or_else(|| {
                    WorkflowError::reference("context", binding.context_id.to_string())
                })?
                .clone();
            let value = if decl.sync_pattern == crate::graph::SyncPattern::MessagePassing
                && matches!(
                    binding.access_mode,
                    crate::graph::AccessMode::Read | crate::graph::AccessMode::ReadWrite
                ) {
                Value::Array(self.contexts.drain(&binding.context_id).await?)
            } else {
                self.contexts.get(&binding.context_id).await?
            };
            entries.push((decl, value));
        }
        Ok(ContextView::new(entries))
    }

    // -----------------------------------------------------------------
    // Parallel step batch
    // -----------------------------------------------------------------

    /// Dispatch every active token whose strategy call is independent —
    /// plain activities whose write-bound context sets are pairwise
    /// disjoint — concurrently. Returns whether anything ran.
    async fn step_batch(&mut self) -> Result<bool> {
        let mut batch: Vec<(Uuid, Activity)> = Vec::new();
        let mut writes_taken: HashSet<Uuid> = HashSet::new();
        for id in &self.token_order {
            let Some(token) = self.tokens.get(id) else { continue };
            if token.status != TokenStatus::Active {
                continue;
            }
            let Some(NodeRef::Activity(activity)) = self.workflow.node(&token.current_node_id)
            else {
                continue;
            };
            if activity.expands_to.is_some()
                || activity.actor_type == crate::graph::ActorType::Human
                || activity.retry.is_some()
                || self.is_join_arrival(id, &token.current_node_id)
            {
                // Humans, sub-workflows, joins and per-activity retry
                // policies go through the sequential path.
                continue;
            }
            let writes: Vec<Uuid> = activity
                .context_bindings
                .iter()
                .filter(|b| b.access_mode.writes())
                .map(|b| b.context_id)
                .collect();
            if writes.iter().any(|w| writes_taken.contains(w)) {
                continue;
            }
            writes_taken.extend(writes);
            batch.push((*id, activity.clone()));
        }
        if batch.len() < 2 {
            return Ok(false);
        }

        debug!(tokens = batch.len(), "dispatching independent strategies concurrently");
        let mut prepared = Vec::with_capacity(batch.len());
        for (token_id, activity) in &batch {
            let view = self.build_view(activity).await?;
            let token = self.tokens.get(token_id).expect("token present").clone();
            prepared.push((*token_id, activity.clone(), token, view));
        }
        let outcomes = join_all(prepared.iter().map(|(_, activity, token, view)| {
            self.execute_with_sla(activity, token, view)
        }))
        .await;

        for ((token_id, activity, _, _), outcome) in prepared.iter().zip(outcomes) {
            let outcome = outcome?;
            match outcome.status {
                StrategyStatus::Ok => {
                    match self
                        .contexts
                        .apply_outputs(&activity.context_bindings, &outcome.outputs)
                        .await
                    {
                        Ok(()) => {
                            self.attempts.remove(token_id);
                            let token = self.tokens.get_mut(token_id).expect("token present");
                            token.merge_data(&outcome.outputs);
                            token.record(
                                HistoryAction::Dispatched,
                                Some(activity.id),
                                Some(outcome.metrics.to_analytics()),
                            );
                            self.route(*token_id, activity.id).await?;
                        }
                        Err(e) => {
                            // Leaves the token active; the attempt counter
                            // persists, so the next iteration retries or
                            // fails it.
                            let _ = self.note_failure(*token_id, activity, &e.to_string()).await?;
                        }
                    }
                }
                StrategyStatus::Suspend => {
                    self.attempts.remove(token_id);
                    let task_id = outcome.suspension.clone().unwrap_or_default();
                    let token = self.tokens.get_mut(token_id).expect("token present");
                    token.record(
                        HistoryAction::Dispatched,
                        Some(activity.id),
                        Some(outcome.metrics.to_analytics()),
                    );
                    token.suspend(Suspension::HumanTask(task_id));
                }
                StrategyStatus::Failed => {
                    let reason = outcome
                        .failure
                        .clone()
                        .unwrap_or_else(|| "strategy failure".to_string());
                    let _ = self.note_failure(*token_id, activity, &reason).await?;
                }
            }
        }
        Ok(true)
    }
}
