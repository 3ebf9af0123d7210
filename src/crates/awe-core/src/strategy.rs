//! Actor strategies
//!
//! One strategy per actor kind, behind a uniform `execute` contract. The
//! engine never looks past [`StrategyOutcome`]: outputs to merge, metrics
//! for history analytics, a status, and an optional suspension handle.
//!
//! The set of strategies is closed — [`ActorStrategy`] is an enum, not an
//! open trait hierarchy:
//!
//! - **Application** runs the activity's bound programs synchronously and
//!   deterministically.
//! - **AiAgent** composes a prompt from the activity description, resolved
//!   inputs and skills, delegates to a [`ChatModel`], and parses the
//!   response against the activity's output schema. Without a credential
//!   it synthesizes deterministic outputs from the schema instead.
//! - **Robot** calls a robot endpoint, or simulates one with the same
//!   contract when no endpoint is configured.
//! - **Human** enqueues a task and suspends the token on its id.

use serde_json::{Map, Value};
use std::time::Instant;
use tracing::{debug, instrument};

use awe_tasks::{HumanTask, TaskQueue};

use crate::error::Result;
use crate::expr::{lookup_path, Scope, ValueExpr};
use crate::graph::{Activity, ActorType, ContextDecl, Program, ProgramKind};
use crate::llm::{ChatModel, ChatRequest};
use crate::token::Token;

/// Outcome status of one strategy call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyStatus {
    Ok,
    /// Retryable failure
    Failed,
    /// Token must suspend on `suspension`
    Suspend,
}

/// Measurements attached to the token's history after a dispatch.
#[derive(Debug, Clone, Default)]
pub struct StrategyMetrics {
    pub duration_ms: u64,
    pub simulated: bool,
    pub input_tokens: Option<usize>,
    pub output_tokens: Option<usize>,
    pub estimated_duration_ms: Option<u64>,
}

impl StrategyMetrics {
    pub fn to_analytics(&self) -> Value {
        let mut map = Map::new();
        map.insert("duration_ms".into(), Value::from(self.duration_ms));
        if self.simulated {
            map.insert("simulated".into(), Value::Bool(true));
        }
        if let Some(n) = self.input_tokens {
            map.insert("input_tokens".into(), Value::from(n));
        }
        if let Some(n) = self.output_tokens {
            map.insert("output_tokens".into(), Value::from(n));
        }
        if let Some(n) = self.estimated_duration_ms {
            map.insert("estimated_duration_ms".into(), Value::from(n));
        }
        Value::Object(map)
    }
}

/// Result of one strategy call.
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    pub outputs: Map<String, Value>,
    pub metrics: StrategyMetrics,
    pub status: StrategyStatus,
    /// Task id when `status` is `Suspend`
    pub suspension: Option<String>,
    /// Failure reason when `status` is `Failed`
    pub failure: Option<String>,
}

impl StrategyOutcome {
    pub fn ok(outputs: Map<String, Value>, metrics: StrategyMetrics) -> Self {
        Self {
            outputs,
            metrics,
            status: StrategyStatus::Ok,
            suspension: None,
            failure: None,
        }
    }

    pub fn failed(reason: impl Into<String>, metrics: StrategyMetrics) -> Self {
        Self {
            outputs: Map::new(),
            metrics,
            status: StrategyStatus::Failed,
            suspension: None,
            failure: Some(reason.into()),
        }
    }

    pub fn suspend(task_id: impl Into<String>, metrics: StrategyMetrics) -> Self {
        Self {
            outputs: Map::new(),
            metrics,
            status: StrategyStatus::Suspend,
            suspension: Some(task_id.into()),
            failure: None,
        }
    }
}

/// Read snapshot of the contexts an activity is bound to, taken by the
/// engine before dispatch. Field lookup is flat across context values
/// first, then qualified by context name (`context_name.field`).
#[derive(Debug, Clone, Default)]
pub struct ContextView {
    entries: Vec<(ContextDecl, Value)>,
    named: Value,
}

impl ContextView {
    pub fn new(entries: Vec<(ContextDecl, Value)>) -> Self {
        let mut named = Map::new();
        for (decl, value) in &entries {
            named.insert(decl.name.clone(), value.clone());
        }
        Self {
            entries,
            named: Value::Object(named),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn value_of(&self, context_name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(decl, _)| decl.name == context_name)
            .map(|(_, v)| v)
    }
}

impl Scope for ContextView {
    fn lookup(&self, path: &str) -> Option<Value> {
        for (_, value) in &self.entries {
            if let Some(found) = lookup_path(value, path) {
                return Some(found);
            }
        }
        lookup_path(&self.named, path)
    }
}

/// Resolution scope for one dispatch: token data shadows bound contexts.
pub struct DispatchScope<'a> {
    token_data: Value,
    view: &'a ContextView,
}

impl<'a> DispatchScope<'a> {
    pub fn new(token: &Token, view: &'a ContextView) -> Self {
        Self {
            token_data: Value::Object(token.data.clone()),
            view,
        }
    }
}

impl Scope for DispatchScope<'_> {
    fn lookup(&self, path: &str) -> Option<Value> {
        lookup_path(&self.token_data, path).or_else(|| self.view.lookup(path))
    }
}

/// Resolve an activity's declared inputs from token data and the context
/// view. An activity with no declared inputs sees the whole token data.
pub fn resolve_inputs(activity: &Activity, token: &Token, view: &ContextView) -> Map<String, Value> {
    if activity.inputs.is_empty() {
        return token.data.clone();
    }
    let scope = DispatchScope::new(token, view);
    let mut resolved = Map::new();
    for name in &activity.inputs {
        resolved.insert(name.clone(), scope.lookup(name).unwrap_or(Value::Null));
    }
    resolved
}

/// Closed set of actor strategies.
pub enum ActorStrategy {
    Application(ApplicationStrategy),
    AiAgent(AiAgentStrategy),
    Robot(RobotStrategy),
    Human(HumanStrategy),
}

impl ActorStrategy {
    /// Uniform dispatch contract.
    #[instrument(skip_all, fields(activity = %activity.name, actor = activity.actor_type.as_str()))]
    pub async fn execute(
        &self,
        activity: &Activity,
        token: &Token,
        view: &ContextView,
    ) -> Result<StrategyOutcome> {
        match self {
            ActorStrategy::Application(s) => s.execute(activity, token, view),
            ActorStrategy::AiAgent(s) => s.execute(activity, token, view).await,
            ActorStrategy::Robot(s) => s.execute(activity, token, view).await,
            ActorStrategy::Human(s) => s.execute(activity, token, view).await,
        }
    }
}

/// The four strategies an engine dispatches to, one per actor kind.
pub struct Strategies {
    pub application: ActorStrategy,
    pub ai_agent: ActorStrategy,
    pub robot: ActorStrategy,
    pub human: ActorStrategy,
}

impl Strategies {
    pub fn new(
        model: Option<Box<dyn ChatModel>>,
        robot_endpoint: Option<String>,
        queue: TaskQueue,
    ) -> Self {
        Self {
            application: ActorStrategy::Application(ApplicationStrategy::new()),
            ai_agent: ActorStrategy::AiAgent(AiAgentStrategy::new(model)),
            robot: ActorStrategy::Robot(RobotStrategy::new(robot_endpoint)),
            human: ActorStrategy::Human(HumanStrategy::new(queue)),
        }
    }

    pub fn for_actor(&self, actor: ActorType) -> &ActorStrategy {
        match actor {
            ActorType::Application => &self.application,
            ActorType::AiAgent => &self.ai_agent,
            ActorType::Robot => &self.robot,
            ActorType::Human => &self.human,
        }
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Executes the activity's bound programs synchronously.
///
/// `expression` programs are line-oriented assignment scripts evaluated
/// with the condition language's value expressions:
///
/// ```text
/// # comments and blank lines are skipped
/// verdict = "approved"
/// amount = claim.amount
/// fail "boom"          # deterministic failure, for compensation paths
/// ```
///
/// `mcp_tool` programs record a simulated invocation; there is no MCP
/// transport in the engine.
#[derive(Default)]
pub struct ApplicationStrategy;

impl ApplicationStrategy {
    pub fn new() -> Self {
        Self
    }

    fn execute(
        &self,
        activity: &Activity,
        token: &Token,
        view: &ContextView,
    ) -> Result<StrategyOutcome> {
        let started = Instant::now();
        let scope = DispatchScope::new(token, view);
        let mut outputs = Map::new();

        for program in &activity.programs {
            match program.kind {
                ProgramKind::Expression => {
                    if let Err(reason) = run_expression_program(program, &scope, &mut outputs) {
                        return Ok(StrategyOutcome::failed(
                            reason,
                            StrategyMetrics {
                                duration_ms: started.elapsed().as_millis() as u64,
                                ..Default::default()
                            },
                        ));
                    }
                }
                ProgramKind::McpTool => {
                    outputs.insert(
                        program.name.clone(),
                        serde_json::json!({
                            "tool": program.body,
                            "status": "simulated",
                        }),
                    );
                }
            }
        }

        Ok(StrategyOutcome::ok(
            outputs,
            StrategyMetrics {
                duration_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            },
        ))
    }
}

fn run_expression_program(
    program: &Program,
    scope: &dyn Scope,
    outputs: &mut Map<String, Value>,
) -> std::result::Result<(), String> {
    for line in program.body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("fail") {
            let reason = rest.trim().trim_matches('"');
            return Err(if reason.is_empty() {
                format!("program '{}' failed", program.name)
            } else {
                reason.to_string()
            });
        }
        let (name, rhs) = line
            .split_once('=')
            .ok_or_else(|| format!("program '{}': expected 'name = value': {line}", program.name))?;
        let value = ValueExpr::parse(rhs.trim())
            .map_err(|e| format!("program '{}': {e}", program.name))?
            .eval(&AssignmentScope {
                outputs: &*outputs,
                base: scope,
            });
        outputs.insert(name.trim().to_string(), value);
    }
    Ok(())
}

// Later assignments see earlier ones before falling back to token data
// and contexts.
struct AssignmentScope<'a> {
    outputs: &'a Map<String, Value>,
    base: &'a dyn Scope,
}

impl Scope for AssignmentScope<'_> {
    fn lookup(&self, path: &str) -> Option<Value> {
        lookup_path(&Value::Object(self.outputs.clone()), path).or_else(|| self.base.lookup(path))
    }
}

// ---------------------------------------------------------------------------
// AI agent
// ---------------------------------------------------------------------------

/// Delegates an activity to a language model; simulates deterministically
/// when no model credential is configured.
pub struct AiAgentStrategy {
    model: Option<Box<dyn ChatModel>>,
}

impl AiAgentStrategy {
    pub fn new(model: Option<Box<dyn ChatModel>>) -> Self {
        Self { model }
    }

    async fn execute(
        &self,
        activity: &Activity,
        token: &Token,
        view: &ContextView,
    ) -> Result<StrategyOutcome> {
        let started = Instant::now();
        let inputs = resolve_inputs(activity, token, view);

        let Some(model) = &self.model else {
            let outputs = simulate_outputs(activity);
            return Ok(StrategyOutcome::ok(
                outputs,
                StrategyMetrics {
                    duration_ms: started.elapsed().as_millis() as u64,
                    simulated: true,
                    ..Default::default()
                },
            ));
        };

        let request = ChatRequest::new(compose_prompt(activity, &inputs))
            .with_system(compose_system(activity));
        let response = match model.chat(request).await {
            Ok(response) => response,
            Err(e) => {
                return Ok(StrategyOutcome::failed(
                    e.to_string(),
                    StrategyMetrics {
                        duration_ms: started.elapsed().as_millis() as u64,
                        ..Default::default()
                    },
                ))
            }
        };

        let metrics = StrategyMetrics {
            duration_ms: started.elapsed().as_millis() as u64,
            input_tokens: response.usage.map(|u| u.input_tokens),
            output_tokens: response.usage.map(|u| u.output_tokens),
            ..Default::default()
        };

        match parse_structured_outputs(&response.text, activity) {
            Ok(outputs) => Ok(StrategyOutcome::ok(outputs, metrics)),
            Err(reason) => Ok(StrategyOutcome::failed(reason, metrics)),
        }
    }
}

fn compose_system(activity: &Activity) -> String {
    format!(
        "You are an AI agent performing the workflow activity '{}' in the role '{}'. \
         Respond with a single JSON object and nothing else.",
        activity.name, activity.role_id
    )
}

fn compose_prompt(activity: &Activity, inputs: &Map<String, Value>) -> String {
    let mut prompt = String::new();
    if let Some(description) = &activity.description {
        prompt.push_str(description);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Inputs:\n");
    prompt.push_str(&serde_json::to_string_pretty(inputs).unwrap_or_else(|_| "{}".into()));
    if !activity.skills.is_empty() {
        prompt.push_str("\n\nSkills: ");
        prompt.push_str(&activity.skills.join(", "));
    }
    if !activity.tool_requirements.is_empty() {
        prompt.push_str("\nTools available: ");
        prompt.push_str(&activity.tool_requirements.join(", "));
    }
    if let Some(schema) = &activity.output_schema {
        prompt.push_str("\n\nRespond with a JSON object conforming to this schema:\n");
        prompt.push_str(&serde_json::to_string_pretty(schema).unwrap_or_else(|_| "{}".into()));
    }
    prompt
}

/// Extract the JSON object from a model response, tolerating code fences
/// and prose around it.
fn parse_structured_outputs(
    text: &str,
    activity: &Activity,
) -> std::result::Result<Map<String, Value>, String> {
    let trimmed = text.trim();
    let candidate = if let Some(stripped) = strip_code_fence(trimmed) {
        stripped
    } else {
        match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(open), Some(close)) if close > open => &trimmed[open..=close],
            _ => return Err(format!("model response is not a JSON object: {trimmed:.80}")),
        }
    };
    let parsed: Value =
        serde_json::from_str(candidate).map_err(|e| format!("unparseable model output: {e}"))?;
    let Value::Object(object) = parsed else {
        return Err("model output is not a JSON object".into());
    };

    // When a schema declares properties, keep only those keys.
    if let Some(properties) = activity
        .output_schema
        .as_ref()
        .and_then(|s| s.get("properties"))
        .and_then(|p| p.as_object())
    {
        let filtered = object
            .into_iter()
            .filter(|(k, _)| properties.contains_key(k))
            .collect();
        return Ok(filtered);
    }
    Ok(object)
}

fn strip_code_fence(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("```")?;
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let end = rest.rfind("```")?;
    Some(rest[..end].trim())
}

/// Deterministic synthetic outputs conforming to the activity's output
/// schema, used when no model credential is present.
fn simulate_outputs(activity: &Activity) -> Map<String, Value> {
    let mut outputs = Map::new();
    let properties = activity
        .output_schema
        .as_ref()
        .and_then(|s| s.get("properties"))
        .and_then(|p| p.as_object());
    match properties {
        Some(properties) => {
            for (name, spec) in properties {
                let value = match spec.get("type").and_then(|t| t.as_str()) {
                    Some("string") => Value::String(format!("{} [simulated]", name)),
                    Some("number") | Some("integer") => Value::from(0),
                    Some("boolean") => Value::Bool(true),
                    Some("array") => Value::Array(Vec::new()),
                    _ => Value::Object(Map::new()),
                };
                outputs.insert(name.clone(), value);
            }
        }
        None => {
            outputs.insert(
                "result".into(),
                Value::String(format!("{} [simulated]", activity.name)),
            );
        }
    }
    outputs
}

// ---------------------------------------------------------------------------
// Robot
// ---------------------------------------------------------------------------

/// Calls a robot endpoint, or simulates one when none is configured.
pub struct RobotStrategy {
    endpoint: Option<String>,
    client: reqwest::Client,
}

impl RobotStrategy {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            endpoint,
            client: reqwest::Client::new(),
        }
    }

    async fn execute(
        &self,
        activity: &Activity,
        token: &Token,
        view: &ContextView,
    ) -> Result<StrategyOutcome> {
        let started = Instant::now();
        let inputs = resolve_inputs(activity, token, view);

        let Some(endpoint) = &self.endpoint else {
            // Simulation keeps the contract of a real robot: outputs plus
            // an estimated duration derived from the payload size.
            let mut outputs = Map::new();
            outputs.insert("robot_status".into(), Value::String("completed".into()));
            outputs.insert(
                "operation".into(),
                Value::String(format!("{} [simulated]", activity.name)),
            );
            let estimated = 250 + 50 * inputs.len() as u64;
            return Ok(StrategyOutcome::ok(
                outputs,
                StrategyMetrics {
                    duration_ms: started.elapsed().as_millis() as u64,
                    simulated: true,
                    estimated_duration_ms: Some(estimated),
                    ..Default::default()
                },
            ));
        };

        let body = serde_json::json!({
            "activity_id": activity.id,
            "activity": activity.name,
            "machine_id": activity.machine_id,
            "inputs": inputs,
        });
        let metrics = |elapsed: u64| StrategyMetrics {
            duration_ms: elapsed,
            ..Default::default()
        };
        let response = match self.client.post(endpoint).json(&body).send().await {
            Ok(response) => response,
            Err(e) => {
                return Ok(StrategyOutcome::failed(
                    format!("robot endpoint unreachable: {e}"),
                    metrics(started.elapsed().as_millis() as u64),
                ))
            }
        };
        if !response.status().is_success() {
            return Ok(StrategyOutcome::failed(
                format!("robot endpoint returned {}", response.status()),
                metrics(started.elapsed().as_millis() as u64),
            ));
        }
        let outputs: Map<String, Value> = match response.json().await {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                let mut map = Map::new();
                map.insert("result".into(), other);
                map
            }
            Err(e) => {
                return Ok(StrategyOutcome::failed(
                    format!("robot response unparseable: {e}"),
                    metrics(started.elapsed().as_millis() as u64),
                ))
            }
        };
        Ok(StrategyOutcome::ok(
            outputs,
            metrics(started.elapsed().as_millis() as u64),
        ))
    }
}

// ---------------------------------------------------------------------------
// Human
// ---------------------------------------------------------------------------

/// Enqueues a human task and suspends the token on it.
pub struct HumanStrategy {
    queue: TaskQueue,
}

impl HumanStrategy {
    pub fn new(queue: TaskQueue) -> Self {
        Self { queue }
    }

    async fn execute(
        &self,
        activity: &Activity,
        token: &Token,
        view: &ContextView,
    ) -> Result<StrategyOutcome> {
        let started = Instant::now();
        let inputs = resolve_inputs(activity, token, view);

        let mut task = HumanTask::new(
            activity.id.to_string(),
            activity.name.clone(),
            token.id.to_string(),
            token.workflow_id.to_string(),
            activity.role_id.clone(),
        )
        .with_priority(activity.priority)
        .with_inputs(Value::Object(inputs))
        .with_created_by("engine");
        if let Some(due_in_ms) = activity.due_in_ms {
            task = task.with_due_at(chrono::Utc::now() + chrono::Duration::milliseconds(due_in_ms as i64));
        }
        if let Some(schema) = &activity.output_schema {
            task = task.with_form_schema(schema.clone());
        }

        let task_id = self.queue.create(task).await?;
        debug!(task_id = %task_id, role = %activity.role_id, "suspending on human task");
        Ok(StrategyOutcome::suspend(
            task_id,
            StrategyMetrics {
                duration_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::test_support::{activity, context_decl};
    use crate::graph::SyncPattern;
    use awe_tasks::{InMemoryTaskStore, TaskPriority, TaskStatus};
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn token_with(data: Value) -> Token {
        Token::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            data.as_object().cloned().unwrap_or_default(),
        )
    }

    fn expression_program(body: &str) -> Program {
        Program {
            name: "main".into(),
            kind: ProgramKind::Expression,
            body: body.into(),
        }
    }

    #[tokio::test]
    async fn test_application_runs_assignments() {
        let mut act = activity("score", ActorType::Application);
        act.programs.push(expression_program(
            "# compute\nverdict = \"approved\"\namount = claim.amount",
        ));
        let token = token_with(json!({"claim": {"amount": 1200}}));
        let strategy = ActorStrategy::Application(ApplicationStrategy::new());

        let outcome = strategy
            .execute(&act, &token, &ContextView::empty())
            .await
            .unwrap();
        assert_eq!(outcome.status, StrategyStatus::Ok);
        assert_eq!(outcome.outputs["verdict"], json!("approved"));
        assert_eq!(outcome.outputs["amount"], json!(1200));
    }

    #[tokio::test]
    async fn test_application_assignments_see_prior_outputs() {
        let mut act = activity("chain", ActorType::Application);
        act.programs
            .push(expression_program("first = 10\nsecond = first"));
        let token = token_with(json!({}));
        let strategy = ActorStrategy::Application(ApplicationStrategy::new());

        let outcome = strategy
            .execute(&act, &token, &ContextView::empty())
            .await
            .unwrap();
        assert_eq!(outcome.outputs["second"], json!(10.0));
    }

    #[tokio::test]
    async fn test_application_fail_directive() {
        let mut act = activity("flaky", ActorType::Application);
        act.programs.push(expression_program("fail \"boom\""));
        let token = token_with(json!({}));
        let strategy = ActorStrategy::Application(ApplicationStrategy::new());

        let outcome = strategy
            .execute(&act, &token, &ContextView::empty())
            .await
            .unwrap();
        assert_eq!(outcome.status, StrategyStatus::Failed);
        assert_eq!(outcome.failure.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_application_mcp_tool_is_simulated() {
        let mut act = activity("tool_user", ActorType::Application);
        act.programs.push(Program {
            name: "lookup".into(),
            kind: ProgramKind::McpTool,
            body: "crm/find_customer".into(),
        });
        let token = token_with(json!({}));
        let strategy = ActorStrategy::Application(ApplicationStrategy::new());

        let outcome = strategy
            .execute(&act, &token, &ContextView::empty())
            .await
            .unwrap();
        assert_eq!(outcome.outputs["lookup"]["status"], json!("simulated"));
    }

    #[tokio::test]
    async fn test_ai_simulation_matches_output_schema() {
        let mut act = activity("assess", ActorType::AiAgent);
        act.output_schema = Some(json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string"},
                "score": {"type": "number"},
                "approved": {"type": "boolean"},
            }
        }));
        let token = token_with(json!({}));
        let strategy = ActorStrategy::AiAgent(AiAgentStrategy::new(None));

        let outcome = strategy
            .execute(&act, &token, &ContextView::empty())
            .await
            .unwrap();
        assert_eq!(outcome.status, StrategyStatus::Ok);
        assert!(outcome.metrics.simulated);
        assert!(outcome.outputs["summary"].is_string());
        assert!(outcome.outputs["score"].is_number());
        assert_eq!(outcome.outputs["approved"], json!(true));

        // Deterministic: a second call produces identical outputs
        let again = strategy
            .execute(&act, &token, &ContextView::empty())
            .await
            .unwrap();
        assert_eq!(again.outputs, outcome.outputs);
    }

    #[tokio::test]
    async fn test_ai_with_model_parses_fenced_json() {
        struct Fixed;
        #[async_trait::async_trait]
        impl ChatModel for Fixed {
            async fn chat(&self, _request: ChatRequest) -> Result<crate::llm::ChatResponse> {
                Ok(crate::llm::ChatResponse {
                    text: "```json\n{\"summary\": \"done\", \"extra\": 1}\n```".into(),
                    usage: Some(crate::llm::UsageMetadata::new(10, 5)),
                    metadata: Default::default(),
                })
            }
            fn clone_box(&self) -> Box<dyn ChatModel> {
                Box::new(Fixed)
            }
        }

        let mut act = activity("summarize", ActorType::AiAgent);
        act.output_schema = Some(json!({
            "type": "object",
            "properties": {"summary": {"type": "string"}}
        }));
        let token = token_with(json!({}));
        let strategy = ActorStrategy::AiAgent(AiAgentStrategy::new(Some(Box::new(Fixed))));

        let outcome = strategy
            .execute(&act, &token, &ContextView::empty())
            .await
            .unwrap();
        assert_eq!(outcome.status, StrategyStatus::Ok);
        // Keys outside the schema are dropped
        assert_eq!(outcome.outputs.len(), 1);
        assert_eq!(outcome.outputs["summary"], json!("done"));
        assert_eq!(outcome.metrics.input_tokens, Some(10));
        assert_eq!(outcome.metrics.output_tokens, Some(5));
    }

    #[tokio::test]
    async fn test_prompt_composition() {
        let mut act = activity("draft", ActorType::AiAgent);
        act.description = Some("Draft a settlement letter".into());
        act.skills = vec!["legal-writing".into()];
        act.inputs = vec!["claimant".into()];
        let token = token_with(json!({"claimant": "Ada"}));

        let inputs = resolve_inputs(&act, &token, &ContextView::empty());
        let prompt = compose_prompt(&act, &inputs);
        assert!(prompt.contains("Draft a settlement letter"));
        assert!(prompt.contains("\"claimant\": \"Ada\""));
        assert!(prompt.contains("legal-writing"));
    }

    #[tokio::test]
    async fn test_robot_simulation_reports_estimate() {
        let act = activity("weld", ActorType::Robot);
        let token = token_with(json!({"part": "frame"}));
        let strategy = ActorStrategy::Robot(RobotStrategy::new(None));

        let outcome = strategy
            .execute(&act, &token, &ContextView::empty())
            .await
            .unwrap();
        assert_eq!(outcome.status, StrategyStatus::Ok);
        assert!(outcome.metrics.simulated);
        assert!(outcome.metrics.estimated_duration_ms.is_some());
        assert_eq!(outcome.outputs["robot_status"], json!("completed"));
    }

    #[tokio::test]
    async fn test_human_enqueues_and_suspends() {
        let queue = TaskQueue::new(Arc::new(InMemoryTaskStore::new()));
        let mut act = activity("review", ActorType::Human);
        act.role_id = "qc".into();
        act.priority = TaskPriority::High;
        act.inputs = vec!["claim_id".into()];
        let token = token_with(json!({"claim_id": "c-42"}));
        let strategy = ActorStrategy::Human(HumanStrategy::new(queue.clone()));

        let outcome = strategy
            .execute(&act, &token, &ContextView::empty())
            .await
            .unwrap();
        assert_eq!(outcome.status, StrategyStatus::Suspend);

        let task_id = outcome.suspension.unwrap();
        let task = queue.get(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.role_id, "qc");
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.inputs, json!({"claim_id": "c-42"}));
        assert_eq!(task.token_id, token.id.to_string());
    }

    #[tokio::test]
    async fn test_context_view_lookup_precedence() {
        let claim = context_decl("claim", SyncPattern::SharedState);
        let view = ContextView::new(vec![(claim, json!({"amount": 900}))]);
        // Flat field lookup and context-qualified lookup both resolve
        assert_eq!(view.lookup("amount"), Some(json!(900)));
        assert_eq!(view.lookup("claim.amount"), Some(json!(900)));

        // Token data shadows context fields
        let token = token_with(json!({"amount": 100}));
        let scope = DispatchScope::new(&token, &view);
        assert_eq!(scope.lookup("amount"), Some(json!(100)));
    }
}
