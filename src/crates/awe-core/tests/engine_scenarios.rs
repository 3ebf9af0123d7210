//! End-to-end engine scenarios: linear flows, decision routing, human
//! task suspend/resume, parallel fork/join over a shared context, and
//! retry with compensation.

use awe_core::document;
use awe_core::engine::{Engine, EngineOptions, RunStatus};
use awe_core::token::{HistoryAction, TokenStatus};
use awe_tasks::{InMemoryTaskStore, TaskPriority, TaskStatus};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

fn engine_for(doc: Value) -> Engine {
    let workflow = Arc::new(document::from_json(&doc.to_string()).expect("document loads"));
    Engine::new(workflow, EngineOptions::new(Arc::new(InMemoryTaskStore::new())))
        .expect("engine builds")
}

fn app_activity(id: Uuid, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "role_id": "system",
        "actor_type": "application",
    })
}

fn edge(id: Uuid, source: Uuid, target: Uuid) -> Value {
    json!({
        "id": id,
        "source_id": source,
        "target_id": target,
        "source_type": "activity",
        "target_type": "activity",
    })
}

// ---------------------------------------------------------------------
// Scenario: linear application flow
// ---------------------------------------------------------------------

#[tokio::test]
async fn linear_application_flow_completes_in_order() {
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let doc = json!({
        "id": Uuid::new_v4(),
        "name": "linear",
        "version": "1.0.0",
        "activities": [app_activity(a, "a"), app_activity(b, "b"), app_activity(c, "c")],
        "edges": [
            edge(Uuid::new_v4(), a, b),
            edge(Uuid::new_v4(), b, c),
        ],
    });
    let mut engine = engine_for(doc);
    engine.start(json!({})).unwrap();

    let status = engine.run_to_quiescence().await.unwrap();
    assert_eq!(status, RunStatus::Completed);

    let tokens = engine.tokens();
    assert_eq!(tokens.len(), 1);
    let token = &tokens[0];
    assert_eq!(token.status, TokenStatus::Completed);

    // entered/exited pairs appear for a, b, c in order and no retries
    // were scheduled
    let visited: Vec<Uuid> = token
        .history
        .iter()
        .filter(|h| h.action == HistoryAction::Entered)
        .filter_map(|h| h.node_id)
        .collect();
    assert_eq!(visited, vec![b, c]);
    assert!(token
        .history
        .iter()
        .all(|h| h.action != HistoryAction::RetryScheduled));

    // History is strictly ordered in time
    for pair in token.history.windows(2) {
        assert!(pair[1].timestamp > pair[0].timestamp);
    }
}

// ---------------------------------------------------------------------
// Scenario: decision routing with hit policy first
// ---------------------------------------------------------------------

fn first_policy_doc(a_ok: Uuid, a_reject: Uuid) -> Value {
    let decision = Uuid::new_v4();
    let edge_ok = Uuid::new_v4();
    let edge_reject = Uuid::new_v4();
    json!({
        "id": Uuid::new_v4(),
        "name": "routing",
        "version": "1.0.0",
        "activities": [app_activity(a_ok, "approve"), app_activity(a_reject, "reject")],
        "decision_nodes": [{
            "id": decision,
            "name": "triage",
            "decision_table": {
                "inputs": [{"name": "risk_score"}],
                "outputs": [{"name": "route"}],
                "hit_policy": "first",
                "rules": [
                    {"input_entries": ["< 30"], "output_entries": ["ok"], "output_edge_id": edge_ok},
                    {"input_entries": ["-"], "output_entries": ["reject"], "output_edge_id": edge_reject},
                ],
            },
        }],
        "edges": [
            {
                "id": edge_ok,
                "source_id": decision,
                "target_id": a_ok,
                "source_type": "decision",
                "target_type": "activity",
            },
            {
                "id": edge_reject,
                "source_id": decision,
                "target_id": a_reject,
                "source_type": "decision",
                "target_type": "activity",
                "is_default": true,
            },
        ],
    })
}

#[tokio::test]
async fn decision_first_routes_low_risk_to_ok_edge() {
    let (a_ok, a_reject) = (Uuid::new_v4(), Uuid::new_v4());
    let mut engine = engine_for(first_policy_doc(a_ok, a_reject));
    engine.start(json!({"risk_score": 15})).unwrap();

    assert_eq!(engine.run_to_quiescence().await.unwrap(), RunStatus::Completed);
    let token = &engine.tokens()[0];
    assert!(token
        .history
        .iter()
        .any(|h| h.action == HistoryAction::Entered && h.node_id == Some(a_ok)));
    assert!(!token
        .history
        .iter()
        .any(|h| h.node_id == Some(a_reject) && h.action == HistoryAction::Entered));
}

#[tokio::test]
async fn decision_first_routes_high_risk_to_reject_edge() {
    let (a_ok, a_reject) = (Uuid::new_v4(), Uuid::new_v4());
    let mut engine = engine_for(first_policy_doc(a_ok, a_reject));
    engine.start(json!({"risk_score": 80})).unwrap();

    assert_eq!(engine.run_to_quiescence().await.unwrap(), RunStatus::Completed);
    let token = &engine.tokens()[0];
    assert!(token
        .history
        .iter()
        .any(|h| h.action == HistoryAction::Entered && h.node_id == Some(a_reject)));
}

// ---------------------------------------------------------------------
// Scenario: unique hit policy ambiguity fails the run
// ---------------------------------------------------------------------

#[tokio::test]
async fn unique_ambiguity_fails_the_run() {
    let sink = Uuid::new_v4();
    let decision = Uuid::new_v4();
    let out = Uuid::new_v4();
    let doc = json!({
        "id": Uuid::new_v4(),
        "name": "ambiguous",
        "version": "1.0.0",
        "activities": [app_activity(sink, "sink")],
        "decision_nodes": [{
            "id": decision,
            "name": "overlap",
            "decision_table": {
                "inputs": [{"name": "risk_score"}],
                "outputs": [{"name": "band"}],
                "hit_policy": "unique",
                "rules": [
                    {"input_entries": ["< 60"], "output_entries": ["low"]},
                    {"input_entries": ["> 40"], "output_entries": ["high"]},
                ],
            },
        }],
        "edges": [{
            "id": out,
            "source_id": decision,
            "target_id": sink,
            "source_type": "decision",
            "target_type": "activity",
            "is_default": true,
        }],
    });
    let mut engine = engine_for(doc);
    engine.start(json!({"risk_score": 50})).unwrap();

    assert_eq!(engine.run_to_quiescence().await.unwrap(), RunStatus::Failed);
    assert_eq!(engine.tokens()[0].status, TokenStatus::Failed);
}

// ---------------------------------------------------------------------
// Scenario: human task suspend / resume
// ---------------------------------------------------------------------

#[tokio::test]
async fn human_task_suspends_and_resumes_the_token() {
    let (intake, review, finish) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let doc = json!({
        "id": Uuid::new_v4(),
        "name": "approval",
        "version": "1.0.0",
        "activities": [
            app_activity(intake, "intake"),
            {
                "id": review,
                "name": "qc_review",
                "role_id": "qc",
                "actor_type": "human",
                "priority": "high",
            },
            app_activity(finish, "finish"),
        ],
        "edges": [
            edge(Uuid::new_v4(), intake, review),
            edge(Uuid::new_v4(), review, finish),
        ],
    });
    let mut engine = engine_for(doc);
    engine.start(json!({"claim_id": "c-42"})).unwrap();

    // The run suspends on the queued task
    assert_eq!(engine.run_to_quiescence().await.unwrap(), RunStatus::Waiting);
    assert_eq!(engine.status(), RunStatus::Waiting);

    let queue = engine.queue();
    let pending = queue.pending_by_role("qc").await.unwrap();
    assert_eq!(pending.len(), 1);
    let task = &pending[0];
    assert_eq!(task.priority, TaskPriority::High);
    assert_eq!(task.activity_name, "qc_review");
    assert_eq!(task.inputs["claim_id"], json!("c-42"));

    // assign -> start -> complete wakes the token
    queue.assign(&task.id, "alice", None).await.unwrap();
    queue.start(&task.id).await.unwrap();
    queue.complete(&task.id, json!({"approved": true})).await.unwrap();

    assert_eq!(engine.run_to_quiescence().await.unwrap(), RunStatus::Completed);
    let token = &engine.tokens()[0];
    assert_eq!(token.status, TokenStatus::Completed);
    assert_eq!(token.data.get("approved"), Some(&json!(true)));

    // Replaying the completion leaves queue and token data unchanged
    queue.complete(&task.id, json!({"approved": false})).await.unwrap();
    assert_eq!(engine.run_to_quiescence().await.unwrap(), RunStatus::Completed);
    assert_eq!(engine.tokens()[0].data.get("approved"), Some(&json!(true)));
    assert_eq!(
        queue.get(&task.id).await.unwrap().outputs,
        Some(json!({"approved": true}))
    );
    assert_eq!(queue.get(&task.id).await.unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn rejected_task_routes_via_the_rejection_condition() {
    let (review, approved_path, rejected_path) =
        (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let doc = json!({
        "id": Uuid::new_v4(),
        "name": "rejection",
        "version": "1.0.0",
        "activities": [
            {
                "id": review,
                "name": "review",
                "role_id": "qc",
                "actor_type": "human",
            },
            app_activity(approved_path, "archive"),
            app_activity(rejected_path, "escalate"),
        ],
        "edges": [
            {
                "id": Uuid::new_v4(),
                "source_id": review,
                "target_id": rejected_path,
                "source_type": "activity",
                "target_type": "activity",
                "condition": "rejection_reason != null",
            },
            {
                "id": Uuid::new_v4(),
                "source_id": review,
                "target_id": approved_path,
                "source_type": "activity",
                "target_type": "activity",
                "is_default": true,
            },
        ],
    });
    let mut engine = engine_for(doc);
    engine.start(json!({})).unwrap();
    assert_eq!(engine.run_to_quiescence().await.unwrap(), RunStatus::Waiting);

    let queue = engine.queue();
    let task = queue.pending_by_role("qc").await.unwrap().remove(0);
    queue.assign(&task.id, "bob", None).await.unwrap();
    queue.start(&task.id).await.unwrap();
    queue.reject(&task.id, "incomplete paperwork").await.unwrap();

    assert_eq!(engine.run_to_quiescence().await.unwrap(), RunStatus::Completed);
    let token = &engine.tokens()[0];
    assert_eq!(
        token.data.get("rejection_reason"),
        Some(&json!("incomplete paperwork"))
    );
    assert!(token
        .history
        .iter()
        .any(|h| h.action == HistoryAction::Entered && h.node_id == Some(rejected_path)));
}

// ---------------------------------------------------------------------
// Scenario: parallel fork/join over a shared context
// ---------------------------------------------------------------------

#[tokio::test]
async fn fork_join_coalesces_siblings_and_context() {
    let (fork, left, right, join) =
        (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let context = Uuid::new_v4();
    let write_binding = json!([{ "context_id": context, "access_mode": "write" }]);
    let doc = json!({
        "id": Uuid::new_v4(),
        "name": "parallel",
        "version": "1.0.0",
        "contexts": [{
            "id": context,
            "name": "findings",
            "context_type": "data",
            "sync_pattern": "shared_state",
            "initial_value": {},
        }],
        "activities": [
            app_activity(fork, "fan_out"),
            {
                "id": left,
                "name": "left_branch",
                "role_id": "system",
                "actor_type": "application",
                "context_bindings": write_binding.clone(),
                "programs": [{"name": "main", "kind": "expression", "body": "left_done = true"}],
            },
            {
                "id": right,
                "name": "right_branch",
                "role_id": "system",
                "actor_type": "application",
                "context_bindings": write_binding.clone(),
                "programs": [{"name": "main", "kind": "expression", "body": "right_done = true"}],
            },
            app_activity(join, "fan_in"),
        ],
        "edges": [
            edge(Uuid::new_v4(), fork, left),
            edge(Uuid::new_v4(), fork, right),
            edge(Uuid::new_v4(), left, join),
            edge(Uuid::new_v4(), right, join),
        ],
    });
    let mut engine = engine_for(doc);
    engine.start(json!({})).unwrap();

    assert_eq!(engine.run_to_quiescence().await.unwrap(), RunStatus::Completed);

    // Parent plus two siblings were created; every token is accounted for
    let tokens = engine.tokens();
    assert_eq!(tokens.len(), 3);
    assert!(tokens.iter().all(|t| t.status.is_terminal()));

    // The join token carries both siblings' fields
    let parent = tokens.iter().find(|t| t.parent_token_id.is_none()).unwrap();
    assert_eq!(parent.data.get("left_done"), Some(&json!(true)));
    assert_eq!(parent.data.get("right_done"), Some(&json!(true)));
    assert!(parent
        .history
        .iter()
        .any(|h| h.action == HistoryAction::Joined));

    // The shared context holds both keys
    let findings = engine.contexts().get(&context).await.unwrap();
    assert_eq!(findings.get("left_done"), Some(&json!(true)));
    assert_eq!(findings.get("right_done"), Some(&json!(true)));
}

// ---------------------------------------------------------------------
// Scenario: retry exhaustion routes along the compensation edge
// ---------------------------------------------------------------------

#[tokio::test]
async fn retry_then_compensation() {
    let (flaky, recover) = (Uuid::new_v4(), Uuid::new_v4());
    let doc = json!({
        "id": Uuid::new_v4(),
        "name": "compensation",
        "version": "1.0.0",
        "activities": [
            {
                "id": flaky,
                "name": "flaky_step",
                "role_id": "system",
                "actor_type": "application",
                "retry": {"max_attempts": 2, "base_delay_ms": 5},
                "programs": [{"name": "main", "kind": "expression", "body": "fail \"downstream unavailable\""}],
            },
            app_activity(recover, "compensate"),
        ],
        "edges": [{
            "id": Uuid::new_v4(),
            "source_id": flaky,
            "target_id": recover,
            "source_type": "activity",
            "target_type": "activity",
            "is_compensation": true,
        }],
    });
    let mut engine = engine_for(doc);
    engine.start(json!({})).unwrap();

    assert_eq!(engine.run_to_quiescence().await.unwrap(), RunStatus::Completed);
    let token = &engine.tokens()[0];

    // Exactly two dispatches: one retry was scheduled between them
    let retries = token
        .history
        .iter()
        .filter(|h| h.action == HistoryAction::RetryScheduled)
        .count();
    assert_eq!(retries, 1);
    assert_eq!(
        token.data.get("failure_reason"),
        Some(&json!("downstream unavailable"))
    );
    assert!(token
        .history
        .iter()
        .any(|h| h.action == HistoryAction::Entered && h.node_id == Some(recover)));
    assert_eq!(token.status, TokenStatus::Completed);
}

// ---------------------------------------------------------------------
// Cancellation and failure edges
// ---------------------------------------------------------------------

#[tokio::test]
async fn cancel_expires_outstanding_human_tasks() {
    let review = Uuid::new_v4();
    let doc = json!({
        "id": Uuid::new_v4(),
        "name": "cancel",
        "version": "1.0.0",
        "activities": [{
            "id": review,
            "name": "review",
            "role_id": "qc",
            "actor_type": "human",
        }],
    });
    let mut engine = engine_for(doc);
    engine.start(json!({})).unwrap();
    assert_eq!(engine.run_to_quiescence().await.unwrap(), RunStatus::Waiting);

    let queue = engine.queue();
    let task = queue.pending_by_role("qc").await.unwrap().remove(0);

    engine.cancel().await.unwrap();
    assert_eq!(engine.status(), RunStatus::Cancelled);
    assert_eq!(queue.get(&task.id).await.unwrap().status, TaskStatus::Expired);
    assert_eq!(engine.tokens()[0].status, TokenStatus::Cancelled);
}

#[tokio::test]
async fn no_valid_edge_fails_the_token() {
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let doc = json!({
        "id": Uuid::new_v4(),
        "name": "dead_end",
        "version": "1.0.0",
        "activities": [app_activity(a, "a"), app_activity(b, "b"), app_activity(c, "c")],
        "edges": [
            {
                "id": Uuid::new_v4(),
                "source_id": a,
                "target_id": b,
                "source_type": "activity",
                "target_type": "activity",
                "condition": "score > 10",
            },
            {
                "id": Uuid::new_v4(),
                "source_id": a,
                "target_id": c,
                "source_type": "activity",
                "target_type": "activity",
                "condition": "score < 5",
            },
        ],
    });
    let mut engine = engine_for(doc);
    engine.start(json!({"score": 7})).unwrap();

    assert_eq!(engine.run_to_quiescence().await.unwrap(), RunStatus::Failed);
}

// ---------------------------------------------------------------------
// Events and sub-workflows
// ---------------------------------------------------------------------

#[tokio::test]
async fn start_and_end_events_bracket_the_run() {
    let (start, work, end) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let doc = json!({
        "id": Uuid::new_v4(),
        "name": "events",
        "version": "1.0.0",
        "events": [
            {"id": start, "name": "begin", "kind": "start"},
            {"id": end, "name": "done", "kind": "end"},
        ],
        "activities": [app_activity(work, "work")],
        "edges": [
            {
                "id": Uuid::new_v4(),
                "source_id": start,
                "target_id": work,
                "source_type": "event",
                "target_type": "activity",
            },
            {
                "id": Uuid::new_v4(),
                "source_id": work,
                "target_id": end,
                "source_type": "activity",
                "target_type": "event",
            },
        ],
    });
    let mut engine = engine_for(doc);
    engine.start(json!({})).unwrap();

    assert_eq!(engine.run_to_quiescence().await.unwrap(), RunStatus::Completed);
    let token = &engine.tokens()[0];
    assert!(token.reached_end);
}

#[tokio::test]
async fn sub_workflow_expansion_runs_nested_and_absorbs_outputs() {
    // Child workflow: one application activity producing a verdict
    let child_id = Uuid::new_v4();
    let child_step = Uuid::new_v4();
    let child_doc = json!({
        "id": child_id,
        "name": "child",
        "version": "1.0.0",
        "activities": [{
            "id": child_step,
            "name": "child_step",
            "role_id": "system",
            "actor_type": "application",
            "programs": [{"name": "main", "kind": "expression", "body": "verdict = \"nested\""}],
        }],
    });
    let child = Arc::new(document::from_json(&child_doc.to_string()).unwrap());

    let (expander, after) = (Uuid::new_v4(), Uuid::new_v4());
    let parent_doc = json!({
        "id": Uuid::new_v4(),
        "name": "parent",
        "version": "1.0.0",
        "activities": [
            {
                "id": expander,
                "name": "expand",
                "role_id": "system",
                "actor_type": "application",
                "expands_to": child_id,
            },
            app_activity(after, "after"),
        ],
        "edges": [edge(Uuid::new_v4(), expander, after)],
    });
    let mut engine = engine_for(parent_doc);
    engine.register_workflow(child);
    engine.start(json!({"seed": 1})).unwrap();

    assert_eq!(engine.run_to_quiescence().await.unwrap(), RunStatus::Completed);
    let token = &engine.tokens()[0];
    assert_eq!(token.data.get("verdict"), Some(&json!("nested")));
    assert_eq!(token.data.get("seed"), Some(&json!(1)));
}

// ---------------------------------------------------------------------
// Universal invariant: token accounting
// ---------------------------------------------------------------------

#[tokio::test]
async fn every_created_token_lands_in_exactly_one_status() {
    let (fork, left, right, join) =
        (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let doc = json!({
        "id": Uuid::new_v4(),
        "name": "accounting",
        "version": "1.0.0",
        "activities": [
            app_activity(fork, "fork"),
            app_activity(left, "left"),
            app_activity(right, "right"),
            app_activity(join, "join"),
        ],
        "edges": [
            edge(Uuid::new_v4(), fork, left),
            edge(Uuid::new_v4(), fork, right),
            edge(Uuid::new_v4(), left, join),
            edge(Uuid::new_v4(), right, join),
        ],
    });
    let mut engine = engine_for(doc);
    engine.start(json!({})).unwrap();
    engine.run_to_quiescence().await.unwrap();

    let tokens = engine.tokens();
    let counted = tokens
        .iter()
        .filter(|t| {
            matches!(
                t.status,
                TokenStatus::Active
                    | TokenStatus::Waiting
                    | TokenStatus::Completed
                    | TokenStatus::Failed
                    | TokenStatus::Cancelled
            )
        })
        .count();
    assert_eq!(counted, tokens.len());
}
