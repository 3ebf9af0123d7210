//! Workflow graph model
//!
//! Typed in-memory representation of a workflow: activities, decision
//! nodes, events, conditional edges and shared-context declarations. A
//! [`Workflow`] is built once from a validated document
//! ([`crate::document`]) and is immutable for the duration of a run; the
//! engine only reads it.
//!
//! Activities and contexts live in id-keyed side tables and reference each
//! other by id only, so the graph carries no owning pointers in both
//! directions. Node lookup is O(1) and outbound-edge iteration is
//! O(out-degree).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use awe_tasks::TaskPriority;

use crate::error::{Result, WorkflowError};
use crate::expr::Expr;

/// Node identifier. All workflow entities carry 128-bit ids rendered in
/// canonical 8-4-4-4-12 form.
pub type NodeId = Uuid;

/// The executing entity behind an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Human,
    AiAgent,
    Robot,
    Application,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::AiAgent => "ai_agent",
            Self::Robot => "robot",
            Self::Application => "application",
        }
    }
}

/// How an activity touches a bound context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
    Subscribe,
    Publish,
}

impl AccessMode {
    /// Shared lock side: the binding reads context state.
    pub fn reads(&self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite | Self::Subscribe)
    }

    /// Exclusive lock side: the binding mutates context state.
    pub fn writes(&self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite | Self::Publish)
    }
}

/// Binding between an activity and a declared context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextBinding {
    pub context_id: Uuid,
    pub access_mode: AccessMode,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramKind {
    /// Assignment script executed by the application strategy
    Expression,
    /// MCP tool reference; invoked in simulation when no transport exists
    McpTool,
}

/// Code body or tool reference carried by an activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Program {
    pub name: String,
    pub kind: ProgramKind,
    pub body: String,
}

/// Per-activity service-level deadline. Breaching it raises a timeout,
/// treated as a retryable failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Sla {
    pub max_duration_ms: u64,
}

/// Per-activity retry override; unset fields fall back to the engine
/// defaults.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
}

/// A unit of work attributed to one actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Activity {
    pub id: NodeId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub role_id: String,
    pub actor_type: ActorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_bindings: Vec<ContextBinding>,
    /// Descriptive only; the engine does not enforce these
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_rights: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub programs: Vec<Program>,
    /// Input names resolved from token data and read-bound contexts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    /// JSON schema describing the structured outputs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_requirements: Vec<String>,
    /// Queue priority of the human task created for this activity
    #[serde(default)]
    pub priority: TaskPriority,
    /// Human task deadline, relative to task creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_in_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla: Option<Sla>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryOverride>,
    /// Expansion into a nested workflow run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expands_to: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytics: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Node kind an edge endpoint refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Activity,
    Decision,
    Event,
}

/// Directed, optionally conditional transition between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Edge {
    pub id: Uuid,
    pub source_id: NodeId,
    pub target_id: NodeId,
    pub source_type: NodeType,
    pub target_type: NodeType,
    /// Boolean expression over token data and bound contexts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    /// Failure reroute target for the source node
    #[serde(default)]
    pub is_compensation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Document,
    Data,
    Config,
    State,
    Memory,
    Artifact,
}

/// Collaboration semantics of a context (§ context store).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPattern {
    #[default]
    SharedState,
    MessagePassing,
    Blackboard,
    EventSourcing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    #[default]
    Workflow,
    Collection,
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Ephemeral,
    Persistent,
}

/// Declaration of a named shared-state slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextDecl {
    pub id: Uuid,
    pub name: String,
    pub context_type: ContextType,
    #[serde(default)]
    pub sync_pattern: SyncPattern,
    /// JSON schema the current value must conform to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<Value>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Intermediate,
    End,
}

/// Lifecycle marker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Event {
    pub id: NodeId,
    pub name: String,
    pub kind: EventKind,
}

/// Rule-selection discipline of a decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitPolicy {
    Unique,
    First,
    Priority,
    Any,
    Collect,
    RuleOrder,
}

/// Aggregation applied to `collect` results; absent means "return the
/// list".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregator {
    Sum,
    Min,
    Max,
    Count,
}

/// Input column of a decision table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionInput {
    pub name: String,
    /// Lookup path into token data / contexts; defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl DecisionInput {
    pub fn source(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }
}

/// Output column of a decision table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionOutput {
    pub name: String,
    /// Ordered value enumeration for the `priority` hit policy; first is
    /// highest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priorities: Option<Vec<Value>>,
}

/// One rule row. `input_entries` align with the table's input columns,
/// `output_entries` with the output columns. Output entries are JSON
/// constants; strings prefixed with `=` are evaluated as value
/// expressions (literal or lookup path) against the decision scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionRule {
    pub input_entries: Vec<String>,
    pub output_entries: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_edge_id: Option<Uuid>,
}

/// DMN-style rule table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionTable {
    pub inputs: Vec<DecisionInput>,
    pub outputs: Vec<DecisionOutput>,
    pub hit_policy: HitPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregator: Option<Aggregator>,
    pub rules: Vec<DecisionRule>,
}

/// A node holding a decision table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionNode {
    pub id: NodeId,
    pub name: String,
    pub decision_table: DecisionTable,
}

/// Serialized workflow document. Round-trips byte-identically modulo key
/// ordering; ids are preserved. Unknown fields are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDocument {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activities: Vec<Activity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub decision_nodes: Vec<DecisionNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contexts: Vec<ContextDecl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytics: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Reference to a resolved node.
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Activity(&'a Activity),
    Decision(&'a DecisionNode),
    Event(&'a Event),
}

impl NodeRef<'_> {
    pub fn id(&self) -> NodeId {
        match self {
            NodeRef::Activity(a) => a.id,
            NodeRef::Decision(d) => d.id,
            NodeRef::Event(e) => e.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            NodeRef::Activity(a) => &a.name,
            NodeRef::Decision(d) => &d.name,
            NodeRef::Event(e) => &e.name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeSlot {
    Activity(usize),
    Decision(usize),
    Event(usize),
}

/// Validated, indexed workflow graph. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Workflow {
    doc: WorkflowDocument,
    nodes: HashMap<NodeId, NodeSlot>,
    outbound: HashMap<NodeId, Vec<usize>>,
    inbound: HashMap<NodeId, Vec<usize>>,
    starts: Vec<NodeId>,
}

impl Workflow {
    /// Index and validate a document. Checks, in order: id uniqueness,
    /// edge endpoint resolution, context binding resolution, edge
    /// condition syntax, and the single-default-edge invariant on
    /// decision nodes.
    pub fn from_document(doc: WorkflowDocument) -> Result<Self> {
        let mut nodes = HashMap::new();
        for (i, a) in doc.activities.iter().enumerate() {
            if nodes.insert(a.id, NodeSlot::Activity(i)).is_some() {
                return Err(WorkflowError::Validation(format!("duplicate node id {}", a.id)));
            }
        }
        for (i, d) in doc.decision_nodes.iter().enumerate() {
            if nodes.insert(d.id, NodeSlot::Decision(i)).is_some() {
                return Err(WorkflowError::Validation(format!("duplicate node id {}", d.id)));
            }
        }
        for (i, e) in doc.events.iter().enumerate() {
            if nodes.insert(e.id, NodeSlot::Event(i)).is_some() {
                return Err(WorkflowError::Validation(format!("duplicate node id {}", e.id)));
            }
        }

        let context_ids: HashMap<Uuid, ()> = doc.contexts.iter().map(|c| (c.id, ())).collect();
        if context_ids.len() != doc.contexts.len() {
            return Err(WorkflowError::Validation("duplicate context id".into()));
        }

        let mut outbound: HashMap<NodeId, Vec<usize>> = HashMap::new();
        let mut inbound: HashMap<NodeId, Vec<usize>> = HashMap::new();
        for (i, edge) in doc.edges.iter().enumerate() {
            if !nodes.contains_key(&edge.source_id) {
                return Err(WorkflowError::reference("node", edge.source_id.to_string()));
            }
            if !nodes.contains_key(&edge.target_id) {
                return Err(WorkflowError::reference("node", edge.target_id.to_string()));
            }
            if let Some(condition) = &edge.condition {
                Expr::parse_condition(condition).map_err(|e| {
                    WorkflowError::Validation(format!("edge {}: {e}", edge.id))
                })?;
            }
            outbound.entry(edge.source_id).or_default().push(i);
            inbound.entry(edge.target_id).or_default().push(i);
        }

        for activity in &doc.activities {
            for binding in &activity.context_bindings {
                if !context_ids.contains_key(&binding.context_id) {
                    return Err(WorkflowError::reference(
                        "context",
                        binding.context_id.to_string(),
                    ));
                }
            }
        }

        // From a decision node with outbound edges, exactly one edge is
        // the default.
        for decision in &doc.decision_nodes {
            let defaults = outbound
                .get(&decision.id)
                .map(|edges| {
                    edges
                        .iter()
                        .filter(|&&i| doc.edges[i].is_default)
                        .count()
                })
                .unwrap_or(0);
            if outbound.get(&decision.id).is_some() && defaults != 1 {
                return Err(WorkflowError::Validation(format!(
                    "decision node '{}' must have exactly one default outbound edge, found {defaults}",
                    decision.name
                )));
            }
        }

        let starts = compute_starts(&doc, &inbound);
        if starts.is_empty() && !nodes.is_empty() {
            return Err(WorkflowError::Validation(
                "workflow has no start event and no source node".into(),
            ));
        }

        Ok(Self {
            doc,
            nodes,
            outbound,
            inbound,
            starts,
        })
    }

    pub fn id(&self) -> Uuid {
        self.doc.id
    }

    pub fn name(&self) -> &str {
        &self.doc.name
    }

    pub fn document(&self) -> &WorkflowDocument {
        &self.doc
    }

    /// O(1) node lookup.
    pub fn node(&self, id: &NodeId) -> Option<NodeRef<'_>> {
        self.nodes.get(id).map(|slot| match slot {
            NodeSlot::Activity(i) => NodeRef::Activity(&self.doc.activities[*i]),
            NodeSlot::Decision(i) => NodeRef::Decision(&self.doc.decision_nodes[*i]),
            NodeSlot::Event(i) => NodeRef::Event(&self.doc.events[*i]),
        })
    }

    /// Outbound edges of a node, in declaration order.
    pub fn outbound(&self, id: &NodeId) -> impl Iterator<Item = &Edge> {
        self.outbound
            .get(id)
            .into_iter()
            .flatten()
            .map(|&i| &self.doc.edges[i])
    }

    pub fn inbound_count(&self, id: &NodeId) -> usize {
        self.inbound.get(id).map(|v| v.len()).unwrap_or(0)
    }

    pub fn edge(&self, id: &Uuid) -> Option<&Edge> {
        self.doc.edges.iter().find(|e| e.id == *id)
    }

    /// Start nodes: explicit start events when declared, otherwise nodes
    /// with no inbound edge.
    pub fn start_nodes(&self) -> &[NodeId] {
        &self.starts
    }

    pub fn contexts(&self) -> &[ContextDecl] {
        &self.doc.contexts
    }

    pub fn context(&self, id: &Uuid) -> Option<&ContextDecl> {
        self.doc.contexts.iter().find(|c| c.id == *id)
    }

    pub fn activities(&self) -> &[Activity] {
        &self.doc.activities
    }
}

fn compute_starts(doc: &WorkflowDocument, inbound: &HashMap<NodeId, Vec<usize>>) -> Vec<NodeId> {
    let start_events: Vec<NodeId> = doc
        .events
        .iter()
        .filter(|e| e.kind == EventKind::Start)
        .map(|e| e.id)
        .collect();
    if !start_events.is_empty() {
        return start_events;
    }
    let mut sourceless: Vec<NodeId> = Vec::new();
    for a in &doc.activities {
        if !inbound.contains_key(&a.id) {
            sourceless.push(a.id);
        }
    }
    for d in &doc.decision_nodes {
        if !inbound.contains_key(&d.id) {
            sourceless.push(d.id);
        }
    }
    for e in &doc.events {
        if !inbound.contains_key(&e.id) {
            sourceless.push(e.id);
        }
    }
    sourceless
}
