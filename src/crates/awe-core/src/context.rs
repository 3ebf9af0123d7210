//! Shared context store
//!
//! Holds the current value of every context declared by a workflow for
//! the duration of one run. Each context carries a single-writer,
//! many-reader lock; operations that touch several contexts acquire locks
//! in ascending context-id order so concurrent strategy calls cannot
//! deadlock.
//!
//! The declared `sync_pattern` decides write/read semantics:
//!
//! - `shared_state` — plain read/replace; `merge` is a shallow object merge
//! - `message_passing` — writes append to a queue; readers drain it
//! - `blackboard` — writes accumulate into a set; readers see the union
//! - `event_sourcing` — writes append immutable events; readers fold
//!
//! When a context declares a JSON schema, every `set`/`merge` validates
//! the candidate value *before* mutating; a mismatch fails the write and
//! leaves the previous value intact. Every committed write is broadcast
//! to subscribers with a per-context monotonic sequence number, so any
//! reader observes a prefix of the written sequence.

use chrono::{DateTime, Utc};
use jsonschema::JSONSchema;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tracing::trace;
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::graph::{ContextBinding, ContextDecl, Lifecycle, SyncPattern};

/// Notification delivered to context subscribers.
#[derive(Debug, Clone)]
pub struct ContextEvent {
    pub context_id: Uuid,
    /// The value as visible after the write
    pub value: Value,
    /// Per-context monotonic sequence number, starting at 1
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum Slot {
    Shared(Value),
    Queue(VecDeque<Value>),
    Board(Vec<Value>),
    Log(Vec<Value>),
}

impl Slot {
    fn new(pattern: SyncPattern, initial: Option<&Value>) -> Self {
        match pattern {
            SyncPattern::SharedState => {
                Slot::Shared(initial.cloned().unwrap_or(Value::Null))
            }
            SyncPattern::MessagePassing => Slot::Queue(VecDeque::new()),
            SyncPattern::Blackboard => Slot::Board(Vec::new()),
            SyncPattern::EventSourcing => Slot::Log(Vec::new()),
        }
    }

    /// Non-draining view of the current state.
    fn view(&self, initial: Option<&Value>) -> Value {
        match self {
            Slot::Shared(v) => v.clone(),
            Slot::Queue(q) => Value::Array(q.iter().cloned().collect()),
            Slot::Board(set) => Value::Array(set.clone()),
            Slot::Log(events) => fold_events(initial, events),
        }
    }
}

/// Reconstruct event-sourced state: object events shallow-merge over the
/// initial value in append order.
fn fold_events(initial: Option<&Value>, events: &[Value]) -> Value {
    let mut state = initial.cloned().unwrap_or(Value::Object(Map::new()));
    for event in events {
        match (&mut state, event) {
            (Value::Object(acc), Value::Object(delta)) => {
                for (k, v) in delta {
                    acc.insert(k.clone(), v.clone());
                }
            }
            (acc, other) => *acc = other.clone(),
        }
    }
    state
}

struct Inner {
    slot: Slot,
    seq: u64,
    last_write: Option<Instant>,
}

struct ContextEntry {
    decl: ContextDecl,
    schema: Option<JSONSchema>,
    state: RwLock<Inner>,
    events: broadcast::Sender<ContextEvent>,
}

impl ContextEntry {
    fn validate(&self, candidate: &Value) -> Result<()> {
        if let Some(schema) = &self.schema {
            if let Err(errors) = schema.validate(candidate) {
                let reasons: Vec<String> = errors.map(|e| e.to_string()).collect();
                return Err(WorkflowError::ContextSchema {
                    context: self.decl.name.clone(),
                    reason: reasons.join("; "),
                });
            }
        }
        Ok(())
    }

    fn expired(&self, inner: &Inner) -> bool {
        match (self.decl.ttl_ms, inner.last_write) {
            (Some(ttl), Some(at)) => at.elapsed() > Duration::from_millis(ttl),
            _ => false,
        }
    }

    fn notify(&self, inner: &Inner) {
        // No subscribers is fine; state is authoritative either way.
        let _ = self.events.send(ContextEvent {
            context_id: self.decl.id,
            value: inner.slot.view(self.decl.initial_value.as_ref()),
            seq: inner.seq,
            timestamp: Utc::now(),
        });
    }
}

/// Run-scoped store of every declared context.
///
/// Entries live in a `BTreeMap` so multi-context operations lock in
/// ascending id order.
pub struct ContextStore {
    entries: BTreeMap<Uuid, Arc<ContextEntry>>,
    owner_workflow_id: Uuid,
}

impl ContextStore {
    /// Build the store for one run, compiling declared schemas and
    /// validating initial values.
    pub fn new(owner_workflow_id: Uuid, decls: &[ContextDecl]) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for decl in decls {
            let schema = match &decl.schema {
                Some(raw) => Some(JSONSchema::compile(raw).map_err(|e| {
                    WorkflowError::Validation(format!(
                        "context '{}' has an invalid schema: {e}",
                        decl.name
                    ))
                })?),
                None => None,
            };
            let entry = ContextEntry {
                decl: decl.clone(),
                schema,
                state: RwLock::new(Inner {
                    slot: Slot::new(decl.sync_pattern, decl.initial_value.as_ref()),
                    seq: 0,
                    last_write: None,
                }),
                events: broadcast::channel(64).0,
            };
            if let Some(initial) = &decl.initial_value {
                entry.validate(initial)?;
            }
            entries.insert(decl.id, Arc::new(entry));
        }
        Ok(Self {
            entries,
            owner_workflow_id,
        })
    }

    fn entry(&self, id: &Uuid) -> Result<&Arc<ContextEntry>> {
        self.entries
            .get(id)
            .ok_or_else(|| WorkflowError::reference("context", id.to_string()))
    }

    pub fn declares(&self, id: &Uuid) -> bool {
        self.entries.contains_key(id)
    }

    /// Current value without consuming queued messages.
    pub async fn get(&self, id: &Uuid) -> Result<Value> {
        let entry = self.entry(id)?;
        if entry.decl.ttl_ms.is_some() {
            // TTL check needs the write side to reset an expired value.
            let mut inner = entry.state.write().await;
            if entry.expired(&inner) {
                inner.slot = Slot::new(entry.decl.sync_pattern, entry.decl.initial_value.as_ref());
                inner.last_write = None;
            }
            return Ok(inner.slot.view(entry.decl.initial_value.as_ref()));
        }
        let inner = entry.state.read().await;
        Ok(inner.slot.view(entry.decl.initial_value.as_ref()))
    }

    /// Consume queued messages of a `message_passing` context. Other
    /// patterns return their view without mutation.
    pub async fn drain(&self, id: &Uuid) -> Result<Vec<Value>> {
        let entry = self.entry(id)?;
        let mut inner = entry.state.write().await;
        match &mut inner.slot {
            Slot::Queue(q) => Ok(q.drain(..).collect()),
            other => Ok(match other.view(entry.decl.initial_value.as_ref()) {
                Value::Array(items) => items,
                single => vec![single],
            }),
        }
    }

    /// Full replacement (or append, for accumulating patterns). Validates
    /// against the declared schema before mutating.
    pub async fn set(&self, id: &Uuid, value: Value) -> Result<()> {
        let entry = self.entry(id)?;
        entry.validate(&value)?;
        let mut inner = entry.state.write().await;
        write_slot(&mut inner.slot, value);
        commit(entry, &mut inner);
        Ok(())
    }

    /// Shallow merge for object-valued `shared_state` contexts; other
    /// shapes and patterns behave like [`set`](Self::set). Atomic with
    /// respect to concurrent `get`.
    pub async fn merge(&self, id: &Uuid, partial: Value) -> Result<()> {
        let entry = self.entry(id)?;
        let mut inner = entry.state.write().await;
        let candidate = match (&inner.slot, &partial) {
            (Slot::Shared(Value::Object(current)), Value::Object(delta)) => {
                let mut merged = current.clone();
                for (k, v) in delta {
                    merged.insert(k.clone(), v.clone());
                }
                Value::Object(merged)
            }
            _ => partial,
        };
        // Validate the post-merge value while still holding the lock, so
        // a failure leaves the previous value visible.
        entry.validate(&candidate)?;
        write_slot(&mut inner.slot, candidate);
        commit(entry, &mut inner);
        Ok(())
    }

    /// Publish an event to an event-stream context. Equivalent to `set`
    /// but named for `publish`-bound activities.
    pub async fn publish(&self, id: &Uuid, event: Value) -> Result<()> {
        self.set(id, event).await
    }

    /// Subscribe to committed writes.
    pub fn subscribe(&self, id: &Uuid) -> Result<broadcast::Receiver<ContextEvent>> {
        Ok(self.entry(id)?.events.subscribe())
    }

    /// Snapshot the values of `ids` under read locks taken in ascending
    /// id order. Used to give decision evaluation a consistent view.
    pub async fn snapshot(&self, ids: &[Uuid]) -> Result<Vec<(ContextDecl, Value)>> {
        let mut sorted: Vec<Uuid> = ids.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut out = Vec::with_capacity(sorted.len());
        for id in sorted {
            let entry = self.entry(&id)?;
            let value = self.get(&id).await?;
            out.push((entry.decl.clone(), value));
        }
        Ok(out)
    }

    /// Snapshot every declared context in id order.
    pub async fn snapshot_all(&self) -> Vec<(ContextDecl, Value)> {
        let mut out = Vec::with_capacity(self.entries.len());
        for (id, entry) in &self.entries {
            if let Ok(value) = self.get(id).await {
                out.push((entry.decl.clone(), value));
            }
        }
        out
    }

    /// Apply a strategy's outputs to its write-bound contexts. Bindings
    /// are processed in ascending context-id order; each context's
    /// candidate value is validated before that context mutates, so a
    /// schema failure leaves the failing context untouched.
    pub async fn apply_outputs(
        &self,
        bindings: &[ContextBinding],
        outputs: &Map<String, Value>,
    ) -> Result<()> {
        if outputs.is_empty() {
            return Ok(());
        }
        let mut writable: Vec<&ContextBinding> =
            bindings.iter().filter(|b| b.access_mode.writes()).collect();
        writable.sort_by_key(|b| b.context_id);
        for binding in writable {
            trace!(context_id = %binding.context_id, "applying strategy outputs");
            self.merge(&binding.context_id, Value::Object(outputs.clone()))
                .await?;
        }
        Ok(())
    }

    /// End-of-run split: ephemeral contexts are discarded, persistent
    /// values survive keyed by the owning workflow.
    pub async fn finish(&self) -> HashMap<(Uuid, Uuid), Value> {
        let mut persisted = HashMap::new();
        for (id, entry) in &self.entries {
            if entry.decl.lifecycle == Lifecycle::Persistent {
                if let Ok(value) = self.get(id).await {
                    persisted.insert((self.owner_workflow_id, *id), value);
                }
            }
        }
        persisted
    }
}

fn write_slot(slot: &mut Slot, value: Value) {
    match slot {
        Slot::Shared(current) => *current = value,
        Slot::Queue(q) => q.push_back(value),
        Slot::Board(set) => {
            if !set.contains(&value) {
                set.push(value);
            }
        }
        Slot::Log(events) => events.push(value),
    }
}

fn commit(entry: &ContextEntry, inner: &mut Inner) {
    inner.seq += 1;
    inner.last_write = Some(Instant::now());
    entry.notify(inner);
}
