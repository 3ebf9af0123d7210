//! Decision table evaluation
//!
//! Evaluates DMN-style rule tables against a name-resolution scope
//! (token data first, then bound contexts). Each rule's input entries are
//! unary expressions in the language of [`crate::expr`]; a rule matches
//! iff every input-column entry is true for that column's resolved value.
//!
//! The hit policy picks among matching rules:
//!
//! | Policy       | Semantics                                             |
//! |--------------|-------------------------------------------------------|
//! | `unique`     | exactly one match, else [`DecisionError`]             |
//! | `first`      | first match in declaration order                      |
//! | `priority`   | match with the highest declared output priority       |
//! | `any`        | matches must agree; unequal outputs fail              |
//! | `collect`    | all matching outputs as a list, optionally aggregated |
//! | `rule_order` | all matching outputs in declaration order             |
//!
//! Results either name outbound edges directly (`output_edge_id` on the
//! matched rules) or merge outputs into token data, leaving routing to
//! the edge conditions.

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::expr::{Expr, ExprError, Scope, ValueExpr};
use crate::graph::{Aggregator, DecisionTable, HitPolicy};

/// Decision evaluation failure. Fails the enclosing token.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecisionError {
    /// No rule matched under a policy that requires one (`unique`, `any`)
    #[error("no rule matched (hit policy {policy:?})")]
    NoMatch { policy: HitPolicy },

    /// More than one rule matched under `unique`
    #[error("{matched} rules matched under hit policy unique")]
    Ambiguous { matched: usize },

    /// Matching rules disagree under `any`
    #[error("matching rules produced unequal outputs under hit policy any")]
    Inconsistent,

    /// An input or output entry failed to parse
    #[error(transparent)]
    Malformed(#[from] ExprError),

    /// Rule arity does not line up with the declared columns
    #[error("rule {rule} has {found} entries, table declares {expected} columns")]
    Shape {
        rule: usize,
        expected: usize,
        found: usize,
    },
}

/// Result of one table evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionOutcome {
    /// Outputs to merge into token data (empty when the table routes by
    /// edge ids, or when a tolerant policy matched nothing)
    pub outputs: Map<String, Value>,
    /// Outbound edges selected by the matched rules
    pub edges: Vec<Uuid>,
}

impl DecisionOutcome {
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.edges.is_empty()
    }
}

/// Evaluate a table against a resolution scope.
///
/// The scope must stay consistent for the duration of the call; the
/// engine passes a snapshot of token data and referenced contexts.
pub fn evaluate(table: &DecisionTable, scope: &dyn Scope) -> Result<DecisionOutcome, DecisionError> {
    let inputs: Vec<Option<Value>> = table
        .inputs
        .iter()
        .map(|input| scope.lookup(input.source()))
        .collect();

    let mut matched: Vec<usize> = Vec::new();
    for (ri, rule) in table.rules.iter().enumerate() {
        if rule.input_entries.len() != table.inputs.len() {
            return Err(DecisionError::Shape {
                rule: ri,
                expected: table.inputs.len(),
                found: rule.input_entries.len(),
            });
        }
        let mut all = true;
        for (entry, input) in rule.input_entries.iter().zip(&inputs) {
            let expr = Expr::parse_entry(entry)?;
            if !expr.eval(input.as_ref(), scope) {
                all = false;
                break;
            }
        }
        if all {
            matched.push(ri);
        }
    }

    match table.hit_policy {
        HitPolicy::Unique => match matched.len() {
            0 => Err(DecisionError::NoMatch {
                policy: HitPolicy::Unique,
            }),
            1 => single_outcome(table, matched[0], scope),
            n => Err(DecisionError::Ambiguous { matched: n }),
        },
        HitPolicy::First => match matched.first() {
            Some(&ri) => single_outcome(table, ri, scope),
            None => Ok(DecisionOutcome::default()),
        },
        HitPolicy::Priority => match pick_by_priority(table, &matched, scope)? {
            Some(ri) => single_outcome(table, ri, scope),
            None => Ok(DecisionOutcome::default()),
        },
        HitPolicy::Any => {
            if matched.is_empty() {
                return Err(DecisionError::NoMatch {
                    policy: HitPolicy::Any,
                });
            }
            let first = rule_outputs(table, matched[0], scope)?;
            for &ri in &matched[1..] {
                if rule_outputs(table, ri, scope)? != first {
                    return Err(DecisionError::Inconsistent);
                }
            }
            single_outcome(table, matched[0], scope)
        }
        HitPolicy::Collect => collected_outcome(table, &matched, scope, table.aggregator),
        HitPolicy::RuleOrder => collected_outcome(table, &matched, scope, None),
    }
}

/// Evaluate one rule's output entries against the scope. Entries are JSON
/// constants; strings prefixed with `=` evaluate as value expressions.
fn rule_outputs(
    table: &DecisionTable,
    rule_index: usize,
    scope: &dyn Scope,
) -> Result<Vec<Value>, DecisionError> {
    let rule = &table.rules[rule_index];
    if rule.output_entries.len() != table.outputs.len() {
        return Err(DecisionError::Shape {
            rule: rule_index,
            expected: table.outputs.len(),
            found: rule.output_entries.len(),
        });
    }
    rule.output_entries
        .iter()
        .map(|entry| match entry {
            Value::String(s) if s.starts_with('=') => {
                Ok(ValueExpr::parse(&s[1..])?.eval(scope))
            }
            constant => Ok(constant.clone()),
        })
        .collect()
}

fn single_outcome(
    table: &DecisionTable,
    rule_index: usize,
    scope: &dyn Scope,
) -> Result<DecisionOutcome, DecisionError> {
    let values = rule_outputs(table, rule_index, scope)?;
    let mut outcome = DecisionOutcome::default();
    if let Some(edge) = table.rules[rule_index].output_edge_id {
        outcome.edges.push(edge);
    } else {
        for (column, value) in table.outputs.iter().zip(values) {
            outcome.outputs.insert(column.name.clone(), value);
        }
    }
    Ok(outcome)
}

fn collected_outcome(
    table: &DecisionTable,
    matched: &[usize],
    scope: &dyn Scope,
    aggregator: Option<Aggregator>,
) -> Result<DecisionOutcome, DecisionError> {
    let mut outcome = DecisionOutcome::default();
    let mut columns: Vec<Vec<Value>> = vec![Vec::new(); table.outputs.len()];
    let mut routes_by_edge = false;

    for &ri in matched {
        if let Some(edge) = table.rules[ri].output_edge_id {
            routes_by_edge = true;
            if !outcome.edges.contains(&edge) {
                outcome.edges.push(edge);
            }
        } else {
            for (ci, value) in rule_outputs(table, ri, scope)?.into_iter().enumerate() {
                columns[ci].push(value);
            }
        }
    }

    if !routes_by_edge {
        for (column, values) in table.outputs.iter().zip(columns) {
            let value = match aggregator {
                None => Value::Array(values),
                Some(Aggregator::Count) => Value::from(values.len()),
                Some(agg) => aggregate_numeric(agg, &values),
            };
            outcome.outputs.insert(column.name.clone(), value);
        }
    }
    Ok(outcome)
}

// Non-numeric entries are skipped by sum/min/max; an empty column
// aggregates to null.
fn aggregate_numeric(agg: Aggregator, values: &[Value]) -> Value {
    let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
    if numbers.is_empty() {
        return Value::Null;
    }
    let result = match agg {
        Aggregator::Sum => numbers.iter().sum(),
        Aggregator::Min => numbers.iter().cloned().fold(f64::INFINITY, f64::min),
        Aggregator::Max => numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        Aggregator::Count => unreachable!("count handled by caller"),
    };
    serde_json::Number::from_f64(result)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Pick the matched rule whose output carries the highest declared
/// priority. The first output column with a `priorities` enumeration
/// ranks rules; earlier entries rank higher. Rules whose output value is
/// not enumerated rank last; ties resolve in declaration order.
fn pick_by_priority(
    table: &DecisionTable,
    matched: &[usize],
    scope: &dyn Scope,
) -> Result<Option<usize>, DecisionError> {
    if matched.is_empty() {
        return Ok(None);
    }
    let ranked_column = table
        .outputs
        .iter()
        .position(|o| o.priorities.is_some());
    let Some(ci) = ranked_column else {
        // No enumeration declared: declaration order decides
        return Ok(Some(matched[0]));
    };
    let priorities = table.outputs[ci]
        .priorities
        .as_ref()
        .expect("position() found Some");

    let mut best: Option<(usize, usize)> = None;
    for &ri in matched {
        let values = rule_outputs(table, ri, scope)?;
        let rank = priorities
            .iter()
            .position(|p| p == &values[ci])
            .unwrap_or(usize::MAX);
        if best.map(|(r, _)| rank < r).unwrap_or(true) {
            best = Some((rank, ri));
        }
    }
    Ok(best.map(|(_, ri)| ri))
}
