//! Declarative routing conditions.
//!
//! A small predicate language over the event payload, stored as data next to
//! the rule. Evaluation **fails closed**: any lookup or type mismatch makes
//! the condition false (the rule does not fire) and is logged, never turned
//! into an error that could abort the whole match.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Predicate over a JSON event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Value at `path` equals `value` exactly.
    Eq { path: String, value: JsonValue },
    /// Value at `path` differs from `value` (missing path fails closed).
    NotEq { path: String, value: JsonValue },
    /// `path` resolves to any non-null value.
    Exists { path: String },
    /// Numeric comparison; non-numeric values fail closed.
    Gt { path: String, value: f64 },
    Lt { path: String, value: f64 },
    /// Value at `path` is one of `values`.
    In { path: String, values: Vec<JsonValue> },
    /// Every sub-condition holds.
    All { conditions: Vec<Condition> },
    /// At least one sub-condition holds.
    Any { conditions: Vec<Condition> },
}

/// Resolve a dotted path ("deal.stage") against a JSON object.
fn lookup<'a>(payload: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

impl Condition {
    /// Evaluate against a payload. Returns `false` on any lookup failure or
    /// type mismatch (fail closed).
    pub fn evaluate(&self, payload: &JsonValue) -> bool {
        match self {
            Condition::Eq { path, value } => lookup(payload, path) == Some(value),
            Condition::NotEq { path, value } => match lookup(payload, path) {
                Some(found) => found != value,
                None => false,
            },
            Condition::Exists { path } => {
                matches!(lookup(payload, path), Some(v) if !v.is_null())
            }
            Condition::Gt { path, value } => match lookup(payload, path).and_then(JsonValue::as_f64)
            {
                Some(n) => n > *value,
                None => false,
            },
            Condition::Lt { path, value } => match lookup(payload, path).and_then(JsonValue::as_f64)
            {
                Some(n) => n < *value,
                None => false,
            },
            Condition::In { path, values } => match lookup(payload, path) {
                Some(found) => values.contains(found),
                None => false,
            },
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(payload)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(payload)),
        }
    }
}
