//! Pure data operations over in-memory result sets.
//!
//! Transform steps name an operation and pass its config as resolved params:
//!
//! ```yaml
//! - id: unpaid
//!   type: transform
//!   operation: filter
//!   params:
//!     items: "{{fetch.data.invoices}}"
//!     condition: { field: status, operator: "!=", value: paid }
//! ```
//!
//! Every operation returns an object envelope (`{items, count, ...}`), never
//! a bare array, so downstream references address a stable shape.

pub mod collection;
pub mod filter;
pub mod join;
pub mod sort;
pub mod stats;

use std::cmp::Ordering;
use std::str::FromStr;

use neuronforge_types::error::{ErrorKind, StepError};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataOpError {
    #[error("unknown data operation '{0}'")]
    UnknownOperation(String),

    #[error("invalid config for '{operation}': {message}")]
    InvalidConfig { operation: &'static str, message: String },
}

impl DataOpError {
    pub(crate) fn config(operation: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            operation,
            message: message.into(),
        }
    }
}

impl From<DataOpError> for StepError {
    fn from(err: DataOpError) -> Self {
        StepError::new(ErrorKind::DataOperation, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Filter,
    Sort,
    Limit,
    GroupBy,
    Aggregate,
    Deduplicate,
    Statistics,
    Distinct,
    Flatten,
    Join,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Filter => "filter",
            Self::Sort => "sort",
            Self::Limit => "limit",
            Self::GroupBy => "group_by",
            Self::Aggregate => "aggregate",
            Self::Deduplicate => "deduplicate",
            Self::Statistics => "statistics",
            Self::Distinct => "distinct",
            Self::Flatten => "flatten",
            Self::Join => "join",
        }
    }
}

impl FromStr for Operation {
    type Err = DataOpError;

    /// Accepts snake_case, camelCase, and a few short aliases.
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let normalized: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        let op = match normalized.as_str() {
            "filter" => Self::Filter,
            "sort" | "orderby" => Self::Sort,
            "limit" | "take" => Self::Limit,
            "groupby" | "group" => Self::GroupBy,
            "aggregate" => Self::Aggregate,
            "deduplicate" | "dedupe" | "dedup" => Self::Deduplicate,
            "statistics" | "stats" => Self::Statistics,
            "distinct" | "unique" => Self::Distinct,
            "flatten" => Self::Flatten,
            "join" | "match" => Self::Join,
            _ => return Err(DataOpError::UnknownOperation(name.to_string())),
        };
        Ok(op)
    }
}

/// Run a named operation over its config.
pub fn run_operation(name: &str, config: &Value) -> Result<Value, DataOpError> {
    match name.parse::<Operation>()? {
        Operation::Filter => filter::filter(config),
        Operation::Sort => sort::sort(config),
        Operation::Limit => sort::limit(config),
        Operation::GroupBy => collection::group_by(config),
        Operation::Aggregate => collection::aggregate(config),
        Operation::Deduplicate => collection::deduplicate(config),
        Operation::Statistics => stats::statistics(config),
        Operation::Distinct => collection::distinct(config),
        Operation::Flatten => collection::flatten(config),
        Operation::Join => join::join(config),
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_config<T: DeserializeOwned>(operation: &'static str, config: &Value) -> Result<T, DataOpError> {
    serde_json::from_value(config.clone()).map_err(|e| DataOpError::config(operation, e.to_string()))
}

/// Dot-path lookup inside an item (`customer.address.city`, `lines.0`).
/// An empty path returns the item itself.
pub(crate) fn field<'a>(item: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = item;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Field value with missing treated as null.
pub(crate) fn field_or_null<'a>(item: &'a Value, path: &str) -> &'a Value {
    static NULL: Value = Value::Null;
    field(item, path).unwrap_or(&NULL)
}

/// Total order: null < numbers < bools < strings < everything else.
pub(crate) fn compare_values(left: &Value, right: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Number(_) => 1,
            Value::Bool(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            let l = l.as_f64().unwrap_or(0.0);
            let r = r.as_f64().unwrap_or(0.0);
            l.partial_cmp(&r).unwrap_or(Ordering::Equal)
        }
        (Value::Bool(l), Value::Bool(r)) => l.cmp(r),
        (Value::String(l), Value::String(r)) => l.cmp(r),
        _ if rank(left) != rank(right) => rank(left).cmp(&rank(right)),
        _ => left.to_string().cmp(&right.to_string()),
    }
}

/// Equality with numbers compared by value (`1 == 1.0`).
pub(crate) fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64() == r.as_f64(),
        _ => left == right,
    }
}

/// Grouping key for a value: strings as-is, everything else as JSON.
pub(crate) fn value_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numbers with no fractional part come back as integers.
pub(crate) fn number(value: f64) -> Value {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_names_accept_case_variants() {
        assert_eq!("groupBy".parse::<Operation>().unwrap(), Operation::GroupBy);
        assert_eq!("group_by".parse::<Operation>().unwrap(), Operation::GroupBy);
        assert_eq!("match".parse::<Operation>().unwrap(), Operation::Join);
        assert_eq!("dedupe".parse::<Operation>().unwrap(), Operation::Deduplicate);
        assert!(matches!(
            "explode".parse::<Operation>(),
            Err(DataOpError::UnknownOperation(_))
        ));
    }

    #[test]
    fn run_operation_dispatches() {
        let out = run_operation("limit", &json!({"items": [1, 2, 3], "limit": 2})).unwrap();
        assert_eq!(out["items"], json!([1, 2]));
    }

    #[test]
    fn bad_config_is_a_data_operation_error() {
        let err = run_operation("filter", &json!({"items": 5})).unwrap_err();
        let step_err: StepError = err.into();
        assert_eq!(step_err.kind, ErrorKind::DataOperation);
        assert!(!step_err.retryable);
    }

    #[test]
    fn field_lookup_walks_objects_and_arrays() {
        let item = json!({"a": {"b": [10, 20]}});
        assert_eq!(field(&item, "a.b.1"), Some(&json!(20)));
        assert_eq!(field(&item, "a.c"), None);
        assert_eq!(field(&item, ""), Some(&item));
    }

    #[test]
    fn compare_orders_null_first() {
        assert_eq!(compare_values(&Value::Null, &json!(1)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_values(&json!(5), &json!("a")), Ordering::Less);
    }

    #[test]
    fn number_prefers_integers() {
        assert_eq!(number(6.0), json!(6));
        assert_eq!(number(2.5), json!(2.5));
    }
}
