//! Collection reshaping: `group_by`, `aggregate`, `deduplicate`, `distinct`,
//! `flatten`.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{DataOpError, compare_values, field, field_or_null, number, parse_config, value_key};

// ---------------------------------------------------------------------------
// group_by
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GroupConfig {
    #[serde(default)]
    items: Option<Vec<Value>>,
    #[serde(alias = "groupBy", alias = "key")]
    field: String,
}

/// `{items, field}` -> `{groups: {key: [items]}, groupCount, count}`.
///
/// Items missing the field group under `"null"`.
pub fn group_by(config: &Value) -> Result<Value, DataOpError> {
    let config: GroupConfig = parse_config("group_by", config)?;
    let items = config.items.unwrap_or_default();
    let count = items.len();

    let mut groups: IndexMap<String, Vec<Value>> = IndexMap::new();
    for item in items {
        let key = value_key(field_or_null(&item, &config.field));
        groups.entry(key).or_default().push(item);
    }

    Ok(json!({
        "groupCount": groups.len(),
        "count": count,
        "groups": groups,
    }))
}

// ---------------------------------------------------------------------------
// aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Sum,
    #[serde(alias = "average", alias = "mean")]
    Avg,
    Min,
    Max,
    Count,
    #[serde(alias = "countDistinct")]
    CountDistinct,
}

impl AggregateOp {
    pub fn parse(name: &str) -> Result<Self, DataOpError> {
        serde_json::from_value(Value::String(name.to_string()))
            .map_err(|_| DataOpError::config("aggregate", format!("unknown aggregate '{name}'")))
    }
}

#[derive(Debug, Deserialize)]
struct AggregateConfig {
    #[serde(default)]
    items: Option<Vec<Value>>,
    #[serde(alias = "op")]
    operation: AggregateOp,
    #[serde(default)]
    field: Option<String>,
}

/// `{items, operation, field?}` -> `{value, operation, count}`.
pub fn aggregate(config: &Value) -> Result<Value, DataOpError> {
    let config: AggregateConfig = parse_config("aggregate", config)?;
    let items = config.items.unwrap_or_default();
    let value = aggregate_values(&items, config.operation, config.field.as_deref());

    Ok(json!({
        "value": value,
        "operation": config.operation,
        "count": items.len(),
    }))
}

/// Single aggregate over `items` (or a field of each item).
///
/// `sum` and `avg` ignore non-numeric values; `min`/`max` use the general value
/// order and ignore nulls. Empty inputs give `0` for sums and counts and `null`
/// otherwise.
pub fn aggregate_values(items: &[Value], op: AggregateOp, field_path: Option<&str>) -> Value {
    let values: Vec<&Value> = items
        .iter()
        .map(|item| match field_path {
            Some(path) => field_or_null(item, path),
            None => item,
        })
        .filter(|v| !v.is_null())
        .collect();
    let numbers: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();

    match op {
        AggregateOp::Sum => number(numbers.iter().sum()),
        AggregateOp::Avg if numbers.is_empty() => Value::Null,
        AggregateOp::Avg => number(numbers.iter().sum::<f64>() / numbers.len() as f64),
        AggregateOp::Min => values
            .iter()
            .min_by(|a, b| compare_values(a, b))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null),
        AggregateOp::Max => values
            .iter()
            .max_by(|a, b| compare_values(a, b))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null),
        AggregateOp::Count => json!(values.len()),
        AggregateOp::CountDistinct => {
            let distinct: HashSet<String> = values.iter().map(|v| value_key(v)).collect();
            json!(distinct.len())
        }
    }
}

// ---------------------------------------------------------------------------
// deduplicate / distinct
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DedupeConfig {
    #[serde(default)]
    items: Option<Vec<Value>>,
    /// Fields forming the identity; empty means the whole item.
    #[serde(default, alias = "keyFields", alias = "key_fields", alias = "fields")]
    keys: Vec<String>,
}

/// `{items, keys?}` -> `{items, count, removed}`. First occurrence wins.
pub fn deduplicate(config: &Value) -> Result<Value, DataOpError> {
    let config: DedupeConfig = parse_config("deduplicate", config)?;
    let items = config.items.unwrap_or_default();
    let original = items.len();

    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(original);
    for item in items {
        let identity = if config.keys.is_empty() {
            item.to_string()
        } else {
            let parts: Vec<&Value> = config.keys.iter().map(|k| field_or_null(&item, k)).collect();
            json!(parts).to_string()
        };
        if seen.insert(identity) {
            kept.push(item);
        }
    }

    Ok(json!({
        "count": kept.len(),
        "removed": original - kept.len(),
        "items": kept,
    }))
}

#[derive(Debug, Deserialize)]
struct DistinctConfig {
    #[serde(default)]
    items: Option<Vec<Value>>,
    #[serde(default)]
    field: Option<String>,
}

/// `{items, field?}` -> `{values, count}`: distinct values in first-seen order.
/// Items missing the field contribute nothing.
pub fn distinct(config: &Value) -> Result<Value, DataOpError> {
    let config: DistinctConfig = parse_config("distinct", config)?;
    let items = config.items.unwrap_or_default();

    let mut seen = HashSet::new();
    let mut values = Vec::new();
    for item in &items {
        let candidate = match config.field.as_deref() {
            Some(path) => match field(item, path) {
                Some(v) => v,
                None => continue,
            },
            None => item,
        };
        if seen.insert(candidate.to_string()) {
            values.push(candidate.clone());
        }
    }

    Ok(json!({ "count": values.len(), "values": values }))
}

// ---------------------------------------------------------------------------
// flatten
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FlattenConfig {
    #[serde(default)]
    items: Option<Vec<Value>>,
    #[serde(default = "default_depth")]
    depth: usize,
}

fn default_depth() -> usize {
    1
}

/// `{items, depth?}` -> `{items, count}`: splices nested arrays `depth` levels.
pub fn flatten(config: &Value) -> Result<Value, DataOpError> {
    let config: FlattenConfig = parse_config("flatten", config)?;
    let mut items = config.items.unwrap_or_default();
    for _ in 0..config.depth {
        if !items.iter().any(Value::is_array) {
            break;
        }
        items = items
            .into_iter()
            .flat_map(|item| match item {
                Value::Array(inner) => inner,
                other => vec![other],
            })
            .collect();
    }

    Ok(json!({ "count": items.len(), "items": items }))
}
