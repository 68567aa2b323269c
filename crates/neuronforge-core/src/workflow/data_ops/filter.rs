//! `filter`: keep the items matching a structured condition.
//!
//! The same evaluator backs structured conditions on conditional steps,
//! where the "item" is the step's resolved params.

use neuronforge_types::step::{CombineWith, ConditionOperator, FilterCondition};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{DataOpError, field, parse_config, values_equal};

const OP: &str = "filter";

#[derive(Debug, Deserialize)]
struct FilterConfig {
    #[serde(default)]
    items: Option<Vec<Value>>,
    condition: FilterCondition,
}

/// `{items, condition}` -> `{items, count, removed, originalCount}`.
pub fn filter(config: &Value) -> Result<Value, DataOpError> {
    let config: FilterConfig = parse_config(OP, config)?;
    let items = config.items.unwrap_or_default();
    let original = items.len();

    let mut kept = Vec::with_capacity(original);
    for item in items {
        if evaluate(&item, &config.condition)? {
            kept.push(item);
        }
    }

    Ok(json!({
        "count": kept.len(),
        "removed": original - kept.len(),
        "originalCount": original,
        "items": kept,
    }))
}

/// Evaluate a condition tree against one item.
///
/// Empty AND groups are true, empty OR groups are false.
pub fn evaluate(item: &Value, condition: &FilterCondition) -> Result<bool, DataOpError> {
    match condition {
        FilterCondition::Rule {
            field: path,
            operator,
            value,
        } => compare(field(item, path), *operator, value),
        FilterCondition::Group {
            combine_with,
            conditions,
        } => {
            for child in conditions {
                let hit = evaluate(item, child)?;
                match combine_with {
                    CombineWith::And if !hit => return Ok(false),
                    CombineWith::Or if hit => return Ok(true),
                    _ => {}
                }
            }
            Ok(*combine_with == CombineWith::And)
        }
    }
}

/// Apply one operator. Missing fields behave as null.
///
/// Ordering operators need a numeric condition value (else config error);
/// non-numeric item values simply do not match. No string-to-number coercion.
pub fn compare(actual: Option<&Value>, operator: ConditionOperator, expected: &Value) -> Result<bool, DataOpError> {
    let actual = actual.unwrap_or(&Value::Null);

    let matched = match operator {
        ConditionOperator::Eq => values_equal(actual, expected),
        ConditionOperator::Ne => !values_equal(actual, expected),
        ConditionOperator::Gt | ConditionOperator::Lt | ConditionOperator::Gte | ConditionOperator::Lte => {
            let Some(bound) = expected.as_f64() else {
                return Err(DataOpError::config(
                    OP,
                    format!("ordering comparison needs a numeric value, got {expected}"),
                ));
            };
            match actual.as_f64() {
                Some(n) => match operator {
                    ConditionOperator::Gt => n > bound,
                    ConditionOperator::Lt => n < bound,
                    ConditionOperator::Gte => n >= bound,
                    _ => n <= bound,
                },
                None => false,
            }
        }
        ConditionOperator::Contains => contains(actual, expected),
        ConditionOperator::NotContains => !contains(actual, expected),
        ConditionOperator::StartsWith | ConditionOperator::EndsWith => {
            let Some(affix) = expected.as_str() else {
                return Err(DataOpError::config(OP, "starts_with/ends_with need a string value"));
            };
            match actual.as_str() {
                Some(s) if operator == ConditionOperator::StartsWith => s.starts_with(affix),
                Some(s) => s.ends_with(affix),
                None => false,
            }
        }
        ConditionOperator::In | ConditionOperator::NotIn => {
            let Some(set) = expected.as_array() else {
                return Err(DataOpError::config(OP, "in/not_in need an array value"));
            };
            let hit = set.iter().any(|candidate| values_equal(actual, candidate));
            if operator == ConditionOperator::In { hit } else { !hit }
        }
        ConditionOperator::IsEmpty => is_empty(actual),
        ConditionOperator::IsNotEmpty => !is_empty(actual),
    };

    Ok(matched)
}

fn contains(actual: &Value, needle: &Value) -> bool {
    match (actual, needle) {
        (Value::String(haystack), Value::String(n)) => haystack.contains(n.as_str()),
        (Value::Array(items), _) => items.iter().any(|item| values_equal(item, needle)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
