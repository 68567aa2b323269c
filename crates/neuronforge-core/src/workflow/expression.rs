//! JEXL evaluation for conditional steps written as expressions.
//!
//! ```yaml
//! condition:
//!   expression: "count > 0 && tier|lower == 'gold'"
//! params:
//!   count: "{{filter.data.count}}"
//!   tier: "{{lookup.data.tier}}"
//! ```
//!
//! The resolved params form the evaluation context, and step data is reachable
//! through `steps['id']`. Values are passed as context, never spliced into the
//! expression text.

use serde_json::{Map, Value, json};

use neuronforge_types::error::{ErrorKind, StepError};
use neuronforge_types::execution::ResultMap;

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("expression context must be an object, got {0}")]
    InvalidContext(&'static str),
}

impl From<ExpressionError> for StepError {
    fn from(err: ExpressionError) -> Self {
        StepError::new(ErrorKind::Condition, err.to_string())
    }
}

fn str_arg(args: &[Value], i: usize) -> &str {
    args.get(i).and_then(Value::as_str).unwrap_or("")
}

/// `jexl_eval::Evaluator` with the transforms conditions commonly need.
///
/// Not `Send`: build one where it is used instead of holding it across awaits.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| Ok(json!(str_arg(args, 0).to_lowercase())))
            .with_transform("upper", |args: &[Value]| Ok(json!(str_arg(args, 0).to_uppercase())))
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("contains", |args: &[Value]| {
                let found = match args.first() {
                    Some(Value::Array(items)) => items.iter().any(|v| Some(v) == args.get(1)),
                    _ => str_arg(args, 0).contains(str_arg(args, 1)),
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            .with_transform("not", |args: &[Value]| {
                Ok(json!(!truthy(args.first().unwrap_or(&Value::Null))))
            });

        Self { evaluator }
    }

    /// Evaluate to a boolean with JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context).map(|v| truthy(&v))
    }

    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(type_label(context)));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Context for a conditional expression: the resolved params, plus
/// `steps[id]` holding each recorded step's visible data.
///
/// A param literally named `steps` wins over the step map.
pub fn build_context(params: &Map<String, Value>, results: &ResultMap) -> Value {
    let mut context = params.clone();
    if !context.contains_key("steps") {
        let steps: Map<String, Value> = results
            .iter()
            .map(|(id, result)| (id.clone(), result.visible_data().clone()))
            .collect();
        context.insert("steps".into(), Value::Object(steps));
    }
    Value::Object(context)
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
