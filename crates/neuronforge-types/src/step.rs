//! Step definitions: the compiled IR the engine executes.
//!
//! A workflow is an ordered list of [`Step`]s. Each step carries an id,
//! declared dependencies, a parameter map whose string values may contain
//! `{{stepId.path}}` references, an optional recovery policy, and a
//! [`StepKind`] describing what it does. The kind is flattened into the step
//! and tagged by `type`:
//!
//! ```yaml
//! - id: send
//!   type: plugin_action
//!   plugin: mock_email
//!   action: send
//!   params:
//!     to: "{{fetch.data.from}}"
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A single executable step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique id within its step list.
    pub id: String,
    /// Optional human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Declared dependencies. Dependencies implied by references are added
    /// by the graph builder.
    #[serde(default, alias = "dependsOn", skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Parameters: literals or reference strings.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    /// Recovery policy overriding the per-type and global defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryPolicy>,
    /// Per-step timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// What the step does.
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    /// Create a step with no params and no declared dependencies.
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            depends_on: Vec::new(),
            params: Map::new(),
            recovery: None,
            timeout_secs: None,
            kind,
        }
    }

    /// Builder: add a declared dependency.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Builder: set a parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Builder: attach a recovery policy.
    pub fn with_recovery(mut self, policy: RecoveryPolicy) -> Self {
        self.recovery = Some(policy);
        self
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    /// Display label: the name when present, otherwise the id.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Nested step list for loop and scatter-gather steps.
    pub fn nested_steps(&self) -> &[Step] {
        match &self.kind {
            StepKind::Loop { steps, .. } | StepKind::ScatterGather { steps, .. } => steps,
            _ => &[],
        }
    }
}

/// Step kinds, dispatched exhaustively by the step runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a plugin action with the resolved params.
    PluginAction { plugin: String, action: String },
    /// Run the AI capability with a prompt; resolved params are the input data.
    #[serde(alias = "llm_decision")]
    AiProcessing {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_schema: Option<Value>,
    },
    /// Run a data operation over the resolved params.
    Transform { operation: String },
    /// Evaluate a condition and select a branch.
    Conditional {
        condition: ConditionSpec,
        #[serde(default, alias = "trueBranch")]
        true_branch: Vec<String>,
        #[serde(default, alias = "falseBranch")]
        false_branch: Vec<String>,
    },
    /// Run the nested steps once per element, sequentially.
    Loop {
        /// Reference to the array to iterate.
        items: String,
        steps: Vec<Step>,
        #[serde(default, alias = "maxIterations", skip_serializing_if = "Option::is_none")]
        max_iterations: Option<usize>,
        /// Fail the loop step when any iteration fails.
        #[serde(default, alias = "failOnError")]
        fail_on_error: bool,
    },
    /// Fan the nested steps out over the elements, then gather.
    ScatterGather {
        items: String,
        steps: Vec<Step>,
        #[serde(default, alias = "maxConcurrency", skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
        #[serde(default)]
        gather: GatherConfig,
    },
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            Self::PluginAction { .. } => StepType::PluginAction,
            Self::AiProcessing { .. } => StepType::AiProcessing,
            Self::Transform { .. } => StepType::Transform,
            Self::Conditional { .. } => StepType::Conditional,
            Self::Loop { .. } => StepType::Loop,
            Self::ScatterGather { .. } => StepType::ScatterGather,
        }
    }
}

/// Fieldless mirror of [`StepKind`], used for policy lookup and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    PluginAction,
    AiProcessing,
    Transform,
    Conditional,
    Loop,
    ScatterGather,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PluginAction => "plugin_action",
            Self::AiProcessing => "ai_processing",
            Self::Transform => "transform",
            Self::Conditional => "conditional",
            Self::Loop => "loop",
            Self::ScatterGather => "scatter_gather",
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Gather
// ---------------------------------------------------------------------------

/// How scatter-gather combines per-element outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatherConfig {
    #[serde(default)]
    pub operation: GatherOperation,
    /// Aggregation applied by `reduce`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reducer: Option<Reducer>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatherOperation {
    /// Array of per-element outputs, in element order.
    #[default]
    Collect,
    /// Shallow merge of object outputs, or concatenation of array outputs.
    Merge,
    /// A single aggregate over the per-element outputs.
    Reduce,
}

/// Aggregate used by `reduce` (`sum`, `avg`, `min`, `max`, `count`,
/// `count_distinct`), optionally over a field of each output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reducer {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Condition for a conditional step: a JEXL expression or a structured rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    Expression { expression: String },
    Filter(FilterCondition),
}

/// Structured condition shared by conditional steps and the `filter` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterCondition {
    /// Nested group combined with AND/OR.
    Group {
        #[serde(default, alias = "combineWith")]
        combine_with: CombineWith,
        conditions: Vec<FilterCondition>,
    },
    /// A single `field operator value` comparison.
    Rule {
        field: String,
        operator: ConditionOperator,
        #[serde(default)]
        value: Value,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombineWith {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOperator {
    #[serde(rename = "==", alias = "eq", alias = "equals")]
    Eq,
    #[serde(rename = "!=", alias = "ne", alias = "not_equals")]
    Ne,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = ">=", alias = "gte")]
    Gte,
    #[serde(rename = "<=", alias = "lte")]
    Lte,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not_contains")]
    NotContains,
    #[serde(rename = "starts_with", alias = "startsWith")]
    StartsWith,
    #[serde(rename = "ends_with", alias = "endsWith")]
    EndsWith,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "is_empty")]
    IsEmpty,
    #[serde(rename = "is_not_empty")]
    IsNotEmpty,
}

// ---------------------------------------------------------------------------
// Recovery policy
// ---------------------------------------------------------------------------

/// What the engine does when a step ends in failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Re-run retryable failures with exponential backoff.
    Retry {
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
        /// Overrides the engine-wide backoff.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backoff: Option<BackoffConfig>,
        #[serde(default)]
        on_exhausted: ExhaustedAction,
    },
    /// Record the failure and keep going.
    Skip,
    /// Abort the workflow.
    #[default]
    FailWorkflow,
}

fn default_max_attempts() -> u32 {
    3
}

/// Fallback once retries are used up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    Skip,
    #[default]
    FailWorkflow,
}

/// Exponential backoff: `initial_delay_ms * multiplier^(attempt - 1)`,
/// capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow document
// ---------------------------------------------------------------------------

/// On-disk workflow file (YAML or JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Default initial input when none is supplied at run time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    pub steps: Vec<Step>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plugin_step_deserializes_with_flattened_kind() {
        let step: Step = serde_json::from_value(json!({
            "id": "send",
            "type": "plugin_action",
            "plugin": "mock_email",
            "action": "send",
            "dependsOn": ["fetch"],
            "params": {"to": "{{fetch.data.from}}"}
        }))
        .unwrap();

        assert_eq!(step.step_type(), StepType::PluginAction);
        assert_eq!(step.depends_on, vec!["fetch"]);
        assert_eq!(step.params["to"], "{{fetch.data.from}}");
        assert!(step.recovery.is_none());
    }

    #[test]
    fn llm_decision_is_an_alias_for_ai_processing() {
        let step: Step = serde_json::from_value(json!({
            "id": "decide",
            "type": "llm_decision",
            "prompt": "Pick one"
        }))
        .unwrap();
        assert_eq!(step.step_type(), StepType::AiProcessing);
    }

    #[test]
    fn loop_step_holds_nested_steps() {
        let yaml = r#"
id: each
type: loop
items: "{{fetch.data.items}}"
steps:
  - id: log
    type: plugin_action
    plugin: log
    action: log
    params:
      email: "{{loop.item.email}}"
"#;
        let step: Step = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.step_type(), StepType::Loop);
        assert_eq!(step.nested_steps().len(), 1);
        assert_eq!(step.nested_steps()[0].id, "log");
    }

    #[test]
    fn condition_spec_accepts_expression_rule_and_group() {
        let expr: ConditionSpec = serde_json::from_value(json!({"expression": "count > 0"})).unwrap();
        assert!(matches!(expr, ConditionSpec::Expression { .. }));

        let rule: ConditionSpec =
            serde_json::from_value(json!({"field": "count", "operator": ">", "value": 0})).unwrap();
        assert!(matches!(
            rule,
            ConditionSpec::Filter(FilterCondition::Rule { operator: ConditionOperator::Gt, .. })
        ));

        let group: ConditionSpec = serde_json::from_value(json!({
            "combineWith": "OR",
            "conditions": [
                {"field": "a", "operator": "is_empty"},
                {"field": "b", "operator": "eq", "value": 1}
            ]
        }))
        .unwrap();
        match group {
            ConditionSpec::Filter(FilterCondition::Group { combine_with, conditions }) => {
                assert_eq!(combine_with, CombineWith::Or);
                assert_eq!(conditions.len(), 2);
            }
            other => panic!("expected group, got {other:?}"),
        }
    }

    #[test]
    fn recovery_policy_defaults() {
        assert_eq!(RecoveryPolicy::default(), RecoveryPolicy::FailWorkflow);

        let policy: RecoveryPolicy = serde_json::from_value(json!({"policy": "retry"})).unwrap();
        match policy {
            RecoveryPolicy::Retry { max_attempts, backoff, on_exhausted } => {
                assert_eq!(max_attempts, 3);
                assert!(backoff.is_none());
                assert_eq!(on_exhausted, ExhaustedAction::FailWorkflow);
            }
            other => panic!("expected retry, got {other:?}"),
        }

        let skip: RecoveryPolicy = serde_json::from_value(json!({"policy": "skip"})).unwrap();
        assert_eq!(skip, RecoveryPolicy::Skip);
    }

    #[test]
    fn gather_defaults_to_collect() {
        let step: Step = serde_json::from_value(json!({
            "id": "fan",
            "type": "scatter_gather",
            "items": "{{input.rows}}",
            "steps": []
        }))
        .unwrap();
        match step.kind {
            StepKind::ScatterGather { gather, max_concurrency, .. } => {
                assert_eq!(gather.operation, GatherOperation::Collect);
                assert!(max_concurrency.is_none());
            }
            other => panic!("expected scatter_gather, got {other:?}"),
        }
    }

    #[test]
    fn step_type_display_matches_serde_name() {
        for ty in [StepType::PluginAction, StepType::ScatterGather, StepType::AiProcessing] {
            let json = serde_json::to_value(ty).unwrap();
            assert_eq!(json, json!(ty.to_string()));
        }
    }
}
