//! Capability ports consumed by the engine: plugin execution, AI processing,
//! and persistence hooks.
//!
//! Each port is a native async trait (RPITIT). Because RPITIT traits cannot be
//! trait objects, each has an object-safe `*Dyn` mirror with boxed futures, a
//! blanket impl, and a `Box*` wrapper the engine stores:
//!
//! 1. `PluginExecutor` -> `PluginExecutorDyn` -> `BoxPluginExecutor`
//! 2. `AiCapability` -> `AiCapabilityDyn` -> `BoxAiCapability`
//! 3. `ExecutionHooks` -> `ExecutionHooksDyn` -> `BoxExecutionHooks`

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use neuronforge_types::error::{AiError, PluginError};
use neuronforge_types::execution::{ExecutionResult, StepStatus};
use neuronforge_types::step::StepType;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ---------------------------------------------------------------------------
// Plugin execution
// ---------------------------------------------------------------------------

/// One plugin action invocation with fully resolved params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginCall {
    pub user_id: String,
    pub plugin: String,
    pub action: String,
    pub params: Value,
}

/// Describes a registered plugin for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub key: String,
    pub description: String,
    pub actions: Vec<String>,
}

/// Runs plugin actions. Implementations own auth, transport, and provider
/// specifics; the engine only sees results and typed errors.
pub trait PluginExecutor: Send + Sync {
    fn execute(
        &self,
        call: &PluginCall,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Value, PluginError>> + Send;

    fn plugins(&self) -> Vec<PluginInfo> {
        Vec::new()
    }
}

pub trait PluginExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        call: &'a PluginCall,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Value, PluginError>>;

    fn plugins(&self) -> Vec<PluginInfo>;
}

impl<T: PluginExecutor> PluginExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        call: &'a PluginCall,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<Value, PluginError>> {
        Box::pin(self.execute(call, cancel))
    }

    fn plugins(&self) -> Vec<PluginInfo> {
        PluginExecutor::plugins(self)
    }
}

/// Type-erased [`PluginExecutor`].
pub struct BoxPluginExecutor {
    inner: Box<dyn PluginExecutorDyn>,
}

impl BoxPluginExecutor {
    pub fn new<T: PluginExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub async fn execute(&self, call: &PluginCall, cancel: CancellationToken) -> Result<Value, PluginError> {
        self.inner.execute_boxed(call, cancel).await
    }

    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.inner.plugins()
    }
}

impl std::fmt::Debug for BoxPluginExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxPluginExecutor")
            .field("plugins", &self.inner.plugins().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// AI processing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiRequest {
    /// Prompt with references already interpolated.
    pub prompt: String,
    /// The step's resolved params.
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    pub output: Value,
    #[serde(default)]
    pub tokens_used: u64,
}

pub trait AiCapability: Send + Sync {
    fn run(
        &self,
        request: &AiRequest,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<AiResponse, AiError>> + Send;
}

pub trait AiCapabilityDyn: Send + Sync {
    fn run_boxed<'a>(
        &'a self,
        request: &'a AiRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<AiResponse, AiError>>;
}

impl<T: AiCapability> AiCapabilityDyn for T {
    fn run_boxed<'a>(
        &'a self,
        request: &'a AiRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<AiResponse, AiError>> {
        Box::pin(self.run(request, cancel))
    }
}

/// Type-erased [`AiCapability`].
pub struct BoxAiCapability {
    inner: Box<dyn AiCapabilityDyn>,
}

impl BoxAiCapability {
    pub fn new<T: AiCapability + 'static>(capability: T) -> Self {
        Self {
            inner: Box::new(capability),
        }
    }

    pub async fn run(&self, request: &AiRequest, cancel: CancellationToken) -> Result<AiResponse, AiError> {
        self.inner.run_boxed(request, cancel).await
    }
}

impl std::fmt::Debug for BoxAiCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxAiCapability")
    }
}

/// Check an AI output against the subset of JSON Schema the engine enforces:
/// top-level `type` and the `required` keys of an object.
pub fn check_output_schema(schema: &Value, output: &Value) -> Result<(), AiError> {
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        let actual = match output {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        };
        let ok = expected == actual || (expected == "number" && actual == "integer");
        if !ok {
            return Err(AiError::SchemaMismatch(format!("expected {expected}, got {actual}")));
        }
    }

    if let (Some(required), Some(object)) = (schema.get("required").and_then(Value::as_array), output.as_object()) {
        let missing: Vec<&str> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|key| !object.contains_key(*key))
            .collect();
        if !missing.is_empty() {
            return Err(AiError::SchemaMismatch(format!("missing keys: {}", missing.join(", "))));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Persistence hooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("hook failed: {0}")]
pub struct HookError(pub String);

/// A row in the step execution log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub execution_id: Uuid,
    pub step_id: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub attempt: u32,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub execution_id: Uuid,
    pub user_id: String,
    pub step_id: String,
    pub tokens_used: u64,
}

/// Best-effort side effects around execution. Failures are logged by the
/// engine and never change the run's outcome.
pub trait ExecutionHooks: Send + Sync {
    /// A step attempt started.
    fn log_step_execution(&self, record: &StepExecutionRecord) -> impl Future<Output = Result<(), HookError>> + Send;

    /// A step reached its final status.
    fn update_step_execution(
        &self,
        record: &StepExecutionRecord,
    ) -> impl Future<Output = Result<(), HookError>> + Send;

    /// Tokens consumed by a step, for billing.
    fn record_usage(&self, _usage: &UsageRecord) -> impl Future<Output = Result<(), HookError>> + Send {
        async { Ok(()) }
    }

    fn run_finished(&self, _result: &ExecutionResult) -> impl Future<Output = Result<(), HookError>> + Send {
        async { Ok(()) }
    }
}

pub trait ExecutionHooksDyn: Send + Sync {
    fn log_step_execution_boxed<'a>(&'a self, record: &'a StepExecutionRecord) -> BoxFuture<'a, Result<(), HookError>>;

    fn update_step_execution_boxed<'a>(
        &'a self,
        record: &'a StepExecutionRecord,
    ) -> BoxFuture<'a, Result<(), HookError>>;

    fn record_usage_boxed<'a>(&'a self, usage: &'a UsageRecord) -> BoxFuture<'a, Result<(), HookError>>;

    fn run_finished_boxed<'a>(&'a self, result: &'a ExecutionResult) -> BoxFuture<'a, Result<(), HookError>>;
}

impl<T: ExecutionHooks> ExecutionHooksDyn for T {
    fn log_step_execution_boxed<'a>(&'a self, record: &'a StepExecutionRecord) -> BoxFuture<'a, Result<(), HookError>> {
        Box::pin(self.log_step_execution(record))
    }

    fn update_step_execution_boxed<'a>(
        &'a self,
        record: &'a StepExecutionRecord,
    ) -> BoxFuture<'a, Result<(), HookError>> {
        Box::pin(self.update_step_execution(record))
    }

    fn record_usage_boxed<'a>(&'a self, usage: &'a UsageRecord) -> BoxFuture<'a, Result<(), HookError>> {
        Box::pin(self.record_usage(usage))
    }

    fn run_finished_boxed<'a>(&'a self, result: &'a ExecutionResult) -> BoxFuture<'a, Result<(), HookError>> {
        Box::pin(self.run_finished(result))
    }
}

/// Type-erased [`ExecutionHooks`].
pub struct BoxExecutionHooks {
    inner: Box<dyn ExecutionHooksDyn>,
}

impl BoxExecutionHooks {
    pub fn new<T: ExecutionHooks + 'static>(hooks: T) -> Self {
        Self { inner: Box::new(hooks) }
    }

    pub async fn log_step_execution(&self, record: &StepExecutionRecord) -> Result<(), HookError> {
        self.inner.log_step_execution_boxed(record).await
    }

    pub async fn update_step_execution(&self, record: &StepExecutionRecord) -> Result<(), HookError> {
        self.inner.update_step_execution_boxed(record).await
    }

    pub async fn record_usage(&self, usage: &UsageRecord) -> Result<(), HookError> {
        self.inner.record_usage_boxed(usage).await
    }

    pub async fn run_finished(&self, result: &ExecutionResult) -> Result<(), HookError> {
        self.inner.run_finished_boxed(result).await
    }
}

impl std::fmt::Debug for BoxExecutionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxExecutionHooks")
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl ExecutionHooks for NoopHooks {
    async fn log_step_execution(&self, _record: &StepExecutionRecord) -> Result<(), HookError> {
        Ok(())
    }

    async fn update_step_execution(&self, _record: &StepExecutionRecord) -> Result<(), HookError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    impl PluginExecutor for Echo {
        async fn execute(&self, call: &PluginCall, _cancel: CancellationToken) -> Result<Value, PluginError> {
            if call.action == "fail" {
                return Err(PluginError::RateLimited {
                    message: "slow down".into(),
                    retry_after_ms: Some(10),
                });
            }
            Ok(json!({"plugin": call.plugin, "params": call.params}))
        }
    }

    struct FixedAi;

    impl AiCapability for FixedAi {
        async fn run(&self, request: &AiRequest, _cancel: CancellationToken) -> Result<AiResponse, AiError> {
            Ok(AiResponse {
                output: json!({"summary": request.prompt.len()}),
                tokens_used: 7,
            })
        }
    }

    fn call(action: &str) -> PluginCall {
        PluginCall {
            user_id: "u1".into(),
            plugin: "echo".into(),
            action: action.into(),
            params: json!({"x": 1}),
        }
    }

    #[tokio::test]
    async fn boxed_plugin_executor_delegates() {
        let boxed = BoxPluginExecutor::new(Echo);
        let out = boxed.execute(&call("go"), CancellationToken::new()).await.unwrap();
        assert_eq!(out["params"]["x"], 1);
        assert!(boxed.plugins().is_empty());

        let err = boxed.execute(&call("fail"), CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn boxed_ai_delegates() {
        let boxed = BoxAiCapability::new(FixedAi);
        let request = AiRequest {
            prompt: "hello".into(),
            input: json!({}),
            output_schema: None,
        };
        let response = boxed.run(&request, CancellationToken::new()).await.unwrap();
        assert_eq!(response.output["summary"], 5);
        assert_eq!(response.tokens_used, 7);
    }

    #[tokio::test]
    async fn noop_hooks_accept_everything() {
        let hooks = BoxExecutionHooks::new(NoopHooks);
        let record = StepExecutionRecord {
            execution_id: Uuid::now_v7(),
            step_id: "s".into(),
            step_type: StepType::Transform,
            status: StepStatus::Running,
            attempt: 1,
            tokens_used: 0,
            execution_time_ms: 0,
            error: None,
        };
        assert!(hooks.log_step_execution(&record).await.is_ok());
        assert!(hooks.update_step_execution(&record).await.is_ok());
        let usage = UsageRecord {
            execution_id: record.execution_id,
            user_id: "u".into(),
            step_id: "s".into(),
            tokens_used: 3,
        };
        assert!(hooks.record_usage(&usage).await.is_ok());
    }

    #[test]
    fn schema_checks_type_and_required_keys() {
        let schema = json!({"type": "object", "required": ["label", "score"]});
        assert!(check_output_schema(&schema, &json!({"label": "a", "score": 1})).is_ok());

        let err = check_output_schema(&schema, &json!({"label": "a"})).unwrap_err();
        assert!(err.to_string().contains("score"));

        let err = check_output_schema(&schema, &json!([1])).unwrap_err();
        assert!(matches!(err, AiError::SchemaMismatch(_)));

        assert!(check_output_schema(&json!({"type": "number"}), &json!(3)).is_ok());
    }
}
