//! Single-step execution, dispatched on [`StepKind`].
//!
//! The runner resolves references, calls the matching capability, and returns
//! the step's data or a structured [`StepError`]. It never retries and never
//! records anything: attempts, timing, and policy belong to the engine.
//!
//! Loop and scatter-gather steps run their nested step lists through a
//! [`NestedRunner`], which the engine implements with the same
//! validate/batch/checkpoint cycle it uses at the top level.

use std::future::Future;
use std::pin::Pin;

use futures_util::StreamExt;
use futures_util::stream;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use neuronforge_types::config::EngineConfig;
use neuronforge_types::error::{ErrorKind, StepError};
use neuronforge_types::execution::{ExecutionResult, ResultMap, StepResult};
use neuronforge_types::step::{ConditionSpec, GatherConfig, GatherOperation, Step, StepKind};

use super::capability::{AiRequest, BoxAiCapability, BoxPluginExecutor, PluginCall, check_output_schema};
use super::data_ops::collection::{AggregateOp, aggregate_values};
use super::data_ops::{filter, run_operation};
use super::expression::{ConditionEvaluator, build_context};
use super::reference::{LOOP_BINDING, ReferenceResolver};

// ---------------------------------------------------------------------------
// Context and outputs
// ---------------------------------------------------------------------------

/// Per-invocation context handed down from the engine.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub execution_id: Uuid,
    pub user_id: String,
    /// 0 for top-level steps, +1 per loop/scatter-gather level.
    pub depth: usize,
    pub cancel: CancellationToken,
}

impl StepContext {
    pub fn new(execution_id: Uuid, user_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            execution_id,
            user_id: user_id.into(),
            depth: 0,
            cancel,
        }
    }

    fn nested(&self) -> Self {
        Self {
            execution_id: self.execution_id,
            user_id: self.user_id.clone(),
            depth: self.depth + 1,
            cancel: self.cancel.child_token(),
        }
    }
}

/// What a successful step produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub data: Value,
    pub tokens_used: u64,
}

impl StepOutput {
    fn data(data: Value) -> Self {
        Self { data, tokens_used: 0 }
    }
}

/// Runs a nested step list to completion, seeded with `seed` results.
pub trait NestedRunner: Send + Sync {
    fn run_nested<'a>(
        &'a self,
        steps: &'a [Step],
        seed: ResultMap,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'a>>;
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

pub struct StepRunner<'a> {
    plugins: &'a BoxPluginExecutor,
    ai: &'a BoxAiCapability,
    config: &'a EngineConfig,
    nested: &'a dyn NestedRunner,
}

impl<'a> StepRunner<'a> {
    pub fn new(
        plugins: &'a BoxPluginExecutor,
        ai: &'a BoxAiCapability,
        config: &'a EngineConfig,
        nested: &'a dyn NestedRunner,
    ) -> Self {
        Self {
            plugins,
            ai,
            config,
            nested,
        }
    }

    /// Execute one attempt of `step` against a read-only results snapshot.
    pub async fn run(&self, step: &Step, results: &ResultMap, ctx: &StepContext) -> Result<StepOutput, StepError> {
        if ctx.cancel.is_cancelled() {
            return Err(StepError::new(ErrorKind::Cancelled, "cancelled before start"));
        }

        let resolved = ReferenceResolver::resolve_step(step, results)?;
        if !resolved.array_references.is_empty() {
            debug!(step_id = %step.id, refs = resolved.array_references.len(), "array references resolved");
        }

        match &step.kind {
            StepKind::PluginAction { plugin, action } => match resolved.iterations {
                Some(iterations) => {
                    self.iterate(iterations, |params| self.call_plugin(plugin, action, params, ctx))
                        .await
                }
                None => self.call_plugin(plugin, action, resolved.params, ctx).await,
            },
            StepKind::AiProcessing { output_schema, .. } => {
                let prompt = resolved.prompt.unwrap_or_default();
                match resolved.iterations {
                    Some(iterations) => {
                        self.iterate(iterations, |input| {
                            self.call_ai(prompt.clone(), input, output_schema.clone(), ctx)
                        })
                        .await
                    }
                    None => {
                        self.call_ai(prompt, resolved.params, output_schema.clone(), ctx)
                            .await
                    }
                }
            }
            StepKind::Transform { operation } => match resolved.iterations {
                Some(iterations) => {
                    self.iterate(iterations, |params| async move {
                        run_operation(operation, &params).map(StepOutput::data).map_err(StepError::from)
                    })
                    .await
                }
                None => run_operation(operation, &resolved.params)
                    .map(StepOutput::data)
                    .map_err(StepError::from),
            },
            StepKind::Conditional { condition, .. } => {
                let params = resolved.params.as_object().cloned().unwrap_or_default();
                let result = evaluate_condition(condition, &params, results)?;
                debug!(step_id = %step.id, result, "condition evaluated");
                Ok(StepOutput::data(json!({ "result": result })))
            }
            StepKind::Loop {
                steps,
                max_iterations,
                fail_on_error,
                ..
            } => {
                let items = self.elements(step, resolved.items, *max_iterations)?;
                self.run_loop(step, steps, items, *fail_on_error, results, ctx).await
            }
            StepKind::ScatterGather {
                steps,
                max_concurrency,
                gather,
                ..
            } => {
                let items = self.elements(step, resolved.items, None)?;
                self.run_scatter(steps, items, *max_concurrency, gather, results, ctx)
                    .await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Capabilities
    // -----------------------------------------------------------------------

    async fn call_plugin(
        &self,
        plugin: &str,
        action: &str,
        params: Value,
        ctx: &StepContext,
    ) -> Result<StepOutput, StepError> {
        let call = PluginCall {
            user_id: ctx.user_id.clone(),
            plugin: plugin.to_string(),
            action: action.to_string(),
            params,
        };
        let data = self.plugins.execute(&call, ctx.cancel.clone()).await?;
        Ok(StepOutput::data(data))
    }

    async fn call_ai(
        &self,
        prompt: String,
        input: Value,
        output_schema: Option<Value>,
        ctx: &StepContext,
    ) -> Result<StepOutput, StepError> {
        let request = AiRequest {
            prompt,
            input,
            output_schema,
        };
        let response = self.ai.run(&request, ctx.cancel.clone()).await?;
        if let Some(schema) = &request.output_schema {
            check_output_schema(schema, &response.output)?;
        }
        Ok(StepOutput {
            data: response.output,
            tokens_used: response.tokens_used,
        })
    }

    // -----------------------------------------------------------------------
    // Implicit iteration
    // -----------------------------------------------------------------------

    /// Run `call` once per element, in order, with bounded concurrency.
    ///
    /// The step fails only when every element fails.
    async fn iterate<F, Fut>(&self, iterations: Vec<Value>, call: F) -> Result<StepOutput, StepError>
    where
        F: Fn(Value) -> Fut,
        Fut: Future<Output = Result<StepOutput, StepError>>,
    {
        let total = iterations.len();
        let outcomes: Vec<Result<StepOutput, StepError>> = stream::iter(iterations)
            .map(call)
            .buffered(self.config.max_parallel_steps.max(1))
            .collect()
            .await;

        let mut items = Vec::with_capacity(total);
        let mut errors = Vec::new();
        let mut tokens_used = 0;
        let mut first_error = None;
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(output) => {
                    tokens_used += output.tokens_used;
                    items.push(output.data);
                }
                Err(err) => {
                    items.push(Value::Null);
                    errors.push(json!({ "index": index, "error": err }));
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error.filter(|_| errors.len() == total) {
            return Err(StepError {
                message: format!("all {total} iterations failed; first: {}", err.message),
                ..err
            });
        }

        Ok(StepOutput {
            data: json!({
                "items": items,
                "count": total,
                "successCount": total - errors.len(),
                "failureCount": errors.len(),
                "errors": errors,
            }),
            tokens_used,
        })
    }

    // -----------------------------------------------------------------------
    // Loop / scatter-gather
    // -----------------------------------------------------------------------

    /// The element array for a loop or scatter-gather, capped at the
    /// iteration limit.
    fn elements(&self, step: &Step, items: Option<Value>, max_iterations: Option<usize>) -> Result<Vec<Value>, StepError> {
        let mut items = match items {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(StepError::new(
                    ErrorKind::InvalidPath,
                    format!("'{}' items must resolve to an array, got {other}", step.id),
                ));
            }
        };

        let cap = max_iterations
            .unwrap_or(self.config.max_loop_iterations)
            .min(self.config.max_loop_iterations);
        if items.len() > cap {
            warn!(step_id = %step.id, items = items.len(), cap, "element count over iteration cap, truncating");
            items.truncate(cap);
        }
        Ok(items)
    }

    fn check_depth(&self, ctx: &StepContext) -> Result<(), StepError> {
        if ctx.depth + 1 > self.config.max_nesting_depth {
            return Err(StepError::new(
                ErrorKind::Internal,
                format!("nesting depth {} exceeds limit {}", ctx.depth + 1, self.config.max_nesting_depth),
            ));
        }
        Ok(())
    }

    async fn run_loop(
        &self,
        step: &Step,
        steps: &[Step],
        items: Vec<Value>,
        fail_on_error: bool,
        results: &ResultMap,
        ctx: &StepContext,
    ) -> Result<StepOutput, StepError> {
        self.check_depth(ctx)?;

        let total = items.len();
        let mut outputs = Vec::with_capacity(total);
        let mut failures = 0;
        let mut tokens_used = 0;

        for (index, item) in items.into_iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(StepError::new(ErrorKind::Cancelled, format!("loop cancelled at iteration {index}")));
            }
            let run = self
                .nested
                .run_nested(steps, seed_iteration(results, item, index), ctx.nested())
                .await;
            tokens_used += run.total_tokens_used;

            if run.success {
                outputs.push(run.output);
                continue;
            }

            failures += 1;
            let err = first_failure(&run);
            if fail_on_error {
                return Err(StepError {
                    message: format!("'{}' iteration {index} failed: {}", step.id, err.message),
                    ..err
                });
            }
            outputs.push(json!({ "error": err }));
        }

        Ok(StepOutput {
            data: json!({
                "iterations": total,
                "successCount": total - failures,
                "failureCount": failures,
                "results": outputs,
            }),
            tokens_used,
        })
    }

    async fn run_scatter(
        &self,
        steps: &[Step],
        items: Vec<Value>,
        max_concurrency: Option<usize>,
        gather: &GatherConfig,
        results: &ResultMap,
        ctx: &StepContext,
    ) -> Result<StepOutput, StepError> {
        self.check_depth(ctx)?;

        let limit = max_concurrency.unwrap_or(self.config.max_parallel_steps).max(1);
        let total = items.len();
        let runs: Vec<ExecutionResult> = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| {
                self.nested
                    .run_nested(steps, seed_iteration(results, item, index), ctx.nested())
            })
            .buffered(limit)
            .collect()
            .await;

        let tokens_used = runs.iter().map(|r| r.total_tokens_used).sum();
        let failures = runs.iter().filter(|r| !r.success).count();
        if total > 0 && failures == total {
            let err = first_failure(&runs[0]);
            return Err(StepError {
                message: format!("all {total} elements failed; first: {}", err.message),
                ..err
            });
        }

        let successes: Vec<Value> = runs.iter().filter(|r| r.success).map(|r| r.output.clone()).collect();
        let data = match gather.operation {
            GatherOperation::Collect => {
                let items: Vec<Value> = runs
                    .iter()
                    .map(|r| if r.success { r.output.clone() } else { Value::Null })
                    .collect();
                json!({
                    "items": items,
                    "count": total,
                    "successCount": total - failures,
                    "failureCount": failures,
                })
            }
            GatherOperation::Merge => json!({
                "result": merge_outputs(successes)?,
                "successCount": total - failures,
                "failureCount": failures,
            }),
            GatherOperation::Reduce => {
                let reducer = gather.reducer.as_ref().ok_or_else(|| {
                    StepError::new(ErrorKind::DataOperation, "gather operation 'reduce' needs a reducer")
                })?;
                let op = AggregateOp::parse(&reducer.operation)?;
                json!({
                    "result": aggregate_values(&successes, op, reducer.field.as_deref()),
                    "operation": op,
                    "successCount": total - failures,
                    "failureCount": failures,
                })
            }
        };

        Ok(StepOutput { data, tokens_used })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Sync so the (non-`Send`) JEXL evaluator never lives across an await.
fn evaluate_condition(
    condition: &ConditionSpec,
    params: &Map<String, Value>,
    results: &ResultMap,
) -> Result<bool, StepError> {
    match condition {
        ConditionSpec::Expression { expression } => {
            let context = build_context(params, results);
            Ok(ConditionEvaluator::new().evaluate_bool(expression, &context)?)
        }
        ConditionSpec::Filter(rule) => Ok(filter::evaluate(&Value::Object(params.clone()), rule)?),
    }
}

/// Outer results plus the `loop` binding `{item, index}`.
fn seed_iteration(results: &ResultMap, item: Value, index: usize) -> ResultMap {
    let mut seed = results.clone();
    seed.insert(
        LOOP_BINDING.to_string(),
        StepResult::completed(LOOP_BINDING, json!({ "item": item, "index": index })),
    );
    seed
}

/// The error that sank a nested run.
fn first_failure(run: &ExecutionResult) -> StepError {
    run.results
        .values()
        .find(|r| r.is_fatal())
        .and_then(|r| r.error.clone())
        .unwrap_or_else(|| StepError::internal(run.error.clone().unwrap_or_else(|| "nested run failed".into())))
}

/// Shallow-merge object outputs or concatenate array outputs.
fn merge_outputs(outputs: Vec<Value>) -> Result<Value, StepError> {
    if outputs.iter().all(Value::is_array) {
        let merged: Vec<Value> = outputs
            .into_iter()
            .flat_map(|v| match v {
                Value::Array(items) => items,
                _ => Vec::new(),
            })
            .collect();
        return Ok(Value::Array(merged));
    }
    if outputs.iter().all(Value::is_object) {
        let mut merged = Map::new();
        for output in outputs {
            if let Value::Object(map) = output {
                merged.extend(map);
            }
        }
        return Ok(Value::Object(merged));
    }
    Err(StepError::new(
        ErrorKind::DataOperation,
        "merge needs every element output to be an object, or every one an array",
    ))
}
