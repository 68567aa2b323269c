//! Workflow engine: batch-by-batch DAG execution with checkpoints.
//!
//! `WorkflowEngine` validates a step list, seeds the `input` binding, and
//! drives the run one batch at a time:
//!
//! 1. At each batch boundary, honor pause/stop and the wall-clock budget.
//! 2. Record steps on a branch their conditional did not take as `skipped`.
//! 3. Run the rest of the batch through the [`ParallelExecutor`]; each step
//!    task applies its recovery policy (retries, then skip or fail).
//! 4. Record results in canonical batch order and checkpoint.
//!
//! Loop and scatter-gather bodies come back through [`NestedRunner`] and reuse
//! the same cycle, without checkpoints or events.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use neuronforge_types::config::EngineConfig;
use neuronforge_types::error::{ErrorKind, StepError};
use neuronforge_types::event::WorkflowEvent;
use neuronforge_types::execution::{
    Checkpoint, ExecutionResult, ExecutionStatus, ExportedState, ResultMap, StepResult, StepStatus,
};
use neuronforge_types::step::{Step, StepKind};
use neuronforge_types::validation::DagValidationResult;

use crate::event::EventBus;

use super::capability::{
    BoxAiCapability, BoxExecutionHooks, BoxPluginExecutor, NoopHooks, StepExecutionRecord, UsageRecord,
};
use super::controller::{ControlHandle, ControlSignal, ControllerError, ExecutionController};
use super::dag::{validate_dag, validate_dag_with};
use super::parallel::ParallelExecutor;
use super::reference::INPUT_BINDING;
use super::retry::{FailureAction, RecoveryHandler};
use super::step_runner::{NestedRunner, StepContext, StepRunner};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The step list failed validation; nothing ran.
    #[error("{}", .0.summary())]
    Invalid(DagValidationResult),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("run is {0} and cannot be driven")]
    NotDrivable(ExecutionStatus),
}

// ---------------------------------------------------------------------------
// WorkflowRun
// ---------------------------------------------------------------------------

/// A validated run: its steps, batch plan, and controller.
///
/// Created by [`WorkflowEngine::new_run`] or [`WorkflowEngine::resume_from`]
/// and advanced by [`WorkflowEngine::drive`]. Between drives the controller is
/// available for rollback and export.
#[derive(Debug)]
pub struct WorkflowRun {
    steps: Arc<Vec<Step>>,
    report: DagValidationResult,
    batches: Vec<Vec<String>>,
    /// Branch step id -> (conditional id, branch taken when the condition is).
    branches: HashMap<String, (String, bool)>,
    controller: ExecutionController,
    cancel: CancellationToken,
    depth: usize,
    user_id: String,
}

impl WorkflowRun {
    fn prepare(
        steps: Vec<Step>,
        report: DagValidationResult,
        controller: ExecutionController,
        cancel: CancellationToken,
        depth: usize,
        user_id: String,
    ) -> Self {
        let batches = report.batches();
        let branches = branch_owners(&steps);
        Self {
            steps: Arc::new(steps),
            report,
            batches,
            branches,
            controller,
            cancel,
            depth,
            user_id,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.controller.execution_id()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.controller.status()
    }

    /// Pause/resume/stop from another task.
    pub fn handle(&self) -> ControlHandle {
        self.controller.handle().clone()
    }

    pub fn controller(&self) -> &ExecutionController {
        &self.controller
    }

    /// Mutable access for rollback between drives.
    pub fn controller_mut(&mut self) -> &mut ExecutionController {
        &mut self.controller
    }

    pub fn report(&self) -> &DagValidationResult {
        &self.report
    }

    pub fn batches(&self) -> &[Vec<String>] {
        &self.batches
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn export_state(&self) -> ExportedState {
        self.controller.export_state()
    }

    /// Snapshot of the run as an `ExecutionResult`.
    pub fn result(&self) -> ExecutionResult {
        build_result(&self.controller)
    }

    /// Make a stored run drivable again.
    ///
    /// Paused and rolled-back runs are left as they are. Stopped and failed
    /// runs roll back to their newest clean checkpoint, or to the start when
    /// there is none. A clean checkpoint has no failures and no step that was
    /// cut short by cancellation or the workflow deadline.
    pub fn reopen(&mut self) -> Result<(), EngineError> {
        match self.controller.status() {
            ExecutionStatus::Pending | ExecutionStatus::Paused | ExecutionStatus::RolledBack => Ok(()),
            ExecutionStatus::Completed => Err(EngineError::NotDrivable(ExecutionStatus::Completed)),
            ExecutionStatus::Running => {
                self.controller.transition(ExecutionStatus::Paused)?;
                Ok(())
            }
            ExecutionStatus::Stopped | ExecutionStatus::Failed => {
                let clean = self
                    .controller
                    .checkpoints()
                    .iter()
                    .rev()
                    .find(|c| is_clean(c))
                    .map(|c| c.sequence);
                match clean {
                    Some(sequence) => self.controller.rollback_to_checkpoint(sequence)?,
                    None => {
                        let recorded = self.controller.step_results().count();
                        self.controller.discard_recent_steps(recorded)?;
                    }
                }
                Ok(())
            }
        }
    }
}

fn is_clean(checkpoint: &Checkpoint) -> bool {
    checkpoint.failed_steps.is_empty()
        && checkpoint
            .results
            .values()
            .all(|r| r.status != StepStatus::Skipped || r.error.is_none())
}

/// Map every branch step to the conditional that owns it.
fn branch_owners(steps: &[Step]) -> HashMap<String, (String, bool)> {
    let mut owners = HashMap::new();
    for step in steps {
        if let StepKind::Conditional {
            true_branch,
            false_branch,
            ..
        } = &step.kind
        {
            for id in true_branch {
                owners.entry(id.clone()).or_insert_with(|| (step.id.clone(), true));
            }
            for id in false_branch {
                owners.entry(id.clone()).or_insert_with(|| (step.id.clone(), false));
            }
        }
    }
    owners
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

enum Boundary {
    Continue,
    Stop,
}

/// The workflow engine. Cloning is cheap; clones share capabilities, hooks,
/// and the event bus.
#[derive(Debug, Clone)]
pub struct WorkflowEngine {
    config: Arc<EngineConfig>,
    plugins: Arc<BoxPluginExecutor>,
    ai: Arc<BoxAiCapability>,
    hooks: Arc<BoxExecutionHooks>,
    events: EventBus,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig, plugins: BoxPluginExecutor, ai: BoxAiCapability) -> Self {
        Self {
            config: Arc::new(config),
            plugins: Arc::new(plugins),
            ai: Arc::new(ai),
            hooks: Arc::new(BoxExecutionHooks::new(NoopHooks)),
            events: EventBus::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: BoxExecutionHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn plugins(&self) -> &BoxPluginExecutor {
        &self.plugins
    }

    /// Structural validation only; nothing runs.
    pub fn validate(&self, steps: &[Step]) -> DagValidationResult {
        validate_dag(steps)
    }

    /// Validate, run to the end, and return the result.
    ///
    /// An invalid step list returns a failed result carrying the validation
    /// summary; no step, hook, or event fires in that case.
    pub async fn execute(&self, steps: &[Step], input: Value) -> ExecutionResult {
        let mut run = match self.new_run(steps.to_vec(), input) {
            Ok(run) => run,
            Err(err) => return invalid_result(Uuid::now_v7(), err.to_string()),
        };
        match self.drive(&mut run).await {
            Ok(result) => result,
            Err(err) => {
                warn!(execution_id = %run.execution_id(), error = %err, "run could not be driven");
                run.result()
            }
        }
    }

    /// Validate `steps` and prepare a run seeded with `input`.
    pub fn new_run(&self, steps: Vec<Step>, input: Value) -> Result<WorkflowRun, EngineError> {
        let report = validate_dag(&steps);
        if !report.is_valid {
            return Err(EngineError::Invalid(report));
        }
        for warning in &report.warnings {
            debug!(warning = %warning, "validation warning");
        }

        let order = report.execution_order.clone().unwrap_or_default();
        let mut controller = ExecutionController::new(Uuid::now_v7(), order, self.config.max_checkpoints);
        controller.seed(StepResult::completed(INPUT_BINDING, input));
        let cancel = controller.handle().token();

        Ok(WorkflowRun::prepare(
            steps,
            report,
            controller,
            cancel,
            0,
            self.config.user_id.clone(),
        ))
    }

    /// Rebuild a run from exported state. A run that was `running` when it
    /// was exported (a crash) comes back paused.
    pub fn resume_from(&self, steps: Vec<Step>, exported: ExportedState) -> Result<WorkflowRun, EngineError> {
        let report = validate_dag(&steps);
        if !report.is_valid {
            return Err(EngineError::Invalid(report));
        }

        let order = report.execution_order.clone().unwrap_or_default();
        let mut controller = ExecutionController::import_state(exported, order, self.config.max_checkpoints);
        if controller.status() == ExecutionStatus::Running {
            controller.transition(ExecutionStatus::Paused)?;
        }
        let cancel = controller.handle().token();

        info!(
            execution_id = %controller.execution_id(),
            status = %controller.status(),
            recorded = controller.step_results().count(),
            "restored run"
        );
        Ok(WorkflowRun::prepare(
            steps,
            report,
            controller,
            cancel,
            0,
            self.config.user_id.clone(),
        ))
    }

    /// Advance a run until it completes, fails, or is stopped.
    ///
    /// Steps already recorded are not run again, so a paused, restored, or
    /// rolled-back run picks up where its results leave off.
    pub async fn drive(&self, run: &mut WorkflowRun) -> Result<ExecutionResult, EngineError> {
        let status = run.controller.status();
        if status.is_terminal() {
            return Err(EngineError::NotDrivable(status));
        }

        let top_level = run.depth == 0;
        let execution_id = run.execution_id();
        if top_level {
            run.cancel = run.controller.handle().token();
        }
        run.controller.transition(ExecutionStatus::Running)?;
        if top_level {
            if status == ExecutionStatus::Pending {
                info!(
                    %execution_id,
                    steps = run.steps.len(),
                    batches = run.batches.len(),
                    "starting workflow run"
                );
                self.events.publish(WorkflowEvent::RunStarted {
                    execution_id,
                    total_steps: run.steps.len(),
                    batches: run.batches.len(),
                });
            } else {
                info!(%execution_id, from = %status, "resuming workflow run");
                self.events.publish(WorkflowEvent::RunResumed { execution_id });
            }
        }

        let executor = ParallelExecutor::new(self.config.max_parallel_steps, self.config.continue_on_error);
        let budget = Duration::from_secs(self.config.workflow_timeout_secs);
        let mut stopped = false;

        for batch_no in 0..run.batches.len() {
            if top_level {
                if let Boundary::Stop = self.boundary(run).await? {
                    stopped = true;
                    break;
                }
            } else if run.cancel.is_cancelled() {
                stopped = true;
                break;
            }

            let elapsed = Duration::from_millis(run.controller.elapsed_ms());
            if top_level && elapsed >= budget {
                self.time_out(run, budget)?;
                break;
            }

            let batch = run.batches[batch_no].clone();
            let pending: Vec<String> = batch.into_iter().filter(|id| !run.controller.is_recorded(id)).collect();
            if pending.is_empty() {
                continue;
            }

            run.controller.set_position(batch_no, None);
            debug!(%execution_id, batch = batch_no, steps = pending.len(), depth = run.depth, "processing batch");
            if top_level {
                self.events.publish(WorkflowEvent::BatchStarted {
                    execution_id,
                    batch: batch_no,
                    steps: pending.clone(),
                });
            }

            // Branches not taken never run.
            let mut to_run = Vec::with_capacity(pending.len());
            for step_id in pending {
                match skip_reason(run, &step_id) {
                    Some(reason) => {
                        debug!(step_id = %step_id, reason = %reason, "skipping step");
                        if top_level {
                            self.events.publish(WorkflowEvent::StepSkipped {
                                execution_id,
                                step_id: step_id.clone(),
                                reason,
                            });
                        }
                        run.controller.record(StepResult::skipped(step_id, None));
                    }
                    None => to_run.push(step_id),
                }
            }

            let mut timed_out = false;
            let mut failure = None;
            if !to_run.is_empty() {
                let deadline = top_level.then(|| Instant::now() + budget.saturating_sub(elapsed));
                let engine = self.clone();
                let steps = Arc::clone(&run.steps);
                let snapshot = Arc::new(run.controller.results().clone());
                let base = StepContext {
                    execution_id,
                    user_id: run.user_id.clone(),
                    depth: run.depth,
                    cancel: run.cancel.clone(),
                };

                let outcome = executor
                    .run_batch(&to_run, deadline, &run.cancel, move |step_id, token| {
                        let engine = engine.clone();
                        let steps = Arc::clone(&steps);
                        let snapshot = Arc::clone(&snapshot);
                        let ctx = StepContext {
                            cancel: token,
                            ..base.clone()
                        };
                        async move {
                            match steps.iter().find(|s| s.id == step_id) {
                                Some(step) => engine.run_step(step, &snapshot, ctx).await,
                                None => StepResult::failed(step_id, StepError::internal("step missing from run")),
                            }
                        }
                    })
                    .await;

                timed_out = outcome.timed_out;
                failure = outcome.fatal_steps().next().map(|r| {
                    let message = r.error.as_ref().map(|e| e.message.as_str()).unwrap_or("unknown error");
                    format!("step '{}' failed: {message}", r.step_id)
                });
                for result in outcome.results {
                    if top_level && result.status == StepStatus::Skipped {
                        let reason = result
                            .error
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "skipped".to_string());
                        self.events.publish(WorkflowEvent::StepSkipped {
                            execution_id,
                            step_id: result.step_id.clone(),
                            reason,
                        });
                    }
                    run.controller.record(result);
                }
            }

            if top_level {
                let sequence = run.controller.checkpoint(Some(batch_no)).sequence;
                self.events.publish(WorkflowEvent::CheckpointTaken { execution_id, sequence });
            }

            if timed_out {
                self.time_out(run, budget)?;
                break;
            }
            if run.cancel.is_cancelled() {
                stopped = true;
                break;
            }
            if let Some(reason) = failure {
                warn!(%execution_id, batch = batch_no, reason = %reason, "failing run");
                run.controller.fail(reason)?;
                break;
            }
        }

        if stopped {
            info!(%execution_id, "run stopped");
            run.controller.transition(ExecutionStatus::Stopped)?;
        } else if run.controller.status() == ExecutionStatus::Running {
            run.controller.transition(ExecutionStatus::Completed)?;
        }

        let result = build_result(&run.controller);
        if top_level {
            self.finish(&result).await;
        }
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Boundaries
    // -----------------------------------------------------------------------

    /// Honor pause and stop before the next batch.
    async fn boundary(&self, run: &mut WorkflowRun) -> Result<Boundary, EngineError> {
        let handle = run.handle();
        let execution_id = run.execution_id();
        match handle.signal() {
            ControlSignal::Stop => return Ok(Boundary::Stop),
            ControlSignal::Run if run.cancel.is_cancelled() => return Ok(Boundary::Stop),
            ControlSignal::Run => return Ok(Boundary::Continue),
            ControlSignal::Pause => {}
        }

        run.controller.transition(ExecutionStatus::Paused)?;
        info!(%execution_id, "run paused");
        self.events.publish(WorkflowEvent::RunPaused { execution_id });

        let signal = tokio::select! {
            signal = handle.wait_while_paused() => signal,
            _ = run.cancel.cancelled() => ControlSignal::Stop,
        };
        if signal == ControlSignal::Stop {
            return Ok(Boundary::Stop);
        }

        run.controller.transition(ExecutionStatus::Running)?;
        info!(%execution_id, "run resumed");
        self.events.publish(WorkflowEvent::RunResumed { execution_id });
        Ok(Boundary::Continue)
    }

    fn time_out(&self, run: &mut WorkflowRun, budget: Duration) -> Result<(), EngineError> {
        warn!(execution_id = %run.execution_id(), budget_secs = budget.as_secs(), "workflow timed out");
        run.cancel.cancel();
        run.controller
            .fail(format!("workflow timed out after {}s", budget.as_secs()))?;
        Ok(())
    }

    async fn finish(&self, result: &ExecutionResult) {
        info!(
            execution_id = %result.execution_id,
            status = %result.status,
            completed = result.steps_completed,
            failed = result.steps_failed,
            skipped = result.steps_skipped,
            duration_ms = result.total_execution_time_ms,
            "workflow run finished"
        );
        self.events.publish(WorkflowEvent::RunFinished {
            execution_id: result.execution_id,
            status: result.status,
            duration_ms: result.total_execution_time_ms,
        });
        if let Err(err) = self.hooks.run_finished(result).await {
            warn!(execution_id = %result.execution_id, error = %err, "run_finished hook failed");
        }
    }

    // -----------------------------------------------------------------------
    // Per-step task
    // -----------------------------------------------------------------------

    /// Run one step to its final result: attempts, timeouts, retries, and
    /// whether the policy lets the run continue past a failure.
    async fn run_step(&self, step: &Step, results: &ResultMap, ctx: StepContext) -> StepResult {
        let top_level = ctx.depth == 0;
        let policy = RecoveryHandler::policy_for(step, &self.config);
        let step_timeout = Duration::from_secs(step.timeout_secs.unwrap_or(self.config.step_timeout_secs));
        let runner = StepRunner::new(&self.plugins, &self.ai, &self.config, self);
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut attempt = 1;

        loop {
            if top_level {
                self.events.publish(WorkflowEvent::StepStarted {
                    execution_id: ctx.execution_id,
                    step_id: step.id.clone(),
                    step_type: step.step_type(),
                    attempt,
                });
                self.log_step(step, &ctx, StepStatus::Running, attempt, None).await;
            }

            let outcome = match tokio::time::timeout(step_timeout, runner.run(step, results, &ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StepError::new(
                    ErrorKind::StepTimeout,
                    format!("step timed out after {}s", step_timeout.as_secs()),
                )),
            };
            let elapsed_ms = clock.elapsed().as_millis() as u64;

            let err = match outcome {
                Ok(output) => {
                    let mut result = StepResult::completed(step.id.clone(), output.data)
                        .with_tokens(output.tokens_used)
                        .with_timing(started_at, elapsed_ms);
                    result.attempts = attempt;
                    debug!(step_id = %step.id, attempt, elapsed_ms, "step completed");
                    if top_level {
                        self.events.publish(WorkflowEvent::StepCompleted {
                            execution_id: ctx.execution_id,
                            step_id: step.id.clone(),
                            duration_ms: elapsed_ms,
                            tokens_used: result.tokens_used,
                        });
                        self.update_step(step, &ctx, &result).await;
                    }
                    return result;
                }
                Err(err) => err,
            };

            if err.kind == ErrorKind::Cancelled || ctx.cancel.is_cancelled() {
                let mut result = StepResult::skipped(step.id.clone(), Some(err)).with_timing(started_at, elapsed_ms);
                result.attempts = attempt;
                return result;
            }

            let will_retry = RecoveryHandler::should_retry(policy, attempt, &err);
            if top_level {
                self.events.publish(WorkflowEvent::StepFailed {
                    execution_id: ctx.execution_id,
                    step_id: step.id.clone(),
                    error: err.to_string(),
                    will_retry,
                });
            }

            if will_retry {
                let delay = RecoveryHandler::backoff_delay(RecoveryHandler::backoff_for(policy, &self.config), attempt);
                warn!(
                    step_id = %step.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "step failed, retrying"
                );
                if RecoveryHandler::wait(delay, &ctx.cancel).await {
                    attempt += 1;
                    continue;
                }
            }

            let mut result = match RecoveryHandler::on_failure(policy) {
                FailureAction::Continue => {
                    debug!(step_id = %step.id, error = %err, "step failed, continuing per policy");
                    StepResult::failed_tolerated(step.id.clone(), err)
                }
                FailureAction::Abort => StepResult::failed(step.id.clone(), err),
            }
            .with_timing(started_at, elapsed_ms);
            result.attempts = attempt;
            if top_level {
                self.update_step(step, &ctx, &result).await;
            }
            return result;
        }
    }

    // -----------------------------------------------------------------------
    // Hooks (best effort)
    // -----------------------------------------------------------------------

    async fn log_step(&self, step: &Step, ctx: &StepContext, status: StepStatus, attempt: u32, error: Option<String>) {
        let record = StepExecutionRecord {
            execution_id: ctx.execution_id,
            step_id: step.id.clone(),
            step_type: step.step_type(),
            status,
            attempt,
            tokens_used: 0,
            execution_time_ms: 0,
            error,
        };
        if let Err(err) = self.hooks.log_step_execution(&record).await {
            warn!(step_id = %step.id, error = %err, "step log hook failed");
        }
    }

    async fn update_step(&self, step: &Step, ctx: &StepContext, result: &StepResult) {
        let record = StepExecutionRecord {
            execution_id: ctx.execution_id,
            step_id: step.id.clone(),
            step_type: step.step_type(),
            status: result.status,
            attempt: result.attempts,
            tokens_used: result.tokens_used,
            execution_time_ms: result.execution_time_ms,
            error: result.error.as_ref().map(ToString::to_string),
        };
        if let Err(err) = self.hooks.update_step_execution(&record).await {
            warn!(step_id = %step.id, error = %err, "step update hook failed");
        }

        if result.tokens_used > 0 {
            let usage = UsageRecord {
                execution_id: ctx.execution_id,
                user_id: ctx.user_id.clone(),
                step_id: step.id.clone(),
                tokens_used: result.tokens_used,
            };
            if let Err(err) = self.hooks.record_usage(&usage).await {
                warn!(step_id = %step.id, error = %err, "usage hook failed");
            }
        }
    }
}

impl NestedRunner for WorkflowEngine {
    fn run_nested<'a>(
        &'a self,
        steps: &'a [Step],
        seed: ResultMap,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'a>> {
        Box::pin(async move {
            let external: HashSet<String> = seed.keys().cloned().collect();
            let report = validate_dag_with(steps, &external);
            if !report.is_valid {
                return invalid_result(ctx.execution_id, report.summary());
            }

            let order = report.execution_order.clone().unwrap_or_default();
            let mut controller = ExecutionController::new(ctx.execution_id, order, None);
            for (_, result) in seed {
                controller.seed(result);
            }
            let mut run = WorkflowRun::prepare(steps.to_vec(), report, controller, ctx.cancel, ctx.depth, ctx.user_id);

            match self.drive(&mut run).await {
                Ok(result) => result,
                Err(err) => invalid_result(ctx.execution_id, err.to_string()),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Why a branch step should not run, if its conditional rules it out.
fn skip_reason(run: &WorkflowRun, step_id: &str) -> Option<String> {
    let (owner, branch) = run.branches.get(step_id)?;
    let decision = run.controller.results().get(owner)?;
    if !decision.is_completed() {
        return Some(format!("condition '{owner}' did not complete"));
    }
    let taken = decision.data.get("result").and_then(Value::as_bool).unwrap_or(false);
    (taken != *branch).then(|| format!("branch not taken by '{owner}'"))
}

fn build_result(controller: &ExecutionController) -> ExecutionResult {
    let results: ResultMap = controller
        .step_results()
        .map(|r| (r.step_id.clone(), r.clone()))
        .collect();
    let output = results
        .values()
        .filter(|r| r.is_completed())
        .last()
        .map(|r| r.data.clone())
        .unwrap_or(Value::Null);
    let status = controller.status();
    let error = controller.state().error.clone().or_else(|| match status {
        ExecutionStatus::Stopped => Some("execution stopped".to_string()),
        ExecutionStatus::RolledBack => Some("execution rolled back".to_string()),
        _ => None,
    });

    ExecutionResult {
        execution_id: controller.execution_id(),
        status,
        success: status == ExecutionStatus::Completed,
        output,
        steps_completed: controller.completed_steps().len(),
        steps_failed: controller.failed_steps().len(),
        steps_skipped: controller.skipped_count(),
        total_execution_time_ms: controller.elapsed_ms(),
        total_tokens_used: results.values().map(|r| r.tokens_used).sum(),
        error,
        results,
    }
}

fn invalid_result(execution_id: Uuid, summary: String) -> ExecutionResult {
    ExecutionResult {
        execution_id,
        status: ExecutionStatus::Failed,
        success: false,
        output: Value::Null,
        steps_completed: 0,
        steps_failed: 0,
        steps_skipped: 0,
        total_execution_time_ms: 0,
        total_tokens_used: 0,
        error: Some(summary),
        results: ResultMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use neuronforge_types::error::{AiError, PluginError};
    use neuronforge_types::step::{
        BackoffConfig, ConditionSpec, ExhaustedAction, GatherConfig, GatherOperation, RecoveryPolicy,
    };
    use serde_json::json;
    use tokio::sync::Notify;

    use crate::workflow::capability::{
        AiCapability, AiRequest, AiResponse, ExecutionHooks, HookError, PluginCall, PluginExecutor,
    };

    // -------------------------------------------------------------------
    // Test collaborators
    // -------------------------------------------------------------------

    #[derive(Default)]
    struct PluginState {
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: Mutex<Vec<String>>,
        attempts: AtomicUsize,
        gate: Notify,
    }

    #[derive(Clone, Default)]
    struct TestPlugins(Arc<PluginState>);

    impl PluginExecutor for TestPlugins {
        async fn execute(&self, call: &PluginCall, cancel: CancellationToken) -> Result<Value, PluginError> {
            let state = &self.0;
            state.calls.lock().unwrap().push(call.action.clone());
            match call.action.as_str() {
                "fetch" => Ok(json!([{"a": 1}, {"a": 2}, {"a": 3}])),
                "echo" => Ok(call.params.clone()),
                "slow" => {
                    let now = state.running.fetch_add(1, Ordering::SeqCst) + 1;
                    state.peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    state.running.fetch_sub(1, Ordering::SeqCst);
                    Ok(call.params.clone())
                }
                "flaky" => {
                    let attempt = state.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let succeed_on = call.params["succeed_on"].as_u64().unwrap_or(u64::MAX) as usize;
                    if attempt >= succeed_on {
                        Ok(json!({"attempt": attempt}))
                    } else {
                        Err(PluginError::ProviderError(format!("attempt {attempt} failed")))
                    }
                }
                "expired" => Err(PluginError::AuthExpired("token revoked".into())),
                "gate" => {
                    state.gate.notified().await;
                    Ok(json!("released"))
                }
                "hang" => {
                    cancel.cancelled().await;
                    Err(PluginError::ProviderError("cancelled".into()))
                }
                other => Err(PluginError::InvalidParams(format!("unknown action {other}"))),
            }
        }
    }

    struct TokenAi;

    impl AiCapability for TokenAi {
        async fn run(&self, request: &AiRequest, _cancel: CancellationToken) -> Result<AiResponse, AiError> {
            Ok(AiResponse {
                output: json!({"summary": request.prompt}),
                tokens_used: 25,
            })
        }
    }

    #[derive(Clone, Default)]
    struct RecordingHooks {
        updates: Arc<Mutex<Vec<StepExecutionRecord>>>,
        usage: Arc<AtomicUsize>,
    }

    impl ExecutionHooks for RecordingHooks {
        async fn log_step_execution(&self, _record: &StepExecutionRecord) -> Result<(), HookError> {
            Err(HookError("log store offline".into()))
        }

        async fn update_step_execution(&self, record: &StepExecutionRecord) -> Result<(), HookError> {
            self.updates.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn record_usage(&self, usage: &UsageRecord) -> Result<(), HookError> {
            self.usage.fetch_add(usage.tokens_used as usize, Ordering::SeqCst);
            Ok(())
        }
    }

    fn engine_with(config: EngineConfig, plugins: TestPlugins) -> WorkflowEngine {
        WorkflowEngine::new(config, BoxPluginExecutor::new(plugins), BoxAiCapability::new(TokenAi))
    }

    fn engine(plugins: TestPlugins) -> WorkflowEngine {
        engine_with(EngineConfig::default(), plugins)
    }

    fn plugin(id: &str, action: &str) -> Step {
        Step::new(
            id,
            StepKind::PluginAction {
                plugin: "test".into(),
                action: action.into(),
            },
        )
    }

    fn fast_retry(max_attempts: u32, on_exhausted: ExhaustedAction) -> RecoveryPolicy {
        RecoveryPolicy::Retry {
            max_attempts,
            backoff: Some(BackoffConfig {
                initial_delay_ms: 1,
                multiplier: 1.0,
                max_delay_ms: 1,
            }),
            on_exhausted,
        }
    }

    /// step1 fetches, step2 filters, step3 and step4 both consume step2.
    fn four_steps() -> Vec<Step> {
        vec![
            plugin("step1", "fetch"),
            Step::new("step2", StepKind::Transform { operation: "filter".into() })
                .param("items", "{{step1.data}}")
                .param("condition", json!({"field": "a", "operator": ">", "value": 1})),
            plugin("step3", "slow").param("count", "{{step2.data.count}}"),
            plugin("step4", "slow").param("first", "{{step2.data.items[0].a}}"),
        ]
    }

    // -------------------------------------------------------------------
    // Happy path
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn four_step_scenario_batches_and_runs_concurrently() {
        let plugins = TestPlugins::default();
        let engine = engine(plugins.clone());
        let steps = four_steps();

        let report = engine.validate(&steps);
        assert_eq!(
            report.batches(),
            vec![
                vec!["step1".to_string()],
                vec!["step2".to_string()],
                vec!["step3".to_string(), "step4".to_string()],
            ]
        );

        let result = engine.execute(&steps, json!({})).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.steps_completed, 4);
        assert_eq!(result.results["step2"].data["count"], 2);
        assert_eq!(result.results["step3"].data, json!({"count": 2}));
        assert_eq!(result.output, json!({"first": 2}));
        assert_eq!(plugins.0.peak.load(Ordering::SeqCst), 2);
        assert!(!result.results.contains_key("input"));
    }

    #[tokio::test]
    async fn input_binding_is_resolvable() {
        let engine = engine(TestPlugins::default());
        let steps = vec![plugin("greet", "echo").param("who", "{{input.name}}")];
        let result = engine.execute(&steps, json!({"name": "Ada"})).await;
        assert_eq!(result.output, json!({"who": "Ada"}));
    }

    #[tokio::test]
    async fn events_follow_the_run() {
        let engine = engine(TestPlugins::default());
        let mut rx = engine.events().subscribe();
        let result = engine.execute(&[plugin("only", "echo")], json!({})).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.execution_id(), result.execution_id);
            kinds.push(match event {
                WorkflowEvent::RunStarted { .. } => "run_started",
                WorkflowEvent::BatchStarted { .. } => "batch_started",
                WorkflowEvent::StepStarted { .. } => "step_started",
                WorkflowEvent::StepCompleted { .. } => "step_completed",
                WorkflowEvent::CheckpointTaken { .. } => "checkpoint",
                WorkflowEvent::RunFinished { .. } => "run_finished",
                _ => "other",
            });
        }
        assert_eq!(
            kinds,
            vec!["run_started", "batch_started", "step_started", "step_completed", "checkpoint", "run_finished"]
        );
    }

    #[tokio::test]
    async fn tokens_are_totalled_and_hooks_are_best_effort() {
        let hooks = RecordingHooks::default();
        let engine = engine(TestPlugins::default()).with_hooks(BoxExecutionHooks::new(hooks.clone()));
        let steps = vec![Step::new(
            "think",
            StepKind::AiProcessing {
                prompt: "summarize".into(),
                output_schema: None,
            },
        )];

        let result = engine.execute(&steps, json!({})).await;
        assert!(result.success);
        assert_eq!(result.total_tokens_used, 25);
        assert_eq!(hooks.usage.load(Ordering::SeqCst), 25);
        let updates = hooks.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, StepStatus::Completed);
    }

    // -------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn invalid_workflow_has_no_side_effects() {
        let plugins = TestPlugins::default();
        let engine = engine(plugins.clone());
        let mut rx = engine.events().subscribe();
        let steps = vec![
            plugin("a", "echo").depends_on("b"),
            plugin("b", "echo").depends_on("a"),
        ];

        let result = engine.execute(&steps, json!({})).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("cycle detected"));
        assert!(result.results.is_empty());
        assert!(plugins.0.calls.lock().unwrap().is_empty());
        assert!(rx.try_recv().is_err());

        assert!(matches!(engine.new_run(steps, json!({})), Err(EngineError::Invalid(_))));
    }

    // -------------------------------------------------------------------
    // Recovery
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn retry_policy_recovers_from_transient_errors() {
        let plugins = TestPlugins::default();
        let engine = engine(plugins.clone());
        let steps = vec![
            plugin("call", "flaky")
                .param("succeed_on", 3)
                .with_recovery(fast_retry(3, ExhaustedAction::FailWorkflow)),
        ];

        let result = engine.execute(&steps, json!({})).await;
        assert!(result.success);
        assert_eq!(result.results["call"].attempts, 3);
        assert_eq!(result.output, json!({"attempt": 3}));
    }

    #[tokio::test]
    async fn non_retryable_errors_are_not_retried() {
        let plugins = TestPlugins::default();
        let engine = engine(plugins.clone());
        let steps = vec![plugin("auth", "expired").with_recovery(fast_retry(5, ExhaustedAction::FailWorkflow))];

        let result = engine.execute(&steps, json!({})).await;
        assert!(!result.success);
        assert_eq!(result.results["auth"].attempts, 1);
        assert_eq!(result.results["auth"].error.as_ref().unwrap().kind, ErrorKind::AuthExpired);
        assert_eq!(plugins.0.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn skip_policy_records_failure_and_lets_dependents_run_with_null() {
        let engine = engine(TestPlugins::default());
        let steps = vec![
            plugin("auth", "expired").with_recovery(RecoveryPolicy::Skip),
            plugin("after", "echo").param("upstream", "{{auth.data}}"),
        ];

        let mut run = engine.new_run(steps, json!({})).unwrap();
        let result = engine.drive(&mut run).await.unwrap();
        assert!(result.success);
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.results["auth"].status, StepStatus::Failed);
        assert!(result.results["auth"].error.is_some());
        assert_eq!(result.steps_failed, 1);
        assert_eq!(result.steps_skipped, 0);
        assert_eq!(result.output, json!({"upstream": null}));
        assert_eq!(run.controller().failed_steps(), ["auth"]);
        assert_eq!(run.controller().checkpoints()[0].failed_steps, vec!["auth".to_string()]);
    }

    #[tokio::test]
    async fn skip_policy_failure_does_not_cancel_siblings() {
        let config = EngineConfig {
            continue_on_error: false,
            ..EngineConfig::default()
        };
        let engine = engine_with(config, TestPlugins::default());
        let steps = vec![
            plugin("auth", "expired").with_recovery(RecoveryPolicy::Skip),
            plugin("work", "slow").param("n", 1),
        ];

        let result = engine.execute(&steps, json!({})).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.results["work"].status, StepStatus::Completed);
        assert_eq!(result.steps_failed, 1);
    }

    #[tokio::test]
    async fn fail_workflow_stops_scheduling_and_keeps_partial_results() {
        let plugins = TestPlugins::default();
        let engine = engine(plugins.clone());
        let steps = vec![
            plugin("first", "echo").param("n", 1),
            plugin("auth", "expired").depends_on("first"),
            plugin("never", "echo").depends_on("auth"),
        ];

        let result = engine.execute(&steps, json!({})).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.steps_completed, 1);
        assert_eq!(result.steps_failed, 1);
        assert!(result.error.unwrap().contains("step 'auth' failed"));
        assert!(!result.results.contains_key("never"));
        assert_eq!(result.output, json!({"n": 1}));
    }

    #[tokio::test]
    async fn fail_fast_cancels_batch_siblings() {
        let config = EngineConfig {
            continue_on_error: false,
            ..EngineConfig::default()
        };
        let engine = engine_with(config, TestPlugins::default());
        let steps = vec![plugin("auth", "expired"), plugin("stuck", "hang")];

        let result = engine.execute(&steps, json!({})).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.results["stuck"].status, StepStatus::Skipped);
        assert_eq!(
            result.results["stuck"].error.as_ref().unwrap().kind,
            ErrorKind::Cancelled
        );
    }

    // -------------------------------------------------------------------
    // Timeouts
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn step_timeout_fails_the_step() {
        let engine = engine(TestPlugins::default());
        let mut step = plugin("stuck", "gate");
        step.timeout_secs = Some(0);
        let result = engine.execute(&[step], json!({})).await;
        assert!(!result.success);
        assert_eq!(result.results["stuck"].error.as_ref().unwrap().kind, ErrorKind::StepTimeout);
    }

    #[tokio::test]
    async fn workflow_timeout_fails_the_run() {
        let config = EngineConfig {
            workflow_timeout_secs: 0,
            ..EngineConfig::default()
        };
        let engine = engine_with(config, TestPlugins::default());
        let result = engine.execute(&[plugin("a", "echo")], json!({})).await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.unwrap().contains("timed out"));
        assert!(result.results.is_empty());
    }

    // -------------------------------------------------------------------
    // Control
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn pause_is_honored_after_the_batch_finishes() {
        let plugins = TestPlugins::default();
        let engine = engine(plugins.clone());
        let mut rx = engine.events().subscribe();
        let steps = vec![
            plugin("held", "gate"),
            plugin("quick", "echo"),
            plugin("later", "echo").depends_on("held"),
        ];
        let mut run = engine.new_run(steps, json!({})).unwrap();
        let handle = run.handle();

        let driver = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let result = engine.drive(&mut run).await;
                (run, result)
            })
        };

        // wait until the gated step is running, then pause mid-batch
        loop {
            if let Ok(WorkflowEvent::StepStarted { step_id, .. }) = rx.recv().await {
                if step_id == "held" {
                    break;
                }
            }
        }
        handle.pause();
        plugins.0.gate.notify_one();

        let mut seen = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                WorkflowEvent::StepCompleted { step_id, .. } => seen.push(step_id),
                WorkflowEvent::RunPaused { .. } => break,
                WorkflowEvent::BatchStarted { batch, .. } => panic!("batch {batch} started while paused"),
                _ => {}
            }
        }
        seen.sort();
        assert_eq!(seen, vec!["held".to_string(), "quick".to_string()]);

        handle.resume();
        let (run, result) = driver.await.unwrap();
        let result = result.unwrap();
        assert!(result.success);
        assert_eq!(result.steps_completed, 3);
        assert_eq!(run.status(), ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn stop_before_start_records_nothing() {
        let engine = engine(TestPlugins::default());
        let mut run = engine.new_run(vec![plugin("a", "echo")], json!({})).unwrap();
        run.handle().stop();

        let result = engine.drive(&mut run).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Stopped);
        assert_eq!(result.error.as_deref(), Some("execution stopped"));
        assert_eq!(run.controller().remaining_steps(), vec!["a".to_string()]);
        assert!(matches!(
            engine.drive(&mut run).await,
            Err(EngineError::NotDrivable(ExecutionStatus::Stopped))
        ));
    }

    #[tokio::test]
    async fn rollback_then_drive_reruns_later_steps() {
        let plugins = TestPlugins::default();
        let engine = engine(plugins.clone());
        let steps = vec![
            plugin("a", "echo").param("n", 1),
            plugin("b", "echo").param("prev", "{{a.data.n}}"),
        ];
        let mut run = engine.new_run(steps, json!({})).unwrap();
        engine.drive(&mut run).await.unwrap();
        let first = run.controller().checkpoints()[0].sequence;

        run.controller_mut().rollback_to_checkpoint(first).unwrap();
        assert_eq!(run.status(), ExecutionStatus::RolledBack);
        assert_eq!(run.controller().remaining_steps(), vec!["b".to_string()]);

        let result = engine.drive(&mut run).await.unwrap();
        assert!(result.success);
        assert_eq!(result.steps_completed, 2);
        // a ran once, b twice
        assert_eq!(plugins.0.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn export_then_resume_continues_a_stopped_run() {
        let plugins = TestPlugins::default();
        let engine = engine(plugins.clone());
        let steps = vec![plugin("a", "echo").param("n", 1), plugin("b", "echo").depends_on("a")];

        let mut run = engine.new_run(steps.clone(), json!({"seed": true})).unwrap();
        run.handle().stop();
        engine.drive(&mut run).await.unwrap();
        let exported = run.export_state();

        let mut restored = engine.resume_from(steps, exported).unwrap();
        assert_eq!(restored.execution_id(), run.execution_id());
        restored.reopen().unwrap();
        let result = engine.drive(&mut restored).await.unwrap();
        assert!(result.success);
        assert_eq!(result.steps_completed, 2);
        assert!(restored.controller().results().contains_key("input"));
    }

    #[tokio::test]
    async fn aborted_run_can_be_reopened_and_driven() {
        let engine = engine(TestPlugins::default());
        let steps = vec![plugin("a", "echo").param("n", 1), plugin("b", "echo").depends_on("a")];
        let mut run = engine.new_run(steps, json!({})).unwrap();
        run.handle().abort();
        let result = engine.drive(&mut run).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Stopped);

        run.reopen().unwrap();
        assert_eq!(run.status(), ExecutionStatus::RolledBack);
        assert!(!run.handle().token().is_cancelled());
        let result = engine.drive(&mut run).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.steps_completed, 2);
    }

    #[tokio::test]
    async fn timed_out_run_can_be_reopened_and_driven() {
        let config = EngineConfig {
            workflow_timeout_secs: 0,
            ..EngineConfig::default()
        };
        let strict = engine_with(config, TestPlugins::default());
        let mut run = strict.new_run(vec![plugin("a", "echo")], json!({})).unwrap();
        let result = strict.drive(&mut run).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(run.handle().token().is_cancelled());

        run.reopen().unwrap();
        let relaxed = engine(TestPlugins::default());
        let result = relaxed.drive(&mut run).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.steps_completed, 1);
    }

    #[tokio::test]
    async fn reopen_ignores_checkpoints_with_interrupted_steps() {
        let config = EngineConfig {
            continue_on_error: false,
            ..EngineConfig::default()
        };
        let engine = engine_with(config, TestPlugins::default());
        let steps = vec![
            plugin("first", "echo"),
            plugin("auth", "expired").depends_on("first"),
            plugin("stuck", "hang").depends_on("first"),
        ];
        let mut run = engine.new_run(steps, json!({})).unwrap();
        engine.drive(&mut run).await.unwrap();
        assert_eq!(run.status(), ExecutionStatus::Failed);
        assert_eq!(run.controller().checkpoints().len(), 2);

        run.reopen().unwrap();
        assert_eq!(run.controller().checkpoints().len(), 1);
        assert_eq!(
            run.controller().remaining_steps(),
            vec!["auth".to_string(), "stuck".to_string()]
        );
    }

    #[tokio::test]
    async fn reopen_failed_run_rolls_back_past_the_failure() {
        let engine = engine(TestPlugins::default());
        let steps = vec![plugin("ok", "echo"), plugin("bad", "expired").depends_on("ok")];
        let mut run = engine.new_run(steps, json!({})).unwrap();
        engine.drive(&mut run).await.unwrap();
        assert_eq!(run.status(), ExecutionStatus::Failed);

        run.reopen().unwrap();
        assert_eq!(run.status(), ExecutionStatus::RolledBack);
        assert_eq!(run.controller().completed_steps(), ["ok"]);
        assert_eq!(run.controller().remaining_steps(), vec!["bad".to_string()]);
    }

    // -------------------------------------------------------------------
    // Control flow
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn conditional_skips_the_branch_not_taken() {
        let engine = engine(TestPlugins::default());
        let steps = vec![
            Step::new(
                "check",
                StepKind::Conditional {
                    condition: ConditionSpec::Expression {
                        expression: "score > 5".into(),
                    },
                    true_branch: vec!["high".into()],
                    false_branch: vec!["low".into()],
                },
            )
            .param("score", "{{input.score}}"),
            plugin("high", "echo").param("level", "high"),
            plugin("low", "echo").param("level", "low"),
        ];

        let result = engine.execute(&steps, json!({"score": 9})).await;
        assert!(result.success);
        assert_eq!(result.results["high"].status, StepStatus::Completed);
        assert_eq!(result.results["low"].status, StepStatus::Skipped);
        assert_eq!(result.output, json!({"level": "high"}));
    }

    #[tokio::test]
    async fn loop_body_runs_through_the_engine() {
        let engine = engine(TestPlugins::default());
        let steps = vec![
            Step::new(
                "each",
                StepKind::Loop {
                    items: "{{input.names}}".into(),
                    steps: vec![plugin("greet", "echo").param("name", "{{loop.item}}")],
                    max_iterations: None,
                    fail_on_error: true,
                },
            ),
        ];

        let result = engine.execute(&steps, json!({"names": ["ada", "bo"]})).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.output["iterations"], 2);
        assert_eq!(result.output["results"][1], json!({"name": "bo"}));
    }

    #[tokio::test]
    async fn scatter_gather_collects_in_element_order() {
        let engine = engine(TestPlugins::default());
        let steps = vec![
            plugin("source", "fetch"),
            Step::new(
                "fan",
                StepKind::ScatterGather {
                    items: "{{source.data}}".into(),
                    steps: vec![plugin("inner", "echo").param("value", "{{loop.item.a}}")],
                    max_concurrency: Some(2),
                    gather: GatherConfig {
                        operation: GatherOperation::Collect,
                        reducer: None,
                    },
                },
            ),
        ];

        let result = engine.execute(&steps, json!({})).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            result.output["items"],
            json!([{"value": 1}, {"value": 2}, {"value": 3}])
        );
        assert_eq!(result.steps_completed, 2);
    }
}
