//! Execution hooks that write the step log to `tracing` and keep token
//! usage totals in memory.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use neuronforge_core::workflow::capability::{ExecutionHooks, HookError, StepExecutionRecord, UsageRecord};
use neuronforge_types::execution::{ExecutionResult, StepStatus};

#[derive(Debug, Clone, Default)]
pub struct TracingHooks {
    usage: Arc<DashMap<String, u64>>,
}

impl TracingHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens recorded for `user_id` since this instance was created.
    pub fn usage_for(&self, user_id: &str) -> u64 {
        self.usage.get(user_id).map(|entry| *entry).unwrap_or(0)
    }
}

impl ExecutionHooks for TracingHooks {
    async fn log_step_execution(&self, record: &StepExecutionRecord) -> Result<(), HookError> {
        info!(
            execution_id = %record.execution_id,
            step_id = %record.step_id,
            step_type = %record.step_type,
            attempt = record.attempt,
            "step started"
        );
        Ok(())
    }

    async fn update_step_execution(&self, record: &StepExecutionRecord) -> Result<(), HookError> {
        match record.status {
            StepStatus::Failed => warn!(
                execution_id = %record.execution_id,
                step_id = %record.step_id,
                attempt = record.attempt,
                error = record.error.as_deref().unwrap_or(""),
                "step failed"
            ),
            status => info!(
                execution_id = %record.execution_id,
                step_id = %record.step_id,
                %status,
                tokens = record.tokens_used,
                duration_ms = record.execution_time_ms,
                "step finished"
            ),
        }
        Ok(())
    }

    async fn record_usage(&self, usage: &UsageRecord) -> Result<(), HookError> {
        *self.usage.entry(usage.user_id.clone()).or_insert(0) += usage.tokens_used;
        Ok(())
    }

    async fn run_finished(&self, result: &ExecutionResult) -> Result<(), HookError> {
        info!(
            execution_id = %result.execution_id,
            status = %result.status,
            completed = result.steps_completed,
            failed = result.steps_failed,
            skipped = result.steps_skipped,
            tokens = result.total_tokens_used,
            duration_ms = result.total_execution_time_ms,
            "workflow finished"
        );
        Ok(())
    }
}
