//! Execution tracking types: step results, run state, checkpoints, and the
//! final execution result.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::StepError;

/// Results keyed by step id, in the order they were recorded.
pub type ResultMap = IndexMap<String, StepResult>;

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub execution_time_ms: u64,
    /// Number of times the step body ran (retries included).
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Failed, but the recovery policy lets the run carry on.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub tolerated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepResult {
    fn with_status(step_id: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step_id: step_id.into(),
            status,
            data: Value::Null,
            tokens_used: 0,
            execution_time_ms: 0,
            attempts: 0,
            error: None,
            tolerated: false,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn completed(step_id: impl Into<String>, data: Value) -> Self {
        let mut result = Self::with_status(step_id, StepStatus::Completed);
        result.data = data;
        result.attempts = 1;
        result
    }

    pub fn failed(step_id: impl Into<String>, error: StepError) -> Self {
        let mut result = Self::with_status(step_id, StepStatus::Failed);
        result.error = Some(error);
        result.attempts = 1;
        result
    }

    /// A failure the run continues past (the `skip` recovery policy).
    pub fn failed_tolerated(step_id: impl Into<String>, error: StepError) -> Self {
        let mut result = Self::failed(step_id, error);
        result.tolerated = true;
        result
    }

    /// A step that was not executed (branch not taken, batch aborted).
    pub fn skipped(step_id: impl Into<String>, reason: Option<StepError>) -> Self {
        let mut result = Self::with_status(step_id, StepStatus::Skipped);
        result.error = reason;
        result
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn with_timing(mut self, started_at: DateTime<Utc>, execution_time_ms: u64) -> Self {
        self.started_at = Some(started_at);
        self.completed_at = Some(Utc::now());
        self.execution_time_ms = execution_time_ms;
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    /// Failed in a way that ends the run.
    pub fn is_fatal(&self) -> bool {
        self.is_failed() && !self.tolerated
    }

    /// `data` as seen by references: skipped steps expose `null`.
    pub fn visible_data(&self) -> &Value {
        static NULL: Value = Value::Null;
        match self.status {
            StepStatus::Skipped => &NULL,
            _ => &self.data,
        }
    }

    /// The object that `{{stepId.path}}` references walk.
    pub fn envelope(&self) -> Value {
        json!({
            "data": self.visible_data(),
            "status": self.status,
            "tokens_used": self.tokens_used,
            "execution_time_ms": self.execution_time_ms,
            "error": self.error,
        })
    }
}

// ---------------------------------------------------------------------------
// Execution state
// ---------------------------------------------------------------------------

/// Run status, mutated only by the execution controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    RolledBack,
    Stopped,
}

impl ExecutionStatus {
    /// A terminal status ends `drive`; a rolled-back run can be driven again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Allowed state-machine edges.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, RolledBack)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Paused, RolledBack)
                | (Failed, RolledBack)
                | (Stopped, RolledBack)
                | (Completed, RolledBack)
                | (RolledBack, Running)
                | (RolledBack, RolledBack)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Mutable run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_batch: Option<usize>,
    /// Wall-clock time spent running, summed across resumes.
    #[serde(default)]
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionState {
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            status: ExecutionStatus::Pending,
            current_step: None,
            current_batch: None,
            elapsed_ms: 0,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Deep snapshot taken after a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Strictly increasing within a run.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<usize>,
    pub results: ResultMap,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub remaining_steps: Vec<String>,
    pub elapsed_ms: u64,
}

/// Serialized controller state for crash recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedState {
    pub state: ExecutionState,
    pub results: ResultMap,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub remaining_steps: Vec<String>,
    pub checkpoints: Vec<Checkpoint>,
    pub next_sequence: u64,
}

// ---------------------------------------------------------------------------
// Execution result
// ---------------------------------------------------------------------------

/// What `execute` returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub success: bool,
    /// Data of the last step that completed, in execution order.
    pub output: Value,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    pub total_execution_time_ms: u64,
    pub total_tokens_used: u64,
    /// One-line summary when the run did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Full per-step audit trail (the `input` seed excluded).
    pub results: ResultMap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, StepError};

    #[test]
    fn envelope_exposes_data_and_metadata() {
        let result = StepResult::completed("fetch", json!({"items": [1, 2]})).with_tokens(12);
        let env = result.envelope();
        assert_eq!(env["data"]["items"][1], 2);
        assert_eq!(env["status"], "completed");
        assert_eq!(env["tokens_used"], 12);
    }

    #[test]
    fn skipped_envelope_has_null_data() {
        let mut result = StepResult::skipped("branch", None);
        result.data = json!({"stale": true});
        assert!(result.envelope()["data"].is_null());
    }

    #[test]
    fn failed_result_carries_error() {
        let result = StepResult::failed("send", StepError::new(ErrorKind::AuthExpired, "token"));
        assert!(result.is_failed());
        assert_eq!(result.attempts, 1);
        assert!(!result.error.as_ref().unwrap().retryable);
        assert!(result.is_fatal());
    }

    #[test]
    fn tolerated_failure_is_failed_but_not_fatal() {
        let result = StepResult::failed_tolerated("send", StepError::internal("smtp down"));
        assert!(result.is_failed());
        assert!(!result.is_fatal());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["tolerated"], true);
        let plain = serde_json::to_value(StepResult::completed("a", json!(1))).unwrap();
        assert!(plain.get("tolerated").is_none());
    }

    #[test]
    fn status_transitions() {
        use ExecutionStatus::*;
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Paused.can_transition_to(Stopped));
        assert!(RolledBack.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Paused));
        assert!(Completed.is_terminal());
        assert!(!RolledBack.is_terminal());
    }

    #[test]
    fn execution_state_round_trips_through_json() {
        let mut state = ExecutionState::new(Uuid::now_v7());
        state.status = ExecutionStatus::Paused;
        state.current_batch = Some(2);
        let json = serde_json::to_string(&state).unwrap();
        let back: ExecutionState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert!(json.contains("\"paused\""));
    }
}
