//! Run lifecycle events published on the engine's event bus.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::ExecutionStatus;
use crate::step::StepType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        execution_id: Uuid,
        total_steps: usize,
        batches: usize,
    },
    BatchStarted {
        execution_id: Uuid,
        batch: usize,
        steps: Vec<String>,
    },
    StepStarted {
        execution_id: Uuid,
        step_id: String,
        step_type: StepType,
        attempt: u32,
    },
    StepCompleted {
        execution_id: Uuid,
        step_id: String,
        duration_ms: u64,
        tokens_used: u64,
    },
    StepFailed {
        execution_id: Uuid,
        step_id: String,
        error: String,
        will_retry: bool,
    },
    StepSkipped {
        execution_id: Uuid,
        step_id: String,
        reason: String,
    },
    CheckpointTaken {
        execution_id: Uuid,
        sequence: u64,
    },
    RunPaused {
        execution_id: Uuid,
    },
    RunResumed {
        execution_id: Uuid,
    },
    RunFinished {
        execution_id: Uuid,
        status: ExecutionStatus,
        duration_ms: u64,
    },
}

impl WorkflowEvent {
    pub fn execution_id(&self) -> Uuid {
        match self {
            Self::RunStarted { execution_id, .. }
            | Self::BatchStarted { execution_id, .. }
            | Self::StepStarted { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::StepSkipped { execution_id, .. }
            | Self::CheckpointTaken { execution_id, .. }
            | Self::RunPaused { execution_id }
            | Self::RunResumed { execution_id }
            | Self::RunFinished { execution_id, .. } => *execution_id,
        }
    }
}
