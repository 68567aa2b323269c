//! Engine configuration.
//!
//! `EngineConfig` is loaded from `neuronforge.toml` (see the infra crate).
//! Every field has a default so an empty file is a valid configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::step::{BackoffConfig, RecoveryPolicy, StepType};

/// Tunables for the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Concurrency ceiling within one batch.
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,

    /// When false, the first failure in a batch cancels its siblings and
    /// fails the run.
    #[serde(default = "default_continue_on_error")]
    pub continue_on_error: bool,

    /// Wall-clock limit for a whole run.
    #[serde(default = "default_workflow_timeout_secs")]
    pub workflow_timeout_secs: u64,

    /// Default per-step limit, overridable on the step.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Checkpoints kept after each batch. `None` keeps all of them.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: Option<usize>,

    /// Hard cap on loop and scatter-gather element counts.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,

    /// How deep loop/scatter-gather steps may nest.
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,

    /// Policy used when neither the step nor its type sets one.
    #[serde(default)]
    pub default_policy: RecoveryPolicy,

    /// Per step type policies, keyed by type name (`plugin_action`, ...).
    #[serde(default)]
    pub type_policies: HashMap<String, RecoveryPolicy>,

    /// Backoff used by retry policies that do not set their own.
    #[serde(default)]
    pub retry_backoff: BackoffConfig,

    /// User on whose behalf plugins are invoked.
    #[serde(default = "default_user_id")]
    pub user_id: String,
}

fn default_max_parallel_steps() -> usize {
    4
}

fn default_continue_on_error() -> bool {
    true
}

fn default_workflow_timeout_secs() -> u64 {
    1800
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_max_checkpoints() -> Option<usize> {
    Some(50)
}

fn default_max_loop_iterations() -> usize {
    1000
}

fn default_max_nesting_depth() -> usize {
    5
}

fn default_user_id() -> String {
    "local".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: default_max_parallel_steps(),
            continue_on_error: default_continue_on_error(),
            workflow_timeout_secs: default_workflow_timeout_secs(),
            step_timeout_secs: default_step_timeout_secs(),
            max_checkpoints: default_max_checkpoints(),
            max_loop_iterations: default_max_loop_iterations(),
            max_nesting_depth: default_max_nesting_depth(),
            default_policy: RecoveryPolicy::default(),
            type_policies: HashMap::new(),
            retry_backoff: BackoffConfig::default(),
            user_id: default_user_id(),
        }
    }
}

impl EngineConfig {
    /// Policy configured for a step type, if any.
    pub fn policy_for_type(&self, step_type: StepType) -> Option<&RecoveryPolicy> {
        self.type_policies.get(step_type.as_str())
    }
}
