//! Error recovery: policy lookup, retry decisions, and backoff.
//!
//! Stateless, like the rest of the per-step helpers: every function takes the
//! policy or config it needs. The step task calls [`RecoveryHandler::should_retry`]
//! between attempts; the engine calls [`RecoveryHandler::on_failure`] once a
//! step has failed for good.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use neuronforge_types::config::EngineConfig;
use neuronforge_types::error::StepError;
use neuronforge_types::step::{BackoffConfig, ExhaustedAction, RecoveryPolicy, Step};

/// What the run does after a step's final failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Record the failure and keep executing.
    Continue,
    /// Stop scheduling and fail the run.
    Abort,
}

pub struct RecoveryHandler;

impl RecoveryHandler {
    /// Effective policy: the step's own, then its type's, then the global
    /// default.
    pub fn policy_for<'a>(step: &'a Step, config: &'a EngineConfig) -> &'a RecoveryPolicy {
        step.recovery
            .as_ref()
            .or_else(|| config.policy_for_type(step.step_type()))
            .unwrap_or(&config.default_policy)
    }

    /// Total attempts the policy allows (at least one).
    pub fn max_attempts(policy: &RecoveryPolicy) -> u32 {
        match policy {
            RecoveryPolicy::Retry { max_attempts, .. } => (*max_attempts).max(1),
            _ => 1,
        }
    }

    /// Whether to run attempt `attempt + 1`. `attempt` is 1-based.
    ///
    /// Only retry policies retry, and only errors flagged retryable.
    pub fn should_retry(policy: &RecoveryPolicy, attempt: u32, error: &StepError) -> bool {
        matches!(policy, RecoveryPolicy::Retry { .. }) && error.retryable && attempt < Self::max_attempts(policy)
    }

    /// Delay before attempt `attempt + 1`:
    /// `initial_delay_ms * multiplier^(attempt - 1)`, capped at `max_delay_ms`.
    pub fn backoff_delay(backoff: &BackoffConfig, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = backoff.initial_delay_ms as f64 * backoff.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(backoff.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Backoff for a policy: its own override, else the engine default.
    pub fn backoff_for<'a>(policy: &'a RecoveryPolicy, config: &'a EngineConfig) -> &'a BackoffConfig {
        match policy {
            RecoveryPolicy::Retry {
                backoff: Some(backoff),
                ..
            } => backoff,
            _ => &config.retry_backoff,
        }
    }

    /// Sleep for the backoff, returning `false` if cancelled first.
    pub async fn wait(delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }

    /// Decision once a step has failed for good.
    pub fn on_failure(policy: &RecoveryPolicy) -> FailureAction {
        match policy {
            RecoveryPolicy::Skip
            | RecoveryPolicy::Retry {
                on_exhausted: ExhaustedAction::Skip,
                ..
            } => FailureAction::Continue,
            RecoveryPolicy::FailWorkflow
            | RecoveryPolicy::Retry {
                on_exhausted: ExhaustedAction::FailWorkflow,
                ..
            } => FailureAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuronforge_types::error::ErrorKind;
    use neuronforge_types::step::StepKind;

    fn retry(max_attempts: u32) -> RecoveryPolicy {
        RecoveryPolicy::Retry {
            max_attempts,
            backoff: None,
            on_exhausted: ExhaustedAction::Skip,
        }
    }

    fn transform(id: &str) -> Step {
        Step::new(
            id,
            StepKind::Transform {
                operation: "filter".into(),
            },
        )
    }

    // -------------------------------------------------------------------
    // policy lookup
    // -------------------------------------------------------------------

    #[test]
    fn step_policy_beats_type_and_default() {
        let mut config = EngineConfig::default();
        config.type_policies.insert("transform".into(), RecoveryPolicy::Skip);

        let plain = transform("a");
        assert_eq!(RecoveryHandler::policy_for(&plain, &config), &RecoveryPolicy::Skip);

        let own = transform("b").with_recovery(retry(2));
        assert_eq!(RecoveryHandler::policy_for(&own, &config), &retry(2));

        config.type_policies.clear();
        assert_eq!(RecoveryHandler::policy_for(&plain, &config), &RecoveryPolicy::FailWorkflow);
    }

    // -------------------------------------------------------------------
    // should_retry
    // -------------------------------------------------------------------

    #[test]
    fn retries_only_retryable_errors_within_limit() {
        let policy = retry(3);
        let flaky = StepError::new(ErrorKind::RateLimited, "429");
        let fatal = StepError::new(ErrorKind::AuthExpired, "401");

        assert!(RecoveryHandler::should_retry(&policy, 1, &flaky));
        assert!(RecoveryHandler::should_retry(&policy, 2, &flaky));
        assert!(!RecoveryHandler::should_retry(&policy, 3, &flaky));
        assert!(!RecoveryHandler::should_retry(&policy, 1, &fatal));
    }

    #[test]
    fn non_retry_policies_never_retry() {
        let flaky = StepError::new(ErrorKind::ProviderError, "502");
        assert!(!RecoveryHandler::should_retry(&RecoveryPolicy::Skip, 1, &flaky));
        assert!(!RecoveryHandler::should_retry(&RecoveryPolicy::FailWorkflow, 1, &flaky));
        assert_eq!(RecoveryHandler::max_attempts(&retry(0)), 1);
    }

    // -------------------------------------------------------------------
    // backoff
    // -------------------------------------------------------------------

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = BackoffConfig {
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 350,
        };
        assert_eq!(RecoveryHandler::backoff_delay(&backoff, 1), Duration::from_millis(100));
        assert_eq!(RecoveryHandler::backoff_delay(&backoff, 2), Duration::from_millis(200));
        assert_eq!(RecoveryHandler::backoff_delay(&backoff, 3), Duration::from_millis(350));
        assert_eq!(RecoveryHandler::backoff_delay(&backoff, 40), Duration::from_millis(350));
    }

    #[test]
    fn policy_backoff_overrides_engine_default() {
        let config = EngineConfig::default();
        let custom = BackoffConfig {
            initial_delay_ms: 1,
            multiplier: 1.0,
            max_delay_ms: 1,
        };
        let policy = RecoveryPolicy::Retry {
            max_attempts: 2,
            backoff: Some(custom.clone()),
            on_exhausted: ExhaustedAction::FailWorkflow,
        };
        assert_eq!(RecoveryHandler::backoff_for(&policy, &config), &custom);
        assert_eq!(
            RecoveryHandler::backoff_for(&RecoveryPolicy::Skip, &config),
            &config.retry_backoff
        );
    }

    #[tokio::test]
    async fn wait_is_cancellable() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!RecoveryHandler::wait(Duration::from_secs(60), &cancel).await);
        assert!(RecoveryHandler::wait(Duration::from_millis(1), &CancellationToken::new()).await);
    }

    // -------------------------------------------------------------------
    // on_failure
    // -------------------------------------------------------------------

    #[test]
    fn failure_actions() {
        assert_eq!(RecoveryHandler::on_failure(&RecoveryPolicy::Skip), FailureAction::Continue);
        assert_eq!(RecoveryHandler::on_failure(&RecoveryPolicy::FailWorkflow), FailureAction::Abort);
        assert_eq!(RecoveryHandler::on_failure(&retry(3)), FailureAction::Continue);
        let strict = RecoveryPolicy::Retry {
            max_attempts: 3,
            backoff: None,
            on_exhausted: ExhaustedAction::FailWorkflow,
        };
        assert_eq!(RecoveryHandler::on_failure(&strict), FailureAction::Abort);
    }
}
