//! Concurrent execution of one batch.
//!
//! Steps in a batch are independent by construction, so they run as tasks on
//! a `JoinSet` gated by a `Semaphore` of `max_parallel_steps` permits. The
//! executor knows nothing about step semantics: the caller supplies a closure
//! producing each step's final `StepResult` (retries included).

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use neuronforge_types::error::{ErrorKind, StepError};
use neuronforge_types::execution::StepResult;

/// Outcome of a batch, in canonical batch order.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub results: Vec<StepResult>,
    /// At least one step failed in a way that ends the run.
    pub batch_failed: bool,
    /// The deadline passed before every step finished.
    pub timed_out: bool,
}

impl BatchOutcome {
    /// Failures not tolerated by a recovery policy.
    pub fn fatal_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.results.iter().filter(|r| r.is_fatal())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParallelExecutor {
    max_parallel: usize,
    continue_on_error: bool,
}

impl ParallelExecutor {
    pub fn new(max_parallel: usize, continue_on_error: bool) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            continue_on_error,
        }
    }

    /// Run every step of `batch` through `run_step`.
    ///
    /// `run_step` gets the step id and a batch-scoped cancellation token. With
    /// `continue_on_error == false` the first fatal failure cancels that token;
    /// steps that had not started, or that stop because of the cancellation,
    /// are recorded `skipped` with a `Cancelled` error. When `deadline` passes,
    /// the token is cancelled, in-flight tasks are detached, and unfinished
    /// steps are recorded `skipped` with a `Timeout` error.
    pub async fn run_batch<F, Fut>(
        &self,
        batch: &[String],
        deadline: Option<Instant>,
        parent: &CancellationToken,
        run_step: F,
    ) -> BatchOutcome
    where
        F: Fn(String, CancellationToken) -> Fut,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        let token = parent.child_token();
        let permits = Arc::new(Semaphore::new(self.max_parallel));
        let mut set = JoinSet::new();

        for (index, step_id) in batch.iter().enumerate() {
            let permits = Arc::clone(&permits);
            let token = token.clone();
            let step_id = step_id.clone();
            let work = run_step(step_id.clone(), token.clone());
            set.spawn(async move {
                let cancelled = || {
                    StepResult::skipped(
                        step_id.clone(),
                        Some(StepError::new(ErrorKind::Cancelled, "batch cancelled")),
                    )
                };
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (index, cancelled());
                };
                if token.is_cancelled() {
                    return (index, cancelled());
                }
                tokio::select! {
                    result = work => (index, result),
                    _ = token.cancelled() => (index, cancelled()),
                }
            });
        }

        let mut slots: Vec<Option<StepResult>> = vec![None; batch.len()];
        let mut timed_out = false;

        loop {
            let next = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, set.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(pending = set.len(), "deadline reached mid-batch, detaching in-flight steps");
                        token.cancel();
                        set.detach_all();
                        timed_out = true;
                        break;
                    }
                },
                None => set.join_next().await,
            };
            let Some(joined) = next else { break };

            match joined {
                Ok((index, result)) => {
                    if result.is_fatal() && !self.continue_on_error && !token.is_cancelled() {
                        debug!(step_id = %result.step_id, "step failed, cancelling batch siblings");
                        token.cancel();
                    }
                    slots[index] = Some(result);
                }
                Err(err) => warn!(error = %err, "step task did not complete"),
            }
        }

        let results: Vec<StepResult> = slots
            .into_iter()
            .zip(batch)
            .map(|(slot, step_id)| {
                slot.unwrap_or_else(|| {
                    if timed_out {
                        StepResult::skipped(
                            step_id.clone(),
                            Some(StepError::new(ErrorKind::Timeout, "workflow timed out")),
                        )
                    } else {
                        StepResult::failed(step_id.clone(), StepError::internal("step task panicked"))
                    }
                })
            })
            .collect();

        BatchOutcome {
            batch_failed: results.iter().any(StepResult::is_fatal),
            timed_out,
            results,
        }
    }
}
