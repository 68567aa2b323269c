//! Execution controller: the single owner of run state.
//!
//! The controller holds the results map, the completed/failed/remaining
//! bookkeeping, the checkpoint history, and the `ExecutionStatus` state
//! machine. Everything else gets read-only snapshots; mutation goes through
//! controller methods, and only the engine's driving task calls them.
//!
//! Pause, resume, and stop arrive from other tasks through a cloneable
//! [`ControlHandle`] and are honored at batch boundaries.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use neuronforge_types::execution::{
    Checkpoint, ExecutionState, ExecutionStatus, ExportedState, ResultMap, StepResult, StepStatus,
};

use super::reference::is_reserved;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: ExecutionStatus, to: ExecutionStatus },

    #[error("checkpoint {0} not found")]
    CheckpointNotFound(u64),

    #[error("cannot roll back {requested} steps: only {available} recorded")]
    NotEnoughSteps { requested: usize, available: usize },

    #[error("cannot roll back {requested} checkpoints: only {available} older than the latest")]
    NotEnoughCheckpoints { requested: usize, available: usize },
}

// ---------------------------------------------------------------------------
// ControlHandle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Stop,
}

/// Cross-task control for a run. Cloning shares the same channel and token.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    signal: Arc<watch::Sender<ControlSignal>>,
    /// Replaced on rollback once cancelled, so a reopened run starts clean.
    cancel: Arc<Mutex<CancellationToken>>,
}

impl ControlHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControlSignal::Run);
        Self {
            signal: Arc::new(tx),
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    fn current(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the run to pause at the next batch boundary.
    pub fn pause(&self) {
        self.signal.send_if_modified(|s| {
            let changed = *s == ControlSignal::Run;
            if changed {
                *s = ControlSignal::Pause;
            }
            changed
        });
    }

    pub fn resume(&self) {
        self.signal.send_if_modified(|s| {
            let changed = *s == ControlSignal::Pause;
            if changed {
                *s = ControlSignal::Run;
            }
            changed
        });
    }

    /// Ask the run to stop at the next batch boundary. In-flight steps finish.
    pub fn stop(&self) {
        self.signal.send_replace(ControlSignal::Stop);
    }

    /// Stop and cancel in-flight plugin/AI calls.
    pub fn abort(&self) {
        self.stop();
        self.current().cancel();
    }

    pub fn signal(&self) -> ControlSignal {
        *self.signal.borrow()
    }

    /// Token for the current drive of the run. Read it again after a
    /// rollback: an aborted or timed-out token is swapped for a fresh one.
    pub fn token(&self) -> CancellationToken {
        self.current().clone()
    }

    /// Clear a leftover stop or abort so a rolled-back run can be driven again.
    pub(crate) fn reset(&self) {
        self.signal.send_replace(ControlSignal::Run);
        let mut token = self.current();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    /// Block while paused; returns the signal that ended the wait.
    pub async fn wait_while_paused(&self) -> ControlSignal {
        let mut rx = self.signal.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if current != ControlSignal::Pause {
                return current;
            }
            if rx.changed().await.is_err() {
                return ControlSignal::Stop;
            }
        }
    }
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ExecutionController
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ExecutionController {
    state: ExecutionState,
    results: ResultMap,
    /// Ids seeded before the run (initial input, outer results of a nested
    /// run). Never counted or reported as steps.
    seeded: HashSet<String>,
    /// Every step id in execution order.
    order: Vec<String>,
    completed: Vec<String>,
    failed: Vec<String>,
    checkpoints: Vec<Checkpoint>,
    next_sequence: u64,
    max_checkpoints: Option<usize>,
    handle: ControlHandle,
    running_since: Option<Instant>,
}

impl ExecutionController {
    /// `order` lists the run's step ids in execution order.
    pub fn new(execution_id: Uuid, order: Vec<String>, max_checkpoints: Option<usize>) -> Self {
        Self {
            state: ExecutionState::new(execution_id),
            results: ResultMap::new(),
            seeded: HashSet::new(),
            order,
            completed: Vec::new(),
            failed: Vec::new(),
            checkpoints: Vec::new(),
            next_sequence: 1,
            max_checkpoints,
            handle: ControlHandle::new(),
            running_since: None,
        }
    }

    /// Insert a pre-existing result (the `input` binding, outer results).
    pub fn seed(&mut self, result: StepResult) {
        self.seeded.insert(result.step_id.clone());
        self.results.insert(result.step_id.clone(), result);
    }

    // -----------------------------------------------------------------------
    // Read access
    // -----------------------------------------------------------------------

    pub fn execution_id(&self) -> Uuid {
        self.state.execution_id
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn status(&self) -> ExecutionStatus {
        self.state.status
    }

    pub fn handle(&self) -> &ControlHandle {
        &self.handle
    }

    /// Everything resolvable by references, seeds included.
    pub fn results(&self) -> &ResultMap {
        &self.results
    }

    /// Recorded step results in record order, seeds excluded.
    pub fn step_results(&self) -> impl Iterator<Item = &StepResult> {
        self.results.values().filter(|r| !self.seeded.contains(&r.step_id))
    }

    pub fn is_recorded(&self, step_id: &str) -> bool {
        self.results.contains_key(step_id) && !self.seeded.contains(step_id)
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed
    }

    pub fn failed_steps(&self) -> &[String] {
        &self.failed
    }

    pub fn remaining_steps(&self) -> Vec<String> {
        self.order.iter().filter(|id| !self.is_recorded(id)).cloned().collect()
    }

    pub fn skipped_count(&self) -> usize {
        self.step_results().filter(|r| r.status == StepStatus::Skipped).count()
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Running time summed across every `Running` span.
    pub fn elapsed_ms(&self) -> u64 {
        let live = self
            .running_since
            .map(|since| since.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.state.elapsed_ms + live
    }

    // -----------------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------------

    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), ControllerError> {
        let current = self.state.status;
        if !current.can_transition_to(next) {
            return Err(ControllerError::InvalidTransition { from: current, to: next });
        }

        if let Some(since) = self.running_since.take() {
            self.state.elapsed_ms += since.elapsed().as_millis() as u64;
        }
        if next == ExecutionStatus::Running {
            self.running_since = Some(Instant::now());
            self.state.started_at.get_or_insert_with(Utc::now);
            self.state.ended_at = None;
            self.state.error = None;
        }
        if next.is_terminal() {
            self.state.ended_at = Some(Utc::now());
            self.state.current_step = None;
        }

        debug!(execution_id = %self.state.execution_id, from = %current, to = %next, "status change");
        self.state.status = next;
        Ok(())
    }

    /// Move to `Failed` with a one-line reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), ControllerError> {
        self.transition(ExecutionStatus::Failed)?;
        self.state.error = Some(reason.into());
        Ok(())
    }

    pub fn set_position(&mut self, batch: usize, step: Option<String>) {
        self.state.current_batch = Some(batch);
        self.state.current_step = step;
    }

    // -----------------------------------------------------------------------
    // Recording
    // -----------------------------------------------------------------------

    /// Record a step's final result.
    pub fn record(&mut self, result: StepResult) {
        let id = result.step_id.clone();
        self.completed.retain(|c| c != &id);
        self.failed.retain(|f| f != &id);
        match result.status {
            StepStatus::Completed => self.completed.push(id.clone()),
            StepStatus::Failed => self.failed.push(id.clone()),
            _ => {}
        }
        self.state.current_step = Some(id.clone());
        self.results.shift_remove(&id);
        self.results.insert(id, result);
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Deep snapshot of the current state. Prunes the oldest checkpoints past
    /// `max_checkpoints`.
    pub fn checkpoint(&mut self, batch: Option<usize>) -> &Checkpoint {
        let checkpoint = Checkpoint {
            sequence: self.next_sequence,
            created_at: Utc::now(),
            batch,
            results: self.results.clone(),
            completed_steps: self.completed.clone(),
            failed_steps: self.failed.clone(),
            remaining_steps: self.remaining_steps(),
            elapsed_ms: self.elapsed_ms(),
        };
        self.next_sequence += 1;
        self.checkpoints.push(checkpoint);

        if let Some(max) = self.max_checkpoints {
            let keep = max.max(1);
            if self.checkpoints.len() > keep {
                let dropped = self.checkpoints.len() - keep;
                self.checkpoints.drain(..dropped);
                debug!(dropped, keep, "pruned old checkpoints");
            }
        }

        &self.checkpoints[self.checkpoints.len() - 1]
    }

    /// Restore the state captured by checkpoint `sequence` and discard every
    /// later checkpoint. The run moves to `RolledBack` and can be driven again.
    pub fn rollback_to_checkpoint(&mut self, sequence: u64) -> Result<(), ControllerError> {
        let position = self
            .checkpoints
            .iter()
            .position(|c| c.sequence == sequence)
            .ok_or(ControllerError::CheckpointNotFound(sequence))?;
        self.transition(ExecutionStatus::RolledBack)?;

        self.checkpoints.truncate(position + 1);
        let checkpoint = &self.checkpoints[position];
        self.results = checkpoint.results.clone();
        self.completed = checkpoint.completed_steps.clone();
        self.failed = checkpoint.failed_steps.clone();
        self.state.elapsed_ms = checkpoint.elapsed_ms;
        self.state.current_batch = checkpoint.batch;
        self.state.current_step = None;
        self.handle.reset();

        warn!(execution_id = %self.state.execution_id, sequence, "rolled back to checkpoint");
        Ok(())
    }

    /// Roll back to the checkpoint `count` positions before the latest one.
    /// `rollback_steps(0)` restores the latest checkpoint.
    pub fn rollback_steps(&mut self, count: usize) -> Result<u64, ControllerError> {
        let available = self.checkpoints.len().saturating_sub(1);
        if self.checkpoints.is_empty() || count > available {
            return Err(ControllerError::NotEnoughCheckpoints {
                requested: count,
                available,
            });
        }
        let sequence = self.checkpoints[self.checkpoints.len() - 1 - count].sequence;
        self.rollback_to_checkpoint(sequence)?;
        Ok(sequence)
    }

    /// Drop the last `count` recorded steps, newest first, along with every
    /// checkpoint that captured one of them. Returns the removed ids.
    pub fn discard_recent_steps(&mut self, count: usize) -> Result<Vec<String>, ControllerError> {
        let recorded: Vec<String> = self.step_results().map(|r| r.step_id.clone()).collect();
        if count > recorded.len() {
            return Err(ControllerError::NotEnoughSteps {
                requested: count,
                available: recorded.len(),
            });
        }
        self.transition(ExecutionStatus::RolledBack)?;

        let removed: Vec<String> = recorded.into_iter().rev().take(count).collect();
        for id in &removed {
            self.results.shift_remove(id);
            self.completed.retain(|c| c != id);
            self.failed.retain(|f| f != id);
        }
        self.checkpoints
            .retain(|c| !removed.iter().any(|id| c.results.contains_key(id)));
        self.state.current_step = None;
        self.handle.reset();

        warn!(execution_id = %self.state.execution_id, count, "discarded recent steps");
        Ok(removed)
    }

    /// Keep only the newest `keep` checkpoints. Returns how many were removed.
    pub fn clear_old_checkpoints(&mut self, keep: usize) -> usize {
        let excess = self.checkpoints.len().saturating_sub(keep);
        self.checkpoints.drain(..excess);
        excess
    }

    // -----------------------------------------------------------------------
    // Export / import
    // -----------------------------------------------------------------------

    pub fn export_state(&self) -> ExportedState {
        let mut state = self.state.clone();
        state.elapsed_ms = self.elapsed_ms();
        ExportedState {
            state,
            results: self.results.clone(),
            completed_steps: self.completed.clone(),
            failed_steps: self.failed.clone(),
            remaining_steps: self.remaining_steps(),
            checkpoints: self.checkpoints.clone(),
            next_sequence: self.next_sequence,
        }
    }

    /// Rebuild a controller from exported state. Reserved bindings in the
    /// results are treated as seeds.
    pub fn import_state(exported: ExportedState, order: Vec<String>, max_checkpoints: Option<usize>) -> Self {
        let seeded = exported
            .results
            .keys()
            .filter(|id| is_reserved(id))
            .cloned()
            .collect();
        Self {
            state: exported.state,
            results: exported.results,
            seeded,
            order,
            completed: exported.completed_steps,
            failed: exported.failed_steps,
            checkpoints: exported.checkpoints,
            next_sequence: exported.next_sequence,
            max_checkpoints,
            handle: ControlHandle::new(),
            running_since: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use neuronforge_types::error::StepError;
    use serde_json::json;

    fn controller(steps: &[&str]) -> ExecutionController {
        let mut c = ExecutionController::new(
            Uuid::now_v7(),
            steps.iter().map(|s| s.to_string()).collect(),
            None,
        );
        c.seed(StepResult::completed("input", json!({"q": 1})));
        c
    }

    // -------------------------------------------------------------------
    // State machine
    // -------------------------------------------------------------------

    #[test]
    fn rejects_invalid_transitions() {
        let mut c = controller(&["a"]);
        let err = c.transition(ExecutionStatus::Paused).unwrap_err();
        assert_eq!(
            err,
            ControllerError::InvalidTransition {
                from: ExecutionStatus::Pending,
                to: ExecutionStatus::Paused
            }
        );

        c.transition(ExecutionStatus::Running).unwrap();
        c.transition(ExecutionStatus::Completed).unwrap();
        assert!(c.transition(ExecutionStatus::Running).is_err());
        assert!(c.state().ended_at.is_some());
    }

    #[test]
    fn fail_records_reason() {
        let mut c = controller(&["a"]);
        c.transition(ExecutionStatus::Running).unwrap();
        c.fail("step 'a' failed").unwrap();
        assert_eq!(c.status(), ExecutionStatus::Failed);
        assert_eq!(c.state().error.as_deref(), Some("step 'a' failed"));
    }

    // -------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------

    #[test]
    fn record_tracks_lists_and_remaining() {
        let mut c = controller(&["a", "b", "c"]);
        c.transition(ExecutionStatus::Running).unwrap();
        c.record(StepResult::completed("a", json!(1)));
        c.record(StepResult::failed("b", StepError::internal("x")));

        assert_eq!(c.completed_steps(), ["a"]);
        assert_eq!(c.failed_steps(), ["b"]);
        assert_eq!(c.remaining_steps(), vec!["c".to_string()]);
        assert!(!c.is_recorded("input"));
        assert_eq!(c.step_results().count(), 2);
        assert!(c.results().contains_key("input"));
    }

    // -------------------------------------------------------------------
    // Checkpoints
    // -------------------------------------------------------------------

    /// Exported state with the fields a rollback does not restore cleared.
    fn comparable(mut exported: ExportedState) -> ExportedState {
        exported.state.status = ExecutionStatus::Pending;
        exported.state.started_at = None;
        exported.state.ended_at = None;
        exported.next_sequence = 0;
        exported
    }

    #[test]
    fn checkpoint_rollback_round_trip() {
        let mut c = controller(&["a", "b", "c"]);
        c.transition(ExecutionStatus::Running).unwrap();
        c.record(StepResult::completed("a", json!(1)));
        c.record(StepResult::failed_tolerated("x", StepError::internal("ignored")));
        c.set_position(0, None);
        // freeze the clock so the export below matches the snapshot exactly
        c.transition(ExecutionStatus::Paused).unwrap();
        let seq = c.checkpoint(Some(0)).sequence;
        let just_after = c.export_state();
        let snapshot = c.results().clone();

        c.transition(ExecutionStatus::Running).unwrap();
        c.record(StepResult::completed("b", json!(2)));
        c.checkpoint(Some(1));
        c.record(StepResult::completed("c", json!(3)));
        c.checkpoint(Some(2));
        assert_eq!(c.checkpoints().len(), 3);

        c.rollback_to_checkpoint(seq).unwrap();
        assert_eq!(c.status(), ExecutionStatus::RolledBack);
        assert_eq!(c.results(), &snapshot);
        assert_eq!(c.completed_steps(), ["a"]);
        assert_eq!(c.failed_steps(), ["x"]);
        assert_eq!(c.remaining_steps(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(c.checkpoints().len(), 1);
        assert_eq!(c.checkpoints()[0].sequence, seq);
        assert_eq!(comparable(c.export_state()), comparable(just_after));

        // sequences keep increasing after a rollback
        c.transition(ExecutionStatus::Running).unwrap();
        assert!(c.checkpoint(Some(1)).sequence > 3);
    }

    #[test]
    fn unknown_checkpoint_is_an_error() {
        let mut c = controller(&["a"]);
        c.transition(ExecutionStatus::Running).unwrap();
        assert_eq!(c.rollback_to_checkpoint(42), Err(ControllerError::CheckpointNotFound(42)));
        assert_eq!(c.status(), ExecutionStatus::Running);
    }

    #[test]
    fn checkpoints_auto_prune() {
        let mut c = ExecutionController::new(Uuid::now_v7(), vec!["a".into()], Some(2));
        c.transition(ExecutionStatus::Running).unwrap();
        for batch in 0..5 {
            c.checkpoint(Some(batch));
        }
        let seqs: Vec<u64> = c.checkpoints().iter().map(|cp| cp.sequence).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn clear_old_checkpoints_keeps_newest() {
        let mut c = controller(&["a"]);
        c.transition(ExecutionStatus::Running).unwrap();
        for batch in 0..4 {
            c.checkpoint(Some(batch));
        }
        assert_eq!(c.clear_old_checkpoints(1), 3);
        assert_eq!(c.checkpoints()[0].sequence, 4);
        assert_eq!(c.clear_old_checkpoints(10), 0);
    }

    #[test]
    fn rollback_steps_truncates_checkpoint_history() {
        let mut c = controller(&["a", "b", "c"]);
        c.transition(ExecutionStatus::Running).unwrap();
        for (batch, id) in ["a", "b", "c"].into_iter().enumerate() {
            c.record(StepResult::completed(id, json!(batch)));
            c.checkpoint(Some(batch));
        }

        assert_eq!(c.rollback_steps(1).unwrap(), 2);
        let seqs: Vec<u64> = c.checkpoints().iter().map(|cp| cp.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(c.completed_steps(), ["a", "b"]);
        assert_eq!(c.remaining_steps(), vec!["c".to_string()]);

        // zero restores the latest remaining checkpoint
        assert_eq!(c.rollback_steps(0).unwrap(), 2);
        assert_eq!(c.checkpoints().len(), 2);

        assert_eq!(
            c.rollback_steps(2),
            Err(ControllerError::NotEnoughCheckpoints { requested: 2, available: 1 })
        );
        assert_eq!(c.checkpoints().len(), 2);
    }

    #[test]
    fn rollback_steps_without_checkpoints_is_an_error() {
        let mut c = controller(&["a"]);
        c.transition(ExecutionStatus::Running).unwrap();
        assert_eq!(
            c.rollback_steps(0),
            Err(ControllerError::NotEnoughCheckpoints { requested: 0, available: 0 })
        );
        assert_eq!(c.status(), ExecutionStatus::Running);
    }

    #[test]
    fn discard_recent_steps_removes_newest_and_their_checkpoints() {
        let mut c = controller(&["a", "b", "c"]);
        c.transition(ExecutionStatus::Running).unwrap();
        c.record(StepResult::completed("a", json!(1)));
        c.checkpoint(Some(0));
        c.record(StepResult::completed("b", json!(2)));
        c.checkpoint(Some(1));
        c.record(StepResult::failed("c", StepError::internal("x")));
        c.fail("step 'c' failed").unwrap();

        let removed = c.discard_recent_steps(2).unwrap();
        assert_eq!(removed, vec!["c".to_string(), "b".to_string()]);
        assert_eq!(c.status(), ExecutionStatus::RolledBack);
        assert_eq!(c.completed_steps(), ["a"]);
        assert!(c.failed_steps().is_empty());
        assert!(c.results().contains_key("input"));
        assert_eq!(c.checkpoints().len(), 1);

        assert!(matches!(
            c.discard_recent_steps(5),
            Err(ControllerError::NotEnoughSteps { requested: 5, available: 1 })
        ));
    }

    // -------------------------------------------------------------------
    // Export / import
    // -------------------------------------------------------------------

    #[test]
    fn export_import_round_trip() {
        let mut c = controller(&["a", "b"]);
        c.transition(ExecutionStatus::Running).unwrap();
        c.record(StepResult::completed("a", json!({"x": 1})));
        c.checkpoint(Some(0));
        c.transition(ExecutionStatus::Paused).unwrap();

        let exported = c.export_state();
        let json = serde_json::to_string(&exported).unwrap();
        let back: ExportedState = serde_json::from_str(&json).unwrap();
        let restored = ExecutionController::import_state(back, vec!["a".into(), "b".into()], None);

        assert_eq!(restored.status(), ExecutionStatus::Paused);
        assert_eq!(restored.results(), c.results());
        assert_eq!(restored.remaining_steps(), vec!["b".to_string()]);
        assert!(!restored.is_recorded("input"));
        assert_eq!(restored.checkpoints().len(), 1);
    }

    // -------------------------------------------------------------------
    // ControlHandle
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn pause_blocks_until_resume() {
        let handle = ControlHandle::new();
        handle.pause();
        assert_eq!(handle.signal(), ControlSignal::Pause);

        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.wait_while_paused().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        handle.resume();
        assert_eq!(task.await.unwrap(), ControlSignal::Run);
    }

    #[tokio::test]
    async fn stop_wins_over_pause() {
        let handle = ControlHandle::new();
        handle.pause();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.wait_while_paused().await });
        handle.stop();
        assert_eq!(task.await.unwrap(), ControlSignal::Stop);

        handle.resume();
        assert_eq!(handle.signal(), ControlSignal::Stop);
    }

    #[test]
    fn abort_cancels_token() {
        let handle = ControlHandle::new();
        let token = handle.token();
        handle.abort();
        assert!(token.is_cancelled());
        assert!(handle.token().is_cancelled());
        assert_eq!(handle.signal(), ControlSignal::Stop);
    }

    #[test]
    fn rollback_replaces_a_cancelled_token() {
        let mut c = controller(&["a"]);
        c.transition(ExecutionStatus::Running).unwrap();
        c.checkpoint(Some(0));
        let handle = c.handle().clone();
        let old = handle.token();
        handle.abort();
        c.transition(ExecutionStatus::Stopped).unwrap();

        c.rollback_steps(0).unwrap();
        assert!(old.is_cancelled());
        assert!(!handle.token().is_cancelled());
        assert_eq!(handle.signal(), ControlSignal::Run);
    }

    #[test]
    fn reset_keeps_a_live_token() {
        let handle = ControlHandle::new();
        let token = handle.token();
        handle.stop();
        handle.reset();
        handle.abort();
        assert!(token.is_cancelled());
    }
}
