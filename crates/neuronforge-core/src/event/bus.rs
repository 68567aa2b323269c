//! Broadcast bus for `WorkflowEvent`s.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no subscribers is a
//! no-op, so the engine never waits on a slow consumer; lagging receivers
//! lose the oldest events instead.

use neuronforge_types::event::WorkflowEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use uuid::Uuid;

/// Default channel capacity used by the engine.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Multi-consumer bus for run events.
///
/// Cloning the bus clones the sender, so every clone feeds the same
/// subscribers.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of one run only.
    pub fn subscribe_run(&self, execution_id: Uuid) -> RunEvents {
        RunEvents {
            execution_id,
            receiver: self.sender.subscribe(),
        }
    }

    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Events of a single run, from [`EventBus::subscribe_run`].
pub struct RunEvents {
    execution_id: Uuid,
    receiver: broadcast::Receiver<WorkflowEvent>,
}

impl RunEvents {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Next event of this run, or `None` once the bus is gone. Events lost
    /// to lag are skipped.
    pub async fn next(&mut self) -> Option<WorkflowEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.execution_id() == self.execution_id => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    debug!(execution_id = %self.execution_id, missed, "run event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn batch_started(batch: usize) -> WorkflowEvent {
        WorkflowEvent::BatchStarted {
            execution_id: Uuid::nil(),
            batch,
            steps: vec!["fetch".to_string()],
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(batch_started(0));

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, WorkflowEvent::BatchStarted { batch: 0, .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(batch_started(3));

        assert_eq!(rx1.recv().await.unwrap(), batch_started(3));
        assert_eq!(rx2.recv().await.unwrap(), batch_started(3));
    }

    #[test]
    fn publish_with_no_subscribers_is_a_no_op() {
        let bus = EventBus::new(16);
        bus.publish(batch_started(0));
        bus.publish(batch_started(1));
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn lagged_receiver_reports_lag() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for i in 0..10 {
            bus.publish(batch_started(i));
        }

        match rx.try_recv() {
            Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::default();
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(batch_started(7));

        assert_eq!(rx.try_recv().unwrap(), batch_started(7));
    }

    #[tokio::test]
    async fn run_subscription_filters_other_runs() {
        let bus = EventBus::new(16);
        let mine = Uuid::now_v7();
        let mut events = bus.subscribe_run(mine);

        bus.publish(WorkflowEvent::RunPaused { execution_id: Uuid::now_v7() });
        bus.publish(WorkflowEvent::RunPaused { execution_id: mine });

        assert_eq!(events.next().await, Some(WorkflowEvent::RunPaused { execution_id: mine }));
        assert_eq!(events.execution_id(), mine);
    }

    #[tokio::test]
    async fn run_subscription_ends_when_bus_is_dropped() {
        let bus = EventBus::new(16);
        let mut events = bus.subscribe_run(Uuid::nil());
        drop(bus);
        assert_eq!(events.next().await, None);
    }

    #[test]
    fn debug_shows_receiver_count() {
        let bus = EventBus::new(16);
        let _rx = bus.subscribe();
        let debug = format!("{bus:?}");
        assert!(debug.contains("EventBus"));
        assert!(debug.contains("receiver_count: 1"));
    }
}
