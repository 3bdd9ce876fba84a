//! In-process domain event bus.
//!
//! Stores emit after their transaction commits; the emitting call site is
//! the same one that performed the transition, so per-task causal order is
//! preserved without polling. Subscribers that fall behind lose the oldest
//! events (broadcast semantics), which is acceptable for UI streams.

use engram_protocol::http::DomainEvent;
use tokio::sync::broadcast;
use tracing::debug;

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Fire-and-forget; a bus with no subscribers is not an error.
    pub fn emit(&self, event: DomainEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!("No event subscribers for {:?}", event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engram_protocol::{TaskId, TaskType};

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let first = TaskId::new();
        let second = TaskId::new();
        bus.emit(DomainEvent::TaskQueued {
            task_id: first.clone(),
            task_type: TaskType::Observation,
        });
        bus.emit(DomainEvent::TaskCompleted {
            task_id: second.clone(),
        });

        match rx.recv().await.unwrap() {
            DomainEvent::TaskQueued { task_id, .. } => assert_eq!(task_id, first),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            DomainEvent::TaskCompleted { task_id } => assert_eq!(task_id, second),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(DomainEvent::TaskCompleted {
            task_id: TaskId::new(),
        });
    }
}
