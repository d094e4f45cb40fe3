//! Best-effort event fan-out (§7: "publish failures are swallowed, never
//! surfaced to the caller"). Grounded on the teacher's `events` module
//! (`adolfousier-opencrabs`'s `events::Event`/broadcast-channel convention);
//! here narrowed to the single `task-updated` event spec §4.3 names.

use crate::task::Task;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

/// Payload for the `task-updated` event: every task currently owned by
/// `session_id`, sent whenever `TaskGraph::create`/`update`/`claim`/`close`
/// touches a session-bound task.
#[derive(Debug, Clone)]
pub struct TaskUpdatedEvent {
    pub session_id: String,
    pub tasks: Vec<Task>,
}

/// Sink for the events this crate emits. Implementations must not let a
/// publish failure propagate — callers treat event delivery as fire-and-
/// forget.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish_task_updated(&self, event: TaskUpdatedEvent);
}

/// In-process broadcast implementation. Subscribers that lag or never
/// subscribe simply miss events; `send` errors (no receivers) are logged at
/// debug and dropped, matching §7's "best effort" framing.
pub struct InMemoryEventBus {
    task_updated: broadcast::Sender<TaskUpdatedEvent>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { task_updated: tx }
    }

    pub fn subscribe_task_updated(&self) -> broadcast::Receiver<TaskUpdatedEvent> {
        self.task_updated.subscribe()
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish_task_updated(&self, event: TaskUpdatedEvent) {
        if self.task_updated.send(event).is_err() {
            debug!("task-updated published with no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = InMemoryEventBus::new();
        bus.publish_task_updated(TaskUpdatedEvent {
            session_id: "s1".to_string(),
            tasks: Vec::new(),
        })
        .await;
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = InMemoryEventBus::new();
        let mut rx = bus.subscribe_task_updated();
        bus.publish_task_updated(TaskUpdatedEvent {
            session_id: "s1".to_string(),
            tasks: Vec::new(),
        })
        .await;
        let received = rx.recv().await.unwrap();
        assert_eq!(received.session_id, "s1");
    }
}
