use crate::types::RunEvent;

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: RunEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunId, RunStatus};

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        assert_eq!(bus.receiver_count(), 1);

        bus.publish(RunEvent::StatusChanged {
            run_id: RunId::from_string("r1"),
            from: RunStatus::Ready,
            to: RunStatus::Running,
        });

        match rx.recv().await.unwrap() {
            RunEvent::StatusChanged { run_id, to, .. } => {
                assert_eq!(run_id.as_str(), "r1");
                assert_eq!(to, RunStatus::Running);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn publish_without_receivers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(RunEvent::ApprovalResolved {
            request_id: "x".into(),
            approved: true,
        });
    }
}
