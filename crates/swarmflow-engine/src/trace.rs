use std::sync::{Arc, Mutex};

use chrono::Utc;

use swarmflow_core::event::EventBus;
use swarmflow_core::types::{RunEvent, RunId, TraceKind, TraceRecord};

/// Ordered execution trace of one run. Every record is also published on
/// the event bus.
pub struct TraceBook {
    run_id: RunId,
    records: Mutex<Vec<TraceRecord>>,
    events: Arc<EventBus>,
}

impl TraceBook {
    pub fn new(run_id: RunId, events: Arc<EventBus>) -> Self {
        Self {
            run_id,
            records: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn record(&self, kind: TraceKind) -> TraceRecord {
        let record = {
            let mut records = self.records.lock().unwrap_or_else(|p| p.into_inner());
            let record = TraceRecord {
                index: records.len() as u64,
                run_id: self.run_id.clone(),
                timestamp: Utc::now(),
                kind,
            };
            records.push(record.clone());
            record
        };
        self.events.publish(RunEvent::Trace(record.clone()));
        record
    }

    pub fn records(&self) -> Vec<TraceRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_are_indexed_and_published() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let book = TraceBook::new(RunId::from_string("r"), bus);

        book.record(TraceKind::Completed);
        let second = book.record(TraceKind::Checkpointed { sequence: 1 });
        assert_eq!(second.index, 1);
        assert_eq!(book.len(), 2);

        match rx.recv().await.unwrap() {
            RunEvent::Trace(record) => assert_eq!(record.kind, TraceKind::Completed),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
