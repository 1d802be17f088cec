use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Emitted by the engine as it services targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Created {
        target: String,
        cadence: String,
        name: String,
    },
    Pruned {
        target: String,
        name: String,
    },
    Failed {
        target: String,
        cadence: String,
        error: String,
        consecutive_failures: u32,
    },
    Deactivated {
        target: String,
        cadence: String,
    },
}

/// Fan-out of [`SchedulerEvent`]s. Slow subscribers lag and lose events;
/// the engine never waits on them.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, event: SchedulerEvent) {
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<SchedulerEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}
