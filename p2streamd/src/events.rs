use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::classify::MessageKind;
use crate::emergency::{EmergencyLevel, ModeConfig, ModeTrigger};
use crate::pool::PoolId;
use crate::watchdog::{PerfLevel, WatchdogSnapshot};

/// Everything the pipeline reports to the application, as typed variants
/// instead of name-keyed payloads.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    MessageExtracted {
        pool_id: PoolId,
        kind: MessageKind,
    },
    BufferOverflow {
        attempted: usize,
        available: usize,
    },
    BufferWarning {
        usage_percent: f64,
        threshold: f64,
    },
    WorkerError {
        error: String,
    },
    SystemReboot {
        text: String,
        timestamp: DateTime<Utc>,
    },
    DebuggerPacket {
        bytes: Bytes,
    },
    CommunicationLost,
    RequestTimeout {
        sequence: u16,
    },
    PerformanceAlert {
        level: PerfLevel,
        previous: PerfLevel,
        metrics: WatchdogSnapshot,
        text: String,
        timestamp: DateTime<Utc>,
    },
    ModeChange {
        prev: EmergencyLevel,
        new: EmergencyLevel,
        trigger: ModeTrigger,
        reason: String,
        config: ModeConfig,
    },
}

/// Broadcast fan-out for pipeline events. Subscribers that lag simply miss
/// events; the pipeline never blocks on a slow listener.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        // Send only fails when nobody is subscribed, which is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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

    #[tokio::test]
    async fn emit_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.emit(PipelineEvent::BufferOverflow {
            attempted: 10,
            available: 3,
        });
        match rx.recv().await.unwrap() {
            PipelineEvent::BufferOverflow {
                attempted,
                available,
            } => {
                assert_eq!(attempted, 10);
                assert_eq!(available, 3);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.emit(PipelineEvent::CommunicationLost);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
