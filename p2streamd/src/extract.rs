//! The extractor worker: drains the ring, classifies, publishes pool slots.
//!
//! Runs on its own blocking task, separate from the USB producer and the
//! router. It is the only consumer of the ring; completed messages become
//! pool slots announced to the main unit over a lightweight channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::classify::{Classifier, MessageKind, SnapshotGate, Step};
use crate::events::{EventBus, PipelineEvent};
use crate::metrics::Metrics;
use crate::pool::{MessagePool, PoolError, PoolId};
use crate::ring::RingConsumer;

/// What the worker hands the main unit for every published message.
#[derive(Debug, Clone, Copy)]
pub struct Notification {
    pub pool_id: PoolId,
    pub kind: MessageKind,
}

const BACKOFF: Duration = Duration::from_millis(1);

enum Outcome {
    /// A message was published or bytes were discarded.
    Progress,
    /// Nothing to do right now (ring empty, or mid-message).
    Idle,
    /// A completed message is waiting for a pool slot.
    PoolBlocked,
}

pub struct Extractor {
    consumer: RingConsumer,
    classifier: Classifier,
    pool: Arc<MessagePool>,
    metrics: Arc<Metrics>,
    events: EventBus,
    notify: mpsc::UnboundedSender<Notification>,
    stop: Arc<AtomicBool>,
}

impl Extractor {
    pub fn new(
        consumer: RingConsumer,
        pool: Arc<MessagePool>,
        gate: SnapshotGate,
        metrics: Arc<Metrics>,
        events: EventBus,
        notify: mpsc::UnboundedSender<Notification>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let classifier = Classifier::new(pool.slot_capacity(), gate);
        Self {
            consumer,
            classifier,
            pool,
            metrics,
            events,
            notify,
            stop,
        }
    }

    /// Move the worker onto a dedicated blocking task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run())
    }

    /// The worker loop. Polls the ring; when idle for a pass it sleeps
    /// 1 ms. Exits once the stop flag is set and the ring is drained.
    pub fn run(mut self) {
        log::info!("extractor worker started");
        loop {
            match self.extract_one() {
                Outcome::Progress => {}
                Outcome::PoolBlocked => {
                    // Back-pressure: the message stays in the ring until a
                    // slot frees. Never drop a completed message.
                    std::thread::sleep(BACKOFF);
                }
                Outcome::Idle => {
                    if self.stop.load(Ordering::Acquire)
                        && self.consumer.is_empty()
                        && self.classifier.is_idle()
                    {
                        break;
                    }
                    std::thread::sleep(BACKOFF);
                }
            }
        }
        log::info!("extractor worker drained and stopped");
    }

    /// Try to cut exactly one message out of the ring.
    fn extract_one(&mut self) -> Outcome {
        self.consumer.save_position();
        loop {
            let Some(byte) = self.consumer.next() else {
                if self.classifier.is_idle() {
                    // Only inter-message whitespace was consumed.
                    self.consumer.commit_position();
                } else {
                    // Mid-message: leave the partial frame in the ring.
                    self.consumer.restore_position();
                    self.classifier.reset();
                }
                return Outcome::Idle;
            };
            match self.classifier.push(byte) {
                Step::Incomplete => {}
                Step::Complete(kind) => {
                    let message = self.classifier.take_message();
                    return self.publish(kind, &message);
                }
                Step::Reject => {
                    // Bad frame header: drop exactly one byte and resync.
                    self.consumer.restore_position();
                    self.consumer.consume(1);
                    self.metrics.inc_framing_error();
                    return Outcome::Progress;
                }
            }
        }
    }

    fn publish(&mut self, kind: MessageKind, message: &[u8]) -> Outcome {
        let produced_at_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        match self.pool.acquire(message, kind, produced_at_us, 1) {
            Ok(pool_id) => {
                self.consumer.commit_position();
                self.metrics.record_message();
                self.metrics.inc_queue_depth();
                let note = Notification { pool_id, kind };
                if self.notify.send(note).is_err() {
                    // Main unit is gone; drop our share so the slot frees.
                    self.metrics.dec_queue_depth();
                    self.pool.release(pool_id);
                }
                self.events
                    .emit(PipelineEvent::MessageExtracted { pool_id, kind });
                Outcome::Progress
            }
            Err(PoolError::Full) => {
                self.consumer.restore_position();
                self.classifier.reset();
                Outcome::PoolBlocked
            }
            Err(err @ PoolError::Oversized { .. }) => {
                // Cannot happen while the classifier bounds frames by the
                // slot capacity; surface it rather than spin on it.
                self.consumer.commit_position();
                self.events.emit(PipelineEvent::WorkerError {
                    error: err.to_string(),
                });
                Outcome::Progress
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DEBUGGER_FRAME_LEN;
    use crate::ring;

    fn harness(
        ring_capacity: usize,
        pool_slots: usize,
    ) -> (
        crate::ring::RingProducer,
        Extractor,
        mpsc::UnboundedReceiver<Notification>,
        Arc<MessagePool>,
        Arc<AtomicBool>,
    ) {
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = ring::ring(ring_capacity).unwrap();
        let pool = Arc::new(
            MessagePool::new(pool_slots, pool_slots, 1, 1024, Arc::clone(&metrics)).unwrap(),
        );
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let extractor = Extractor::new(
            rx,
            Arc::clone(&pool),
            SnapshotGate::new(),
            metrics,
            EventBus::new(64),
            notify_tx,
            Arc::clone(&stop),
        );
        (tx, extractor, notify_rx, pool, stop)
    }

    #[test]
    fn extracts_classified_messages_in_order() {
        let (tx, mut extractor, mut rx, pool, _stop) = harness(1024, 8);
        tx.append(b"Hello\nCog2 run\n`plot 1\n");
        for _ in 0..3 {
            assert!(matches!(extractor.extract_one(), Outcome::Progress));
        }
        let kinds: Vec<MessageKind> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|n| n.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                MessageKind::TerminalOutput,
                MessageKind::CogMessage { cog: 2 },
                MessageKind::WindowCommand,
            ]
        );
        assert_eq!(pool.stats().in_use, 3);
    }

    #[test]
    fn partial_message_stays_in_ring() {
        let (tx, mut extractor, mut rx, _pool, _stop) = harness(1024, 8);
        tx.append(b"no newline yet");
        assert!(matches!(extractor.extract_one(), Outcome::Idle));
        assert!(rx.try_recv().is_err());
        tx.append(b" done\n");
        assert!(matches!(extractor.extract_one(), Outcome::Progress));
        let note = rx.try_recv().unwrap();
        assert_eq!(note.kind, MessageKind::TerminalOutput);
    }

    #[test]
    fn pool_full_applies_backpressure_without_loss() {
        let (tx, mut extractor, mut rx, pool, _stop) = harness(1024, 1);
        tx.append(b"first\nsecond\n");
        assert!(matches!(extractor.extract_one(), Outcome::Progress));
        assert!(matches!(extractor.extract_one(), Outcome::PoolBlocked));
        // Free the slot; the blocked message is still extractable.
        let first = rx.try_recv().unwrap();
        pool.release(first.pool_id);
        assert!(matches!(extractor.extract_one(), Outcome::Progress));
        let second = rx.try_recv().unwrap();
        assert_eq!(pool.get(second.pool_id).unwrap().data, b"second\n");
    }

    #[test]
    fn framing_error_drops_one_byte_and_resyncs() {
        let (tx, mut extractor, mut rx, pool, _stop) = harness(1024, 8);
        // Declared payload of 0xFFFF exceeds the 1 KiB slot bound.
        tx.append(&[0xDB, 0x01, 0xFF, 0xFF]);
        tx.append(b"ok\n");
        assert!(matches!(extractor.extract_one(), Outcome::Progress));
        // The remaining header bytes reparse as a text line.
        assert!(matches!(extractor.extract_one(), Outcome::Progress));
        let note = rx.try_recv().unwrap();
        let view = pool.get(note.pool_id).unwrap();
        assert_eq!(view.data, &[0x01, 0xFF, 0xFF, b'o', b'k', b'\n'][..]);
    }

    #[test]
    fn armed_gate_cuts_snapshot_on_the_exact_boundary() {
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = ring::ring(4096).unwrap();
        let pool = Arc::new(
            MessagePool::new(8, 8, 1, 1024, Arc::clone(&metrics)).unwrap(),
        );
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
        let gate = SnapshotGate::new();
        let mut extractor = Extractor::new(
            rx,
            Arc::clone(&pool),
            gate.clone(),
            metrics,
            EventBus::new(64),
            notify_tx,
            Arc::new(AtomicBool::new(false)),
        );

        gate.arm();
        // First frame byte is 0x20: it belongs to the snapshot, not to
        // inter-message whitespace, or the boundary slips by one.
        let mut frame = vec![0x20u8; DEBUGGER_FRAME_LEN];
        frame[DEBUGGER_FRAME_LEN - 1] = 0x7F;
        tx.append(&frame);
        tx.append(b"Cog1 after\n");

        assert!(matches!(extractor.extract_one(), Outcome::Progress));
        let first = notify_rx.try_recv().unwrap();
        assert_eq!(first.kind, MessageKind::DebuggerFrame);
        assert_eq!(pool.get(first.pool_id).unwrap().data, &frame[..]);
        assert!(!gate.is_armed());

        assert!(matches!(extractor.extract_one(), Outcome::Progress));
        let second = notify_rx.try_recv().unwrap();
        assert_eq!(second.kind, MessageKind::CogMessage { cog: 1 });
        assert_eq!(pool.get(second.pool_id).unwrap().data, b"Cog1 after\n");
    }

    #[tokio::test]
    async fn worker_drains_ring_before_stopping() {
        let (tx, extractor, mut rx, _pool, stop) = harness(4096, 64);
        for i in 0..20 {
            tx.append(format!("line {i}\n").as_bytes());
        }
        stop.store(true, Ordering::Release);
        extractor.spawn().await.unwrap();
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 20);
    }
}
