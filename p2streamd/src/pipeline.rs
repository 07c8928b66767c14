//! Ownership and wiring.
//!
//! The pipeline owns every shared object (pool, router, watchdog,
//! emergency controller, protocol engine, device cache) and hands the USB
//! side a small [`PipelineHandle`]. Three units of execution cooperate:
//! the producer (whoever calls `ingest`), the extractor worker, and the
//! main loop driven by [`Pipeline::run`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::config::Config;
use crate::datamgr::DataManager;
use crate::emergency::EmergencyController;
use crate::events::{EventBus, PipelineEvent};
use crate::extract::{Extractor, Notification};
use crate::metrics::Metrics;
use crate::pool::MessagePool;
use crate::protocol::{ActivityTracker, ProtocolEngine};
use crate::recording::UsbRecorder;
use crate::ring::{self, RingProducer};
use crate::router::{Destination, Router};
use crate::watchdog::{SampleInputs, Watchdog};
use crate::classify::SnapshotGate;

/// Producer-side entry point, cheap to clone into the USB callback.
#[derive(Clone)]
pub struct PipelineHandle {
    producer: Arc<RingProducer>,
    metrics: Arc<Metrics>,
    events: EventBus,
    activity: Arc<ActivityTracker>,
    recorder: Option<UsbRecorder>,
    capture_flag: Arc<AtomicBool>,
    capture_tx: mpsc::UnboundedSender<Bytes>,
}

impl PipelineHandle {
    /// Feed one USB chunk. Never blocks: the cost is one memcpy and a few
    /// atomic stores. Returns false when the ring is full; the chunk is
    /// dropped whole and the drop is surfaced, not hidden.
    ///
    /// While the RED raw capture is open, bytes go verbatim to the
    /// capture file and classification is bypassed.
    pub fn ingest(&self, chunk: &[u8]) -> bool {
        self.activity.touch();
        if let Some(recorder) = &self.recorder {
            recorder.record_rx(chunk);
        }
        if self.capture_flag.load(Ordering::Acquire) {
            let _ = self.capture_tx.send(Bytes::copy_from_slice(chunk));
            self.metrics.record_bytes(chunk.len());
            return true;
        }
        if self.producer.append(chunk) {
            self.metrics.record_bytes(chunk.len());
            true
        } else {
            self.metrics.inc_buffer_overflow(chunk.len());
            self.events.emit(PipelineEvent::BufferOverflow {
                attempted: chunk.len(),
                available: self.producer.available(),
            });
            false
        }
    }

    /// Log one outgoing packet to the USB recording, when TX logging is
    /// enabled. The TX pump calls this as it writes to the device.
    pub fn record_tx(&self, bytes: &[u8]) {
        if let Some(recorder) = &self.recorder {
            recorder.record_tx(bytes);
        }
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }
}

pub struct Pipeline {
    config: Config,
    metrics: Arc<Metrics>,
    events: EventBus,
    pool: Arc<MessagePool>,
    producer: Arc<RingProducer>,
    router: Router,
    watchdog: Watchdog,
    emergency: EmergencyController,
    engine: Arc<Mutex<ProtocolEngine>>,
    datamgr: Arc<Mutex<DataManager>>,
    extractor: Option<Extractor>,
    notify_rx: mpsc::UnboundedReceiver<Notification>,
    capture_rx: mpsc::UnboundedReceiver<Bytes>,
    stop: Arc<AtomicBool>,
    tx_rx: Option<mpsc::UnboundedReceiver<Bytes>>,
    recorder_task: Option<tokio::task::JoinHandle<()>>,
}

impl Pipeline {
    pub async fn new(config: Config) -> anyhow::Result<(Self, PipelineHandle)> {
        let metrics = Arc::new(Metrics::new());
        let events = EventBus::new(1024);
        let (producer, consumer) = ring::ring(config.ring.capacity)?;
        let producer = Arc::new(producer);
        let pool = Arc::new(MessagePool::new(
            config.pool.initial_slots,
            config.pool.max_slots,
            config.pool.growth_step,
            config.pool.slot_capacity,
            Arc::clone(&metrics),
        )?);
        let gate = SnapshotGate::new();
        let activity = Arc::new(ActivityTracker::new());

        let (usb_tx, tx_rx) = mpsc::unbounded_channel::<Bytes>();
        let engine = Arc::new(Mutex::new(ProtocolEngine::new(
            usb_tx,
            gate.clone(),
            Arc::clone(&activity),
            Arc::clone(&metrics),
            events.clone(),
        )));
        let datamgr = Arc::new(Mutex::new(DataManager::new()));

        let router = Router::new(Arc::clone(&pool), Arc::clone(&metrics), events.clone());
        let watchdog = Watchdog::new(
            config.watchdog.yellow_percent,
            config.watchdog.orange_percent,
            config.watchdog.sustainable_bps,
            config.ring.warning_threshold,
            events.clone(),
        );
        let emergency = EmergencyController::new(
            config.emergency.hysteresis_ms,
            config.emergency.raw_capture_dir.clone(),
            events.clone(),
            Arc::clone(&metrics),
        );

        let (recorder, recorder_task) = match &config.logging.usb_logging_path {
            Some(path) => {
                let (recorder, task) =
                    UsbRecorder::start(std::path::Path::new(path), config.logging.usb_log_tx)
                        .await?;
                (Some(recorder), Some(task))
            }
            None => (None, None),
        };

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let extractor = Extractor::new(
            consumer,
            Arc::clone(&pool),
            gate,
            Arc::clone(&metrics),
            events.clone(),
            notify_tx,
            Arc::clone(&stop),
        );

        let handle = PipelineHandle {
            producer: Arc::clone(&producer),
            metrics: Arc::clone(&metrics),
            events: events.clone(),
            activity,
            recorder,
            capture_flag: emergency.capture_flag(),
            capture_tx,
        };

        let pipeline = Self {
            config,
            metrics,
            events,
            pool,
            producer,
            router,
            watchdog,
            emergency,
            engine,
            datamgr,
            extractor: Some(extractor),
            notify_rx,
            capture_rx,
            stop,
            tx_rx: Some(tx_rx),
            recorder_task,
        };
        Ok((pipeline, handle))
    }

    pub fn register_destination(
        &mut self,
        key: crate::router::RouteKey,
        destination: Arc<dyn Destination>,
    ) {
        self.router.register(key, destination);
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn pool(&self) -> Arc<MessagePool> {
        Arc::clone(&self.pool)
    }

    pub fn protocol(&self) -> Arc<Mutex<ProtocolEngine>> {
        Arc::clone(&self.engine)
    }

    pub fn data_manager(&self) -> Arc<Mutex<DataManager>> {
        Arc::clone(&self.datamgr)
    }

    /// The outgoing USB bytes (debugger requests). Take it once and pump
    /// it into the serial writer.
    pub fn tx_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.tx_rx.take()
    }

    /// Run the main unit until `shutdown` resolves, then drain in order:
    /// extractor empties the ring, remaining notifications route, the raw
    /// capture and recording flush.
    pub async fn run(mut self, shutdown: impl std::future::Future<Output = ()>) {
        let extractor = self.extractor.take().expect("pipeline already ran");
        let worker = extractor.spawn();

        let mut tick = interval(Duration::from_millis(100));
        let mut rollup = interval(Duration::from_secs(1));
        let mut recovery = interval(Duration::from_millis(
            self.config.emergency.recovery_check_ms.max(100),
        ));
        // The first tick of a tokio interval fires immediately.
        tick.tick().await;
        rollup.tick().await;
        recovery.tick().await;

        let mut last_snapshot = None;
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(note) = self.notify_rx.recv() => {
                    self.handle_notification(note).await;
                }
                Some(bytes) = self.capture_rx.recv() => {
                    self.emergency.write_capture(&bytes);
                }
                _ = tick.tick() => {
                    last_snapshot = Some(self.on_tick());
                }
                _ = rollup.tick() => {
                    self.metrics.rollup();
                }
                _ = recovery.tick() => {
                    if let Some(snapshot) = &last_snapshot {
                        self.emergency.recovery_tick(snapshot);
                    }
                }
            }
        }

        log::info!("shutting down: draining ring and notifications");
        self.stop.store(true, Ordering::Release);
        // Keep routing while the worker drains the ring, otherwise the
        // worker could wait forever on a full pool that only routing can
        // empty.
        let mut worker = worker;
        loop {
            tokio::select! {
                result = &mut worker => {
                    if let Err(err) = result {
                        log::error!("extractor worker panicked: {err}");
                    }
                    break;
                }
                Some(note) = self.notify_rx.recv() => {
                    self.handle_notification(note).await;
                }
            }
        }
        while let Ok(note) = self.notify_rx.try_recv() {
            self.handle_notification(note).await;
        }
        while let Ok(bytes) = self.capture_rx.try_recv() {
            self.emergency.write_capture(&bytes);
        }
        self.emergency.flush();
        if let Some(task) = self.recorder_task.take() {
            // Completes once every recorder clone is gone; don't hang
            // shutdown if the caller kept one.
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                log::warn!("USB recording writer still has live handles; not awaited");
            }
        }
        log::info!("pipeline stopped");
    }

    async fn handle_notification(&mut self, note: Notification) {
        self.metrics.dec_queue_depth();
        if let Some(view) = self.pool.get(note.pool_id) {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros() as u64)
                .unwrap_or(0);
            self.watchdog
                .record_latency(now.saturating_sub(view.arrived_at_us));
        }
        self.router.route(note.pool_id).await;
    }

    fn on_tick(&mut self) -> crate::watchdog::WatchdogSnapshot {
        let ring_stats = self.producer.stats();
        let pool_stats = self.pool.stats();
        let inputs = SampleInputs {
            buffer_usage_percent: ring_stats.usage_percent(),
            pool_in_use: pool_stats.in_use,
            queue_depth: self.metrics.queue_depth(),
            bytes_per_sec: self.metrics.bytes_per_sec(),
            messages_per_sec: self.metrics.messages_per_sec(),
            drops_total: self.metrics.total_drops(),
        };
        let snapshot = self.watchdog.sample(inputs);
        self.emergency.observe(&snapshot);

        let report = self.engine.lock().unwrap().check_timeouts();
        {
            let mut datamgr = self.datamgr.lock().unwrap();
            for request in &report.expired {
                datamgr.on_request_timeout(request);
            }
            if report.communication_lost {
                datamgr.set_all_inactive();
            }
            let mut engine = self.engine.lock().unwrap();
            datamgr.tick(&mut engine);
        }
        snapshot
    }
}
