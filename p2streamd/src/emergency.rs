//! Graceful degradation.
//!
//! Four levels mirror the watchdog grades. A raise must persist for the
//! hysteresis window before it applies; recovery steps the level back
//! down one notch at a time on a slower ticker, and only when the trigger
//! condition has cleared. A manual override pins the level until cleared.
//!
//! At RED the controller opens an append-only raw-capture file and the
//! ingest path forwards the verbatim USB bytes to it; classification is
//! effectively bypassed until the level drops.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;

use crate::events::{EventBus, PipelineEvent};
use crate::metrics::Metrics;
use crate::watchdog::{PerfLevel, WatchdogSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EmergencyLevel {
    Normal,
    Yellow,
    Orange,
    Red,
}

impl EmergencyLevel {
    pub fn label(&self) -> &'static str {
        match self {
            EmergencyLevel::Normal => "NORMAL",
            EmergencyLevel::Yellow => "YELLOW",
            EmergencyLevel::Orange => "ORANGE",
            EmergencyLevel::Red => "RED",
        }
    }

    fn from_perf(level: PerfLevel) -> Self {
        match level {
            PerfLevel::Green => EmergencyLevel::Normal,
            PerfLevel::Yellow => EmergencyLevel::Yellow,
            PerfLevel::Orange => EmergencyLevel::Orange,
            PerfLevel::Red => EmergencyLevel::Red,
        }
    }

    fn step_down(self) -> Self {
        match self {
            EmergencyLevel::Red => EmergencyLevel::Orange,
            EmergencyLevel::Orange => EmergencyLevel::Yellow,
            _ => EmergencyLevel::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeTrigger {
    Automatic,
    Recovery,
    Manual,
}

/// Knobs each level applies to the rest of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeConfig {
    pub ui_refresh_ms: u64,
    pub batch_size: usize,
    pub pattern_matching: bool,
    pub cog_parsing: bool,
    pub logging_enabled: bool,
    pub raw_capture: bool,
}

impl ModeConfig {
    pub fn for_level(level: EmergencyLevel) -> Self {
        match level {
            EmergencyLevel::Normal => Self {
                ui_refresh_ms: 16,
                batch_size: 1,
                pattern_matching: true,
                cog_parsing: true,
                logging_enabled: true,
                raw_capture: false,
            },
            EmergencyLevel::Yellow => Self {
                ui_refresh_ms: 50,
                batch_size: 16,
                pattern_matching: true,
                cog_parsing: true,
                logging_enabled: true,
                raw_capture: false,
            },
            EmergencyLevel::Orange => Self {
                ui_refresh_ms: 200,
                batch_size: 64,
                pattern_matching: false,
                cog_parsing: true,
                logging_enabled: false,
                raw_capture: false,
            },
            EmergencyLevel::Red => Self {
                ui_refresh_ms: 1000,
                batch_size: 256,
                pattern_matching: false,
                cog_parsing: false,
                logging_enabled: false,
                raw_capture: true,
            },
        }
    }
}

struct RawCapture {
    file: fs::File,
    path: PathBuf,
}

impl RawCapture {
    fn open(dir: &PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(dir)?;
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let path = dir.join(format!("raw-capture-{stamp}.bin"));
        let mut file = fs::File::create(&path)?;
        let header = json!({
            "version": "1.0",
            "startTime": Utc::now().to_rfc3339(),
            "mode": "emergency-raw-capture",
        });
        file.write_all(header.to_string().as_bytes())?;
        file.write_all(b"\n")?;
        Ok(Self { file, path })
    }
}

pub struct EmergencyController {
    level: EmergencyLevel,
    /// A pending automatic raise and when it was first requested.
    pending: Option<(EmergencyLevel, Instant)>,
    manual: Option<EmergencyLevel>,
    hysteresis: Duration,
    capture_dir: PathBuf,
    capture: Option<RawCapture>,
    /// Read by the ingest path to decide whether to tee bytes.
    capture_active: Arc<AtomicBool>,
    events: EventBus,
    metrics: Arc<Metrics>,
    /// Drop counter at the moment RED was entered (or last recovery
    /// check); RED only recovers once this stops moving.
    drops_at_check: u64,
}

impl EmergencyController {
    pub fn new(
        hysteresis_ms: u64,
        capture_dir: impl Into<PathBuf>,
        events: EventBus,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            level: EmergencyLevel::Normal,
            pending: None,
            manual: None,
            hysteresis: Duration::from_millis(hysteresis_ms),
            capture_dir: capture_dir.into(),
            capture: None,
            capture_active: Arc::new(AtomicBool::new(false)),
            events,
            metrics,
            drops_at_check: 0,
        }
    }

    pub fn level(&self) -> EmergencyLevel {
        self.level
    }

    pub fn config(&self) -> ModeConfig {
        ModeConfig::for_level(self.level)
    }

    /// Flag shared with the producer side; true while RED capture runs.
    pub fn capture_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.capture_active)
    }

    pub fn capture_path(&self) -> Option<&PathBuf> {
        self.capture.as_ref().map(|c| &c.path)
    }

    /// Feed one watchdog sample. Raises go through hysteresis; a request
    /// that stops persisting is discarded.
    pub fn observe(&mut self, snapshot: &WatchdogSnapshot) {
        if self.manual.is_some() {
            return;
        }
        let requested = EmergencyLevel::from_perf(snapshot.level);
        if requested <= self.level {
            self.pending = None;
            return;
        }
        match self.pending {
            Some((level, since)) if level == requested => {
                if since.elapsed() >= self.hysteresis {
                    self.pending = None;
                    self.drops_at_check = snapshot.drops_total;
                    self.apply(
                        requested,
                        ModeTrigger::Automatic,
                        format!(
                            "load {:.1}% / {} new drops persisted past hysteresis",
                            snapshot.load_percent, snapshot.new_drops
                        ),
                    );
                }
            }
            _ => {
                self.pending = Some((requested, Instant::now()));
            }
        }
    }

    /// The slow recovery ticker: one step down when the trigger cleared.
    pub fn recovery_tick(&mut self, snapshot: &WatchdogSnapshot) {
        if self.manual.is_some() || self.level == EmergencyLevel::Normal {
            return;
        }
        let clear = match self.level {
            EmergencyLevel::Red => {
                let no_new_drops = snapshot.drops_total == self.drops_at_check;
                self.drops_at_check = snapshot.drops_total;
                no_new_drops
            }
            EmergencyLevel::Orange => snapshot.buffer_usage_percent < 50.0,
            EmergencyLevel::Yellow => {
                snapshot.buffer_usage_percent < 30.0 && snapshot.queue_depth < 50
            }
            EmergencyLevel::Normal => false,
        };
        if clear {
            let next = self.level.step_down();
            self.apply(
                next,
                ModeTrigger::Recovery,
                format!("{} trigger cleared", self.level.label()),
            );
        }
    }

    /// Pin the level, bypassing hysteresis and recovery.
    pub fn set_manual(&mut self, level: EmergencyLevel) {
        self.manual = Some(level);
        self.pending = None;
        if level != self.level {
            self.apply(level, ModeTrigger::Manual, "manual override".to_string());
        }
    }

    pub fn clear_manual(&mut self) {
        self.manual = None;
    }

    fn apply(&mut self, level: EmergencyLevel, trigger: ModeTrigger, reason: String) {
        let prev = self.level;
        self.level = level;
        let config = ModeConfig::for_level(level);
        if config.raw_capture {
            self.open_capture();
        } else {
            self.close_capture();
        }
        log::warn!(
            "emergency mode {} -> {} ({reason})",
            prev.label(),
            level.label()
        );
        self.events.emit(PipelineEvent::ModeChange {
            prev,
            new: level,
            trigger,
            reason,
            config,
        });
    }

    fn open_capture(&mut self) {
        if self.capture.is_some() {
            return;
        }
        match RawCapture::open(&self.capture_dir) {
            Ok(capture) => {
                log::warn!("raw capture opened at {}", capture.path.display());
                self.capture = Some(capture);
                self.capture_active.store(true, Ordering::Release);
            }
            Err(err) => {
                // An unwritable capture dir must not stall the pipeline.
                log::error!("failed to open raw capture: {err:#}");
            }
        }
    }

    fn close_capture(&mut self) {
        self.capture_active.store(false, Ordering::Release);
        if let Some(mut capture) = self.capture.take() {
            if let Err(err) = capture.file.flush() {
                log::error!("raw capture flush failed: {err:#}");
            }
            log::info!("raw capture closed at {}", capture.path.display());
        }
    }

    /// Append verbatim USB bytes to the capture file, if one is open.
    pub fn write_capture(&mut self, bytes: &[u8]) {
        if let Some(capture) = self.capture.as_mut() {
            match capture.file.write_all(bytes) {
                Ok(()) => self.metrics.add_raw_capture_bytes(bytes.len()),
                Err(err) => log::error!("raw capture write failed: {err:#}"),
            }
        }
    }

    /// Shutdown path: make sure the capture hits the disk.
    pub fn flush(&mut self) {
        self.close_capture();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(level: PerfLevel, buffer: f64, queue: usize, drops: u64) -> WatchdogSnapshot {
        WatchdogSnapshot {
            buffer_usage_percent: buffer,
            pool_in_use: 0,
            queue_depth: queue,
            bytes_per_sec: 0,
            messages_per_sec: 0,
            drops_total: drops,
            new_drops: 0,
            load_percent: buffer,
            latency_p50_us: 0,
            latency_p95_us: 0,
            latency_p99_us: 0,
            level,
        }
    }

    fn controller(hysteresis_ms: u64) -> (EmergencyController, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ctl = EmergencyController::new(
            hysteresis_ms,
            dir.path(),
            EventBus::new(64),
            Arc::new(Metrics::new()),
        );
        (ctl, dir)
    }

    #[test]
    fn short_lived_request_is_discarded() {
        let (mut ctl, _dir) = controller(10_000);
        ctl.observe(&snapshot(PerfLevel::Orange, 96.0, 0, 0));
        assert_eq!(ctl.level(), EmergencyLevel::Normal);
        // The condition goes away before hysteresis elapses.
        ctl.observe(&snapshot(PerfLevel::Green, 10.0, 0, 0));
        ctl.observe(&snapshot(PerfLevel::Orange, 96.0, 0, 0));
        assert_eq!(ctl.level(), EmergencyLevel::Normal);
        assert!(ctl.pending.is_some());
    }

    #[test]
    fn persistent_request_applies_after_hysteresis() {
        let (mut ctl, _dir) = controller(1);
        ctl.observe(&snapshot(PerfLevel::Yellow, 85.0, 0, 0));
        std::thread::sleep(Duration::from_millis(5));
        ctl.observe(&snapshot(PerfLevel::Yellow, 85.0, 0, 0));
        assert_eq!(ctl.level(), EmergencyLevel::Yellow);
    }

    #[test]
    fn recovery_steps_down_one_level_when_clear() {
        let (mut ctl, _dir) = controller(1);
        ctl.observe(&snapshot(PerfLevel::Orange, 96.0, 0, 0));
        std::thread::sleep(Duration::from_millis(5));
        ctl.observe(&snapshot(PerfLevel::Orange, 96.0, 0, 0));
        assert_eq!(ctl.level(), EmergencyLevel::Orange);
        // Buffer still high: no recovery.
        ctl.recovery_tick(&snapshot(PerfLevel::Green, 70.0, 0, 0));
        assert_eq!(ctl.level(), EmergencyLevel::Orange);
        ctl.recovery_tick(&snapshot(PerfLevel::Green, 40.0, 0, 0));
        assert_eq!(ctl.level(), EmergencyLevel::Yellow);
        // Yellow needs buffer < 30 and queue < 50.
        ctl.recovery_tick(&snapshot(PerfLevel::Green, 20.0, 100, 0));
        assert_eq!(ctl.level(), EmergencyLevel::Yellow);
        ctl.recovery_tick(&snapshot(PerfLevel::Green, 20.0, 10, 0));
        assert_eq!(ctl.level(), EmergencyLevel::Normal);
    }

    #[test]
    fn red_opens_capture_and_recovery_needs_quiet_drops() {
        let (mut ctl, dir) = controller(1);
        ctl.observe(&snapshot(PerfLevel::Red, 99.0, 0, 3));
        std::thread::sleep(Duration::from_millis(5));
        ctl.observe(&snapshot(PerfLevel::Red, 99.0, 0, 3));
        assert_eq!(ctl.level(), EmergencyLevel::Red);
        assert!(ctl.capture_flag().load(Ordering::Acquire));
        let path = ctl.capture_path().unwrap().clone();
        assert!(path.starts_with(dir.path()));

        ctl.write_capture(b"\xDB\x01payload");
        // Drops still advancing: stay RED.
        ctl.recovery_tick(&snapshot(PerfLevel::Red, 99.0, 0, 5));
        assert_eq!(ctl.level(), EmergencyLevel::Red);
        ctl.recovery_tick(&snapshot(PerfLevel::Red, 99.0, 0, 5));
        assert_eq!(ctl.level(), EmergencyLevel::Orange);
        assert!(!ctl.capture_flag().load(Ordering::Acquire));

        let content = fs::read(&path).unwrap();
        let newline = content.iter().position(|&b| b == b'\n').unwrap();
        let header: serde_json::Value = serde_json::from_slice(&content[..newline]).unwrap();
        assert_eq!(header["version"], "1.0");
        assert_eq!(header["mode"], "emergency-raw-capture");
        assert_eq!(&content[newline + 1..], b"\xDB\x01payload");
    }

    #[test]
    fn manual_override_bypasses_fsm() {
        let (mut ctl, _dir) = controller(60_000);
        let events = ctl.events.clone();
        let mut rx = events.subscribe();
        ctl.set_manual(EmergencyLevel::Orange);
        assert_eq!(ctl.level(), EmergencyLevel::Orange);
        match rx.try_recv().unwrap() {
            PipelineEvent::ModeChange { trigger, new, .. } => {
                assert_eq!(trigger, ModeTrigger::Manual);
                assert_eq!(new, EmergencyLevel::Orange);
            }
            other => panic!("unexpected event {other:?}"),
        }
        // Automatic inputs are ignored while pinned.
        ctl.observe(&snapshot(PerfLevel::Red, 99.0, 0, 9));
        ctl.recovery_tick(&snapshot(PerfLevel::Green, 1.0, 0, 9));
        assert_eq!(ctl.level(), EmergencyLevel::Orange);
        ctl.clear_manual();
        ctl.recovery_tick(&snapshot(PerfLevel::Green, 1.0, 0, 9));
        assert_eq!(ctl.level(), EmergencyLevel::Yellow);
    }
}
