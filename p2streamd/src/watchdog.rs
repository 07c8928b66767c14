//! Load grading.
//!
//! Sampled every 100 ms from the main unit. The watchdog only grades;
//! acting on the grade is the emergency controller's job.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::events::{EventBus, PipelineEvent};

/// How many latency observations the percentile window keeps.
const LATENCY_WINDOW: usize = 1024;

/// Reference queue depth treated as 100% queue usage.
const QUEUE_FULL_DEPTH: usize = 1000;

const ALERT_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PerfLevel {
    Green,
    Yellow,
    Orange,
    Red,
}

impl PerfLevel {
    pub fn label(&self) -> &'static str {
        match self {
            PerfLevel::Green => "GREEN",
            PerfLevel::Yellow => "YELLOW",
            PerfLevel::Orange => "ORANGE",
            PerfLevel::Red => "RED",
        }
    }
}

/// Raw inputs for one 100 ms sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleInputs {
    pub buffer_usage_percent: f64,
    pub pool_in_use: usize,
    pub queue_depth: usize,
    pub bytes_per_sec: u64,
    pub messages_per_sec: u64,
    pub drops_total: u64,
}

/// One graded sample, as carried by performance alerts.
#[derive(Debug, Clone)]
pub struct WatchdogSnapshot {
    pub buffer_usage_percent: f64,
    pub pool_in_use: usize,
    pub queue_depth: usize,
    pub bytes_per_sec: u64,
    pub messages_per_sec: u64,
    pub drops_total: u64,
    pub new_drops: u64,
    pub load_percent: f64,
    pub latency_p50_us: u64,
    pub latency_p95_us: u64,
    pub latency_p99_us: u64,
    pub level: PerfLevel,
}

pub struct Watchdog {
    yellow_percent: u8,
    orange_percent: u8,
    sustainable_bps: u64,
    warning_threshold: f64,
    events: EventBus,
    level: PerfLevel,
    last_drops: u64,
    latencies: VecDeque<u64>,
    last_alert: [Option<Instant>; 4],
    above_warning: bool,
    alert_cooldown: Duration,
}

impl Watchdog {
    pub fn new(
        yellow_percent: u8,
        orange_percent: u8,
        sustainable_bps: u64,
        warning_threshold: f64,
        events: EventBus,
    ) -> Self {
        Self {
            yellow_percent,
            orange_percent,
            sustainable_bps: sustainable_bps.max(1),
            warning_threshold,
            events,
            level: PerfLevel::Green,
            last_drops: 0,
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            last_alert: [None; 4],
            above_warning: false,
            alert_cooldown: ALERT_COOLDOWN,
        }
    }

    #[cfg(test)]
    fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.alert_cooldown = cooldown;
        self
    }

    pub fn level(&self) -> PerfLevel {
        self.level
    }

    /// Record one arrival-to-routing latency observation.
    pub fn record_latency(&mut self, micros: u64) {
        if self.latencies.len() == LATENCY_WINDOW {
            self.latencies.pop_front();
        }
        self.latencies.push_back(micros);
    }

    /// Grade the given inputs. Pure in the metrics: coordinate-wise
    /// larger inputs never yield a lower level.
    pub fn grade(&self, inputs: &SampleInputs, new_drops: u64) -> (PerfLevel, f64) {
        let queue_usage = inputs.queue_depth as f64 * 100.0 / QUEUE_FULL_DEPTH as f64;
        let throughput_ratio = inputs.bytes_per_sec as f64 * 100.0 / self.sustainable_bps as f64;
        let load = inputs
            .buffer_usage_percent
            .max(queue_usage)
            .max(throughput_ratio);
        let level = if new_drops > 0 {
            PerfLevel::Red
        } else if load >= self.orange_percent as f64 {
            PerfLevel::Orange
        } else if load >= self.yellow_percent as f64 {
            PerfLevel::Yellow
        } else {
            PerfLevel::Green
        };
        (level, load)
    }

    /// Take the 100 ms sample: grade, track the warning threshold, and
    /// emit alerts on level transitions (per-level cooldown applies).
    pub fn sample(&mut self, inputs: SampleInputs) -> WatchdogSnapshot {
        let new_drops = inputs.drops_total.saturating_sub(self.last_drops);
        self.last_drops = inputs.drops_total;
        let (level, load) = self.grade(&inputs, new_drops);
        let (p50, p95, p99) = self.percentiles();
        let snapshot = WatchdogSnapshot {
            buffer_usage_percent: inputs.buffer_usage_percent,
            pool_in_use: inputs.pool_in_use,
            queue_depth: inputs.queue_depth,
            bytes_per_sec: inputs.bytes_per_sec,
            messages_per_sec: inputs.messages_per_sec,
            drops_total: inputs.drops_total,
            new_drops,
            load_percent: load,
            latency_p50_us: p50,
            latency_p95_us: p95,
            latency_p99_us: p99,
            level,
        };
        self.track_warning(inputs.buffer_usage_percent);
        if level != self.level {
            let previous = self.level;
            self.level = level;
            self.maybe_alert(level, previous, &snapshot);
        }
        snapshot
    }

    fn track_warning(&mut self, usage_percent: f64) {
        let threshold = self.warning_threshold * 100.0;
        let above = usage_percent >= threshold;
        if above && !self.above_warning {
            self.events.emit(PipelineEvent::BufferWarning {
                usage_percent,
                threshold,
            });
        }
        self.above_warning = above;
    }

    fn maybe_alert(&mut self, level: PerfLevel, previous: PerfLevel, snapshot: &WatchdogSnapshot) {
        let slot = level as usize;
        if let Some(last) = self.last_alert[slot] {
            if last.elapsed() < self.alert_cooldown {
                return;
            }
        }
        self.last_alert[slot] = Some(Instant::now());
        let text = format!(
            "performance {} -> {} (load {:.1}%, {} B/s, {} msg/s, {} drops)",
            previous.label(),
            level.label(),
            snapshot.load_percent,
            snapshot.bytes_per_sec,
            snapshot.messages_per_sec,
            snapshot.new_drops
        );
        log::warn!("{text}");
        self.events.emit(PipelineEvent::PerformanceAlert {
            level,
            previous,
            metrics: snapshot.clone(),
            text,
            timestamp: Utc::now(),
        });
    }

    fn percentiles(&self) -> (u64, u64, u64) {
        if self.latencies.is_empty() {
            return (0, 0, 0);
        }
        let mut sorted: Vec<u64> = self.latencies.iter().copied().collect();
        sorted.sort_unstable();
        let pick = |p: f64| {
            let idx = ((sorted.len() as f64 - 1.0) * p) as usize;
            sorted[idx.min(sorted.len() - 1)]
        };
        (pick(0.50), pick(0.95), pick(0.99))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watchdog() -> Watchdog {
        Watchdog::new(80, 95, 2_097_152, 0.8, EventBus::new(64))
    }

    fn inputs(buffer: f64, queue: usize, bps: u64, drops: u64) -> SampleInputs {
        SampleInputs {
            buffer_usage_percent: buffer,
            pool_in_use: 0,
            queue_depth: queue,
            bytes_per_sec: bps,
            messages_per_sec: 0,
            drops_total: drops,
        }
    }

    #[test]
    fn grading_thresholds() {
        let w = watchdog();
        assert_eq!(w.grade(&inputs(10.0, 0, 0, 0), 0).0, PerfLevel::Green);
        assert_eq!(w.grade(&inputs(80.0, 0, 0, 0), 0).0, PerfLevel::Yellow);
        assert_eq!(w.grade(&inputs(95.0, 0, 0, 0), 0).0, PerfLevel::Orange);
        assert_eq!(w.grade(&inputs(10.0, 0, 0, 0), 1).0, PerfLevel::Red);
        // Queue depth and throughput feed the same load maximum.
        assert_eq!(w.grade(&inputs(0.0, 900, 0, 0), 0).0, PerfLevel::Yellow);
        assert_eq!(
            w.grade(&inputs(0.0, 0, 2_097_152, 0), 0).0,
            PerfLevel::Orange
        );
    }

    #[test]
    fn grading_is_monotone() {
        let w = watchdog();
        let cases = [
            (0.0, 0, 0u64, 0u64),
            (50.0, 100, 500_000, 0),
            (81.0, 200, 1_000_000, 0),
            (96.0, 950, 2_000_000, 0),
            (99.0, 1000, 4_000_000, 1),
        ];
        let mut last = PerfLevel::Green;
        for (buffer, queue, bps, drops) in cases {
            let (level, _) = w.grade(&inputs(buffer, queue, bps, drops), drops);
            assert!(level >= last, "level regressed at buffer={buffer}");
            last = level;
        }
    }

    #[test]
    fn transition_emits_alert_with_cooldown() {
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let mut w = Watchdog::new(80, 95, 2_097_152, 0.99, events)
            .with_cooldown(Duration::from_secs(3600));
        w.sample(inputs(85.0, 0, 0, 0));
        match rx.try_recv().unwrap() {
            PipelineEvent::PerformanceAlert {
                level, previous, ..
            } => {
                assert_eq!(level, PerfLevel::Yellow);
                assert_eq!(previous, PerfLevel::Green);
            }
            other => panic!("unexpected event {other:?}"),
        }
        // Drop back and rise again inside the cooldown: no second alert
        // for YELLOW.
        w.sample(inputs(10.0, 0, 0, 0));
        while let Ok(ev) = rx.try_recv() {
            assert!(!matches!(
                ev,
                PipelineEvent::PerformanceAlert {
                    level: PerfLevel::Yellow,
                    ..
                }
            ));
        }
        w.sample(inputs(85.0, 0, 0, 0));
        assert!(rx.try_recv().is_err());
        assert_eq!(w.level(), PerfLevel::Yellow);
    }

    #[test]
    fn new_drops_are_deltas() {
        let mut w = watchdog();
        let snap = w.sample(inputs(0.0, 0, 0, 5));
        assert_eq!(snap.new_drops, 5);
        assert_eq!(snap.level, PerfLevel::Red);
        let snap = w.sample(inputs(0.0, 0, 0, 5));
        assert_eq!(snap.new_drops, 0);
        assert_eq!(snap.level, PerfLevel::Green);
    }

    #[test]
    fn warning_fires_on_upward_crossing_only() {
        let events = EventBus::new(64);
        let mut rx = events.subscribe();
        let mut w = Watchdog::new(200, 201, 2_097_152, 0.8, events);
        w.sample(inputs(50.0, 0, 0, 0));
        assert!(rx.try_recv().is_err());
        w.sample(inputs(85.0, 0, 0, 0));
        assert!(matches!(
            rx.try_recv().unwrap(),
            PipelineEvent::BufferWarning { .. }
        ));
        w.sample(inputs(90.0, 0, 0, 0));
        assert!(rx.try_recv().is_err(), "still above: no repeat warning");
        w.sample(inputs(10.0, 0, 0, 0));
        w.sample(inputs(85.0, 0, 0, 0));
        assert!(rx.try_recv().is_ok(), "re-crossing warns again");
    }

    #[test]
    fn latency_percentiles() {
        let mut w = watchdog();
        for us in 1..=100u64 {
            w.record_latency(us);
        }
        let snap = w.sample(inputs(0.0, 0, 0, 0));
        assert_eq!(snap.latency_p50_us, 50);
        assert_eq!(snap.latency_p95_us, 95);
        assert_eq!(snap.latency_p99_us, 99);
    }
}
