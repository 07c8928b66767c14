use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/p2stream/p2streamd.toml";
const ENV_CONFIG_PATH: &str = "P2STREAMD_CONFIG";

pub const RING_CAPACITY_MIN: usize = 64 * 1024;
pub const RING_CAPACITY_MAX: usize = 2 * 1024 * 1024;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub emergency: EmergencyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `P2STREAMD_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_path(&PathBuf::from(path))
    }

    /// Load from an explicit path, falling back to defaults on a missing
    /// or unparseable file.
    pub fn load_path(path: &std::path::Path) -> Self {
        let mut cfg: Config = match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        };
        cfg.clamp();
        cfg
    }

    /// Clamp out-of-range values back into their documented bounds.
    pub fn clamp(&mut self) {
        if self.ring.capacity < RING_CAPACITY_MIN || self.ring.capacity > RING_CAPACITY_MAX {
            let clamped = self.ring.capacity.clamp(RING_CAPACITY_MIN, RING_CAPACITY_MAX);
            log::warn!(
                "ring.capacity {} outside [{RING_CAPACITY_MIN}, {RING_CAPACITY_MAX}], using {clamped}",
                self.ring.capacity
            );
            self.ring.capacity = clamped;
        }
        if !(0.1..=0.95).contains(&self.ring.warning_threshold) {
            let clamped = self.ring.warning_threshold.clamp(0.1, 0.95);
            log::warn!(
                "ring.warning_threshold {} outside [0.10, 0.95], using {clamped}",
                self.ring.warning_threshold
            );
            self.ring.warning_threshold = clamped;
        }
        if self.pool.max_slots > POOL_SLOTS_HARD_MAX {
            log::warn!(
                "pool.max_slots {} above hard maximum {POOL_SLOTS_HARD_MAX}, using the maximum",
                self.pool.max_slots
            );
            self.pool.max_slots = POOL_SLOTS_HARD_MAX;
        }
        if self.pool.initial_slots > self.pool.max_slots {
            self.pool.initial_slots = self.pool.max_slots;
        }
        if self.watchdog.yellow_percent >= self.watchdog.orange_percent {
            log::warn!(
                "watchdog.yellow_percent {} >= orange_percent {}, using defaults",
                self.watchdog.yellow_percent,
                self.watchdog.orange_percent
            );
            self.watchdog.yellow_percent = default_yellow_percent();
            self.watchdog.orange_percent = default_orange_percent();
        }
    }
}

const POOL_SLOTS_HARD_MAX: usize = 1000;

#[derive(Debug, Deserialize, Clone)]
pub struct RingConfig {
    #[serde(default = "default_ring_capacity")]
    pub capacity: usize,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            capacity: default_ring_capacity(),
            warning_threshold: default_warning_threshold(),
        }
    }
}

fn default_ring_capacity() -> usize {
    1024 * 1024
}
fn default_warning_threshold() -> f64 {
    0.80
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    #[serde(default = "default_pool_max_slots")]
    pub max_slots: usize,
    #[serde(default = "default_pool_initial_slots")]
    pub initial_slots: usize,
    #[serde(default = "default_pool_growth_step")]
    pub growth_step: usize,
    #[serde(default = "default_slot_capacity")]
    pub slot_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_slots: default_pool_max_slots(),
            initial_slots: default_pool_initial_slots(),
            growth_step: default_pool_growth_step(),
            slot_capacity: default_slot_capacity(),
        }
    }
}

fn default_pool_max_slots() -> usize {
    1000
}
fn default_pool_initial_slots() -> usize {
    100
}
fn default_pool_growth_step() -> usize {
    50
}
fn default_slot_capacity() -> usize {
    65_536
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchdogConfig {
    #[serde(default = "default_yellow_percent")]
    pub yellow_percent: u8,
    #[serde(default = "default_orange_percent")]
    pub orange_percent: u8,
    #[serde(default = "default_sustainable_bps")]
    pub sustainable_bps: u64,
    #[serde(default = "default_burst_bps")]
    pub burst_bps: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            yellow_percent: default_yellow_percent(),
            orange_percent: default_orange_percent(),
            sustainable_bps: default_sustainable_bps(),
            burst_bps: default_burst_bps(),
        }
    }
}

fn default_yellow_percent() -> u8 {
    80
}
fn default_orange_percent() -> u8 {
    95
}
fn default_sustainable_bps() -> u64 {
    2_097_152
}
fn default_burst_bps() -> u64 {
    4_194_304
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmergencyConfig {
    #[serde(default = "default_hysteresis_ms")]
    pub hysteresis_ms: u64,
    #[serde(default = "default_recovery_check_ms")]
    pub recovery_check_ms: u64,
    /// Directory for the RED-level raw capture files.
    #[serde(default = "default_raw_capture_dir")]
    pub raw_capture_dir: String,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            hysteresis_ms: default_hysteresis_ms(),
            recovery_check_ms: default_recovery_check_ms(),
            raw_capture_dir: default_raw_capture_dir(),
        }
    }
}

fn default_hysteresis_ms() -> u64 {
    5000
}
fn default_recovery_check_ms() -> u64 {
    10_000
}
fn default_raw_capture_dir() -> String {
    "/var/log/p2stream".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_main_log")]
    pub main_log: String,
    /// Write per-COG sibling logs next to the main log on export.
    #[serde(default = "default_cog_logs")]
    pub cog_logs: bool,
    /// When set, RX bytes (and optionally TX) are recorded with monotonic
    /// timestamps for later replay.
    #[serde(default)]
    pub usb_logging_path: Option<String>,
    #[serde(default)]
    pub usb_log_tx: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            main_log: default_main_log(),
            cog_logs: default_cog_logs(),
            usb_logging_path: None,
            usb_log_tx: false,
        }
    }
}

fn default_main_log() -> String {
    "/var/log/p2stream/debug.log".to_string()
}
fn default_cog_logs() -> bool {
    true
}
