//! Configuration management for screenpilot
//!
//! Handles loading and validation of screenpilot.toml configuration files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable that points at an explicit config file.
pub const CONFIG_ENV_VAR: &str = "SCREENPILOT_CONFIG";

/// Default config file name.
pub const CONFIG_FILE_NAME: &str = "screenpilot.toml";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Marker matching settings
    #[serde(default)]
    pub vision: VisionConfig,

    /// Navigator settings
    #[serde(default)]
    pub navigation: NavigationConfig,

    /// Recovery ladder settings
    #[serde(default)]
    pub recovery: RecoveryConfig,

    /// Adaptive timer settings
    #[serde(default)]
    pub timing: TimingConfig,

    /// Stats persistence settings
    #[serde(default)]
    pub stats: StatsConfig,

    /// Task manager settings
    #[serde(default)]
    pub tasks: TasksConfig,

    /// adb transport settings
    #[serde(default)]
    pub adb: AdbConfig,

    /// Failure screenshots
    #[serde(default)]
    pub debug: DebugConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Data directory; defaults to the platform data dir
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
            log_file: None,
            data_dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Vision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    /// Minimum confidence for a screen marker to count as a match
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: f64,

    /// Recent hit locations remembered per marker
    #[serde(default = "default_region_cache_size")]
    pub region_cache_size: usize,

    /// Padding (px) around a cached hit when searching near it
    #[serde(default = "default_region_padding")]
    pub region_padding: u32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            accept_threshold: default_accept_threshold(),
            region_cache_size: default_region_cache_size(),
            region_padding: default_region_padding(),
        }
    }
}

fn default_accept_threshold() -> f64 {
    0.8
}

fn default_region_cache_size() -> usize {
    8
}

fn default_region_padding() -> u32 {
    40
}

/// Navigator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigationConfig {
    /// Maximum recursion depth
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Extra verification attempts after the first
    #[serde(default = "default_verify_retries")]
    pub verify_retries: u32,

    /// Delay between verification attempts (ms)
    #[serde(default = "default_verify_delay")]
    pub verify_delay_ms: u64,

    /// Nominal budget for one transition to land (ms)
    #[serde(default = "default_step_budget")]
    pub step_budget_ms: u64,

    /// Pause between the steps of a multi-step transition (ms)
    #[serde(default = "default_sequence_delay")]
    pub sequence_delay_ms: u64,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            verify_retries: default_verify_retries(),
            verify_delay_ms: default_verify_delay(),
            step_budget_ms: default_step_budget(),
            sequence_delay_ms: default_sequence_delay(),
        }
    }
}

impl NavigationConfig {
    #[must_use]
    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }

    #[must_use]
    pub fn step_budget(&self) -> Duration {
        Duration::from_millis(self.step_budget_ms)
    }

    #[must_use]
    pub fn sequence_delay(&self) -> Duration {
        Duration::from_millis(self.sequence_delay_ms)
    }
}

fn default_max_depth() -> u32 {
    4
}

fn default_verify_retries() -> u32 {
    2
}

fn default_verify_delay() -> u64 {
    1000
}

fn default_step_budget() -> u64 {
    5000
}

fn default_sequence_delay() -> u64 {
    800
}

/// Recovery ladder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Neutral coordinate tapped by the third rung
    #[serde(default = "default_neutral_point")]
    pub neutral_point: (u32, u32),

    /// Attempts of the template-dismiss rung
    #[serde(default = "default_template_attempts")]
    pub template_attempts: u32,

    /// Back signals sent by the nuclear rung
    #[serde(default = "default_nuclear_backs")]
    pub nuclear_backs: u32,

    /// Settle time after each corrective action (ms)
    #[serde(default = "default_settle")]
    pub settle_ms: u64,

    /// Cooldown at the end of the nuclear rung (ms)
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            neutral_point: default_neutral_point(),
            template_attempts: default_template_attempts(),
            nuclear_backs: default_nuclear_backs(),
            settle_ms: default_settle(),
            cooldown_ms: default_cooldown(),
        }
    }
}

fn default_neutral_point() -> (u32, u32) {
    (540, 80)
}

fn default_template_attempts() -> u32 {
    2
}

fn default_nuclear_backs() -> u32 {
    3
}

fn default_settle() -> u64 {
    1500
}

fn default_cooldown() -> u64 {
    3000
}

/// Adaptive timer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Poll interval for wait_until (ms)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Multiplier applied to the P90 duration
    #[serde(default = "default_headroom")]
    pub headroom: f64,

    /// Lowest allowed budget as a fraction of nominal
    #[serde(default = "default_floor_fraction")]
    pub floor_fraction: f64,

    /// Highest allowed budget as a multiple of nominal
    #[serde(default = "default_ceiling_factor")]
    pub ceiling_factor: f64,

    /// Samples needed before a label's history is trusted
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Success rate needed before a label's history is trusted
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            headroom: default_headroom(),
            floor_fraction: default_floor_fraction(),
            ceiling_factor: default_ceiling_factor(),
            min_samples: default_min_samples(),
            min_success_rate: default_min_success_rate(),
        }
    }
}

impl TimingConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_interval() -> u64 {
    150
}

fn default_headroom() -> f64 {
    1.5
}

fn default_floor_fraction() -> f64 {
    0.4
}

fn default_ceiling_factor() -> f64 {
    1.0
}

fn default_min_samples() -> usize {
    10
}

fn default_min_success_rate() -> f64 {
    0.8
}

/// Stats persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Directory for session files; defaults to `<data_dir>/stats`
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Session files kept on disk
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Timing samples kept per label
    #[serde(default = "default_max_samples")]
    pub max_samples_per_label: usize,

    /// Periodic flush interval (seconds)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            max_sessions: default_max_sessions(),
            max_samples_per_label: default_max_samples(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

fn default_max_sessions() -> usize {
    30
}

fn default_max_samples() -> usize {
    200
}

fn default_flush_interval() -> u64 {
    60
}

/// Task manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TasksConfig {
    /// Time between signaling and aborting during force_stop_all (ms)
    #[serde(default = "default_force_grace")]
    pub force_grace_ms: u64,

    /// How long graceful shutdown waits for tasks to finish (ms)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,

    /// How long force_stop_all waits for aborted tasks to actually end (ms)
    #[serde(default = "default_abort_wait")]
    pub abort_wait_ms: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            force_grace_ms: default_force_grace(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            abort_wait_ms: default_abort_wait(),
        }
    }
}

fn default_force_grace() -> u64 {
    100
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_abort_wait() -> u64 {
    2000
}

/// Debug screenshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Save a screenshot on an unknown screen, a failed verify, or a failed recovery
    #[serde(default)]
    pub screenshots: bool,

    /// Directory for captures; defaults to `<data_dir>/debug`
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Captures kept on disk; oldest are deleted first
    #[serde(default = "default_debug_max_files")]
    pub max_files: usize,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            screenshots: false,
            dir: None,
            max_files: default_debug_max_files(),
        }
    }
}

fn default_debug_max_files() -> usize {
    50
}

/// adb configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdbConfig {
    /// Explicit adb binary
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Per-call timeout (ms)
    #[serde(default = "default_adb_timeout")]
    pub timeout_ms: u64,

    /// Try `adb connect` on known emulator ports before listing devices
    #[serde(default)]
    pub auto_connect: bool,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            path: None,
            timeout_ms: default_adb_timeout(),
            auto_connect: false,
        }
    }
}

fn default_adb_timeout() -> u64 {
    10_000
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Order: `$SCREENPILOT_CONFIG`, `./screenpilot.toml`,
    /// `<config_dir>/screenpilot/screenpilot.toml`, then built-in defaults.
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::load_from(Path::new(&path));
        }
        for candidate in Self::search_paths() {
            if candidate.is_file() {
                return Self::load_from(&candidate);
            }
        }
        Ok(Self::default())
    }

    /// Candidate config file locations, highest priority first.
    #[must_use]
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("screenpilot").join(CONFIG_FILE_NAME));
        }
        paths
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(text: &str) -> crate::Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeFailed(e.to_string()).into())
    }

    /// Reject settings that would break the control loop's invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError::ValidationError(msg));

        if !(0.0..=1.0).contains(&self.vision.accept_threshold) {
            return fail(format!(
                "vision.accept_threshold must be within [0, 1], got {}",
                self.vision.accept_threshold
            ));
        }
        if self.navigation.max_depth == 0 {
            return fail("navigation.max_depth must be at least 1".to_string());
        }
        let timing = &self.timing;
        if timing.poll_interval_ms == 0 {
            return fail("timing.poll_interval_ms must be positive".to_string());
        }
        if !(timing.floor_fraction > 0.0 && timing.floor_fraction <= 1.0) {
            return fail(format!(
                "timing.floor_fraction must be within (0, 1], got {}",
                timing.floor_fraction
            ));
        }
        if timing.headroom < 1.0 {
            return fail(format!("timing.headroom must be >= 1, got {}", timing.headroom));
        }
        if timing.ceiling_factor < timing.floor_fraction {
            return fail(format!(
                "timing.ceiling_factor ({}) is below timing.floor_fraction ({})",
                timing.ceiling_factor, timing.floor_fraction
            ));
        }
        if !(0.0..=1.0).contains(&timing.min_success_rate) {
            return fail(format!(
                "timing.min_success_rate must be within [0, 1], got {}",
                timing.min_success_rate
            ));
        }
        if self.stats.max_sessions == 0 {
            return fail("stats.max_sessions must be at least 1".to_string());
        }
        if self.stats.max_samples_per_label == 0 {
            return fail("stats.max_samples_per_label must be at least 1".to_string());
        }
        if self.adb.timeout_ms == 0 {
            return fail("adb.timeout_ms must be positive".to_string());
        }
        if self.debug.max_files == 0 {
            return fail("debug.max_files must be at least 1".to_string());
        }
        Ok(())
    }

    /// Resolved data directory.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.general.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|dir| dir.join("screenpilot"))
                .unwrap_or_else(|| PathBuf::from(".screenpilot"))
        })
    }

    /// Resolved stats directory.
    #[must_use]
    pub fn stats_dir(&self) -> PathBuf {
        self.stats
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("stats"))
    }

    /// Resolved debug screenshot directory.
    #[must_use]
    pub fn debug_dir(&self) -> PathBuf {
        self.debug
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("debug"))
    }
}
