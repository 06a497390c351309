//! Error types for screenpilot-core

use std::fmt::Write;
use thiserror::Error;

use crate::screen::Screen;

/// A command the user can run to fix or diagnose a failure.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    pub label: String,
    pub command: String,
    /// Only applies on this platform ("macOS", "Linux (Debian/Ubuntu)", ...)
    pub platform: Option<String>,
}

/// What to do about an error, shown under the error message by `sp`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    pub summary: String,
    pub commands: Vec<RemediationCommand>,
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.push_command(label.into(), command.into(), None)
    }

    #[must_use]
    pub fn platform_command(
        self,
        label: impl Into<String>,
        command: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        self.push_command(label.into(), command.into(), Some(platform.into()))
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    fn push_command(mut self, label: String, command: String, platform: Option<String>) -> Self {
        self.commands.push(RemediationCommand {
            label,
            command,
            platform,
        });
        self
    }

    /// Plain-text block starting with "To fix:".
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "To fix:\n  {}", self.summary);
        if !self.commands.is_empty() {
            let _ = writeln!(out, "  Commands:");
        }
        for cmd in &self.commands {
            match &cmd.platform {
                Some(platform) => {
                    let _ = writeln!(out, "    - {} ({platform}): {}", cmd.label, cmd.command);
                }
                None => {
                    let _ = writeln!(out, "    - {}: {}", cmd.label, cmd.command);
                }
            }
        }
        if !self.alternatives.is_empty() {
            let _ = writeln!(out, "  Alternatives:");
        }
        for alt in &self.alternatives {
            let _ = writeln!(out, "    - {alt}");
        }
        out
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for screenpilot-core
#[derive(Error, Debug)]
pub enum Error {
    /// Navigation failures (recovery exhausted, route gaps, ...)
    #[error("Navigation error: {0}")]
    Navigation(#[from] NavigationError),

    /// Task manager errors
    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    /// Device transport / capability provider errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Stats persistence errors
    #[error("Stats error: {0}")]
    Stats(#[from] StatsError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation was cancelled by a stop request
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Navigation(err) => Some(err.remediation()),
            Self::Task(err) => Some(err.remediation()),
            Self::Transport(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Stats(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Show config", "sp config show")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("A stats session file is not valid JSON.")
                    .command("Inspect sessions", "sp stats")
                    .alternative("Delete the offending session_*.json file."),
            ),
            Self::Cancelled(_) => Some(
                Remediation::new("Operation was cancelled. Retry if the stop was unexpected.")
                    .alternative("Check whether a stop or shutdown request triggered the cancellation."),
            ),
        }
    }
}

/// Device transport and capability provider errors
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// adb binary not found
    #[error("adb not found. Install Android platform-tools or set adb.path.")]
    AdbNotFound,

    /// A device call exceeded its per-call timeout
    #[error("{op} timed out after {timeout_ms} ms")]
    Timeout { op: String, timeout_ms: u64 },

    /// Device is not connected or not in the `device` state
    #[error("Device offline: {0}")]
    DeviceOffline(String),

    /// Command execution failed
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Screenshot or provider output could not be decoded
    #[error("Failed to decode device output: {0}")]
    Decode(String),

    /// The provider does not implement this capability
    #[error("Unsupported capability: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Whether this failure is worth one reconnect-and-retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::AdbNotFound => Remediation::new(
                "Install Android platform-tools and ensure `adb` is on PATH.",
            )
            .platform_command("Install", "sudo apt install adb", "Linux (Debian/Ubuntu)")
            .platform_command("Install", "brew install android-platform-tools", "macOS")
            .command("Verify install", "adb version")
            .alternative("Point adb.path in screenpilot.toml at the emulator's bundled adb."),
            Self::Timeout { op, .. } => Remediation::new(format!(
                "Device call `{op}` timed out. Check that the emulator is responsive."
            ))
            .command("List devices", "sp devices")
            .alternative("Raise adb.timeout_ms if the host is heavily loaded."),
            Self::DeviceOffline(device) => {
                Remediation::new(format!("Reconnect device {device} and retry."))
                    .command("Reconnect", format!("adb connect {device}"))
                    .command("List devices", "sp devices")
            }
            Self::CommandFailed(_) => Remediation::new("adb command failed. Check adb output.")
                .command("Restart adb", "adb kill-server && adb start-server")
                .command("List devices", "sp devices"),
            Self::Decode(_) => Remediation::new(
                "Device returned unexpected output. Verify the emulator is fully booted.",
            )
            .command("Capture", "sp screenshot <device> shot.png"),
            Self::Unsupported(_) => Remediation::new(
                "This capability needs an external provider (template matcher or OCR).",
            )
            .alternative("Plug a CapabilityProvider implementation into Vision."),
        }
    }
}

/// Navigation failures surfaced by the navigator
#[derive(Error, Debug)]
pub enum NavigationError {
    /// Every recovery rung ran and the screen is still unknown
    #[error("Recovery exhausted (best partial confidence {best_confidence:.2})")]
    RecoveryExhausted { best_confidence: f64 },

    /// No route or edge is defined between two screens
    #[error("No route from {from} to {to}")]
    RouteGap { from: Screen, to: Screen },

    /// Recursion depth guard tripped (route cycle or repeated misfire)
    #[error("Navigation depth exceeded (max {max})")]
    DepthExceeded { max: u32 },

    /// Arrival verification kept observing a different screen
    #[error("Verification failed: expected {expected}, saw {actual}")]
    VerifyFailed { expected: Screen, actual: Screen },

    /// An edge's marker was not on screen when the step ran
    #[error("Marker not found: {0}")]
    MarkerMissing(String),

    /// A halting overlay (e.g. logged-out notice) covers the screen
    #[error("Blocked by overlay: {0}")]
    Blocked(String),

    /// Capability provider or transport failed mid-step
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The owning task was asked to stop
    #[error("Navigation cancelled")]
    Cancelled,
}

impl NavigationError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::RecoveryExhausted { .. } => Remediation::new(
                "The device shows a screen no marker recognizes. Inspect a screenshot.",
            )
            .command("Capture", "sp screenshot <device> shot.png")
            .alternative("Register a marker or dismiss rule for the unrecognized overlay."),
            Self::RouteGap { from, to } => Remediation::new(format!(
                "Add a route and edge for {from} -> {to} to the route table."
            ))
            .command("Show routes", "sp routes"),
            Self::DepthExceeded { .. } => Remediation::new(
                "A transition keeps landing on an unexpected screen. Check the edge markers.",
            )
            .command("Show routes", "sp routes")
            .alternative("Raise navigation.max_depth only if the route is legitimately long."),
            Self::VerifyFailed { .. } => Remediation::new(
                "Arrival could not be confirmed. Raise navigation.verify_retries or the step budget.",
            )
            .command("Show config", "sp config show"),
            Self::MarkerMissing(name) => Remediation::new(format!(
                "Marker `{name}` was not found. The reference image may be stale."
            ))
            .command("Capture", "sp screenshot <device> shot.png")
            .alternative("Lower the marker threshold or replace the edge with a fixed tap."),
            Self::Blocked(name) => Remediation::new(format!(
                "Overlay `{name}` needs manual attention (often a logged-out session)."
            ))
            .alternative("Log the account back in, then relaunch the task."),
            Self::Transport(err) => err.remediation(),
            Self::Cancelled => Remediation::new("Navigation was stopped by its task."),
        }
    }
}

/// Task manager errors
#[derive(Error, Debug)]
pub enum TaskError {
    /// A conflicting task is already live on this device
    #[error("Task {existing} is already active on {device}; refusing to launch {kind}")]
    Conflict {
        device: String,
        kind: String,
        existing: String,
    },

    /// No task with this id was ever launched
    #[error("Unknown task id: {0}")]
    NotFound(u64),

    /// The manager is shutting down and accepts no new work
    #[error("Task manager is shutting down")]
    ShuttingDown,
}

impl TaskError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Conflict { existing, .. } => Remediation::new(format!(
                "Stop `{existing}` first, or wait for it to finish."
            ))
            .alternative("Tasks of the same kind, or two exclusive tasks, never share a device."),
            Self::NotFound(_) => Remediation::new("Use a task id returned by launch."),
            Self::ShuttingDown => Remediation::new("Restart the process to launch new tasks."),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Invalid config: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Create the config file or pass a different path: {path}"
            ))
            .command("Show defaults", "sp config show"),
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Check permissions on {path} and retry."))
                    .command("Check file", format!("ls -la \"{path}\""))
            }
            Self::ParseError(_) => Remediation::new("Fix the TOML syntax and retry.")
                .command("Validate", "sp config check"),
            Self::SerializeFailed(_) => {
                Remediation::new("Config could not be serialized; report this as a bug.")
            }
            Self::ValidationError(_) => Remediation::new("Correct the out-of-range setting.")
                .command("Validate", "sp config check")
                .command("Show defaults", "sp config show"),
        }
    }
}

/// Stats persistence errors
#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Failed to persist stats to {path}: {details}")]
    Persist { path: String, details: String },

    #[error("Failed to lock stats directory {0}")]
    Lock(String),
}

impl StatsError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Persist { path, .. } => {
                Remediation::new(format!("Make sure {path} is writable."))
                    .command("Show config", "sp config show")
            }
            Self::Lock(_) => Remediation::new(
                "Another screenpilot process may be saving stats. Retry shortly.",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_available_for_error_variants() {
        let json_err = serde_json::from_str::<serde_json::Value>("").unwrap_err();
        let errors = vec![
            Error::Transport(TransportError::AdbNotFound),
            Error::Transport(TransportError::Timeout {
                op: "tap".to_string(),
                timeout_ms: 5000,
            }),
            Error::Transport(TransportError::DeviceOffline("emulator-5554".to_string())),
            Error::Transport(TransportError::CommandFailed("boom".to_string())),
            Error::Transport(TransportError::Decode("png".to_string())),
            Error::Transport(TransportError::Unsupported("ocr".to_string())),
            Error::Navigation(NavigationError::RecoveryExhausted {
                best_confidence: 0.5,
            }),
            Error::Navigation(NavigationError::RouteGap {
                from: Screen::Map,
                to: Screen::War,
            }),
            Error::Navigation(NavigationError::DepthExceeded { max: 4 }),
            Error::Navigation(NavigationError::VerifyFailed {
                expected: Screen::War,
                actual: Screen::Map,
            }),
            Error::Navigation(NavigationError::MarkerMissing("war_button".to_string())),
            Error::Navigation(NavigationError::Blocked("attention".to_string())),
            Error::Navigation(NavigationError::Cancelled),
            Error::Task(TaskError::Conflict {
                device: "emulator-5554".to_string(),
                kind: "rally".to_string(),
                existing: "rally".to_string(),
            }),
            Error::Task(TaskError::NotFound(7)),
            Error::Task(TaskError::ShuttingDown),
            Error::Config(ConfigError::FileNotFound("screenpilot.toml".to_string())),
            Error::Config(ConfigError::ReadFailed(
                "screenpilot.toml".to_string(),
                "io".to_string(),
            )),
            Error::Config(ConfigError::ParseError("parse".to_string())),
            Error::Config(ConfigError::SerializeFailed("serialize".to_string())),
            Error::Config(ConfigError::ValidationError("invalid".to_string())),
            Error::Stats(StatsError::Persist {
                path: "/tmp/stats".to_string(),
                details: "disk full".to_string(),
            }),
            Error::Stats(StatsError::Lock("/tmp/stats".to_string())),
            Error::Io(std::io::Error::other("io")),
            Error::Json(json_err),
            Error::Cancelled("stop requested".to_string()),
        ];

        for error in errors {
            let remediation = error.remediation().expect("missing remediation");
            assert!(
                !remediation.summary.trim().is_empty(),
                "empty remediation summary for {error}"
            );
        }
    }

    #[test]
    fn only_timeouts_are_retryable() {
        assert!(
            TransportError::Timeout {
                op: "screenshot".to_string(),
                timeout_ms: 1,
            }
            .is_retryable()
        );
        assert!(!TransportError::AdbNotFound.is_retryable());
        assert!(!TransportError::CommandFailed("x".to_string()).is_retryable());
    }

    #[test]
    fn render_plain_lists_commands_and_alternatives() {
        let text = Remediation::new("Do the thing")
            .command("Check", "sp devices")
            .platform_command("Install", "brew install adb", "macOS")
            .alternative("Try again later")
            .render_plain();
        assert!(text.contains("Do the thing"));
        assert!(text.contains("Check: sp devices"));
        assert!(text.contains("Install (macOS): brew install adb"));
        assert!(text.contains("Try again later"));
    }

    #[test]
    fn navigation_error_converts_from_transport() {
        let err: NavigationError = TransportError::DeviceOffline("d".to_string()).into();
        assert!(matches!(err, NavigationError::Transport(_)));
        let top: Error = err.into();
        assert!(top.to_string().starts_with("Navigation error"));
    }
}
