//! Timing history, adaptive budgets, and per-device action statistics.
//!
//! Every wait appends a [`TimingSample`] under its call-site label. Budgets
//! are derived lazily from a label's recent history. The tracker persists one
//! JSON file per process session, keeps a bounded number of sessions on disk
//! and seeds label histories from them at startup.
//!
//! All state sits behind one mutex, so appends from many device tasks are
//! linearizable per label and a budget is never computed from a half-written
//! history.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::{StatsConfig, TimingConfig};
use crate::device::DeviceId;
use crate::error::StatsError;

const MAX_ERRORS_PER_ACTION: usize = 50;
const MAX_MISSES_PER_MARKER: usize = 10;
const SESSION_PREFIX: &str = "session_";
const SESSION_SUFFIX: &str = ".json";
const LOCK_FILE: &str = ".stats.lock";

/// Distinguishes trackers opened by one process within the same millisecond.
static SESSION_SEQ: AtomicUsize = AtomicUsize::new(0);

// =============================================================================
// Samples and budgets
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleOutcome {
    Success,
    Timeout,
}

/// One wait's duration and outcome. Stored under its call-site label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSample {
    pub duration_ms: u64,
    pub outcome: SampleOutcome,
    pub recorded_at: DateTime<Utc>,
}

impl TimingSample {
    #[must_use]
    pub fn new(duration: Duration, outcome: SampleOutcome) -> Self {
        Self {
            duration_ms: duration.as_millis() as u64,
            outcome,
            recorded_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == SampleOutcome::Success
    }
}

/// Parameters for turning a label's history into a budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetPolicy {
    pub headroom: f64,
    pub floor_fraction: f64,
    pub ceiling_factor: f64,
    pub min_samples: usize,
    pub min_success_rate: f64,
}

impl From<&TimingConfig> for BudgetPolicy {
    fn from(config: &TimingConfig) -> Self {
        Self {
            headroom: config.headroom,
            floor_fraction: config.floor_fraction,
            ceiling_factor: config.ceiling_factor,
            min_samples: config.min_samples,
            min_success_rate: config.min_success_rate,
        }
    }
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

/// Nearest-rank percentile of an ascending slice.
#[must_use]
pub fn percentile_ms(sorted: &[u64], pct: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

/// Adaptive budget for a history, or `None` when the history is too thin or
/// too unreliable to trust.
///
/// The result is P90 of successful durations times `headroom`, clamped to
/// `[floor_fraction, ceiling_factor] * nominal`.
pub fn compute_budget<'a>(
    samples: impl IntoIterator<Item = &'a TimingSample>,
    nominal: Duration,
    policy: &BudgetPolicy,
) -> Option<Duration> {
    let mut total = 0usize;
    let mut successes = Vec::new();
    for sample in samples {
        total += 1;
        if sample.is_success() {
            successes.push(sample.duration_ms);
        }
    }
    if total == 0 || total < policy.min_samples {
        return None;
    }
    if (successes.len() as f64 / total as f64) < policy.min_success_rate {
        return None;
    }
    successes.sort_unstable();
    let p90_ms = percentile_ms(&successes, 90.0)?;

    let nominal_ns = nominal.as_nanos() as f64;
    let floor_ns = nominal_ns * policy.floor_fraction;
    let ceiling_ns = (nominal_ns * policy.ceiling_factor).max(floor_ns);
    let raw_ns = p90_ms as f64 * 1_000_000.0 * policy.headroom;
    Some(Duration::from_nanos(raw_ns.clamp(floor_ns, ceiling_ns).ceil() as u64))
}

// =============================================================================
// Persisted records
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelSession {
    pub samples: Vec<TimingSample>,
    pub successes: u64,
    pub timeouts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_time_ms: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub errors: VecDeque<ErrorEntry>,
}

impl ActionStats {
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 / self.attempts as f64
    }

    #[must_use]
    pub fn average_ms(&self) -> u64 {
        self.total_time_ms.checked_div(self.attempts).unwrap_or(0)
    }

    fn merge(&mut self, other: &Self) {
        self.attempts += other.attempts;
        self.successes += other.successes;
        self.failures += other.failures;
        self.total_time_ms += other.total_time_ms;
        self.last_failure = self.last_failure.max(other.last_failure);
        self.errors.extend(other.errors.iter().cloned());
        while self.errors.len() > MAX_ERRORS_PER_ACTION {
            self.errors.pop_front();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSession {
    pub actions: BTreeMap<String, ActionStats>,
    pub template_misses: BTreeMap<String, VecDeque<f64>>,
    pub nav_failures: BTreeMap<String, u64>,
}

/// Contents of one `session_*.json` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub started_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub timings: BTreeMap<String, LabelSession>,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceSession>,
}

impl SessionRecord {
    #[must_use]
    pub fn empty(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            saved_at: started_at,
            timings: BTreeMap::new(),
            devices: BTreeMap::new(),
        }
    }

    /// Fold another session into this one (used for multi-session reports).
    pub fn merge(&mut self, other: &Self) {
        self.started_at = self.started_at.min(other.started_at);
        self.saved_at = self.saved_at.max(other.saved_at);
        for (label, session) in &other.timings {
            let mine = self.timings.entry(label.clone()).or_default();
            mine.samples.extend(session.samples.iter().cloned());
            mine.successes += session.successes;
            mine.timeouts += session.timeouts;
        }
        for (device, session) in &other.devices {
            let mine = self.devices.entry(device.clone()).or_default();
            for (action, stats) in &session.actions {
                mine.actions.entry(action.clone()).or_default().merge(stats);
            }
            for (marker, scores) in &session.template_misses {
                let list = mine.template_misses.entry(marker.clone()).or_default();
                list.extend(scores.iter().copied());
                while list.len() > MAX_MISSES_PER_MARKER {
                    list.pop_front();
                }
            }
            for (route, count) in &session.nav_failures {
                *mine.nav_failures.entry(route.clone()).or_default() += count;
            }
        }
    }

    /// Human-readable report.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Session {} .. {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.saved_at.format("%Y-%m-%d %H:%M:%S")
        );

        if !self.timings.is_empty() {
            let _ = writeln!(out, "\nWaits:");
            for (label, session) in &self.timings {
                let total = session.successes + session.timeouts;
                let mut ok: Vec<u64> = session
                    .samples
                    .iter()
                    .filter(|s| s.is_success())
                    .map(|s| s.duration_ms)
                    .collect();
                ok.sort_unstable();
                let p90 = percentile_ms(&ok, 90.0)
                    .map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"));
                let _ = writeln!(
                    out,
                    "  {label}: {total} waits, {} timed out, p90 {p90}",
                    session.timeouts
                );
            }
        }

        for (device, session) in &self.devices {
            let _ = writeln!(out, "\n[{device}]");
            for (action, stats) in &session.actions {
                let _ = writeln!(
                    out,
                    "  {action}: {}/{} ok ({:.0}%), avg {}ms",
                    stats.successes,
                    stats.attempts,
                    stats.success_rate() * 100.0,
                    stats.average_ms()
                );
                if let Some(last) = stats.errors.back() {
                    let _ = writeln!(out, "    last error: {}", last.message);
                }
            }
            for (route, count) in &session.nav_failures {
                let _ = writeln!(out, "  nav failure {route}: {count}");
            }
            for (marker, scores) in &session.template_misses {
                let best = scores.iter().copied().fold(0.0_f64, f64::max);
                let _ = writeln!(
                    out,
                    "  template miss {marker}: {} misses, best {best:.2}",
                    scores.len()
                );
            }
        }
        out
    }
}

fn is_session_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(SESSION_PREFIX) && n.ends_with(SESSION_SUFFIX))
}

/// Session files in `dir`, oldest first (names sort chronologically).
pub fn session_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_session_file(path))
        .collect();
    files.sort();
    Ok(files)
}

/// Parse every readable session in `dir`, oldest first. Corrupt files are
/// skipped with a warning.
#[must_use]
pub fn load_sessions(dir: &Path) -> Vec<(PathBuf, SessionRecord)> {
    let files = match session_files(dir) {
        Ok(files) => files,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "Cannot list stats sessions");
            return Vec::new();
        }
    };
    files
        .into_iter()
        .filter_map(|path| {
            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| {
                    serde_json::from_str::<SessionRecord>(&text).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(record) => Some((path, record)),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable stats session");
                    None
                }
            }
        })
        .collect()
}

// =============================================================================
// Tracker
// =============================================================================

#[derive(Debug, Default)]
struct LabelStats {
    /// Recent samples across sessions; drives budgets.
    history: VecDeque<TimingSample>,
    /// Samples recorded by this process; persisted on save.
    session: VecDeque<TimingSample>,
    successes: u64,
    timeouts: u64,
}

#[derive(Debug, Default)]
struct Inner {
    labels: HashMap<String, LabelStats>,
    devices: BTreeMap<String, DeviceSession>,
}

/// Summary of one label's current history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelSummary {
    pub samples: usize,
    pub success_rate: f64,
    pub p90_ms: Option<u64>,
}

pub struct StatsTracker {
    dir: Option<PathBuf>,
    session_name: String,
    started_at: DateTime<Utc>,
    max_sessions: usize,
    max_samples: usize,
    policy: BudgetPolicy,
    inner: Mutex<Inner>,
}

impl StatsTracker {
    /// Tracker without persistence.
    #[must_use]
    pub fn in_memory(config: &StatsConfig, policy: BudgetPolicy) -> Self {
        let started_at = Utc::now();
        Self {
            dir: None,
            session_name: session_file_name(started_at),
            started_at,
            max_sessions: config.max_sessions,
            max_samples: config.max_samples_per_label.max(1),
            policy,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Persistent tracker rooted at `dir`, seeded from retained sessions.
    pub fn open(dir: &Path, config: &StatsConfig, policy: BudgetPolicy) -> Result<Self, StatsError> {
        Self::open_at(dir, config, policy, Utc::now())
    }

    pub fn open_at(
        dir: &Path,
        config: &StatsConfig,
        policy: BudgetPolicy,
        started_at: DateTime<Utc>,
    ) -> Result<Self, StatsError> {
        fs::create_dir_all(dir).map_err(|e| StatsError::Persist {
            path: dir.display().to_string(),
            details: e.to_string(),
        })?;
        let mut tracker = Self::in_memory(config, policy);
        tracker.dir = Some(dir.to_path_buf());
        tracker.started_at = started_at;
        tracker.session_name = session_file_name(started_at);
        let loaded = tracker.load_recent();
        info!(dir = %dir.display(), sessions = loaded, "Stats tracker opened");
        Ok(tracker)
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn policy(&self) -> &BudgetPolicy {
        &self.policy
    }

    /// Path this session saves to, when persistent.
    #[must_use]
    pub fn session_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(&self.session_name))
    }

    /// Seed histories from retained sessions on disk. Returns sessions read.
    fn load_recent(&self) -> usize {
        let Some(dir) = &self.dir else {
            return 0;
        };
        let sessions = load_sessions(dir);
        let mut inner = self.inner();
        let mut count = 0;
        for (path, record) in sessions.iter().rev().take(self.max_sessions).rev() {
            if path.file_name().and_then(|n| n.to_str()) == Some(self.session_name.as_str()) {
                continue;
            }
            for (label, session) in &record.timings {
                let stats = inner.labels.entry(label.clone()).or_default();
                for sample in &session.samples {
                    push_bounded(&mut stats.history, sample.clone(), self.max_samples);
                }
            }
            count += 1;
        }
        count
    }

    /// Append one timing sample under `label`.
    pub fn record_timing(&self, label: &str, duration: Duration, outcome: SampleOutcome) {
        let sample = TimingSample::new(duration, outcome);
        let mut inner = self.inner();
        let stats = inner.labels.entry(label.to_string()).or_default();
        match outcome {
            SampleOutcome::Success => stats.successes += 1,
            SampleOutcome::Timeout => stats.timeouts += 1,
        }
        push_bounded(&mut stats.history, sample.clone(), self.max_samples);
        push_bounded(&mut stats.session, sample, self.max_samples);
    }

    /// Budget for `label`, or `None` if history does not qualify.
    #[must_use]
    pub fn adaptive_budget(&self, label: &str, nominal: Duration) -> Option<Duration> {
        let inner = self.inner();
        let stats = inner.labels.get(label)?;
        compute_budget(stats.history.iter(), nominal, &self.policy)
    }

    /// Budget to actually use: adaptive when available, else nominal.
    #[must_use]
    pub fn effective_budget(&self, label: &str, nominal: Duration) -> Duration {
        self.adaptive_budget(label, nominal).unwrap_or(nominal)
    }

    #[must_use]
    pub fn history(&self, label: &str) -> Vec<TimingSample> {
        self.inner()
            .labels
            .get(label)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn label_summary(&self, label: &str) -> Option<LabelSummary> {
        let inner = self.inner();
        let stats = inner.labels.get(label)?;
        let samples = stats.history.len();
        let mut ok: Vec<u64> = stats
            .history
            .iter()
            .filter(|s| s.is_success())
            .map(|s| s.duration_ms)
            .collect();
        let success_rate = if samples == 0 {
            0.0
        } else {
            ok.len() as f64 / samples as f64
        };
        ok.sort_unstable();
        Some(LabelSummary {
            samples,
            success_rate,
            p90_ms: percentile_ms(&ok, 90.0),
        })
    }

    /// Record the outcome of a named action on a device.
    pub fn record_action(
        &self,
        device: &DeviceId,
        action: &str,
        success: bool,
        elapsed: Duration,
        error: Option<&str>,
    ) {
        let mut inner = self.inner();
        let stats = inner
            .devices
            .entry(device.to_string())
            .or_default()
            .actions
            .entry(action.to_string())
            .or_default();
        stats.attempts += 1;
        stats.total_time_ms += elapsed.as_millis() as u64;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
            let now = Utc::now();
            stats.last_failure = Some(now);
            if let Some(message) = error {
                stats.errors.push_back(ErrorEntry {
                    at: now,
                    message: message.to_string(),
                });
                while stats.errors.len() > MAX_ERRORS_PER_ACTION {
                    stats.errors.pop_front();
                }
            }
        }
    }

    /// Record a marker that was expected but not found, with its best score.
    pub fn record_template_miss(&self, device: &DeviceId, marker: &str, best_score: f64) {
        let mut inner = self.inner();
        let scores = inner
            .devices
            .entry(device.to_string())
            .or_default()
            .template_misses
            .entry(marker.to_string())
            .or_default();
        scores.push_back(best_score);
        while scores.len() > MAX_MISSES_PER_MARKER {
            scores.pop_front();
        }
    }

    pub fn record_nav_failure(&self, device: &DeviceId, from: &str, to: &str) {
        let mut inner = self.inner();
        *inner
            .devices
            .entry(device.to_string())
            .or_default()
            .nav_failures
            .entry(format!("{from}->{to}"))
            .or_default() += 1;
    }

    /// This session's data.
    #[must_use]
    pub fn snapshot(&self) -> SessionRecord {
        let inner = self.inner();
        let timings = inner
            .labels
            .iter()
            .filter(|(_, s)| !s.session.is_empty() || s.successes + s.timeouts > 0)
            .map(|(label, s)| {
                (
                    label.clone(),
                    LabelSession {
                        samples: s.session.iter().cloned().collect(),
                        successes: s.successes,
                        timeouts: s.timeouts,
                    },
                )
            })
            .collect();
        SessionRecord {
            started_at: self.started_at,
            saved_at: Utc::now(),
            timings,
            devices: inner.devices.clone(),
        }
    }

    #[must_use]
    pub fn summary(&self) -> String {
        self.snapshot().summary()
    }

    /// Write this session atomically, then prune old sessions.
    ///
    /// Returns the written path, or `None` for an in-memory tracker.
    pub fn save(&self) -> Result<Option<PathBuf>, StatsError> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let persist_err = |path: &Path, e: &dyn std::fmt::Display| StatsError::Persist {
            path: path.display().to_string(),
            details: e.to_string(),
        };

        fs::create_dir_all(dir).map_err(|e| persist_err(dir, &e))?;
        let lock_path = dir.join(LOCK_FILE);
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| persist_err(&lock_path, &e))?;
        lock.try_lock_exclusive()
            .map_err(|_| StatsError::Lock(dir.display().to_string()))?;

        let path = dir.join(&self.session_name);
        let result = (|| {
            let json = serde_json::to_string_pretty(&self.snapshot())
                .map_err(|e| persist_err(&path, &e))?;
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, json).map_err(|e| persist_err(&tmp, &e))?;
            fs::rename(&tmp, &path).map_err(|e| persist_err(&path, &e))?;
            self.prune(dir);
            Ok(Some(path.clone()))
        })();

        let _ = FileExt::unlock(&lock);
        if result.is_ok() {
            debug!(path = %path.display(), "Stats saved");
        }
        result
    }

    fn prune(&self, dir: &Path) {
        let files = match session_files(dir) {
            Ok(files) => files,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "Cannot list sessions for pruning");
                return;
            }
        };
        let excess = files.len().saturating_sub(self.max_sessions);
        for old in files.into_iter().take(excess) {
            match fs::remove_file(&old) {
                Ok(()) => debug!(path = %old.display(), "Pruned stats session"),
                Err(err) => warn!(path = %old.display(), error = %err, "Failed to prune session"),
            }
        }
    }

    /// Flush on a fixed interval until the returned handle is shut down.
    #[must_use]
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> FlusherHandle {
        let token = CancellationToken::new();
        let tracker = Arc::clone(self);
        let stop = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    () = stop.cancelled() => break,
                }
                let tracker = Arc::clone(&tracker);
                match tokio::task::spawn_blocking(move || tracker.save()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(error = %err, "Periodic stats flush failed"),
                    Err(err) => warn!(error = %err, "Stats flush task failed"),
                }
            }
        });
        FlusherHandle {
            tracker: Arc::clone(self),
            token,
            task,
        }
    }
}

/// Handle to the periodic flusher.
pub struct FlusherHandle {
    tracker: Arc<StatsTracker>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl FlusherHandle {
    /// Stop the flusher and write a final snapshot.
    pub async fn shutdown(self) -> Result<Option<PathBuf>, StatsError> {
        self.token.cancel();
        let _ = self.task.await;
        let tracker = self.tracker;
        match tokio::task::spawn_blocking(move || tracker.save()).await {
            Ok(result) => result,
            Err(err) => Err(StatsError::Persist {
                path: String::new(),
                details: err.to_string(),
            }),
        }
    }
}

fn push_bounded<T>(deque: &mut VecDeque<T>, item: T, cap: usize) {
    deque.push_back(item);
    while deque.len() > cap {
        deque.pop_front();
    }
}

/// `session_<date>_<time>_<millis>_<pid>-<seq>.json`. The timestamp leads so
/// names still sort chronologically.
fn session_file_name(started_at: DateTime<Utc>) -> String {
    let seq = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "{SESSION_PREFIX}{}_{}-{seq}{SESSION_SUFFIX}",
        started_at.format("%Y%m%d_%H%M%S_%3f"),
        std::process::id(),
    )
}
