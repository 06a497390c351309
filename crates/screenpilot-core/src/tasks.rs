//! Task launch, cooperative stop, and forced stop.
//!
//! Each launched task runs on its own tokio task under a supervisor. The
//! supervisor acquires the device lock, runs the work with a [`TaskContext`],
//! releases the lock however the work ends (return, error, panic, abort) and
//! moves the record to `Stopped`. Failures and panics are reported on the
//! error channel.
//!
//! [`TaskManager::repeat`] tasks instead take the lock per run, so other
//! tasks on the device can interleave while they sleep between runs.
//! [`TaskManager::once`] and `repeat` time each run and record it as an
//! action in the [`StatsTracker`].
//!
//! Record states only move forward:
//!
//! ```text
//! Running ──stop──► Stopping ──exit──► Stopped
//!    └────────────exit / force──────────► Stopped
//! ```

use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::cancel::{CancelExt, CancellationToken};
use crate::config::TasksConfig;
use crate::device::{DeviceId, DeviceRegistry};
use crate::device_lock::DeviceLockGuard;
use crate::device_span;
use crate::error::TaskError;
use crate::navigator::HaltListener;
use crate::stats::StatsTracker;
use crate::timer::sleep_jittered;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a task does. Two kinds conflict on one device when they share a
/// name or are both exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskKind {
    pub name: String,
    #[serde(default)]
    pub exclusive: bool,
}

impl TaskKind {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exclusive: false,
        }
    }

    #[must_use]
    pub fn exclusive(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exclusive: true,
        }
    }

    #[must_use]
    pub fn conflicts_with(&self, other: &Self) -> bool {
        self.name == other.name || (self.exclusive && other.exclusive)
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    Stopping,
    Stopped,
}

impl TaskState {
    #[must_use]
    pub fn is_live(self) -> bool {
        self != Self::Stopped
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => f.write_str("RUNNING"),
            Self::Stopping => f.write_str("STOPPING"),
            Self::Stopped => f.write_str("STOPPED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    /// Stopped cooperatively (including before it got the lock).
    Cancelled,
    /// Aborted by `force_stop_all` before it reached its next await.
    Killed,
    Panicked(String),
}

impl TaskOutcome {
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Panicked(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub device: DeviceId,
    pub kind: TaskKind,
    pub state: TaskState,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub outcome: Option<TaskOutcome>,
}

/// A failed or panicked task, as delivered on the error channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub id: TaskId,
    pub device: DeviceId,
    pub kind: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The token was signaled by this call.
    Signaled,
    AlreadyStopping,
    AlreadyStopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForceStopReport {
    /// Tasks whose token was signaled.
    pub signaled: Vec<TaskId>,
    /// Tasks still running after the grace period, aborted, and since ended.
    pub killed: Vec<TaskId>,
    /// Tasks that had not ended when the abort wait ran out, typically stuck
    /// inside blocking code. They stay `Stopping` and keep their device locked
    /// until they return.
    pub unresponsive: Vec<TaskId>,
    /// Devices whose lock was still held with no task left on them, and was
    /// force-released.
    pub released: Vec<DeviceId>,
}

/// Whether the supervisor holds the device lock for the task's whole life or
/// the work takes it per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockScope {
    Task,
    PerRun,
}

// =============================================================================
// Task context
// =============================================================================

/// Handle given to a task's work.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    device: DeviceId,
    kind: TaskKind,
    token: CancellationToken,
    registry: Arc<DeviceRegistry>,
}

impl TaskContext {
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[must_use]
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    #[must_use]
    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// Safe-point check; long-running work must poll this.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token to thread into navigation and waits.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Publish a human-readable status for this device.
    pub fn set_status(&self, status: impl Into<String>) {
        self.registry.set_task_status(&self.device, self.id, status);
    }

    /// Sleep unless stopped first. Returns `false` if stopped.
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.token.sleep(duration).await
    }

    /// Sleep `base` plus or minus up to `variation`. Returns `false` if stopped.
    pub async fn sleep_jittered(&self, base: Duration, variation: Duration) -> bool {
        sleep_jittered(base, variation, &self.token).await
    }

    /// Take the device lock for one run, or `None` if stopped while waiting.
    async fn lock_device(&self) -> Option<DeviceLockGuard> {
        let lock = self.registry.lock_for(&self.device);
        tokio::select! {
            biased;
            () = self.token.cancelled() => None,
            guard = lock.acquire(self.id) => Some(guard),
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

struct Entry {
    record: TaskRecord,
    token: CancellationToken,
    abort: Option<AbortHandle>,
    done: watch::Receiver<bool>,
}

struct Shared {
    registry: Arc<DeviceRegistry>,
    entries: Mutex<HashMap<TaskId, Entry>>,
    errors: mpsc::UnboundedSender<TaskFailure>,
}

impl Shared {
    fn entries(&self) -> MutexGuard<'_, HashMap<TaskId, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store the work's abort handle. Returns false if the task was already
    /// force-stopped, in which case the work is aborted at once.
    fn attach(&self, id: TaskId, abort: AbortHandle) -> bool {
        let mut entries = self.entries();
        match entries.get_mut(&id) {
            Some(entry) if entry.record.state.is_live() => {
                entry.abort = Some(abort);
                true
            }
            _ => {
                abort.abort();
                false
            }
        }
    }

    fn finish(&self, id: TaskId, outcome: TaskOutcome) {
        let failure = {
            let mut entries = self.entries();
            let Some(entry) = entries.get_mut(&id) else {
                return;
            };
            entry.abort = None;
            if entry.record.state == TaskState::Stopped {
                return;
            }
            entry.record.state = TaskState::Stopped;
            entry.record.stopped_at = Some(Utc::now());
            entry.record.outcome = Some(outcome.clone());
            match &outcome {
                TaskOutcome::Failed(err) | TaskOutcome::Panicked(err) => Some(TaskFailure {
                    id,
                    device: entry.record.device.clone(),
                    kind: entry.record.kind.name.clone(),
                    error: err.clone(),
                }),
                _ => None,
            }
        };
        if let Some(failure) = failure {
            error!(task_id = %id, device = %failure.device, error = %failure.error, "Task failed");
            let _ = self.errors.send(failure);
        }
    }
}

pub struct TaskManager {
    shared: Arc<Shared>,
    config: TasksConfig,
    /// Parent of every task token; cancelled only by `shutdown`.
    root: CancellationToken,
    stats: Option<Arc<StatsTracker>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskFailure>>>,
}

impl TaskManager {
    #[must_use]
    pub fn new(registry: Arc<DeviceRegistry>, config: TasksConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                registry,
                entries: Mutex::new(HashMap::new()),
                errors: tx,
            }),
            config,
            root: CancellationToken::new(),
            stats: None,
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            errors_rx: Mutex::new(Some(rx)),
        }
    }

    /// Record `once`/`repeat` runs as actions in `stats`.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<StatsTracker>) -> Self {
        self.stats = Some(stats);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.shared.registry
    }

    /// Take the error channel. Only the first call gets it.
    pub fn errors(&self) -> Option<mpsc::UnboundedReceiver<TaskFailure>> {
        self.errors_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Start `work` on `device`.
    ///
    /// Rejected when a conflicting task is live on the device. Otherwise the
    /// task waits for the device lock, then runs. Must be called from within
    /// a tokio runtime.
    pub fn launch<F, Fut, E>(
        &self,
        device: &DeviceId,
        kind: TaskKind,
        work: F,
    ) -> Result<TaskRecord, TaskError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        self.spawn_task(device, kind, LockScope::Task, work)
    }

    /// Run `action` once under the device lock, publishing `"<kind>..."` as
    /// the device status and recording the run as an action.
    pub fn once<F, Fut, E>(
        &self,
        device: &DeviceId,
        kind: TaskKind,
        action: F,
    ) -> Result<TaskRecord, TaskError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let stats = self.stats.clone();
        self.spawn_task(device, kind, LockScope::Task, move |ctx| async move {
            ctx.set_status(format!("{}...", ctx.kind()));
            timed_action(stats.as_deref(), &ctx, action(ctx.clone())).await
        })
    }

    /// Run `action` every `every` (plus or minus up to `variation`) until
    /// stopped.
    ///
    /// Each run takes the device lock, publishes `"<kind>..."`, and is
    /// recorded as an action; the status turns `"Idle"` and the lock is
    /// released before the sleep. A failed run is logged and the loop goes on.
    pub fn repeat<F, Fut, E>(
        &self,
        device: &DeviceId,
        kind: TaskKind,
        every: Duration,
        variation: Duration,
        mut action: F,
    ) -> Result<TaskRecord, TaskError>
    where
        F: FnMut(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let stats = self.stats.clone();
        self.spawn_task(device, kind, LockScope::PerRun, move |ctx| async move {
            let mut runs = 0u64;
            while !ctx.should_stop() {
                let Some(guard) = ctx.lock_device().await else {
                    break;
                };
                ctx.set_status(format!("{}...", ctx.kind()));
                let _ = timed_action(stats.as_deref(), &ctx, action(ctx.clone())).await;
                runs += 1;
                ctx.set_status("Idle");
                drop(guard);
                if !ctx.sleep_jittered(every, variation).await {
                    break;
                }
            }
            debug!(runs, "Repeat loop ended");
            Ok::<(), Infallible>(())
        })
    }

    fn spawn_task<F, Fut, E>(
        &self,
        device: &DeviceId,
        kind: TaskKind,
        scope: LockScope,
        work: F,
    ) -> Result<TaskRecord, TaskError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(TaskError::ShuttingDown);
        }

        let mut entries = self.shared.entries();
        if let Some(existing) = entries.values().find(|e| {
            e.record.device == *device
                && e.record.state.is_live()
                && e.record.kind.conflicts_with(&kind)
        }) {
            warn!(device = %device, kind = %kind, existing = %existing.record.id, "Launch rejected");
            return Err(TaskError::Conflict {
                device: device.to_string(),
                kind: kind.name.clone(),
                existing: existing.record.kind.name.clone(),
            });
        }

        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let token = self.root.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        let record = TaskRecord {
            id,
            device: device.clone(),
            kind: kind.clone(),
            state: TaskState::Running,
            started_at: Utc::now(),
            stopped_at: None,
            outcome: None,
        };
        entries.insert(
            id,
            Entry {
                record: record.clone(),
                token: token.clone(),
                abort: None,
                done: done_rx,
            },
        );
        drop(entries);

        let ctx = TaskContext {
            id,
            device: device.clone(),
            kind: kind.clone(),
            token,
            registry: Arc::clone(&self.shared.registry),
        };
        let span = device_span!("task", device = device, task_id = %id, task_kind = %kind);
        tokio::spawn(supervise(Arc::clone(&self.shared), ctx, scope, work, done_tx).instrument(span));
        info!(device = %device, task_id = %id, kind = %kind, "Task launched");
        Ok(record)
    }

    /// Ask a task to stop. Idempotent; never waits for the task to exit.
    pub fn stop(&self, id: TaskId) -> Result<StopOutcome, TaskError> {
        let mut entries = self.shared.entries();
        let entry = entries.get_mut(&id).ok_or(TaskError::NotFound(id.0))?;
        match entry.record.state {
            TaskState::Stopped => Ok(StopOutcome::AlreadyStopped),
            TaskState::Stopping => Ok(StopOutcome::AlreadyStopping),
            TaskState::Running => {
                entry.token.cancel();
                entry.record.state = TaskState::Stopping;
                self.shared.registry.set_task_status(
                    &entry.record.device,
                    id,
                    format!("Stopping {}...", entry.record.kind),
                );
                debug!(task_id = %id, "Stop signaled");
                Ok(StopOutcome::Signaled)
            }
        }
    }

    /// Signal every live task on `device`. Returns the tasks this call
    /// signaled; tasks already stopping are skipped.
    pub fn stop_device(&self, device: &DeviceId) -> Vec<TaskId> {
        self.live_where(|r| r.device == *device)
            .into_iter()
            .filter(|id| matches!(self.stop(*id), Ok(StopOutcome::Signaled)))
            .collect()
    }

    /// Signal every live task whose kind name ends with `suffix`, on any
    /// device. Returns the tasks this call signaled.
    pub fn stop_matching(&self, suffix: &str) -> Vec<TaskId> {
        let ids = self.live_where(|r| r.kind.name.ends_with(suffix));
        ids.into_iter()
            .filter(|id| matches!(self.stop(*id), Ok(StopOutcome::Signaled)))
            .collect()
    }

    fn live_where(&self, pred: impl Fn(&TaskRecord) -> bool) -> Vec<TaskId> {
        let entries = self.shared.entries();
        let mut ids: Vec<TaskId> = entries
            .values()
            .filter(|e| e.record.state.is_live() && pred(&e.record))
            .map(|e| e.record.id)
            .collect();
        ids.sort();
        ids
    }

    /// Emergency stop: signal everything, abort whatever is still running
    /// after the grace period, and wait (bounded by `abort_wait_ms`) for the
    /// aborted tasks to actually end.
    ///
    /// An abort only lands at the task's next await. A task stuck in blocking
    /// code keeps running, so it is reported as unresponsive and its device
    /// lock is left alone: releasing it would let a new task drive the device
    /// alongside the old one. Locks still held on devices with no task left
    /// are force-released.
    pub async fn force_stop_all(&self) -> ForceStopReport {
        let signaled = {
            let mut entries = self.shared.entries();
            let mut ids = Vec::new();
            for entry in entries.values_mut().filter(|e| e.record.state.is_live()) {
                entry.token.cancel();
                if entry.record.state == TaskState::Running {
                    entry.record.state = TaskState::Stopping;
                }
                ids.push(entry.record.id);
            }
            ids.sort();
            ids
        };

        if !signaled.is_empty() {
            tokio::time::sleep(Duration::from_millis(self.config.force_grace_ms)).await;
        }

        let mut pending: Vec<(TaskId, DeviceId, bool, watch::Receiver<bool>)> = {
            let entries = self.shared.entries();
            entries
                .values()
                .filter(|e| e.record.state.is_live())
                .map(|e| {
                    let aborted = match &e.abort {
                        Some(abort) => {
                            abort.abort();
                            true
                        }
                        None => false,
                    };
                    (e.record.id, e.record.device.clone(), aborted, e.done.clone())
                })
                .collect()
        };
        pending.sort_by_key(|(id, ..)| *id);

        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.abort_wait_ms);
        let _ = tokio::time::timeout_at(deadline, async {
            for (_, _, _, done) in &mut pending {
                let _ = done.wait_for(|finished| *finished).await;
            }
        })
        .await;

        let mut killed = Vec::new();
        let mut unresponsive = Vec::new();
        let mut stuck_devices = BTreeSet::new();
        for (id, device, aborted, done) in &pending {
            if *done.borrow() {
                if *aborted {
                    killed.push(*id);
                }
            } else {
                warn!(
                    task_id = %id,
                    device = %device,
                    wait_ms = self.config.abort_wait_ms,
                    "Task did not end after abort; leaving its device locked"
                );
                unresponsive.push(*id);
                stuck_devices.insert(device.clone());
            }
        }

        let mut released = Vec::new();
        for device in self.shared.registry.known_devices() {
            if stuck_devices.contains(&device) {
                continue;
            }
            if let Some(holder) = self.shared.registry.force_release(&device) {
                debug!(device = %device, holder = %holder, "Released orphaned device lock");
                released.push(device.clone());
            }
            self.shared.registry.clear_status(&device);
        }

        warn!(
            signaled = signaled.len(),
            killed = killed.len(),
            unresponsive = unresponsive.len(),
            released = released.len(),
            "Force stop complete"
        );
        ForceStopReport {
            signaled,
            killed,
            unresponsive,
            released,
        }
    }

    /// Wait for a task to reach `Stopped` and return its final record.
    pub async fn join(&self, id: TaskId) -> Result<TaskRecord, TaskError> {
        let mut done = {
            let entries = self.shared.entries();
            entries
                .get(&id)
                .ok_or(TaskError::NotFound(id.0))?
                .done
                .clone()
        };
        let _ = done.wait_for(|finished| *finished).await;
        self.get(id).ok_or(TaskError::NotFound(id.0))
    }

    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.shared.entries().get(&id).map(|e| e.record.clone())
    }

    /// All records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        let entries = self.shared.entries();
        let mut records: Vec<TaskRecord> = entries.values().map(|e| e.record.clone()).collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Records not yet stopped.
    #[must_use]
    pub fn live(&self) -> Vec<TaskRecord> {
        self.snapshot()
            .into_iter()
            .filter(|r| r.state.is_live())
            .collect()
    }

    /// Drop stopped records. Returns how many were removed.
    pub fn forget_stopped(&self) -> usize {
        let mut entries = self.shared.entries();
        let before = entries.len();
        entries.retain(|_, e| e.record.state.is_live());
        before - entries.len()
    }

    /// Refuse new launches, stop everything cooperatively, and fall back to
    /// `force_stop_all` if tasks outlive the shutdown timeout.
    pub async fn shutdown(&self) -> Option<ForceStopReport> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let ids = self.live_where(|_| true);
        for id in &ids {
            let _ = self.stop(*id);
        }
        self.root.cancel();
        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
        let all = async {
            for id in &ids {
                let _ = self.join(*id).await;
            }
        };
        if tokio::time::timeout(timeout, all).await.is_ok() {
            info!(tasks = ids.len(), "Task manager shut down");
            None
        } else {
            warn!("Tasks outlived shutdown timeout; forcing");
            Some(self.force_stop_all().await)
        }
    }
}

async fn supervise<F, Fut, E>(
    shared: Arc<Shared>,
    ctx: TaskContext,
    scope: LockScope,
    work: F,
    done: watch::Sender<bool>,
) where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let id = ctx.id;
    let device = ctx.device.clone();
    let token = ctx.token.clone();

    let admitted = match scope {
        LockScope::Task => {
            let lock = shared.registry.lock_for(&device);
            tokio::select! {
                biased;
                () = token.cancelled() => None,
                guard = lock.acquire(id) => Some(Some(guard)),
            }
        }
        LockScope::PerRun => Some(None),
    };

    let outcome = match admitted {
        Some(guard) if !token.is_cancelled() => {
            if guard.is_some() {
                debug!("Device lock acquired");
            }
            let inner = tokio::spawn(work(ctx).in_current_span());
            let outcome = if shared.attach(id, inner.abort_handle()) {
                match inner.await {
                    Ok(Ok(())) if token.is_cancelled() => TaskOutcome::Cancelled,
                    Ok(Ok(())) => TaskOutcome::Completed,
                    Ok(Err(err)) if token.is_cancelled() => {
                        debug!(error = %err, "Task returned an error after stop was requested");
                        TaskOutcome::Cancelled
                    }
                    Ok(Err(err)) => TaskOutcome::Failed(err.to_string()),
                    Err(err) if err.is_panic() => {
                        TaskOutcome::Panicked(panic_message(err.into_panic()))
                    }
                    Err(_) => TaskOutcome::Killed,
                }
            } else {
                TaskOutcome::Killed
            };
            // Clear before the lock can pass to the next task.
            shared.registry.clear_task_status(&device, id);
            drop(guard);
            outcome
        }
        _ => {
            shared.registry.clear_task_status(&device, id);
            TaskOutcome::Cancelled
        }
    };

    debug!(outcome = ?outcome, "Task exited");
    shared.finish(id, outcome);
    let _ = done.send(true);
}

/// Time one run of a task's action and record it in `stats`.
///
/// A run that fails because its task was stopped is not counted.
async fn timed_action<Fut, E>(
    stats: Option<&StatsTracker>,
    ctx: &TaskContext,
    action: Fut,
) -> Result<(), E>
where
    Fut: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    let name = &ctx.kind().name;
    debug!(action = %name, "Action starting");
    let start = tokio::time::Instant::now();
    let result = action.await;
    let elapsed = start.elapsed();
    let elapsed_ms = elapsed.as_millis() as u64;
    match &result {
        Ok(()) => {
            info!(action = %name, elapsed_ms, "Action completed");
            if let Some(stats) = stats {
                stats.record_action(ctx.device(), name, true, elapsed, None);
            }
        }
        Err(err) if ctx.should_stop() => {
            debug!(action = %name, error = %err, "Action ended by stop");
        }
        Err(err) => {
            warn!(action = %name, elapsed_ms, error = %err, "Action failed");
            if let Some(stats) = stats {
                stats.record_action(ctx.device(), name, false, elapsed, Some(&err.to_string()));
            }
        }
    }
    result
}

impl HaltListener for TaskManager {
    /// A halting overlay (e.g. logged out) means no task on the device can
    /// make progress; stop them all.
    fn halted(&self, device: &DeviceId, overlay: &str) {
        let stopped = self.stop_device(device);
        warn!(device = %device, overlay, stopped = stopped.len(), "Halting overlay; stopping device tasks");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
