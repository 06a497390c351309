//! Device handles and the process-wide per-device registry.
//!
//! Every component that needs per-device state (locks, status strings,
//! partial-match diagnostics) receives an `Arc<DeviceRegistry>` at
//! construction. Entries are created on first reference and live until
//! [`DeviceRegistry::forget`] is called; nothing re-initializes an entry
//! implicitly.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::device_lock::DeviceLock;
use crate::screen::ScreenIdentity;
use crate::tasks::TaskId;

/// Opaque identifier for one controllable device (an adb serial).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Arc<str>);

impl DeviceId {
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// A status string and the task that published it, if any.
#[derive(Debug, Clone)]
struct Status {
    text: String,
    owner: Option<TaskId>,
}

/// Mutable state kept for one device.
#[derive(Debug, Default)]
pub struct DeviceState {
    lock: DeviceLock,
    status: Mutex<Option<Status>>,
    partial_match: Mutex<Option<ScreenIdentity>>,
}

impl DeviceState {
    #[must_use]
    pub fn lock(&self) -> &DeviceLock {
        &self.lock
    }
}

/// Registry of per-device state keyed by [`DeviceId`].
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, Arc<DeviceState>>>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State for `device`, created on first use.
    pub fn get(&self, device: &DeviceId) -> Arc<DeviceState> {
        if let Some(state) = self
            .devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device)
        {
            return Arc::clone(state);
        }
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(devices.entry(device.clone()).or_default())
    }

    /// The device's lock (shared handle).
    pub fn lock_for(&self, device: &DeviceId) -> DeviceLock {
        self.get(device).lock.clone()
    }

    fn put_status(&self, device: &DeviceId, status: Option<Status>) {
        let state = self.get(device);
        *state.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    pub fn set_status(&self, device: &DeviceId, status: impl Into<String>) {
        self.put_status(
            device,
            Some(Status {
                text: status.into(),
                owner: None,
            }),
        );
    }

    /// Publish a status on behalf of task `owner`.
    pub fn set_task_status(&self, device: &DeviceId, owner: TaskId, status: impl Into<String>) {
        self.put_status(
            device,
            Some(Status {
                text: status.into(),
                owner: Some(owner),
            }),
        );
    }

    pub fn clear_status(&self, device: &DeviceId) {
        self.put_status(device, None);
    }

    /// Clear the status only if `owner` published it last. A task that exits
    /// after a newer task took over the device leaves the newer status alone.
    pub fn clear_task_status(&self, device: &DeviceId, owner: TaskId) -> bool {
        let state = self.get(device);
        let mut status = state.status.lock().unwrap_or_else(|e| e.into_inner());
        if status.as_ref().is_some_and(|s| s.owner == Some(owner)) {
            *status = None;
            true
        } else {
            false
        }
    }

    /// Last human-readable status for `device`.
    #[must_use]
    pub fn status(&self, device: &DeviceId) -> Option<String> {
        let state = self.get(device);
        let status = state.status.lock().unwrap_or_else(|e| e.into_inner());
        status.as_ref().map(|s| s.text.clone())
    }

    /// All devices with a status set, sorted by device id.
    #[must_use]
    pub fn statuses(&self) -> Vec<(DeviceId, String)> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = devices
            .iter()
            .filter_map(|(id, state)| {
                let status = state.status.lock().unwrap_or_else(|e| e.into_inner());
                status.as_ref().map(|s| (id.clone(), s.text.clone()))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Remember the best under-threshold match seen while recovering.
    pub fn record_partial_match(&self, device: &DeviceId, identity: Option<ScreenIdentity>) {
        let state = self.get(device);
        *state
            .partial_match
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = identity;
    }

    #[must_use]
    pub fn partial_match(&self, device: &DeviceId) -> Option<ScreenIdentity> {
        let state = self.get(device);
        let partial = state
            .partial_match
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *partial
    }

    /// Force-release `device`'s lock. Returns the evicted holder, if any.
    pub fn force_release(&self, device: &DeviceId) -> Option<TaskId> {
        self.get(device).lock.force_release()
    }

    #[must_use]
    pub fn known_devices(&self) -> Vec<DeviceId> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<_> = devices.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop a disconnected device's state. Returns false if the device is
    /// unknown or its lock is still held.
    pub fn forget(&self, device: &DeviceId) -> bool {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        match devices.get(device) {
            Some(state) if !state.lock.is_held() => {
                devices.remove(device);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::Screen;

    #[test]
    fn state_is_created_once_and_shared() {
        let registry = DeviceRegistry::new();
        let id = DeviceId::new("emulator-5554");
        let a = registry.get(&id);
        let b = registry.get(&id);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.known_devices(), vec![id]);
    }

    #[test]
    fn status_set_and_clear() {
        let registry = DeviceRegistry::new();
        let id = DeviceId::from("emulator-5556");
        assert_eq!(registry.status(&id), None);
        registry.set_status(&id, "Rallying...");
        assert_eq!(registry.status(&id).as_deref(), Some("Rallying..."));
        assert_eq!(registry.statuses(), vec![(id.clone(), "Rallying...".to_string())]);
        registry.clear_status(&id);
        assert_eq!(registry.status(&id), None);
    }

    #[test]
    fn task_status_is_cleared_only_by_its_owner() {
        let registry = DeviceRegistry::new();
        let id = DeviceId::new("d");
        registry.set_task_status(&id, TaskId(1), "Rally...");
        registry.set_task_status(&id, TaskId(2), "Farm...");
        // The older task exits late and must not erase the newer status.
        assert!(!registry.clear_task_status(&id, TaskId(1)));
        assert_eq!(registry.status(&id).as_deref(), Some("Farm..."));
        assert!(registry.clear_task_status(&id, TaskId(2)));
        assert_eq!(registry.status(&id), None);

        registry.set_status(&id, "manual");
        assert!(!registry.clear_task_status(&id, TaskId(2)));
        assert_eq!(registry.status(&id).as_deref(), Some("manual"));
    }

    #[test]
    fn partial_match_round_trip() {
        let registry = DeviceRegistry::new();
        let id = DeviceId::new("d");
        let identity = ScreenIdentity::new(Screen::Map, 0.71);
        registry.record_partial_match(&id, Some(identity));
        assert_eq!(registry.partial_match(&id), Some(identity));
    }

    #[test]
    fn force_release_reports_the_evicted_holder() {
        let registry = DeviceRegistry::new();
        let a = DeviceId::new("a");
        let b = DeviceId::new("b");
        let guard = registry.lock_for(&a).try_acquire(TaskId(1)).unwrap();

        assert_eq!(registry.force_release(&a), Some(TaskId(1)));
        assert_eq!(registry.force_release(&b), None);
        assert!(!registry.lock_for(&a).is_held());
        drop(guard);
        assert!(!registry.lock_for(&a).is_held());
    }

    #[test]
    fn forget_refuses_held_device() {
        let registry = DeviceRegistry::new();
        let id = DeviceId::new("held");
        let guard = registry.lock_for(&id).try_acquire(TaskId(9)).unwrap();
        assert!(!registry.forget(&id));
        drop(guard);
        assert!(registry.forget(&id));
        assert!(registry.known_devices().is_empty());
    }
}
