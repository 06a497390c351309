//! Failure screenshots.
//!
//! When navigation meets an unknown screen, fails verification, or exhausts
//! recovery, the frame on the device is written to the debug directory so the
//! failure can be inspected later. The directory keeps at most `max_files`
//! captures; the oldest go first.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::device::DeviceId;
use crate::vision::{Screenshot, Vision};

const CAPTURE_SUFFIX: &str = ".png";

pub struct DebugCaptures {
    dir: PathBuf,
    max_files: usize,
    seq: AtomicU64,
}

impl DebugCaptures {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, max_files: usize) -> Self {
        Self {
            dir: dir.into(),
            max_files: max_files.max(1),
            seq: AtomicU64::new(0),
        }
    }

    /// Captures as configured, or `None` when `debug.screenshots` is off.
    #[must_use]
    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .debug
            .screenshots
            .then(|| Self::new(config.debug_dir(), config.debug.max_files))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Capture files, oldest first (names lead with the timestamp).
    pub fn captures(&self) -> io::Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(CAPTURE_SUFFIX))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Write `image` under `label`, then prune. Blocking.
    pub fn save(&self, image: &Screenshot, label: &str) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}-{seq:04}_{}_{}{CAPTURE_SUFFIX}",
            Utc::now().format("%Y%m%d_%H%M%S_%3f"),
            file_safe(image.device.as_str()),
            file_safe(label),
        );
        let path = self.dir.join(name);
        fs::write(&path, &image.data)?;
        self.prune();
        Ok(path)
    }

    fn prune(&self) {
        let files = match self.captures() {
            Ok(files) => files,
            Err(err) => {
                warn!(dir = %self.dir.display(), error = %err, "Cannot list debug captures");
                return;
            }
        };
        let excess = files.len().saturating_sub(self.max_files);
        for old in files.into_iter().take(excess) {
            if let Err(err) = fs::remove_file(&old) {
                warn!(path = %old.display(), error = %err, "Failed to prune debug capture");
            }
        }
    }

    /// Screenshot `device` and save it under `label`.
    ///
    /// Diagnostics must never fail navigation: errors are logged and yield
    /// `None`.
    pub async fn capture(
        self: &Arc<Self>,
        vision: &Vision,
        device: &DeviceId,
        label: &str,
    ) -> Option<PathBuf> {
        let image = match vision.screenshot(device).await {
            Ok(image) => image,
            Err(err) => {
                warn!(device = %device, label, error = %err, "Debug capture skipped");
                return None;
            }
        };
        let captures = Arc::clone(self);
        let label = label.to_string();
        match tokio::task::spawn_blocking(move || captures.save(&image, &label)).await {
            Ok(Ok(path)) => {
                debug!(device = %device, path = %path.display(), "Saved debug capture");
                Some(path)
            }
            Ok(Err(err)) => {
                warn!(device = %device, error = %err, "Failed to save debug capture");
                None
            }
            Err(err) => {
                warn!(device = %device, error = %err, "Debug capture task failed");
                None
            }
        }
    }
}

/// `emulator-5554` stays as is, `127.0.0.1:5555` becomes `127.0.0.1_5555`.
fn file_safe(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
