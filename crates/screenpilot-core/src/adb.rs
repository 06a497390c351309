//! adb transport and device discovery.
//!
//! Every adb invocation runs as a subprocess with a hard timeout; on expiry
//! the child is killed and the call fails with [`TransportError::Timeout`],
//! which the [`Vision`](crate::vision::Vision) boundary treats as retryable.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

use crate::config::AdbConfig;
use crate::device::DeviceId;
use crate::error::TransportError;
use crate::vision::{KeyCode, Point};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Ports emulators commonly expose adb on.
///
/// BlueStacks uses 5555 + 10n, MuMu 5 uses 5555 + 2n, MuMu 12 uses
/// 16384 + 32n, for up to eight instances each.
#[must_use]
pub fn known_emulator_ports() -> Vec<u16> {
    let mut ports: Vec<u16> = (0..8)
        .flat_map(|i| [5555 + i * 10, 5555 + i * 2, 16384 + i * 32])
        .collect();
    ports.sort_unstable();
    ports.dedup();
    ports
}

/// Parse `adb devices` output into ready devices.
///
/// Only entries in the `device` state are kept. When both `emulator-N` and
/// `<host>:<N+1>` are listed they are the same instance; the emulator form
/// wins.
#[must_use]
pub fn parse_devices(output: &str) -> Vec<DeviceId> {
    let ready: Vec<&str> = output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            (parts.next() == Some("device")).then_some(serial)
        })
        .collect();

    let emulator_data_ports: Vec<u32> = ready
        .iter()
        .filter_map(|serial| serial.strip_prefix("emulator-"))
        .filter_map(|port| port.parse::<u32>().ok())
        .map(|console| console + 1)
        .collect();

    ready
        .into_iter()
        .filter(|serial| {
            if serial.starts_with("emulator-") {
                return true;
            }
            let port = serial
                .rsplit_once(':')
                .and_then(|(_, port)| port.parse::<u32>().ok());
            !matches!(port, Some(p) if emulator_data_ports.contains(&p))
        })
        .map(DeviceId::new)
        .collect()
}

/// Locate the adb binary: explicit config, then `PATH`, then SDK defaults.
#[must_use]
pub fn find_adb(configured: Option<&Path>) -> PathBuf {
    if let Some(path) = configured {
        if path.is_file() {
            return path.to_path_buf();
        }
        warn!(path = %path.display(), "Configured adb path does not exist; searching");
    }

    let exe = if cfg!(windows) { "adb.exe" } else { "adb" };
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(exe);
            if candidate.is_file() {
                return candidate;
            }
        }
    }

    let mut candidates = Vec::new();
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join("Library/Android/sdk/platform-tools").join(exe));
        candidates.push(home.join("Android/Sdk/platform-tools").join(exe));
    }
    if let Some(local) = dirs::data_local_dir() {
        candidates.push(local.join("Android/Sdk/platform-tools").join(exe));
    }
    candidates.push(PathBuf::from("/usr/local/bin/adb"));
    candidates.push(PathBuf::from("/opt/homebrew/bin/adb"));

    candidates
        .into_iter()
        .find(|c| c.is_file())
        .unwrap_or_else(|| PathBuf::from(exe))
}

/// Captured output of one adb call.
#[derive(Debug)]
pub struct AdbOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub success: bool,
}

/// adb-backed [`DeviceTransport`](crate::vision::DeviceTransport).
#[derive(Debug, Clone)]
pub struct AdbTransport {
    adb: PathBuf,
    timeout: Duration,
    auto_connect: bool,
}

impl AdbTransport {
    #[must_use]
    pub fn new(adb: PathBuf, timeout: Duration) -> Self {
        Self {
            adb,
            timeout,
            auto_connect: false,
        }
    }

    #[must_use]
    pub fn from_config(config: &AdbConfig) -> Self {
        Self {
            adb: find_adb(config.path.as_deref()),
            timeout: Duration::from_millis(config.timeout_ms),
            auto_connect: config.auto_connect,
        }
    }

    #[must_use]
    pub fn adb_path(&self) -> &Path {
        &self.adb
    }

    /// Run adb with `args`, killing it after the configured timeout.
    pub fn run(&self, args: &[&str]) -> Result<AdbOutput, TransportError> {
        let op_args = if args.first() == Some(&"-s") {
            args.get(2..).unwrap_or_default()
        } else {
            args
        };
        let op = op_args.iter().take(3).copied().collect::<Vec<_>>().join(" ");
        trace!(adb = %self.adb.display(), ?args, "adb call");

        let mut child = Command::new(&self.adb)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => TransportError::AdbNotFound,
                _ => TransportError::CommandFailed(format!("spawn adb: {e}")),
            })?;

        // Drain pipes on threads so a large screencap cannot fill the pipe
        // and stall the child before wait_timeout returns.
        let stdout_reader = child.stdout.take().map(|mut out| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = out.read_to_end(&mut buf);
                buf
            })
        });
        let stderr_reader = child.stderr.take().map(|mut err| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf);
                buf
            })
        });

        let status = child
            .wait_timeout(self.timeout)
            .map_err(|e| TransportError::CommandFailed(format!("wait adb: {e}")))?;
        let Some(status) = status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(TransportError::Timeout {
                op,
                timeout_ms: self.timeout.as_millis() as u64,
            });
        };

        let stdout = stdout_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        Ok(AdbOutput {
            stdout,
            stderr,
            success: status.success(),
        })
    }

    fn run_checked(&self, args: &[&str]) -> Result<AdbOutput, TransportError> {
        let output = self.run(args)?;
        if output.success {
            return Ok(output);
        }
        let stderr = output.stderr.trim();
        if stderr.contains("not found") || stderr.contains("offline") {
            let device = args.get(1).copied().unwrap_or_default();
            return Err(TransportError::DeviceOffline(device.to_string()));
        }
        Err(TransportError::CommandFailed(stderr.to_string()))
    }

    fn shell(&self, device: &DeviceId, command: &[&str]) -> Result<(), TransportError> {
        let mut args = vec!["-s", device.as_str(), "shell"];
        args.extend_from_slice(command);
        self.run_checked(&args).map(|_| ())
    }

    /// Best-effort `adb connect` on every known emulator port.
    pub fn connect_known_ports(&self) {
        for port in known_emulator_ports() {
            let addr = format!("127.0.0.1:{port}");
            if let Err(err) = self.run(&["connect", &addr]) {
                debug!(addr, error = %err, "adb connect failed");
            }
        }
    }

    /// Ready devices, deduplicated.
    pub fn list_devices(&self) -> Result<Vec<DeviceId>, TransportError> {
        if self.auto_connect {
            self.connect_known_ports();
        }
        let output = self.run_checked(&["devices"])?;
        Ok(parse_devices(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Raw PNG screenshot.
    pub fn capture_png(&self, device: &DeviceId) -> Result<Vec<u8>, TransportError> {
        let output = self.run_checked(&["-s", device.as_str(), "exec-out", "screencap", "-p"])?;
        if !output.stdout.starts_with(&PNG_SIGNATURE) {
            return Err(TransportError::Decode(format!(
                "screencap returned {} bytes without a PNG header",
                output.stdout.len()
            )));
        }
        Ok(output.stdout)
    }
}

impl crate::vision::DeviceTransport for AdbTransport {
    fn tap(&self, device: &DeviceId, point: Point) -> Result<(), TransportError> {
        self.shell(
            device,
            &["input", "tap", &point.x.to_string(), &point.y.to_string()],
        )
    }

    fn swipe(
        &self,
        device: &DeviceId,
        from: Point,
        to: Point,
        duration: Duration,
    ) -> Result<(), TransportError> {
        self.shell(
            device,
            &[
                "input",
                "swipe",
                &from.x.to_string(),
                &from.y.to_string(),
                &to.x.to_string(),
                &to.y.to_string(),
                &duration.as_millis().to_string(),
            ],
        )
    }

    fn key_event(&self, device: &DeviceId, code: KeyCode) -> Result<(), TransportError> {
        self.shell(device, &["input", "keyevent", &code.0.to_string()])
    }

    fn reconnect(&self, device: &DeviceId) -> Result<(), TransportError> {
        if device.as_str().contains(':') {
            let _ = self.run(&["disconnect", device.as_str()]);
            let output = self.run_checked(&["connect", device.as_str()])?;
            let text = String::from_utf8_lossy(&output.stdout);
            if text.contains("connected") {
                return Ok(());
            }
            return Err(TransportError::DeviceOffline(device.to_string()));
        }
        self.run_checked(&["-s", device.as_str(), "reconnect"])
            .map(|_| ())
    }
}
