//! Capability provider boundary.
//!
//! The control loop sees a device through two traits: a
//! [`CapabilityProvider`] that captures screenshots and locates markers or
//! reads text in them, and a [`DeviceTransport`] that injects input. Both are
//! synchronous and fallible. [`DeviceIo`] combines them and owns the only
//! retry policy in the system: a transport timeout triggers one reconnect
//! followed by one retry. Nothing above this layer retries device calls on
//! its own. [`Vision`] is the async handle the control loop uses; it runs
//! every call on tokio's blocking pool so a forced stop never waits on a
//! worker thread stuck in a device call.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::device::DeviceId;
use crate::error::TransportError;

/// Threshold used when a marker does not carry its own.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.8;

// =============================================================================
// Geometry and matching types
// =============================================================================

/// A screen coordinate in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned search region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Box of `padding` pixels around a point, clipped at the origin.
    #[must_use]
    pub fn around(point: Point, padding: u32) -> Self {
        let x = point.x.saturating_sub(padding);
        let y = point.y.saturating_sub(padding);
        Self::new(x, y, point.x - x + padding, point.y - y + padding)
    }

    /// Smallest region containing both.
    #[must_use]
    pub fn union(self, other: Self) -> Self {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = (self.x + self.width).max(other.x + other.width);
        let bottom = (self.y + self.height).max(other.y + other.height);
        Self::new(x, y, right - x, bottom - y)
    }

    #[must_use]
    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.x
            && point.y >= self.y
            && point.x < self.x + self.width
            && point.y < self.y + self.height
    }
}

/// A known visual reference pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub name: String,
    /// Minimum confidence for `found`; `None` uses [`DEFAULT_MATCH_THRESHOLD`].
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Configured search region; `None` searches the whole screenshot.
    #[serde(default)]
    pub region: Option<Region>,
}

impl Marker {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            threshold: None,
            region: None,
        }
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    #[must_use]
    pub fn in_region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    #[must_use]
    pub fn effective_threshold(&self) -> f64 {
        self.threshold.unwrap_or(DEFAULT_MATCH_THRESHOLD)
    }
}

/// Outcome of one `locate` call. `location` is the match center.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub found: bool,
    pub location: Option<Point>,
    pub confidence: f64,
}

impl MatchResult {
    #[must_use]
    pub fn hit(location: Point, confidence: f64) -> Self {
        Self {
            found: true,
            location: Some(location),
            confidence,
        }
    }

    #[must_use]
    pub fn miss(confidence: f64) -> Self {
        Self {
            found: false,
            location: None,
            confidence,
        }
    }
}

/// A captured frame. `data` is opaque to the core (PNG bytes for adb).
#[derive(Debug, Clone)]
pub struct Screenshot {
    pub device: DeviceId,
    pub data: Arc<[u8]>,
}

impl Screenshot {
    #[must_use]
    pub fn new(device: DeviceId, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            device,
            data: data.into(),
        }
    }
}

/// Android key code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyCode(pub u32);

impl KeyCode {
    pub const HOME: Self = Self(3);
    pub const BACK: Self = Self(4);
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// Screenshot capture plus the opaque matching and OCR primitives.
pub trait CapabilityProvider: Send + Sync {
    fn screenshot(&self, device: &DeviceId) -> Result<Screenshot, TransportError>;

    fn locate(
        &self,
        image: &Screenshot,
        marker: &Marker,
        region: Option<Region>,
    ) -> Result<MatchResult, TransportError>;

    fn read_text(
        &self,
        image: &Screenshot,
        region: Region,
        allowlist: Option<&str>,
    ) -> Result<String, TransportError>;
}

/// Input injection. Implementations enforce their own per-call timeout.
pub trait DeviceTransport: Send + Sync {
    fn tap(&self, device: &DeviceId, point: Point) -> Result<(), TransportError>;

    fn swipe(
        &self,
        device: &DeviceId,
        from: Point,
        to: Point,
        duration: Duration,
    ) -> Result<(), TransportError>;

    fn key_event(&self, device: &DeviceId, code: KeyCode) -> Result<(), TransportError>;

    fn reconnect(&self, device: &DeviceId) -> Result<(), TransportError>;
}

// =============================================================================
// Region cache
// =============================================================================

/// Recent hit locations per marker, used to narrow the next search.
#[derive(Debug)]
pub struct RegionCache {
    capacity: usize,
    padding: u32,
    hits: Mutex<HashMap<String, VecDeque<Point>>>,
}

impl RegionCache {
    #[must_use]
    pub fn new(capacity: usize, padding: u32) -> Self {
        Self {
            capacity,
            padding,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, marker: &str, point: Point) {
        if self.capacity == 0 {
            return;
        }
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let recent = hits.entry(marker.to_string()).or_default();
        recent.retain(|p| *p != point);
        recent.push_front(point);
        recent.truncate(self.capacity);
    }

    /// Padded bounding box of recent hits, if any.
    #[must_use]
    pub fn hint(&self, marker: &str) -> Option<Region> {
        let hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        hits.get(marker)?
            .iter()
            .map(|p| Region::around(*p, self.padding))
            .reduce(Region::union)
    }

    pub fn forget(&self, marker: &str) {
        self.hits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(marker);
    }
}

// =============================================================================
// Vision boundary
// =============================================================================

/// Provider + transport with one reconnect-and-retry on timeout.
///
/// Every call blocks. Async code reaches it through [`Vision::run`], which
/// moves the call onto tokio's blocking pool.
pub struct DeviceIo {
    provider: Arc<dyn CapabilityProvider>,
    transport: Arc<dyn DeviceTransport>,
    regions: RegionCache,
}

impl DeviceIo {
    #[must_use]
    pub fn new(
        provider: Arc<dyn CapabilityProvider>,
        transport: Arc<dyn DeviceTransport>,
        config: &crate::config::VisionConfig,
    ) -> Self {
        Self {
            provider,
            transport,
            regions: RegionCache::new(config.region_cache_size, config.region_padding),
        }
    }

    #[must_use]
    pub fn regions(&self) -> &RegionCache {
        &self.regions
    }

    fn with_retry<T>(
        &self,
        device: &DeviceId,
        op: &str,
        mut call: impl FnMut() -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        match call() {
            Err(err) if err.is_retryable() => {
                warn!(device = %device, op, error = %err, "Device call timed out; reconnecting");
                self.transport.reconnect(device)?;
                call()
            }
            other => other,
        }
    }

    pub fn screenshot(&self, device: &DeviceId) -> Result<Screenshot, TransportError> {
        self.with_retry(device, "screenshot", || self.provider.screenshot(device))
    }

    /// Locate `marker`, trying the cached hit region before the configured one.
    pub fn locate(&self, image: &Screenshot, marker: &Marker) -> Result<MatchResult, TransportError> {
        let device = &image.device;
        if let Some(hint) = self.regions.hint(&marker.name) {
            let result = self.with_retry(device, "locate", || {
                self.provider.locate(image, marker, Some(hint))
            })?;
            if result.found {
                debug!(device = %device, marker = %marker.name, "Region cache hit");
                if let Some(location) = result.location {
                    self.regions.record(&marker.name, location);
                }
                return Ok(result);
            }
        }

        let result = self.with_retry(device, "locate", || {
            self.provider.locate(image, marker, marker.region)
        })?;
        if let (true, Some(location)) = (result.found, result.location) {
            self.regions.record(&marker.name, location);
        }
        Ok(result)
    }

    pub fn read_text(
        &self,
        image: &Screenshot,
        region: Region,
        allowlist: Option<&str>,
    ) -> Result<String, TransportError> {
        self.with_retry(&image.device, "read_text", || {
            self.provider.read_text(image, region, allowlist)
        })
    }

    /// Fresh screenshot, then locate.
    pub fn find(&self, device: &DeviceId, marker: &Marker) -> Result<MatchResult, TransportError> {
        let image = self.screenshot(device)?;
        self.locate(&image, marker)
    }

    /// Tap the marker's center if it is on screen. Returns whether it tapped.
    pub fn tap_marker(&self, device: &DeviceId, marker: &Marker) -> Result<bool, TransportError> {
        let result = self.find(device, marker)?;
        match (result.found, result.location) {
            (true, Some(location)) => {
                self.tap(device, location)?;
                debug!(device = %device, marker = %marker.name, x = location.x, y = location.y, "Tapped marker");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn tap(&self, device: &DeviceId, point: Point) -> Result<(), TransportError> {
        self.with_retry(device, "tap", || self.transport.tap(device, point))
    }

    pub fn swipe(
        &self,
        device: &DeviceId,
        from: Point,
        to: Point,
        duration: Duration,
    ) -> Result<(), TransportError> {
        self.with_retry(device, "swipe", || {
            self.transport.swipe(device, from, to, duration)
        })
    }

    pub fn key_event(&self, device: &DeviceId, code: KeyCode) -> Result<(), TransportError> {
        self.with_retry(device, "key_event", || {
            self.transport.key_event(device, code)
        })
    }
}

/// Marks a blocking call as abandoned when its awaiting future is dropped.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Async face of [`DeviceIo`].
///
/// Calls run on the blocking pool and are serialized per device by an I/O
/// gate held inside the blocking closure. A task aborted mid-call therefore
/// stops at once, while the call it left behind keeps the gate until the
/// device answers: the next call on that device waits for it instead of
/// overlapping. A call whose caller is gone before it reaches the gate is
/// skipped.
pub struct Vision {
    io: Arc<DeviceIo>,
    gates: Mutex<HashMap<DeviceId, Arc<Mutex<()>>>>,
}

impl Vision {
    #[must_use]
    pub fn new(
        provider: Arc<dyn CapabilityProvider>,
        transport: Arc<dyn DeviceTransport>,
        config: &crate::config::VisionConfig,
    ) -> Self {
        Self {
            io: Arc::new(DeviceIo::new(provider, transport, config)),
            gates: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn regions(&self) -> &RegionCache {
        self.io.regions()
    }

    fn gate(&self, device: &DeviceId) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(gates.entry(device.clone()).or_default())
    }

    /// Run blocking device work for `device` on the blocking pool.
    ///
    /// Panics inside `work` resume on the caller.
    pub async fn run<T, F>(&self, device: &DeviceId, op: &'static str, work: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&DeviceIo) -> Result<T, TransportError> + Send + 'static,
    {
        let io = Arc::clone(&self.io);
        let gate = self.gate(device);
        let abandoned = Arc::new(AtomicBool::new(false));
        let _armed = AbandonOnDrop(Arc::clone(&abandoned));
        let handle = tokio::task::spawn_blocking(move || {
            let _serial = gate.lock().unwrap_or_else(|e| e.into_inner());
            if abandoned.load(Ordering::SeqCst) {
                return Err(TransportError::CommandFailed(format!("{op} abandoned")));
            }
            work(&io)
        });
        match handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(TransportError::CommandFailed(format!("{op} did not run: {err}"))),
        }
    }

    pub async fn screenshot(&self, device: &DeviceId) -> Result<Screenshot, TransportError> {
        let owned = device.clone();
        self.run(device, "screenshot", move |io| io.screenshot(&owned))
            .await
    }

    pub async fn locate(&self, image: &Screenshot, marker: &Marker) -> Result<MatchResult, TransportError> {
        let image = image.clone();
        let marker = marker.clone();
        let device = image.device.clone();
        self.run(&device, "locate", move |io| io.locate(&image, &marker))
            .await
    }

    pub async fn read_text(
        &self,
        image: &Screenshot,
        region: Region,
        allowlist: Option<&str>,
    ) -> Result<String, TransportError> {
        let image = image.clone();
        let allowlist = allowlist.map(str::to_owned);
        let device = image.device.clone();
        self.run(&device, "read_text", move |io| {
            io.read_text(&image, region, allowlist.as_deref())
        })
        .await
    }

    pub async fn find(&self, device: &DeviceId, marker: &Marker) -> Result<MatchResult, TransportError> {
        let owned = device.clone();
        let marker = marker.clone();
        self.run(device, "find", move |io| io.find(&owned, &marker))
            .await
    }

    pub async fn tap_marker(&self, device: &DeviceId, marker: &Marker) -> Result<bool, TransportError> {
        let owned = device.clone();
        let marker = marker.clone();
        self.run(device, "tap_marker", move |io| io.tap_marker(&owned, &marker))
            .await
    }

    pub async fn tap(&self, device: &DeviceId, point: Point) -> Result<(), TransportError> {
        let owned = device.clone();
        self.run(device, "tap", move |io| io.tap(&owned, point)).await
    }

    pub async fn swipe(
        &self,
        device: &DeviceId,
        from: Point,
        to: Point,
        duration: Duration,
    ) -> Result<(), TransportError> {
        let owned = device.clone();
        self.run(device, "swipe", move |io| io.swipe(&owned, from, to, duration))
            .await
    }

    pub async fn key_event(&self, device: &DeviceId, code: KeyCode) -> Result<(), TransportError> {
        let owned = device.clone();
        self.run(device, "key_event", move |io| io.key_event(&owned, code))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn region_around_clips_at_origin() {
        let region = Region::around(Point::new(10, 100), 40);
        assert_eq!(region, Region::new(0, 60, 50, 80));
        assert!(region.contains(Point::new(10, 100)));
    }

    #[test]
    fn region_union_covers_both() {
        let a = Region::new(0, 0, 10, 10);
        let b = Region::new(20, 5, 10, 10);
        let u = a.union(b);
        assert_eq!(u, Region::new(0, 0, 30, 15));
    }

    #[test]
    fn region_cache_is_bounded_and_deduplicated() {
        let cache = RegionCache::new(2, 10);
        cache.record("close_x", Point::new(100, 100));
        cache.record("close_x", Point::new(100, 100));
        cache.record("close_x", Point::new(200, 200));
        cache.record("close_x", Point::new(300, 300));
        let hint = cache.hint("close_x").unwrap();
        assert!(hint.contains(Point::new(300, 300)));
        assert!(hint.contains(Point::new(200, 200)));
        assert!(!hint.contains(Point::new(100, 100)));
        assert!(cache.hint("other").is_none());
    }

    #[test]
    fn zero_capacity_cache_never_hints() {
        let cache = RegionCache::new(0, 10);
        cache.record("m", Point::new(1, 1));
        assert!(cache.hint("m").is_none());
    }

    /// Transport whose first `failures` taps time out. Each tap blocks for
    /// `delay` and tracks how many taps are in flight at once.
    #[derive(Default)]
    struct FlakyTransport {
        failures: AtomicU32,
        delay: Duration,
        taps: AtomicU32,
        reconnects: AtomicU32,
        active: AtomicU32,
        peak: AtomicU32,
    }

    impl DeviceTransport for FlakyTransport {
        fn tap(&self, _device: &DeviceId, _point: Point) -> Result<(), TransportError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.taps.fetch_add(1, Ordering::SeqCst);
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::Timeout {
                    op: "tap".to_string(),
                    timeout_ms: 10,
                });
            }
            Ok(())
        }

        fn swipe(&self, _: &DeviceId, _: Point, _: Point, _: Duration) -> Result<(), TransportError> {
            Ok(())
        }

        fn key_event(&self, _: &DeviceId, _: KeyCode) -> Result<(), TransportError> {
            Err(TransportError::CommandFailed("no keys".to_string()))
        }

        fn reconnect(&self, _: &DeviceId) -> Result<(), TransportError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NoProvider;

    impl CapabilityProvider for NoProvider {
        fn screenshot(&self, device: &DeviceId) -> Result<Screenshot, TransportError> {
            Ok(Screenshot::new(device.clone(), Vec::new()))
        }

        fn locate(&self, _: &Screenshot, _: &Marker, _: Option<Region>) -> Result<MatchResult, TransportError> {
            Ok(MatchResult::miss(0.0))
        }

        fn read_text(&self, _: &Screenshot, _: Region, _: Option<&str>) -> Result<String, TransportError> {
            Err(TransportError::Unsupported("ocr".to_string()))
        }
    }

    fn vision_over(transport: FlakyTransport) -> (Arc<Vision>, Arc<FlakyTransport>) {
        let transport = Arc::new(transport);
        let vision = Vision::new(
            Arc::new(NoProvider),
            transport.clone(),
            &crate::config::VisionConfig::default(),
        );
        (Arc::new(vision), transport)
    }

    fn vision_with(failures: u32) -> (Arc<Vision>, Arc<FlakyTransport>) {
        vision_over(FlakyTransport {
            failures: AtomicU32::new(failures),
            ..FlakyTransport::default()
        })
    }

    #[tokio::test]
    async fn timeout_reconnects_and_retries_once() {
        let (vision, transport) = vision_with(1);
        let device = DeviceId::new("d");
        vision.tap(&device, Point::new(1, 1)).await.unwrap();
        assert_eq!(transport.taps.load(Ordering::SeqCst), 2);
        assert_eq!(transport.reconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_timeout_is_surfaced() {
        let (vision, transport) = vision_with(2);
        let err = vision
            .tap(&DeviceId::new("d"), Point::new(1, 1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.taps.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_timeout_errors_are_not_retried() {
        let (vision, transport) = vision_with(0);
        let err = vision
            .key_event(&DeviceId::new("d"), KeyCode::BACK)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::CommandFailed(_)));
        assert_eq!(transport.reconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn device_io_is_usable_without_a_runtime() {
        let (vision, transport) = vision_with(0);
        vision.io.tap(&DeviceId::new("d"), Point::new(1, 1)).unwrap();
        assert_eq!(transport.taps.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn calls_on_one_device_are_serialized() {
        let (vision, transport) = vision_over(FlakyTransport {
            delay: Duration::from_millis(30),
            ..FlakyTransport::default()
        });
        let device = DeviceId::new("d");
        let calls: Vec<_> = (0..4)
            .map(|_| {
                let vision = Arc::clone(&vision);
                let device = device.clone();
                tokio::spawn(async move { vision.tap(&device, Point::new(1, 1)).await })
            })
            .collect();
        for call in calls {
            call.await.unwrap().unwrap();
        }
        assert_eq!(transport.taps.load(Ordering::SeqCst), 4);
        assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn aborted_caller_does_not_let_the_next_call_overlap() {
        let (vision, transport) = vision_over(FlakyTransport {
            delay: Duration::from_millis(150),
            ..FlakyTransport::default()
        });
        let device = DeviceId::new("d");
        let stuck = {
            let vision = Arc::clone(&vision);
            let device = device.clone();
            tokio::spawn(async move { vision.tap(&device, Point::new(1, 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        stuck.abort();
        assert!(stuck.await.unwrap_err().is_cancelled());

        // The abandoned tap is still on the device; this one queues behind it.
        vision.tap(&device, Point::new(2, 2)).await.unwrap();
        assert_eq!(transport.taps.load(Ordering::SeqCst), 2);
        assert_eq!(transport.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_call_waiting_for_the_gate_is_skipped() {
        let (vision, transport) = vision_over(FlakyTransport {
            delay: Duration::from_millis(120),
            ..FlakyTransport::default()
        });
        let device = DeviceId::new("d");
        let first = {
            let vision = Arc::clone(&vision);
            let device = device.clone();
            tokio::spawn(async move { vision.tap(&device, Point::new(1, 1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = {
            let vision = Arc::clone(&vision);
            let device = device.clone();
            tokio::spawn(async move { vision.tap(&device, Point::new(2, 2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queued.abort();
        first.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.taps.load(Ordering::SeqCst), 1);
    }
}
