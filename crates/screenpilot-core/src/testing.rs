//! Scripted fake device world for tests and dry runs.
//!
//! [`FakeGame`] implements both [`CapabilityProvider`] and [`DeviceTransport`].
//! Each device shows a *label*. A label equal to a screen name (`"MAP"`,
//! `"WAR"`, ...) makes that screen's marker visible; any other label (e.g.
//! `"loading"`, `"reward"`) is unrecognized. Inputs move a device between
//! labels through scripted transitions, optionally after a latency.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::classifier::Classifier;
use crate::config::VisionConfig;
use crate::device::DeviceId;
use crate::error::TransportError;
use crate::routes::{RouteTable, Transition};
use crate::screen::{Screen, ScreenMarkers};
use crate::vision::{
    CapabilityProvider, DeviceTransport, KeyCode, Marker, MatchResult, Point, Region, Screenshot,
    Vision,
};

/// Where screen-identifying markers are reported.
pub const SCREEN_MARKER_POINT: Point = Point::new(540, 960);

const VISIBLE_SCREEN_CONFIDENCE: f64 = 0.95;
const HIDDEN_SCREEN_CONFIDENCE: f64 = 0.1;
const SHOWN_MARKER_CONFIDENCE: f64 = 0.9;
const ABSENT_MARKER_CONFIDENCE: f64 = 0.05;

/// An input delivered to a fake device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Tap(Point),
    Key(KeyCode),
    Swipe(Point, Point),
}

#[derive(Debug, Default)]
struct World {
    current: HashMap<DeviceId, String>,
    pending: HashMap<DeviceId, (Instant, String)>,
    transitions: HashMap<(String, Action), String>,
    markers: HashMap<(String, String), Point>,
    confidence: HashMap<String, f64>,
    text: HashMap<String, String>,
    screenshot_failures: HashMap<DeviceId, u32>,
    actions: HashMap<DeviceId, Vec<Action>>,
    screenshots: HashMap<DeviceId, u32>,
    reconnects: u32,
    latency: Duration,
}

impl World {
    fn settle(&mut self, device: &DeviceId) {
        let due = self
            .pending
            .get(device)
            .is_some_and(|(at, _)| Instant::now() >= *at);
        if due {
            if let Some((_, label)) = self.pending.remove(device) {
                self.current.insert(device.clone(), label);
            }
        }
    }

    fn apply(&mut self, device: &DeviceId, action: Action) {
        self.settle(device);
        self.actions.entry(device.clone()).or_default().push(action);
        let Some(label) = self.current.get(device) else {
            return;
        };
        let Some(next) = self.transitions.get(&(label.clone(), action)).cloned() else {
            return;
        };
        if self.latency.is_zero() {
            self.current.insert(device.clone(), next);
        } else {
            self.pending
                .insert(device.clone(), (Instant::now() + self.latency, next));
        }
    }
}

#[derive(Debug, Default)]
pub struct FakeGame {
    world: Mutex<World>,
}

impl FakeGame {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// World whose transitions mirror `table`: every edge action moves the
    /// device from its source screen to its destination. Marker steps get a
    /// fixed point per marker name; multi-step edges pass through
    /// intermediate labels.
    #[must_use]
    pub fn from_routes(table: &RouteTable) -> Arc<Self> {
        let game = Self::new();
        let mut points: BTreeMap<String, Point> = BTreeMap::new();
        for (from, to, transition) in table.edges() {
            let steps = transition.steps();
            let mut label = from.as_str().to_string();
            for (i, step) in steps.iter().enumerate() {
                let next = if i + 1 == steps.len() {
                    to.as_str().to_string()
                } else {
                    format!("{from}->{to}#{i}")
                };
                match step {
                    Transition::TapMarker(marker) => {
                        let count = points.len() as u32;
                        let point = *points
                            .entry(marker.name.clone())
                            .or_insert_with(|| Point::new(100 + 60 * count, 1700));
                        game.on_marker_tap(&label, &marker.name, point, &next);
                    }
                    Transition::Tap(point) => game.on_tap(&label, *point, &next),
                    Transition::Key(code) => game.on_key(&label, *code, &next),
                    Transition::Sequence(_) => {}
                }
                label = next;
            }
        }
        game
    }

    /// The built-in route table's world, plus BACK returning to MAP from
    /// every other known screen.
    #[must_use]
    pub fn standard() -> Arc<Self> {
        let game = Self::from_routes(&RouteTable::default());
        for screen in Screen::KNOWN {
            if screen != Screen::Map {
                game.on_key(screen.as_str(), KeyCode::BACK, "MAP");
            }
        }
        game
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn place(&self, device: &DeviceId, label: impl AsRef<str>) {
        let mut world = self.world();
        world.pending.remove(device);
        world
            .current
            .insert(device.clone(), label.as_ref().to_string());
    }

    #[must_use]
    pub fn current(&self, device: &DeviceId) -> Option<String> {
        let mut world = self.world();
        world.settle(device);
        world.current.get(device).cloned()
    }

    /// Delay between an input and the resulting label change.
    pub fn set_latency(&self, latency: Duration) {
        self.world().latency = latency;
    }

    /// Make a non-screen marker visible at `point` while `label` is shown.
    pub fn show_marker(&self, label: &str, marker: &str, point: Point) {
        self.world()
            .markers
            .insert((label.to_string(), marker.to_string()), point);
    }

    pub fn on_tap(&self, label: &str, point: Point, next: &str) {
        self.world()
            .transitions
            .insert((label.to_string(), Action::Tap(point)), next.to_string());
    }

    pub fn on_key(&self, label: &str, code: KeyCode, next: &str) {
        self.world()
            .transitions
            .insert((label.to_string(), Action::Key(code)), next.to_string());
    }

    /// Show `marker` at `point` on `label`; tapping it moves to `next`.
    pub fn on_marker_tap(&self, label: &str, marker: &str, point: Point, next: &str) {
        self.show_marker(label, marker, point);
        self.on_tap(label, point, next);
    }

    /// Score reported for the screen marker of a screen-named label.
    pub fn set_confidence(&self, label: &str, confidence: f64) {
        self.world()
            .confidence
            .insert(label.to_string(), confidence);
    }

    pub fn set_text(&self, label: &str, text: &str) {
        self.world()
            .text
            .insert(label.to_string(), text.to_string());
    }

    /// The next `count` screenshots of `device` time out.
    pub fn fail_screenshots(&self, device: &DeviceId, count: u32) {
        self.world()
            .screenshot_failures
            .insert(device.clone(), count);
    }

    #[must_use]
    pub fn actions(&self, device: &DeviceId) -> Vec<Action> {
        self.world().actions.get(device).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn tap_count(&self, device: &DeviceId) -> usize {
        self.actions(device)
            .iter()
            .filter(|a| matches!(a, Action::Tap(_)))
            .count()
    }

    #[must_use]
    pub fn screenshot_count(&self, device: &DeviceId) -> u32 {
        self.world().screenshots.get(device).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn reconnects(&self) -> u32 {
        self.world().reconnects
    }

    /// Vision over this world with default cache settings.
    #[must_use]
    pub fn vision(self: &Arc<Self>) -> Arc<Vision> {
        Arc::new(Vision::new(
            Arc::clone(self) as Arc<dyn CapabilityProvider>,
            Arc::clone(self) as Arc<dyn DeviceTransport>,
            &VisionConfig::default(),
        ))
    }

    #[must_use]
    pub fn classifier(self: &Arc<Self>, threshold: f64) -> Classifier {
        Classifier::new(self.vision(), ScreenMarkers::default(), threshold)
    }
}

fn screen_for_marker(name: &str) -> Option<Screen> {
    Screen::KNOWN.into_iter().find(|s| s.marker_name() == name)
}

impl CapabilityProvider for FakeGame {
    fn screenshot(&self, device: &DeviceId) -> Result<Screenshot, TransportError> {
        let mut world = self.world();
        *world.screenshots.entry(device.clone()).or_default() += 1;
        let remaining = world.screenshot_failures.entry(device.clone()).or_default();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(TransportError::Timeout {
                op: "screencap".to_string(),
                timeout_ms: 0,
            });
        }
        world.settle(device);
        let label = world
            .current
            .get(device)
            .cloned()
            .ok_or_else(|| TransportError::DeviceOffline(device.to_string()))?;
        Ok(Screenshot::new(device.clone(), label.into_bytes()))
    }

    fn locate(
        &self,
        image: &Screenshot,
        marker: &Marker,
        region: Option<Region>,
    ) -> Result<MatchResult, TransportError> {
        let label = String::from_utf8_lossy(&image.data).into_owned();
        let world = self.world();
        let in_region = |p: Point| region.is_none_or(|r| r.contains(p));

        let (point, confidence) = if let Some(screen) = screen_for_marker(&marker.name) {
            let confidence = if label == screen.as_str() {
                world
                    .confidence
                    .get(&label)
                    .copied()
                    .unwrap_or(VISIBLE_SCREEN_CONFIDENCE)
            } else {
                HIDDEN_SCREEN_CONFIDENCE
            };
            (SCREEN_MARKER_POINT, confidence)
        } else if let Some(point) = world.markers.get(&(label, marker.name.clone())) {
            (*point, SHOWN_MARKER_CONFIDENCE)
        } else {
            return Ok(MatchResult::miss(ABSENT_MARKER_CONFIDENCE));
        };

        if in_region(point) && confidence >= marker.effective_threshold() {
            Ok(MatchResult::hit(point, confidence))
        } else {
            Ok(MatchResult::miss(confidence))
        }
    }

    fn read_text(
        &self,
        image: &Screenshot,
        _region: Region,
        _allowlist: Option<&str>,
    ) -> Result<String, TransportError> {
        let label = String::from_utf8_lossy(&image.data).into_owned();
        Ok(self.world().text.get(&label).cloned().unwrap_or_default())
    }
}

impl DeviceTransport for FakeGame {
    fn tap(&self, device: &DeviceId, point: Point) -> Result<(), TransportError> {
        self.world().apply(device, Action::Tap(point));
        Ok(())
    }

    fn swipe(
        &self,
        device: &DeviceId,
        from: Point,
        to: Point,
        _duration: Duration,
    ) -> Result<(), TransportError> {
        self.world().apply(device, Action::Swipe(from, to));
        Ok(())
    }

    fn key_event(&self, device: &DeviceId, code: KeyCode) -> Result<(), TransportError> {
        self.world().apply(device, Action::Key(code));
        Ok(())
    }

    fn reconnect(&self, _device: &DeviceId) -> Result<(), TransportError> {
        self.world().reconnects += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn standard_world_follows_edges() {
        let game = FakeGame::standard();
        let device = DeviceId::new("d");
        game.place(&device, "MAP");
        let vision = game.vision();
        assert!(
            vision
                .tap_marker(&device, &Marker::new("alliance_button"))
                .await
                .unwrap()
        );
        assert_eq!(game.current(&device).as_deref(), Some("ALLIANCE"));
        vision.key_event(&device, KeyCode::BACK).await.unwrap();
        assert_eq!(game.current(&device).as_deref(), Some("MAP"));
    }

    #[test]
    fn sequence_edges_pass_through_intermediate_labels() {
        let table = RouteTable::new().with_edge(
            Screen::Map,
            Screen::War,
            Transition::Sequence(vec![
                Transition::Tap(Point::new(1, 1)),
                Transition::Tap(Point::new(2, 2)),
            ]),
        );
        let game = FakeGame::from_routes(&table);
        let device = DeviceId::new("d");
        game.place(&device, "MAP");
        game.tap(&device, Point::new(1, 1)).unwrap();
        assert_eq!(game.current(&device).as_deref(), Some("MAP->WAR#0"));
        game.tap(&device, Point::new(2, 2)).unwrap();
        assert_eq!(game.current(&device).as_deref(), Some("WAR"));
    }

    #[test]
    fn unscripted_input_is_recorded_but_inert() {
        let game = FakeGame::new();
        let device = DeviceId::new("d");
        game.place(&device, "MAP");
        game.tap(&device, Point::new(5, 5)).unwrap();
        assert_eq!(game.current(&device).as_deref(), Some("MAP"));
        assert_eq!(game.tap_count(&device), 1);
    }

    #[test]
    fn unplaced_device_is_offline() {
        let game = FakeGame::new();
        let err = game.screenshot(&DeviceId::new("ghost")).unwrap_err();
        assert!(matches!(err, TransportError::DeviceOffline(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn latency_delays_label_change() {
        let game = FakeGame::new();
        let device = DeviceId::new("d");
        game.place(&device, "MAP");
        game.on_tap("MAP", Point::new(1, 1), "WAR");
        game.set_latency(Duration::from_millis(500));
        game.tap(&device, Point::new(1, 1)).unwrap();
        assert_eq!(game.current(&device).as_deref(), Some("MAP"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(game.current(&device).as_deref(), Some("WAR"));
    }

    #[test]
    fn region_restricts_shown_markers() {
        let game = FakeGame::new();
        let device = DeviceId::new("d");
        game.place(&device, "popup");
        game.show_marker("popup", "close_x", Point::new(900, 100));
        let image = game.screenshot(&device).unwrap();
        let far = Region::new(0, 1000, 100, 100);
        assert!(!game.locate(&image, &Marker::new("close_x"), Some(far)).unwrap().found);
        assert!(game.locate(&image, &Marker::new("close_x"), None).unwrap().found);
    }
}
