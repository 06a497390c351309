//! Escalating recovery when the current screen cannot be identified.
//!
//! The ladder runs lowest-impact first and stops at the first rung after
//! which the classifier recognizes a screen:
//!
//! 1. `TemplateDismiss`: tap a generic close/cancel/back control if one is
//!    visible. Two attempts, reclassifying after each.
//! 2. `BackSignal`: device back key.
//! 3. `NeutralTap`: tap a fixed harmless coordinate to clear click-through
//!    overlays.
//! 4. `Nuclear`: several back keys, a neutral tap, then a cooldown.
//!
//! The best under-threshold candidate seen along the way is stored per
//! device so callers can tell "probably MAP at 0.74" from "nothing at all".

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::{CancelExt, CancellationToken};
use crate::classifier::{Classification, Classifier};
use crate::config::RecoveryConfig;
use crate::device::{DeviceId, DeviceRegistry};
use crate::error::TransportError;
use crate::screen::ScreenIdentity;
use crate::vision::{KeyCode, Marker, Point, Vision};

/// Gap between the back keys of the nuclear rung.
const NUCLEAR_BACK_GAP: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryRung {
    TemplateDismiss,
    BackSignal,
    NeutralTap,
    Nuclear,
}

impl RecoveryRung {
    pub const LADDER: [Self; 4] = [
        Self::TemplateDismiss,
        Self::BackSignal,
        Self::NeutralTap,
        Self::Nuclear,
    ];
}

impl fmt::Display for RecoveryRung {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TemplateDismiss => "template_dismiss",
            Self::BackSignal => "back_signal",
            Self::NeutralTap => "neutral_tap",
            Self::Nuclear => "nuclear",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryOutcome {
    /// Known screen on success, `Unknown` otherwise.
    pub identity: ScreenIdentity,
    /// Rungs executed, in order.
    pub rungs_tried: Vec<RecoveryRung>,
    /// Highest under-threshold candidate observed.
    pub best_partial: Option<ScreenIdentity>,
}

impl RecoveryOutcome {
    #[must_use]
    pub fn recovered(&self) -> bool {
        self.identity.is_known()
    }
}

/// Generic controls tried by the template rung, in priority order.
#[must_use]
pub fn default_dismiss_markers() -> Vec<Marker> {
    vec![
        Marker::new("close_x").with_threshold(0.7),
        Marker::new("cancel").with_threshold(0.65),
        Marker::new("back_arrow").with_threshold(0.7),
    ]
}

pub struct RecoveryEscalator {
    vision: Arc<Vision>,
    classifier: Arc<Classifier>,
    registry: Arc<DeviceRegistry>,
    dismiss_markers: Arc<[Marker]>,
    config: RecoveryConfig,
}

impl RecoveryEscalator {
    #[must_use]
    pub fn new(
        vision: Arc<Vision>,
        classifier: Arc<Classifier>,
        registry: Arc<DeviceRegistry>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            vision,
            classifier,
            registry,
            dismiss_markers: default_dismiss_markers().into(),
            config,
        }
    }

    #[must_use]
    pub fn with_dismiss_markers(mut self, markers: Vec<Marker>) -> Self {
        self.dismiss_markers = markers.into();
        self
    }

    fn neutral_point(&self) -> Point {
        let (x, y) = self.config.neutral_point;
        Point::new(x, y)
    }

    fn settle(&self) -> Duration {
        Duration::from_millis(self.config.settle_ms)
    }

    /// Run the ladder until a screen is recognized or every rung is spent.
    ///
    /// Cancellation is honored between rungs and inside every settle or
    /// cooldown sleep; a cancelled run returns the rungs tried so far with an
    /// `Unknown` identity.
    pub async fn recover(
        &self,
        device: &DeviceId,
        token: &CancellationToken,
    ) -> Result<RecoveryOutcome, TransportError> {
        let mut tracker = PartialTracker::default();
        let mut rungs_tried = Vec::new();

        for rung in RecoveryRung::LADDER {
            if token.is_cancelled() {
                break;
            }
            rungs_tried.push(rung);
            debug!(device = %device, rung = %rung, "Recovery rung");

            let step = match rung {
                RecoveryRung::TemplateDismiss => {
                    self.template_dismiss(device, token, &mut tracker).await?
                }
                RecoveryRung::BackSignal => {
                    self.vision.key_event(device, KeyCode::BACK).await?;
                    self.settle_then_reclassify(device, self.settle(), token, &mut tracker)
                        .await?
                }
                RecoveryRung::NeutralTap => {
                    self.vision.tap(device, self.neutral_point()).await?;
                    self.settle_then_reclassify(device, self.settle(), token, &mut tracker)
                        .await?
                }
                RecoveryRung::Nuclear => self.nuclear(device, token, &mut tracker).await?,
            };

            match step {
                Step::Recognized(identity) => {
                    info!(device = %device, rung = %rung, screen = %identity.screen, "Recovered");
                    self.registry.record_partial_match(device, None);
                    return Ok(RecoveryOutcome {
                        identity,
                        rungs_tried,
                        best_partial: tracker.best,
                    });
                }
                Step::Stopped => {
                    debug!(device = %device, rung = %rung, "Recovery cancelled");
                    return Ok(tracker.unknown(rungs_tried));
                }
                Step::Unrecognized => {}
            }
        }

        if token.is_cancelled() {
            return Ok(tracker.unknown(rungs_tried));
        }
        let best = tracker.best;
        self.registry.record_partial_match(device, best);
        warn!(
            device = %device,
            rungs = rungs_tried.len(),
            best = best.map_or_else(|| "none".to_string(), |b| b.to_string()),
            "Recovery exhausted"
        );
        Ok(tracker.unknown(rungs_tried))
    }

    async fn template_dismiss(
        &self,
        device: &DeviceId,
        token: &CancellationToken,
        tracker: &mut PartialTracker,
    ) -> Result<Step, TransportError> {
        for attempt in 0..self.config.template_attempts.max(1) {
            if attempt > 0 && token.is_cancelled() {
                return Ok(Step::Stopped);
            }
            let owned = device.clone();
            let markers = Arc::clone(&self.dismiss_markers);
            let control = self
                .vision
                .run(device, "template_dismiss", move |io| {
                    let image = io.screenshot(&owned)?;
                    for marker in markers.iter() {
                        let result = io.locate(&image, marker)?;
                        if let (true, Some(location)) = (result.found, result.location) {
                            return Ok(Some((marker.name.clone(), location)));
                        }
                    }
                    Ok(None)
                })
                .await?;
            let settle = match control {
                Some((name, location)) => {
                    debug!(device = %device, marker = %name, "Tapping generic control");
                    self.vision.tap(device, location).await?;
                    self.settle()
                }
                None => Duration::ZERO,
            };
            match self
                .settle_then_reclassify(device, settle, token, tracker)
                .await?
            {
                Step::Unrecognized => {}
                step => return Ok(step),
            }
        }
        Ok(Step::Unrecognized)
    }

    async fn nuclear(
        &self,
        device: &DeviceId,
        token: &CancellationToken,
        tracker: &mut PartialTracker,
    ) -> Result<Step, TransportError> {
        for _ in 0..self.config.nuclear_backs {
            self.vision.key_event(device, KeyCode::BACK).await?;
            if !token.sleep(NUCLEAR_BACK_GAP).await {
                return Ok(Step::Stopped);
            }
        }
        self.vision.tap(device, self.neutral_point()).await?;
        let cooldown = Duration::from_millis(self.config.cooldown_ms);
        self.settle_then_reclassify(device, cooldown, token, tracker)
            .await
    }

    async fn settle_then_reclassify(
        &self,
        device: &DeviceId,
        settle: Duration,
        token: &CancellationToken,
        tracker: &mut PartialTracker,
    ) -> Result<Step, TransportError> {
        if !settle.is_zero() && !token.sleep(settle).await {
            return Ok(Step::Stopped);
        }
        let classification = self.classifier.classify_full(device).await?;
        tracker.observe(&classification);
        if classification.identity.is_known() {
            Ok(Step::Recognized(classification.identity))
        } else {
            Ok(Step::Unrecognized)
        }
    }
}

/// Where one rung left the ladder.
enum Step {
    Recognized(ScreenIdentity),
    Unrecognized,
    Stopped,
}

#[derive(Debug, Default)]
struct PartialTracker {
    best: Option<ScreenIdentity>,
}

impl PartialTracker {
    fn unknown(&self, rungs_tried: Vec<RecoveryRung>) -> RecoveryOutcome {
        RecoveryOutcome {
            identity: ScreenIdentity::unknown(self.best.map_or(0.0, |b| b.confidence)),
            rungs_tried,
            best_partial: self.best,
        }
    }

    fn observe(&mut self, classification: &Classification) {
        if classification.identity.is_known() {
            return;
        }
        let Some(candidate) = classification.best else {
            return;
        };
        if candidate.confidence > 0.0 && self.best.is_none_or(|b| candidate.confidence > b.confidence) {
            self.best = Some(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::Screen;
    use crate::testing::{Action, FakeGame};

    fn escalator(game: &Arc<FakeGame>, registry: &Arc<DeviceRegistry>) -> RecoveryEscalator {
        let vision = game.vision();
        let classifier = Arc::new(game.classifier(0.8));
        RecoveryEscalator::new(vision, classifier, Arc::clone(registry), RecoveryConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn back_signal_recovers_after_template_attempts() {
        let game = FakeGame::new();
        let registry = Arc::new(DeviceRegistry::new());
        let device = DeviceId::new("d");
        game.place(&device, "loading");
        game.on_key("loading", KeyCode::BACK, "MAP");

        let outcome = escalator(&game, &registry)
            .recover(&device, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.identity.screen, Screen::Map);
        assert_eq!(
            outcome.rungs_tried,
            vec![RecoveryRung::TemplateDismiss, RecoveryRung::BackSignal]
        );
        assert_eq!(game.actions(&device), vec![Action::Key(KeyCode::BACK)]);
        assert_eq!(registry.partial_match(&device), None);
    }

    #[tokio::test(start_paused = true)]
    async fn template_rung_taps_generic_close() {
        let game = FakeGame::new();
        let registry = Arc::new(DeviceRegistry::new());
        let device = DeviceId::new("d");
        let close = Point::new(1000, 200);
        game.place(&device, "popup");
        game.on_marker_tap("popup", "close_x", close, "WAR");

        let outcome = escalator(&game, &registry)
            .recover(&device, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.identity.screen, Screen::War);
        assert_eq!(outcome.rungs_tried, vec![RecoveryRung::TemplateDismiss]);
        assert_eq!(game.actions(&device), vec![Action::Tap(close)]);
    }

    #[tokio::test(start_paused = true)]
    async fn only_last_rung_succeeds_after_each_prior_rung_once() {
        let game = FakeGame::new();
        let registry = Arc::new(DeviceRegistry::new());
        let device = DeviceId::new("d");
        game.place(&device, "stuck");
        // The nuclear rung's neutral tap is the second neutral tap overall.
        game.on_key("stuck", KeyCode::BACK, "stuck2");
        game.on_tap("stuck2", Point::new(540, 80), "stuck3");
        game.on_key("stuck3", KeyCode::BACK, "stuck4");
        game.on_tap("stuck4", Point::new(540, 80), "PROFILE");

        let outcome = escalator(&game, &registry)
            .recover(&device, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.identity.screen, Screen::Profile);
        assert_eq!(outcome.rungs_tried, RecoveryRung::LADDER.to_vec());
        let keys = game
            .actions(&device)
            .iter()
            .filter(|a| matches!(a, Action::Key(_)))
            .count();
        assert_eq!(keys, 1 + 3);
        assert_eq!(game.tap_count(&device), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_records_best_partial() {
        let game = FakeGame::new();
        let registry = Arc::new(DeviceRegistry::new());
        let device = DeviceId::new("d");
        game.place(&device, "MAP");
        game.set_confidence("MAP", 0.72);

        let outcome = escalator(&game, &registry)
            .recover(&device, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!outcome.recovered());
        assert_eq!(outcome.rungs_tried.len(), 4);
        let partial = registry.partial_match(&device).unwrap();
        assert_eq!(partial.screen, Screen::Map);
        assert!((partial.confidence - 0.72).abs() < 1e-9);
        assert!((outcome.identity.confidence - 0.72).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_stops_before_first_rung() {
        let game = FakeGame::new();
        let registry = Arc::new(DeviceRegistry::new());
        let device = DeviceId::new("d");
        game.place(&device, "loading");
        let token = CancellationToken::new();
        token.cancel();
        let outcome = escalator(&game, &registry).recover(&device, &token).await.unwrap();
        assert!(outcome.rungs_tried.is_empty());
        assert!(game.actions(&device).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_nuclear_rung_ends_the_ladder() {
        let game = FakeGame::new();
        let registry = Arc::new(DeviceRegistry::new());
        let device = DeviceId::new("d");
        game.place(&device, "stuck");
        let escalator = Arc::new(escalator(&game, &registry));
        let token = CancellationToken::new();
        let run = {
            let escalator = Arc::clone(&escalator);
            let device = device.clone();
            let token = token.clone();
            tokio::spawn(async move { escalator.recover(&device, &token).await })
        };
        // Settles: 2 template attempts, back, neutral tap. Then the first
        // nuclear back key is followed by a 300 ms gap.
        let config = RecoveryConfig::default();
        let before_nuclear = Duration::from_millis(config.settle_ms * 2);
        tokio::time::sleep(before_nuclear + Duration::from_millis(150)).await;
        token.cancel();
        let outcome = run.await.unwrap().unwrap();

        assert!(!outcome.recovered());
        assert_eq!(outcome.rungs_tried, RecoveryRung::LADDER.to_vec());
        let keys = game
            .actions(&device)
            .iter()
            .filter(|a| matches!(a, Action::Key(_)))
            .count();
        // One back from the back rung, one from the nuclear rung, then stop.
        assert_eq!(keys, 2);
        // Only the neutral-tap rung tapped; the nuclear tap never fired.
        assert_eq!(game.tap_count(&device), 1);
        // A cancelled run is not an exhausted one.
        assert_eq!(registry.partial_match(&device), None);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_propagates() {
        let game = FakeGame::new();
        let registry = Arc::new(DeviceRegistry::new());
        let device = DeviceId::new("d");
        game.place(&device, "loading");
        game.fail_screenshots(&device, 2);
        let err = escalator(&game, &registry)
            .recover(&device, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
