//! Route-following navigation.
//!
//! `navigate` brings a device to a target screen:
//!
//! 1. PRE popup dismissal (a halting overlay fails immediately).
//! 2. Classify; an unknown screen goes through the recovery ladder.
//! 3. POST popup dismissal.
//! 4. Already on target: verify and return.
//! 5. Look up the waypoints from here to the target.
//! 6. For each waypoint: perform the edge action, wait (adaptively) for the
//!    waypoint to appear, then recurse toward that waypoint. The recursive
//!    call re-classifies, so an action that lands somewhere unexpected is
//!    corrected by routing from wherever the device actually is.
//!
//! Recursion depth is bounded; a route cycle or a transition that keeps
//! misfiring fails with `DepthExceeded` instead of looping.
//!
//! When the screen is unknown and recovery is exhausted, navigation fails
//! with `RecoveryExhausted` before any route is consulted, so that error
//! takes precedence over a route gap.
//!
//! A halting overlay is reported to the [`HaltListener`], if one is set, so
//! the device's tasks stop instead of retrying. With [`DebugCaptures`] set,
//! the frame is saved on an unknown screen, a failed verification, and an
//! exhausted recovery.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, info, warn};

use crate::cancel::{CancelExt, CancellationToken};
use crate::classifier::Classifier;
use crate::config::Config;
use crate::debug_capture::DebugCaptures;
use crate::device::{DeviceId, DeviceRegistry};
use crate::device_span;
use crate::error::NavigationError;
use crate::popup::{DismissOutcome, DismissPhase, PopupDismisser};
use crate::recovery::RecoveryEscalator;
use crate::routes::{RouteTable, Transition};
use crate::screen::{Screen, ScreenMarkers};
use crate::stats::StatsTracker;
use crate::timer::{AdaptiveTimer, WaitOutcome};
use crate::vision::Vision;

type NavFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NavigationError>> + Send + 'a>>;

#[derive(Debug, Clone)]
pub struct NavigatorSettings {
    pub max_depth: u32,
    pub verify_retries: u32,
    pub verify_delay: Duration,
    pub step_budget: Duration,
    pub sequence_delay: Duration,
}

impl From<&Config> for NavigatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_depth: config.navigation.max_depth,
            verify_retries: config.navigation.verify_retries,
            verify_delay: config.navigation.verify_delay(),
            step_budget: config.navigation.step_budget(),
            sequence_delay: config.navigation.sequence_delay(),
        }
    }
}

/// Told when a device shows an overlay that navigation cannot clear.
pub trait HaltListener: Send + Sync {
    fn halted(&self, device: &DeviceId, overlay: &str);
}

pub struct Navigator {
    vision: Arc<Vision>,
    classifier: Arc<Classifier>,
    popups: Arc<PopupDismisser>,
    recovery: Arc<RecoveryEscalator>,
    timer: Arc<AdaptiveTimer>,
    routes: Arc<RouteTable>,
    settings: NavigatorSettings,
    halt: Option<Arc<dyn HaltListener>>,
    debug: Option<Arc<DebugCaptures>>,
}

impl Navigator {
    #[must_use]
    pub fn new(
        vision: Arc<Vision>,
        classifier: Arc<Classifier>,
        popups: Arc<PopupDismisser>,
        recovery: Arc<RecoveryEscalator>,
        timer: Arc<AdaptiveTimer>,
        routes: Arc<RouteTable>,
        settings: NavigatorSettings,
    ) -> Self {
        Self {
            vision,
            classifier,
            popups,
            recovery,
            timer,
            routes,
            settings,
            halt: None,
            debug: None,
        }
    }

    #[must_use]
    pub fn with_halt_listener(mut self, listener: Arc<dyn HaltListener>) -> Self {
        self.halt = Some(listener);
        self
    }

    #[must_use]
    pub fn with_debug_captures(mut self, captures: Arc<DebugCaptures>) -> Self {
        self.debug = Some(captures);
        self
    }

    /// Wire up every collaborator from configuration with the built-in
    /// screen markers and popup rules.
    #[must_use]
    pub fn assemble(
        vision: Arc<Vision>,
        registry: Arc<DeviceRegistry>,
        stats: Arc<StatsTracker>,
        routes: RouteTable,
        config: &Config,
    ) -> Self {
        let classifier = Arc::new(Classifier::new(
            Arc::clone(&vision),
            ScreenMarkers::default(),
            config.vision.accept_threshold,
        ));
        let popups = Arc::new(PopupDismisser::with_default_rules(
            Arc::clone(&vision),
            config.navigation.sequence_delay(),
        ));
        let recovery = Arc::new(RecoveryEscalator::new(
            Arc::clone(&vision),
            Arc::clone(&classifier),
            registry,
            config.recovery.clone(),
        ));
        let timer = Arc::new(AdaptiveTimer::new(stats, &config.timing));
        let navigator = Self::new(
            vision,
            classifier,
            popups,
            recovery,
            timer,
            Arc::new(routes),
            NavigatorSettings::from(config),
        );
        match DebugCaptures::from_config(config) {
            Some(captures) => navigator.with_debug_captures(Arc::new(captures)),
            None => navigator,
        }
    }

    #[must_use]
    pub fn classifier(&self) -> &Arc<Classifier> {
        &self.classifier
    }

    #[must_use]
    pub fn timer(&self) -> &Arc<AdaptiveTimer> {
        &self.timer
    }

    #[must_use]
    pub fn recovery(&self) -> &Arc<RecoveryEscalator> {
        &self.recovery
    }

    #[must_use]
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    #[must_use]
    pub fn vision(&self) -> &Arc<Vision> {
        &self.vision
    }

    #[must_use]
    pub fn debug_captures(&self) -> Option<&Arc<DebugCaptures>> {
        self.debug.as_ref()
    }

    async fn capture(&self, device: &DeviceId, label: &str) {
        if let Some(debug) = &self.debug {
            debug.capture(&self.vision, device, label).await;
        }
    }

    /// Drive `device` to `target`.
    pub async fn navigate(
        &self,
        device: &DeviceId,
        target: Screen,
        token: &CancellationToken,
    ) -> Result<(), NavigationError> {
        let span = device_span!("navigate", device = device, to = %target);
        async {
            let mut origin = None;
            let result = self
                .navigate_at(device, target, 0, token, &mut origin)
                .await;
            match &result {
                Ok(()) => info!(from = ?origin, "Arrived"),
                Err(NavigationError::Cancelled) => info!("Navigation cancelled"),
                Err(err) => {
                    let from = origin.map_or("UNKNOWN", Screen::as_str);
                    warn!(from, error = %err, "Navigation failed");
                    self.timer
                        .stats()
                        .record_nav_failure(device, from, target.as_str());
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    /// `navigate` collapsed to a boolean.
    pub async fn navigate_ok(
        &self,
        device: &DeviceId,
        target: Screen,
        token: &CancellationToken,
    ) -> bool {
        self.navigate(device, target, token).await.is_ok()
    }

    fn navigate_at<'a>(
        &'a self,
        device: &'a DeviceId,
        target: Screen,
        depth: u32,
        token: &'a CancellationToken,
        origin: &'a mut Option<Screen>,
    ) -> NavFuture<'a> {
        Box::pin(async move {
            if depth > self.settings.max_depth {
                return Err(NavigationError::DepthExceeded {
                    max: self.settings.max_depth,
                });
            }
            if token.is_cancelled() {
                return Err(NavigationError::Cancelled);
            }

            if let DismissOutcome::Blocked(name) =
                self.popups.dismiss(device, DismissPhase::Pre, token).await?
            {
                if let Some(halt) = &self.halt {
                    halt.halted(device, &name);
                }
                return Err(NavigationError::Blocked(name));
            }

            let mut current = self.classifier.classify_full(device).await?.identity;
            if !current.is_known() {
                self.capture(device, "unknown_screen").await;
                let outcome = self.recovery.recover(device, token).await?;
                if token.is_cancelled() && !outcome.recovered() {
                    return Err(NavigationError::Cancelled);
                }
                if !outcome.recovered() {
                    self.capture(device, "recovery_fail").await;
                    return Err(NavigationError::RecoveryExhausted {
                        best_confidence: outcome.identity.confidence,
                    });
                }
                current = outcome.identity;
            }
            let from = current.screen;
            origin.get_or_insert(from);

            self.popups.dismiss(device, DismissPhase::Post, token).await?;

            if from == target {
                return self.verify(device, target, token).await;
            }

            let waypoints = self
                .routes
                .route(from, target)
                .ok_or(NavigationError::RouteGap { from, to: target })?;
            debug!(depth, from = %from, route = ?waypoints, "Following route");

            let mut at = from;
            for waypoint in waypoints {
                if token.is_cancelled() {
                    return Err(NavigationError::Cancelled);
                }
                let transition = self
                    .routes
                    .edge(at, waypoint)
                    .ok_or(NavigationError::RouteGap { from: at, to: waypoint })?;
                self.perform(device, transition, token).await?;

                let label = format!("nav.{at}->{waypoint}");
                let classifier = &self.classifier;
                let landed = self
                    .timer
                    .wait_until(
                        device,
                        move || classifier.is_on(device, waypoint),
                        self.settings.step_budget,
                        &label,
                        token,
                    )
                    .await;
                match landed {
                    WaitOutcome::Cancelled => return Err(NavigationError::Cancelled),
                    WaitOutcome::TimedOut => {
                        debug!(depth, from = %at, to = %waypoint, "Waypoint not observed; re-routing");
                    }
                    WaitOutcome::Met => {}
                }

                self.navigate_at(device, waypoint, depth + 1, token, &mut *origin)
                    .await?;
                at = waypoint;
            }
            Ok(())
        })
    }

    /// Execute one edge's primitive steps in order.
    async fn perform(
        &self,
        device: &DeviceId,
        transition: &Transition,
        token: &CancellationToken,
    ) -> Result<(), NavigationError> {
        for (i, step) in transition.steps().into_iter().enumerate() {
            if i > 0 && !token.sleep(self.settings.sequence_delay).await {
                return Err(NavigationError::Cancelled);
            }
            match step {
                Transition::TapMarker(marker) => {
                    let found = self.vision.find(device, marker).await?;
                    match (found.found, found.location) {
                        (true, Some(location)) => self.vision.tap(device, location).await?,
                        _ => {
                            self.timer.stats().record_template_miss(
                                device,
                                &marker.name,
                                found.confidence,
                            );
                            return Err(NavigationError::MarkerMissing(marker.name.clone()));
                        }
                    }
                }
                Transition::Tap(point) => self.vision.tap(device, *point).await?,
                Transition::Key(code) => self.vision.key_event(device, *code).await?,
                Transition::Sequence(_) => {}
            }
        }
        Ok(())
    }

    /// Re-classify until the target is confirmed or retries run out.
    async fn verify(
        &self,
        device: &DeviceId,
        target: Screen,
        token: &CancellationToken,
    ) -> Result<(), NavigationError> {
        let mut actual = Screen::Unknown;
        for attempt in 0..=self.settings.verify_retries {
            if attempt > 0 && !token.sleep(self.settings.verify_delay).await {
                return Err(NavigationError::Cancelled);
            }
            actual = self.classifier.classify(device).await?.screen;
            if actual == target {
                return Ok(());
            }
            debug!(attempt, expected = %target, actual = %actual, "Verification mismatch");
        }
        self.capture(device, &format!("verify_fail_{target}")).await;
        Err(NavigationError::VerifyFailed {
            expected: target,
            actual,
        })
    }
}
