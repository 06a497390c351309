//! Popup dismissal around classification.
//!
//! PRE rules run before classifying and target overlays that would otherwise
//! be mistaken for a screen. POST rules run once a screen is known and clear
//! benign overlays layered over it. Each phase walks a bounded rule list and
//! stops at the first marker found on screen.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cancel::{CancelExt, CancellationToken};
use crate::device::DeviceId;
use crate::error::TransportError;
use crate::vision::{KeyCode, Marker, Point, Vision};

/// Upper bound on rules per phase.
pub const MAX_RULES_PER_PHASE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DismissPhase {
    Pre,
    Post,
}

impl fmt::Display for DismissPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pre => f.write_str("pre"),
            Self::Post => f.write_str("post"),
        }
    }
}

/// What to do once a rule's marker is found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DismissAction {
    /// Tap the detected marker itself.
    TapMarker,
    /// Tap a fixed coordinate.
    Tap(Point),
    /// Send the back key.
    Back,
    /// The overlay cannot be dismissed (e.g. session logged out).
    Halt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DismissRule {
    pub marker: Marker,
    pub action: DismissAction,
}

impl DismissRule {
    #[must_use]
    pub fn new(marker: Marker, action: DismissAction) -> Self {
        Self { marker, action }
    }
}

/// Result of one dismissal phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DismissOutcome {
    /// No rule matched.
    Clear,
    /// The named overlay was dismissed.
    Dismissed(String),
    /// A halting overlay is on screen.
    Blocked(String),
}

pub struct PopupDismisser {
    vision: Arc<Vision>,
    pre: Arc<[DismissRule]>,
    post: Arc<[DismissRule]>,
    settle: Duration,
}

impl PopupDismisser {
    #[must_use]
    pub fn new(
        vision: Arc<Vision>,
        mut pre: Vec<DismissRule>,
        mut post: Vec<DismissRule>,
        settle: Duration,
    ) -> Self {
        for (phase, rules) in [("pre", &mut pre), ("post", &mut post)] {
            if rules.len() > MAX_RULES_PER_PHASE {
                warn!(phase, count = rules.len(), "Too many dismiss rules; truncating");
                rules.truncate(MAX_RULES_PER_PHASE);
            }
        }
        Self {
            vision,
            pre: pre.into(),
            post: post.into(),
            settle,
        }
    }

    /// Dismisser with the built-in rule lists.
    #[must_use]
    pub fn with_default_rules(vision: Arc<Vision>, settle: Duration) -> Self {
        Self::new(vision, default_pre_rules(), default_post_rules(), settle)
    }

    #[must_use]
    pub fn rules(&self, phase: DismissPhase) -> &[DismissRule] {
        match phase {
            DismissPhase::Pre => &self.pre,
            DismissPhase::Post => &self.post,
        }
    }

    fn shared_rules(&self, phase: DismissPhase) -> Arc<[DismissRule]> {
        match phase {
            DismissPhase::Pre => Arc::clone(&self.pre),
            DismissPhase::Post => Arc::clone(&self.post),
        }
    }

    /// Run one phase. Absence of any overlay is `Ok(DismissOutcome::Clear)`.
    pub async fn dismiss(
        &self,
        device: &DeviceId,
        phase: DismissPhase,
        token: &CancellationToken,
    ) -> Result<DismissOutcome, TransportError> {
        let rules = self.shared_rules(phase);
        if rules.is_empty() {
            return Ok(DismissOutcome::Clear);
        }

        let owned = device.clone();
        let hit = self
            .vision
            .run(device, "dismiss", move |io| {
                let image = io.screenshot(&owned)?;
                for (index, rule) in rules.iter().enumerate() {
                    let found = io.locate(&image, &rule.marker)?;
                    if found.found {
                        return Ok(Some((index, found.location)));
                    }
                }
                Ok(None)
            })
            .await?;
        let Some((index, location)) = hit else {
            return Ok(DismissOutcome::Clear);
        };

        let rule = &self.rules(phase)[index];
        let name = rule.marker.name.clone();
        match &rule.action {
            DismissAction::Halt => {
                warn!(device = %device, %phase, overlay = %name, "Blocking overlay detected");
                return Ok(DismissOutcome::Blocked(name));
            }
            DismissAction::TapMarker => {
                if let Some(location) = location {
                    self.vision.tap(device, location).await?;
                }
            }
            DismissAction::Tap(point) => self.vision.tap(device, *point).await?,
            DismissAction::Back => self.vision.key_event(device, KeyCode::BACK).await?,
        }
        info!(device = %device, %phase, overlay = %name, "Dismissed overlay");
        token.sleep(self.settle).await;
        Ok(DismissOutcome::Dismissed(name))
    }
}

/// Logged-out notice: cannot be cleared by tapping, halts navigation.
#[must_use]
pub fn default_pre_rules() -> Vec<DismissRule> {
    vec![
        DismissRule::new(Marker::new("attention"), DismissAction::Halt),
        DismissRule::new(
            Marker::new("reward_popup_close").with_threshold(0.75),
            DismissAction::TapMarker,
        ),
    ]
}

#[must_use]
pub fn default_post_rules() -> Vec<DismissRule> {
    vec![DismissRule::new(
        Marker::new("event_banner_close").with_threshold(0.75),
        DismissAction::TapMarker,
    )]
}
