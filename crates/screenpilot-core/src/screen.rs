//! Screen identities and the screen-marker registry.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::vision::Marker;

/// The fixed set of screens the classifier can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Screen {
    Map,
    BattleList,
    AllianceQuest,
    TroopDetail,
    Territory,
    War,
    Profile,
    Alliance,
    Unknown,
}

impl Screen {
    /// Every identifiable screen, excluding `Unknown`.
    pub const KNOWN: [Self; 8] = [
        Self::Map,
        Self::BattleList,
        Self::AllianceQuest,
        Self::TroopDetail,
        Self::Territory,
        Self::War,
        Self::Profile,
        Self::Alliance,
    ];

    #[must_use]
    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Map => "MAP",
            Self::BattleList => "BATTLE_LIST",
            Self::AllianceQuest => "ALLIANCE_QUEST",
            Self::TroopDetail => "TROOP_DETAIL",
            Self::Territory => "TERRITORY",
            Self::War => "WAR",
            Self::Profile => "PROFILE",
            Self::Alliance => "ALLIANCE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Name of the marker that identifies this screen.
    #[must_use]
    pub fn marker_name(self) -> &'static str {
        match self {
            Self::Map => "map_screen",
            Self::BattleList => "bl_screen",
            Self::AllianceQuest => "aq_screen",
            Self::TroopDetail => "td_screen",
            Self::Territory => "territory_screen",
            Self::War => "war_screen",
            Self::Profile => "profile_screen",
            Self::Alliance => "alliance_screen",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Screen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Screen {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace(['-', ' '], "_");
        Self::KNOWN
            .into_iter()
            .chain(std::iter::once(Self::Unknown))
            .find(|screen| screen.as_str() == normalized)
            .ok_or_else(|| format!("unknown screen: {s}"))
    }
}

/// A classification result: the screen plus the confidence that produced it.
///
/// For `Unknown`, `confidence` is the best sub-threshold score observed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenIdentity {
    pub screen: Screen,
    pub confidence: f64,
}

impl ScreenIdentity {
    #[must_use]
    pub fn new(screen: Screen, confidence: f64) -> Self {
        Self { screen, confidence }
    }

    #[must_use]
    pub fn unknown(best_confidence: f64) -> Self {
        Self::new(Screen::Unknown, best_confidence)
    }

    #[must_use]
    pub fn is_known(&self) -> bool {
        self.screen.is_known()
    }
}

impl fmt::Display for ScreenIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.2})", self.screen, self.confidence)
    }
}

/// The markers the classifier evaluates, one or more per screen.
#[derive(Debug, Clone)]
pub struct ScreenMarkers {
    entries: Vec<(Screen, Marker)>,
}

impl ScreenMarkers {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register an additional marker for `screen`.
    #[must_use]
    pub fn with(mut self, screen: Screen, marker: Marker) -> Self {
        self.entries.push((screen, marker));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Screen, Marker)> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ScreenMarkers {
    /// One full-screen marker per known screen, named by [`Screen::marker_name`].
    fn default() -> Self {
        Screen::KNOWN.into_iter().fold(Self::empty(), |markers, screen| {
            markers.with(screen, Marker::new(screen.marker_name()))
        })
    }
}
