//! Static route table.
//!
//! Edges say how to get from one screen to an adjacent one. Routes list the
//! waypoints from a screen to a (possibly distant) target; consecutive
//! waypoints must be joined by edges. A direct edge doubles as a one-hop
//! route when no explicit route is registered.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::screen::Screen;
use crate::vision::{KeyCode, Marker, Point};

/// The in-game back arrow, top-left.
pub const BACK_ARROW: Point = Point::new(75, 75);

/// Action that moves the device across one edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Transition {
    /// Find the marker and tap its center.
    TapMarker(Marker),
    /// Tap a fixed coordinate.
    Tap(Point),
    /// Send a key event.
    Key(KeyCode),
    /// Several primitive steps in order.
    Sequence(Vec<Transition>),
}

impl Transition {
    /// Primitive steps in execution order.
    #[must_use]
    pub fn steps(&self) -> Vec<&Self> {
        match self {
            Self::Sequence(steps) => steps.iter().flat_map(Self::steps).collect(),
            other => vec![other],
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TapMarker(marker) => write!(f, "tap marker {}", marker.name),
            Self::Tap(point) => write!(f, "tap ({}, {})", point.x, point.y),
            Self::Key(code) => write!(f, "key {}", code.0),
            Self::Sequence(steps) => {
                let parts: Vec<String> = steps.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", parts.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    edges: HashMap<(Screen, Screen), Transition>,
    routes: HashMap<(Screen, Screen), Vec<Screen>>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            edges: HashMap::new(),
            routes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_edge(mut self, from: Screen, to: Screen, transition: Transition) -> Self {
        self.edges.insert((from, to), transition);
        self
    }

    #[must_use]
    pub fn with_route(mut self, from: Screen, to: Screen, waypoints: Vec<Screen>) -> Self {
        self.routes.insert((from, to), waypoints);
        self
    }

    pub fn remove_edge(&mut self, from: Screen, to: Screen) -> Option<Transition> {
        self.edges.remove(&(from, to))
    }

    pub fn remove_route(&mut self, from: Screen, to: Screen) -> Option<Vec<Screen>> {
        self.routes.remove(&(from, to))
    }

    #[must_use]
    pub fn edge(&self, from: Screen, to: Screen) -> Option<&Transition> {
        self.edges.get(&(from, to))
    }

    /// Waypoints from `from` to `to`, ending with `to`.
    #[must_use]
    pub fn route(&self, from: Screen, to: Screen) -> Option<Vec<Screen>> {
        if let Some(waypoints) = self.routes.get(&(from, to)) {
            return Some(waypoints.clone());
        }
        self.edges.contains_key(&(from, to)).then(|| vec![to])
    }

    /// Edges sorted by (from, to) for display.
    #[must_use]
    pub fn edges(&self) -> Vec<(Screen, Screen, &Transition)> {
        let sorted: BTreeMap<_, _> = self.edges.iter().collect();
        sorted
            .into_iter()
            .map(|((from, to), transition)| (*from, *to, transition))
            .collect()
    }

    /// Explicit routes sorted by (from, to).
    #[must_use]
    pub fn routes(&self) -> Vec<(Screen, Screen, &[Screen])> {
        let sorted: BTreeMap<_, _> = self.routes.iter().collect();
        sorted
            .into_iter()
            .map(|((from, to), waypoints)| (*from, *to, waypoints.as_slice()))
            .collect()
    }

    /// Structural problems: routes that do not end at their target, routes
    /// through `Unknown`, and consecutive waypoints with no edge.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (from, to, waypoints) in self.routes() {
            if waypoints.last() != Some(&to) {
                problems.push(format!("route {from}->{to} does not end at {to}"));
            }
            if waypoints.contains(&Screen::Unknown) || from == Screen::Unknown {
                problems.push(format!("route {from}->{to} passes through UNKNOWN"));
            }
            let mut prev = from;
            for &next in waypoints {
                if self.edge(prev, next).is_none() {
                    problems.push(format!("route {from}->{to} has no edge {prev}->{next}"));
                }
                prev = next;
            }
        }
        problems
    }
}

impl Default for RouteTable {
    /// The built-in game map.
    ///
    /// MAP is the hub. Every screen with a back edge to MAP reaches any
    /// target through MAP unless a direct edge exists.
    fn default() -> Self {
        let mut table = Self::new()
            .with_edge(
                Screen::Map,
                Screen::BattleList,
                Transition::TapMarker(Marker::new("bl_button")),
            )
            .with_edge(
                Screen::Map,
                Screen::Alliance,
                Transition::TapMarker(Marker::new("alliance_button")),
            )
            .with_edge(
                Screen::Map,
                Screen::Profile,
                Transition::TapMarker(Marker::new("profile_button")),
            )
            .with_edge(
                Screen::Alliance,
                Screen::War,
                Transition::TapMarker(Marker::new("war_button")),
            )
            .with_edge(
                Screen::BattleList,
                Screen::AllianceQuest,
                Transition::Tap(Point::new(300, 1100)),
            )
            .with_edge(
                Screen::BattleList,
                Screen::Territory,
                Transition::Tap(Point::new(316, 1467)),
            )
            .with_edge(
                Screen::TroopDetail,
                Screen::Map,
                Transition::Tap(Point::new(990, 1850)),
            );

        for screen in [
            Screen::BattleList,
            Screen::AllianceQuest,
            Screen::Territory,
            Screen::War,
            Screen::Profile,
            Screen::Alliance,
        ] {
            table = table.with_edge(screen, Screen::Map, Transition::Tap(BACK_ARROW));
        }

        let from_map = [
            (Screen::BattleList, vec![Screen::BattleList]),
            (Screen::AllianceQuest, vec![Screen::BattleList, Screen::AllianceQuest]),
            (Screen::Territory, vec![Screen::BattleList, Screen::Territory]),
            (Screen::Alliance, vec![Screen::Alliance]),
            (Screen::War, vec![Screen::Alliance, Screen::War]),
            (Screen::Profile, vec![Screen::Profile]),
        ];

        for (target, waypoints) in &from_map {
            table = table.with_route(Screen::Map, *target, waypoints.clone());
        }

        for from in Screen::KNOWN {
            if from == Screen::Map || table.edge(from, Screen::Map).is_none() {
                continue;
            }
            for (target, waypoints) in &from_map {
                if *target == from || table.edge(from, *target).is_some() {
                    continue;
                }
                let mut through_map = vec![Screen::Map];
                through_map.extend(waypoints.iter().copied());
                table = table.with_route(from, *target, through_map);
            }
        }

        table
    }
}
