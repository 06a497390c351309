//! screenpilot-core: Core library for screenpilot
//!
//! This crate provides the perception-action control loop used to drive a
//! visually rendered application on one or more emulator devices.
//!
//! # Architecture
//!
//! ```text
//! TaskManager ──► DeviceLock ──► Navigator ──► Classifier / PopupDismisser
//!                                    │                 │
//!                                    ▼                 ▼
//!                           RecoveryEscalator       Vision (provider + transport)
//!                                    │
//!                                    ▼
//!                             AdaptiveTimer ◄──► StatsTracker (persisted)
//! ```
//!
//! # Modules
//!
//! - `vision`: Capability provider and transport traits, reconnect-and-retry boundary,
//!   blocking-pool dispatch
//! - `adb`: ADB transport and device discovery
//! - `screen`: Screen identities and marker registry
//! - `classifier`: Screen classification
//! - `popup`: PRE/POST popup dismissal
//! - `routes`: Static route table
//! - `navigator`: Route-following state machine
//! - `recovery`: Escalating recovery ladder
//! - `timer`: Adaptive poll-until-true waits
//! - `stats`: Timing history, adaptive budgets, session persistence
//! - `tasks`: Task launch, cooperative stop, forced stop
//! - `device`: Per-device registry (locks, status strings, partial matches)
//! - `device_lock`: Per-device mutual exclusion with forced release
//! - `cancel`: Cancellation tokens and cancellable sleeps
//! - `debug_capture`: Bounded failure screenshots
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//! - `testing`: Scripted fake device world for tests and dry runs
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod adb;
pub mod cancel;
pub mod classifier;
pub mod config;
pub mod debug_capture;
pub mod device;
pub mod device_lock;
pub mod error;
pub mod logging;
pub mod navigator;
pub mod popup;
pub mod recovery;
pub mod routes;
pub mod screen;
pub mod stats;
pub mod tasks;
pub mod testing;
pub mod timer;
pub mod vision;

pub use error::{Error, Result};

/// Version of the screenpilot-core library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
