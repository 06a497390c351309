//! Shared test infrastructure for screenpilot-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::Rig;
//! ```

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use screenpilot_core::config::Config;
use screenpilot_core::device::{DeviceId, DeviceRegistry};
use screenpilot_core::navigator::{HaltListener, Navigator};
use screenpilot_core::routes::RouteTable;
use screenpilot_core::stats::{BudgetPolicy, StatsTracker};
use screenpilot_core::tasks::TaskManager;
use screenpilot_core::testing::FakeGame;

/// A fully wired control loop over a fake game.
pub struct Rig {
    pub game: Arc<FakeGame>,
    pub registry: Arc<DeviceRegistry>,
    pub stats: Arc<StatsTracker>,
    pub navigator: Arc<Navigator>,
    pub tasks: Arc<TaskManager>,
    pub config: Config,
}

impl Rig {
    /// Standard world and route table, in-memory stats.
    pub fn standard() -> Self {
        Self::with(FakeGame::standard(), RouteTable::default(), Config::default())
    }

    pub fn with(game: Arc<FakeGame>, routes: RouteTable, config: Config) -> Self {
        let stats = Arc::new(StatsTracker::in_memory(
            &config.stats,
            BudgetPolicy::from(&config.timing),
        ));
        Self::assemble(game, routes, config, stats)
    }

    /// Standard world with stats persisted under `dir`.
    pub fn persistent(dir: &Path) -> Self {
        let config = Config::default();
        let stats = Arc::new(
            StatsTracker::open(dir, &config.stats, BudgetPolicy::from(&config.timing))
                .expect("open stats"),
        );
        Self::assemble(FakeGame::standard(), RouteTable::default(), config, stats)
    }

    fn assemble(
        game: Arc<FakeGame>,
        routes: RouteTable,
        config: Config,
        stats: Arc<StatsTracker>,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let tasks = Arc::new(
            TaskManager::new(Arc::clone(&registry), config.tasks.clone())
                .with_stats(Arc::clone(&stats)),
        );
        let navigator = Arc::new(
            Navigator::assemble(
                game.vision(),
                Arc::clone(&registry),
                Arc::clone(&stats),
                routes,
                &config,
            )
            .with_halt_listener(Arc::clone(&tasks) as Arc<dyn HaltListener>),
        );
        Self {
            game,
            registry,
            stats,
            navigator,
            tasks,
            config,
        }
    }

    /// A device placed on `label`.
    pub fn device(&self, id: &str, label: &str) -> DeviceId {
        let device = DeviceId::new(id);
        self.game.place(&device, label);
        device
    }
}
