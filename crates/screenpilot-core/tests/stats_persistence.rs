//! Learned timing and failure records surviving a restart.

mod common;

use std::time::Duration;

use common::Rig;
use screenpilot_core::cancel::CancellationToken;
use screenpilot_core::screen::Screen;
use screenpilot_core::stats::load_sessions;

#[tokio::test(start_paused = true)]
async fn learned_budget_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let label = "nav.MAP->PROFILE";
    {
        let rig = Rig::persistent(dir.path());
        rig.game.set_latency(Duration::from_millis(300));
        let device = rig.device("d", "MAP");
        let token = CancellationToken::new();
        for _ in 0..12 {
            rig.navigator.navigate(&device, Screen::Profile, &token).await.unwrap();
            rig.navigator.navigate(&device, Screen::Map, &token).await.unwrap();
        }
        assert_eq!(rig.stats.history(label).len(), 12);
        assert!(rig.stats.save().unwrap().is_some());
    }

    let rig = Rig::persistent(dir.path());
    assert_eq!(rig.stats.history(label).len(), 12);
    let nominal = rig.config.navigation.step_budget();
    let budget = rig.navigator.timer().effective_budget(label, nominal);
    assert!(budget < nominal);
    assert!(budget >= nominal.mul_f64(rig.config.timing.floor_fraction));
}

#[tokio::test(start_paused = true)]
async fn navigation_failures_are_persisted_per_device() {
    let dir = tempfile::tempdir().unwrap();
    let rig = Rig::persistent(dir.path());
    let device = rig.device("d", "MAP");
    let token = CancellationToken::new();
    assert!(!rig.navigator.navigate_ok(&device, Screen::TroopDetail, &token).await);
    assert!(!rig.navigator.navigate_ok(&device, Screen::TroopDetail, &token).await);
    rig.stats.save().unwrap();

    let sessions = load_sessions(dir.path());
    assert_eq!(sessions.len(), 1);
    let (_, record) = &sessions[0];
    assert_eq!(record.devices["d"].nav_failures["MAP->TROOP_DETAIL"], 2);
}
