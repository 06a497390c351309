//! Navigation running inside managed tasks.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::Rig;
use screenpilot_core::error::TaskError;
use screenpilot_core::screen::Screen;
use screenpilot_core::tasks::{StopOutcome, TaskKind, TaskOutcome, TaskState};
use screenpilot_core::vision::Point;

#[tokio::test(start_paused = true)]
async fn devices_navigate_independently() {
    let rig = Rig::standard();
    let targets = [("a", Screen::War), ("b", Screen::Territory), ("c", Screen::Profile)];
    let mut ids = Vec::new();
    for (id, target) in targets {
        let device = rig.device(id, "MAP");
        let nav = Arc::clone(&rig.navigator);
        let record = rig
            .tasks
            .launch(&device, TaskKind::new("goto"), move |ctx| async move {
                nav.navigate(ctx.device(), target, ctx.token()).await
            })
            .unwrap();
        ids.push(record.id);
    }
    for id in ids {
        let record = rig.tasks.join(id).await.unwrap();
        assert_eq!(record.outcome, Some(TaskOutcome::Completed));
        assert_eq!(record.state, TaskState::Stopped);
    }
    for (id, target) in targets {
        let device = screenpilot_core::device::DeviceId::new(id);
        assert_eq!(rig.game.current(&device).as_deref(), Some(target.as_str()));
        assert!(!rig.registry.lock_for(&device).is_held());
    }
}

#[tokio::test(start_paused = true)]
async fn tasks_on_one_device_never_overlap() {
    let rig = Rig::standard();
    let device = rig.device("d", "MAP");
    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut ids = Vec::new();
    for (kind, target) in [("war", Screen::War), ("profile", Screen::Profile), ("bl", Screen::BattleList)] {
        let nav = Arc::clone(&rig.navigator);
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        let record = rig
            .tasks
            .launch(&device, TaskKind::new(kind), move |ctx| async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let result = nav.navigate(ctx.device(), target, ctx.token()).await;
                active.fetch_sub(1, Ordering::SeqCst);
                result
            })
            .unwrap();
        ids.push(record.id);
    }
    for id in ids {
        let record = rig.tasks.join(id).await.unwrap();
        assert_eq!(record.outcome, Some(TaskOutcome::Completed));
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn conflicting_launch_is_rejected_while_running() {
    let rig = Rig::standard();
    rig.game.set_latency(Duration::from_secs(2));
    let device = rig.device("d", "MAP");
    let nav = Arc::clone(&rig.navigator);
    let first = rig
        .tasks
        .launch(&device, TaskKind::exclusive("quest"), move |ctx| async move {
            nav.navigate(ctx.device(), Screen::AllianceQuest, ctx.token()).await
        })
        .unwrap();

    let err = rig
        .tasks
        .launch(&device, TaskKind::exclusive("war"), |_ctx| async move {
            Ok::<(), String>(())
        })
        .unwrap_err();
    assert!(matches!(err, TaskError::Conflict { .. }));

    let record = rig.tasks.join(first.id).await.unwrap();
    assert_eq!(record.outcome, Some(TaskOutcome::Completed));
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_navigation_at_a_safe_point() {
    let rig = Rig::standard();
    rig.game.set_latency(Duration::from_secs(3));
    let device = rig.device("d", "MAP");
    let nav = Arc::clone(&rig.navigator);
    let record = rig
        .tasks
        .launch(&device, TaskKind::new("goto"), move |ctx| async move {
            nav.navigate(ctx.device(), Screen::War, ctx.token()).await
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(rig.tasks.stop(record.id).unwrap(), StopOutcome::Signaled);
    assert_eq!(rig.tasks.stop(record.id).unwrap(), StopOutcome::AlreadyStopping);

    let done = rig.tasks.join(record.id).await.unwrap();
    assert_eq!(done.state, TaskState::Stopped);
    assert_eq!(done.outcome, Some(TaskOutcome::Cancelled));
    assert_eq!(rig.tasks.stop(record.id).unwrap(), StopOutcome::AlreadyStopped);
    assert_eq!(rig.game.tap_count(&device), 1);
    assert!(!rig.registry.lock_for(&device).is_held());
}

#[tokio::test(start_paused = true)]
async fn navigation_failure_reaches_error_channel() {
    let rig = Rig::standard();
    let mut errors = rig.tasks.errors().unwrap();
    let device = rig.device("d", "MAP");
    let nav = Arc::clone(&rig.navigator);
    let record = rig
        .tasks
        .launch(&device, TaskKind::new("goto"), move |ctx| async move {
            nav.navigate(ctx.device(), Screen::TroopDetail, ctx.token()).await
        })
        .unwrap();

    let failure = errors.recv().await.unwrap();
    assert_eq!(failure.id, record.id);
    assert_eq!(failure.device, device);
    assert_eq!(failure.kind, "goto");
    assert_eq!(failure.error, "No route from MAP to TROOP_DETAIL");
    let done = rig.tasks.join(record.id).await.unwrap();
    assert!(done.outcome.unwrap().is_failure());
}

#[tokio::test]
async fn force_stop_leaves_no_lock_held() {
    let rig = Rig::standard();
    let devices: Vec<_> = ["a", "b", "c"].iter().map(|id| rig.device(id, "MAP")).collect();
    for device in &devices {
        rig.tasks
            .launch(device, TaskKind::exclusive("stuck"), |_ctx| async move {
                std::future::pending::<()>().await;
                Ok::<(), String>(())
            })
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let report = rig.tasks.force_stop_all().await;
    assert_eq!(report.killed.len(), 3);
    assert!(report.unresponsive.is_empty());
    for device in &devices {
        assert!(!rig.registry.lock_for(device).is_held());
        assert_eq!(rig.registry.status(device), None);
    }
    assert!(rig.tasks.live().is_empty());

    let nav = Arc::clone(&rig.navigator);
    let record = rig
        .tasks
        .launch(&devices[0], TaskKind::exclusive("stuck"), move |ctx| async move {
            nav.navigate(ctx.device(), Screen::Profile, ctx.token()).await
        })
        .unwrap();
    let done = tokio::time::timeout(Duration::from_secs(30), rig.tasks.join(record.id))
        .await
        .expect("relaunch blocked")
        .unwrap();
    assert_eq!(done.outcome, Some(TaskOutcome::Completed));
}

#[tokio::test(start_paused = true)]
async fn logged_out_device_stops_its_repeat_tasks() {
    let rig = Rig::standard();
    let device = rig.device("d", "MAP");
    let other = rig.device("e", "MAP");
    let mut ids = Vec::new();
    for (dev, target) in [(&device, Screen::Profile), (&other, Screen::War)] {
        let nav = Arc::clone(&rig.navigator);
        let record = rig
            .tasks
            .repeat(
                dev,
                TaskKind::new("patrol"),
                Duration::from_secs(30),
                Duration::ZERO,
                move |ctx| {
                    let nav = Arc::clone(&nav);
                    async move { nav.navigate(ctx.device(), target, ctx.token()).await }
                },
            )
            .unwrap();
        ids.push(record.id);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(rig.game.current(&device).as_deref(), Some("PROFILE"));
    assert_eq!(rig.game.current(&other).as_deref(), Some("WAR"));

    // The notice appears on the first device while it idles between runs.
    rig.game.show_marker("PROFILE", "attention", Point::new(540, 900));
    let done = rig.tasks.join(ids[0]).await.unwrap();
    assert_eq!(done.outcome, Some(TaskOutcome::Cancelled));
    assert!(rig.tasks.get(ids[1]).unwrap().state.is_live());

    // The blocked run was ended by the stop, so only the first run counts.
    let patrol = &rig.stats.snapshot().devices["d"].actions["patrol"];
    assert_eq!(patrol.attempts, 1);
    assert_eq!(patrol.successes, 1);
    assert_eq!(rig.registry.status(&device), None);

    rig.tasks.stop(ids[1]).unwrap();
    let done = rig.tasks.join(ids[1]).await.unwrap();
    assert_eq!(done.outcome, Some(TaskOutcome::Cancelled));
    assert_eq!(rig.stats.snapshot().devices["e"].actions["patrol"].failures, 0);
}
