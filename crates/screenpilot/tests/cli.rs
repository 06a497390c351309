//! CLI contract tests for `sp`.
//!
//! Every test runs against a temp config so the user's real config and
//! stats directory are never read. ADB-backed commands use a scripted fake
//! adb that records its arguments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;
use screenpilot_core::config::StatsConfig;
use screenpilot_core::stats::{BudgetPolicy, SampleOutcome, StatsTracker};
use tempfile::TempDir;

// =============================================================================
// Fixtures
// =============================================================================

/// Temp dir holding a config file with the given TOML body.
fn workspace(config: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("create temp dir");
    let path = dir.path().join("screenpilot.toml");
    std::fs::write(&path, config).expect("write config");
    (dir, path)
}

#[allow(deprecated)]
fn sp(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("sp").expect("sp binary should be built");
    cmd.env("SCREENPILOT_CONFIG", config);
    cmd.env("RUST_LOG", "warn");
    cmd
}

/// Fake adb that appends its argv to `adb.log` and lists one emulator.
#[cfg(unix)]
fn fake_adb(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let log = dir.join("adb.log");
    let script = dir.join("adb");
    let body = format!(
        "#!/bin/sh\necho \"$@\" >> \"{}\"\nif [ \"$1\" = \"devices\" ]; then\n  printf 'List of devices attached\\nemulator-5554\\tdevice\\n127.0.0.1:5555\\tdevice\\n127.0.0.1:5600\\toffline\\n'\nfi\n",
        log.display()
    );
    std::fs::write(&script, body).expect("write fake adb");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fake adb");
    script
}

// =============================================================================
// routes / config
// =============================================================================

#[test]
fn routes_lists_hub_routes() {
    let (_dir, config) = workspace("");
    sp(&config)
        .arg("routes")
        .assert()
        .success()
        .stdout(predicate::str::contains("MAP -> WAR: ALLIANCE > WAR"))
        .stdout(predicate::str::contains("ALLIANCE -> WAR: tap marker war_button"));
}

#[test]
fn routes_json_is_parseable() {
    let (_dir, config) = workspace("");
    let output = sp(&config).args(["routes", "--json"]).output().unwrap();
    assert!(output.status.success());
    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(!doc["edges"].as_array().unwrap().is_empty());
    let map_to_war = doc["routes"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["from"] == "MAP" && r["to"] == "WAR")
        .expect("MAP -> WAR route");
    assert_eq!(map_to_war["waypoints"], serde_json::json!(["ALLIANCE", "WAR"]));
}

#[test]
fn config_show_prints_effective_values() {
    let (_dir, config) = workspace("[timing]\npoll_interval_ms = 200\n");
    sp(&config)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[timing]"))
        .stdout(predicate::str::contains("poll_interval_ms = 200"))
        .stdout(predicate::str::contains("max_depth = 4"));
}

#[test]
fn config_check_accepts_defaults() {
    let (_dir, config) = workspace("");
    sp(&config)
        .args(["config", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config OK"));
}

#[test]
fn invalid_config_fails_with_remediation() {
    let (_dir, config) = workspace("[timing]\nfloor_fraction = 1.5\n");
    sp(&config)
        .args(["config", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("floor_fraction"))
        .stderr(predicate::str::contains("To fix:"))
        .stderr(predicate::str::contains("sp config show"));
}

#[test]
fn missing_config_file_is_reported() {
    let dir = TempDir::new().unwrap();
    sp(&dir.path().join("absent.toml"))
        .arg("routes")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file not found"));
}

// =============================================================================
// stats
// =============================================================================

#[test]
fn stats_on_empty_dir() {
    let (dir, config) = workspace("");
    let stats_dir = dir.path().join("stats");
    sp(&config)
        .args(["stats", "--dir"])
        .arg(&stats_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("No sessions in"));
}

#[test]
fn stats_reports_saved_sessions() {
    let (dir, config) = workspace("");
    let stats_dir = dir.path().join("stats");
    let tracker = StatsTracker::open(&stats_dir, &StatsConfig::default(), BudgetPolicy::default())
        .unwrap();
    for ms in [400, 450, 500] {
        tracker.record_timing("nav.MAP->ALLIANCE", Duration::from_millis(ms), SampleOutcome::Success);
    }
    tracker.record_timing("nav.MAP->ALLIANCE", Duration::from_secs(5), SampleOutcome::Timeout);
    tracker.save().unwrap();

    sp(&config)
        .args(["stats", "--dir"])
        .arg(&stats_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 session(s)"))
        .stdout(predicate::str::contains("nav.MAP->ALLIANCE: 4 waits, 1 timed out, p90 500ms"));

    let output = sp(&config)
        .args(["stats", "--json", "--dir"])
        .arg(&stats_dir)
        .output()
        .unwrap();
    assert!(output.status.success());
    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["timings"]["nav.MAP->ALLIANCE"]["timeouts"], 1);
}

// =============================================================================
// simulate
// =============================================================================

#[test]
fn simulate_prints_inputs_and_arrival() {
    let (_dir, config) = workspace("");
    let output = sp(&config)
        .args(["simulate", "--from", "MAP", "--to", "WAR"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let taps = stdout.lines().filter(|l| l.starts_with("tap ")).count();
    assert_eq!(taps, 2);
    assert!(stdout.ends_with("Arrived at WAR\n"));
}

#[test]
fn simulate_route_gap_fails_with_remediation() {
    let (_dir, config) = workspace("");
    sp(&config)
        .args(["simulate", "--to", "troop_detail"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No route from MAP to TROOP_DETAIL"))
        .stderr(predicate::str::contains("To fix:"));
}

#[test]
fn simulate_rejects_unknown_screen_name() {
    let (_dir, config) = workspace("");
    sp(&config)
        .args(["simulate", "--to", "LOBBY"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown screen"));
}

// =============================================================================
// adb-backed commands
// =============================================================================

#[cfg(unix)]
#[test]
fn devices_lists_ready_emulators_once() {
    let dir = TempDir::new().unwrap();
    let adb = fake_adb(dir.path());
    let config = dir.path().join("screenpilot.toml");
    std::fs::write(&config, format!("[adb]\npath = \"{}\"\n", adb.display())).unwrap();

    let output = sp(&config).arg("devices").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(stdout, "emulator-5554\n");
}

#[cfg(unix)]
#[test]
fn tap_and_key_shell_out_to_adb() {
    let dir = TempDir::new().unwrap();
    let adb = fake_adb(dir.path());
    let config = dir.path().join("screenpilot.toml");
    std::fs::write(&config, format!("[adb]\npath = \"{}\"\n", adb.display())).unwrap();

    sp(&config).args(["tap", "emulator-5554", "540", "80"]).assert().success();
    sp(&config).args(["key", "emulator-5554", "4"]).assert().success();

    let log = std::fs::read_to_string(dir.path().join("adb.log")).unwrap();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(
        lines,
        vec![
            "-s emulator-5554 shell input tap 540 80",
            "-s emulator-5554 shell input keyevent 4",
        ]
    );
}

#[cfg(unix)]
#[test]
fn screenshot_rejects_non_png_output() {
    let dir = TempDir::new().unwrap();
    let adb = fake_adb(dir.path());
    let config = dir.path().join("screenpilot.toml");
    std::fs::write(&config, format!("[adb]\npath = \"{}\"\n", adb.display())).unwrap();

    sp(&config)
        .args(["screenshot", "emulator-5554"])
        .arg(dir.path().join("shot.png"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("without a PNG header"))
        .stderr(predicate::str::contains("To fix:"));
    assert!(!dir.path().join("shot.png").exists());
}
