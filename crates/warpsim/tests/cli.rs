use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

fn warpsim(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_warpsim"))
        .env("WARPSIM_CONFIG_DIR", root.join("config"))
        .env("WARPSIM_DATA_DIR", root.join("data"))
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("failed to run warpsim")
}

#[test]
fn defaults_write_installs_a_valid_config_once() {
    let root = TempDir::new().unwrap();
    let output = warpsim(root.path(), &["defaults", "write"]);
    assert!(output.status.success());
    let config = root.path().join("config/warpsim.toml");
    assert!(config.exists());

    fs::write(&config, "version = 1\n[display]\nrefresh_hz = 72.0\n").unwrap();
    let output = warpsim(root.path(), &["defaults", "write"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("--force"));
    assert!(fs::read_to_string(&config).unwrap().contains("72.0"));

    let output = warpsim(root.path(), &["check", config.to_str().unwrap()]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("@ 72Hz"));
}

#[test]
fn check_rejects_invalid_config() {
    let root = TempDir::new().unwrap();
    let config = root.path().join("bad.toml");
    fs::write(&config, "version = 1\n[pipeline]\nminimum_vsyncs = 9\n").unwrap();
    let output = warpsim(root.path(), &["check", config.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("minimum_vsyncs"));
}

#[test]
fn simulated_run_writes_a_json_report() {
    let root = TempDir::new().unwrap();
    let report = root.path().join("out/report.json");
    let output = warpsim(
        root.path(),
        &[
            "run",
            "--clock",
            "simulated",
            "--duration",
            "1500ms",
            "--script",
            "200ms=powersave",
            "--report",
            report.to_str().unwrap(),
        ],
    );
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );

    let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(json["topology"], "sync-front-buffer");
    let submissions = json["submissions"].as_u64().unwrap();
    // A second at full rate, then half rate once the power poll sees power save.
    assert!((70..=82).contains(&submissions), "{submissions}");
    assert_eq!(json["notices"], serde_json::json!(["PowerSaveEngaged"]));
    assert_eq!(json["throttle"]["throttled"], true);
    let eye_log = json["warp"]["eye_log"].as_array().unwrap();
    assert!(!eye_log.is_empty());
    assert!(eye_log[0].get("pose_latency_seconds").is_some());
    assert_eq!(eye_log[0]["eye"], "Left");
}
