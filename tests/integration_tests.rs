use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use serial_test::serial;

const OVERRIDE_VARS: &[&str] = &[
    "NAVER_CLIENT_ID",
    "NAVER_CLIENT_SECRET",
    "NEWSTOWN_ID",
    "NEWSTOWN_PW",
    "GOOGLE_SHEET_URL",
    "NEWS_DISPLAY_COUNT",
    "NEWS_MAX_WORKERS",
    "UPLOAD_CHECK_INTERVAL",
    "UPLOAD_COMPLETED_COLUMN",
    "DELETE_INTERVAL",
    "DELETE_MAX_COUNT",
];

/// A shepherd invocation isolated under `home`
fn shepherd(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_shepherd"));
    cmd.env("SHEPHERD_HOME", home)
        .env("RUST_LOG", "shepherd=warn")
        .env("SHEPHERD_GRACE_SECS", "3");
    for var in OVERRIDE_VARS {
        cmd.env_remove(var);
    }
    cmd
}

fn run(home: &Path, args: &[&str]) -> Output {
    shepherd(home)
        .args(args)
        .output()
        .expect("Failed to execute shepherd")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

/// Test that status works on a fresh home and reports every worker stopped
#[test]
#[serial]
fn test_status_on_fresh_home() {
    let temp_dir = TempDir::new().unwrap();

    let output = run(temp_dir.path(), &["status"]);
    assert!(output.status.success(), "status failed: {output:?}");

    let reports = stdout_json(&output);
    let reports = reports.as_array().unwrap();
    assert_eq!(reports.len(), 3);
    for report in reports {
        assert_eq!(report["status"], "stopped");
        assert_eq!(report["running"], false);
    }

    // First run also created the config store with defaults
    assert!(temp_dir.path().join("config").join("shepherd.json").exists());
}

/// Test that secrets are masked on show and readable on reveal
#[test]
#[serial]
fn test_config_secrets_are_masked() {
    let temp_dir = TempDir::new().unwrap();
    let home = temp_dir.path();

    let output = run(
        home,
        &["config", "set", "news_collection", "naver_client_secret", "s3cr3t"],
    );
    assert!(output.status.success(), "config set failed: {output:?}");
    assert!(!String::from_utf8_lossy(&output.stdout).contains("s3cr3t"));

    let shown = stdout_json(&run(home, &["config", "show", "news_collection"]));
    assert_eq!(shown["naver_client_secret"], "***MASKED***");
    assert_eq!(shown["display_count"], 30);

    // Echoing the mask back must not overwrite the secret
    let output = run(
        home,
        &["config", "set", "news_collection", "naver_client_secret", "***MASKED***"],
    );
    assert!(output.status.success());

    let revealed = stdout_json(&run(home, &["config", "reveal", "news_collection"]));
    assert_eq!(revealed["naver_client_secret"], "s3cr3t");

    let all = stdout_json(&run(home, &["config", "show"]));
    assert_eq!(all["news_collection"]["naver_client_secret"], "***MASKED***");
    assert!(all.get("upload_monitor").is_some());
}

/// Test that out-of-range values are refused and nothing is written
#[test]
#[serial]
fn test_config_rejects_invalid_values() {
    let temp_dir = TempDir::new().unwrap();
    let home = temp_dir.path();

    for (section, path, value) in [
        ("news_collection", "display_count", "500"),
        ("news_collection", "sort", "popularity"),
        ("row_deletion", "delete_interval", "5"),
        ("news_schedule", "interval_hours", "48"),
    ] {
        let output = run(home, &["config", "set", section, path, value]);
        assert!(!output.status.success(), "{section}.{path}={value} was accepted");
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("\"code\":\"invalid_request\""), "got: {stderr}");
    }

    let news = stdout_json(&run(home, &["config", "show", "news_collection"]));
    assert_eq!(news["display_count"], 30);
    assert_eq!(news["sort"], "date");

    let output = run(home, &["config", "set", "news_schedule", "interval_hours", "6"]);
    assert!(output.status.success(), "config set failed: {output:?}");
    let schedule = stdout_json(&run(home, &["config", "show", "news_schedule"]));
    assert_eq!(schedule["interval_hours"], 6);
    assert_eq!(schedule["enabled"], false);
}

/// Test that stopping a stopped worker fails with a structured error
#[test]
#[serial]
fn test_stop_not_running() {
    let temp_dir = TempDir::new().unwrap();

    let output = run(temp_dir.path(), &["stop", "upload_monitor"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("\"code\":\"not_running\""), "got: {stderr}");

    let output = run(temp_dir.path(), &["stop", "no_such_worker"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("\"code\":\"unknown_worker\""), "got: {stderr}");

    let output = run(temp_dir.path(), &["stop-all"]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output), serde_json::json!([]));
}

/// Test that the tail size is bounded
#[test]
#[serial]
fn test_logs_rejects_bad_line_counts() {
    let temp_dir = TempDir::new().unwrap();

    for lines in ["0", "1001"] {
        let output = run(temp_dir.path(), &["logs", "news_collection", "-n", lines]);
        assert!(!output.status.success());
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains("invalid_request"), "got: {stderr}");
    }

    let output = run(temp_dir.path(), &["logs", "news_collection", "-n", "5"]);
    assert!(output.status.success());
    assert!(output.stdout.is_empty());
}

/// Test that a worker without credentials is never launched
#[test]
#[serial]
fn test_run_refuses_missing_credentials() {
    let temp_dir = TempDir::new().unwrap();

    let output = run(temp_dir.path(), &["run", "news_collection"]);
    assert!(!output.status.success());

    let status = stdout_json(&run(temp_dir.path(), &["status", "news_collection"]));
    assert_eq!(status["status"], "stopped");
    assert!(status["pid"].is_null());
}

/// Test run -> status -> stop across separate control-plane processes
#[cfg(unix)]
#[test]
#[serial]
fn test_stop_from_another_process() {
    let temp_dir = TempDir::new().unwrap();
    let home = temp_dir.path();

    // Stand-in worker: the interpreter is sh, the "script" reads its config and idles
    let scripts = home.join("scripts");
    fs::create_dir_all(&scripts).unwrap();
    fs::write(
        scripts.join("run_row_deletion.py"),
        "read -r config\necho \"got config\"\nsleep 30\n",
    )
    .unwrap();

    let mut supervisor = shepherd(home)
        .env("SHEPHERD_PYTHON", "sh")
        .env("SHEPHERD_SCRIPTS_DIR", &scripts)
        .args(["run", "row_deletion"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to start supervisor");

    let deadline = Instant::now() + Duration::from_secs(15);
    let status = loop {
        let status = stdout_json(&run(home, &["status", "row_deletion"]));
        if status["status"] == "running" || Instant::now() >= deadline {
            break status;
        }
        sleep(Duration::from_millis(200));
    };
    assert_eq!(status["status"], "running");
    assert!(status["pid"].as_u64().is_some());
    assert!(status["runtime"].as_str().unwrap().starts_with("00:"));

    let output = run(home, &["stop", "row_deletion"]);
    assert!(output.status.success(), "stop failed: {output:?}");
    let report = stdout_json(&output);
    assert_eq!(report["status"], "stopped");
    assert_eq!(report["termination"], "graceful");

    // The supervisor notices its only worker is gone and exits cleanly
    let deadline = Instant::now() + Duration::from_secs(15);
    let exit = loop {
        if let Some(exit) = supervisor.try_wait().unwrap() {
            break Some(exit);
        }
        if Instant::now() >= deadline {
            let _ = supervisor.kill();
            break None;
        }
        sleep(Duration::from_millis(200));
    };
    assert!(exit.expect("supervisor did not exit").success());

    let status = stdout_json(&run(home, &["status", "row_deletion"]));
    assert_eq!(status["status"], "stopped");

    let logs = run(home, &["logs", "row_deletion", "-n", "20"]);
    let logs = String::from_utf8_lossy(&logs.stdout);
    assert!(logs.contains("got config"), "got: {logs}");
}
