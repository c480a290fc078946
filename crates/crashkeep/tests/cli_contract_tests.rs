//! CLI command contract tests for `ck`.
//!
//! Each test runs the binary against a temp record directory and a config
//! file pinned through `CRASHKEEP_CONFIG`, so the user's own config never
//! leaks in.
//!
//! Contract guarantees tested:
//! - Deterministic exit codes
//! - Stable JSON shape in `--format json` mode
//! - Actionable error messages for failure paths

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test fixture helpers
// =============================================================================

struct Workspace {
    _tmp: TempDir,
    config: PathBuf,
    logs: PathBuf,
}

/// Temp workspace with a quiet config pointing at `<tmp>/logs`.
fn setup_workspace() -> Workspace {
    setup_workspace_with("")
}

fn setup_workspace_with(extra: &str) -> Workspace {
    let tmp = TempDir::new().expect("create temp dir");
    let logs = tmp.path().join("logs");
    fs::create_dir_all(&logs).expect("create logs dir");
    let config = tmp.path().join("crashkeep.toml");
    let body = format!(
        "[storage]\nlog_dir = {logs:?}\n\n[dispatch]\ngrace_period_ms = 0\n\n[logging]\nlevel = \"warn\"\n{extra}",
        logs = logs.display().to_string(),
    );
    fs::write(&config, body).expect("write config");
    Workspace {
        _tmp: tmp,
        config,
        logs,
    }
}

fn write_fixture(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).expect("write fixture");
    path
}

fn ck_cmd(ws: &Workspace) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("ck").expect("ck binary");
    cmd.env("CRASHKEEP_CONFIG", &ws.config);
    cmd.env_remove("RUST_LOG");
    cmd.timeout(Duration::from_secs(30));
    cmd
}

fn stdout_json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not JSON ({e}):\n{}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

/// Answer `statuses.len()` HTTP requests, one per connection, returning the
/// collector URL. Bodies received are sent back on the channel.
fn fake_collector(statuses: Vec<u16>) -> (String, std::sync::mpsc::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let url = format!("http://{}/crashes", listener.local_addr().expect("addr"));
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        for status in statuses {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(stream);
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 || line == "\r\n" {
                    break;
                }
                if let Some(v) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = v.trim().parse().unwrap_or(0);
                }
            }
            let mut body = vec![0; content_length];
            if reader.read_exact(&mut body).is_err() {
                return;
            }
            let _ = tx.send(body);
            let mut stream = reader.into_inner();
            let _ = write!(
                stream,
                "HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
            );
        }
    });
    (url, rx)
}

// =============================================================================
// help / unknown
// =============================================================================

#[test]
fn help_lists_commands() {
    let ws = setup_workspace();
    ck_cmd(&ws)
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("list")
                .and(predicate::str::contains("show"))
                .and(predicate::str::contains("sweep"))
                .and(predicate::str::contains("upload"))
                .and(predicate::str::contains("demo-crash")),
        );
}

#[test]
fn unknown_subcommand_fails() {
    let ws = setup_workspace();
    ck_cmd(&ws).arg("explode").assert().failure();
}

#[test]
fn missing_config_file_fails_with_remediation() {
    let ws = setup_workspace();
    ck_cmd(&ws)
        .env("CRASHKEEP_CONFIG", ws.logs.join("absent.toml"))
        .arg("list")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Config file not found").and(predicate::str::contains("ck config")));
}

// =============================================================================
// list
// =============================================================================

#[test]
fn list_empty_plain() {
    let ws = setup_workspace();
    ck_cmd(&ws)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No crash records"));
}

#[test]
fn list_populated_newest_first() {
    let ws = setup_workspace();
    write_fixture(&ws.logs, "crash_1700000000000.log", "older");
    write_fixture(&ws.logs, "crash_1700000005000.log", "newer");
    write_fixture(&ws.logs, "notes.txt", "ignored");

    let output = ck_cmd(&ws).arg("list").output().expect("run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let newer = stdout.find("crash_1700000005000.log").expect("newer listed");
    let older = stdout.find("crash_1700000000000.log").expect("older listed");
    assert!(newer < older, "{stdout}");
    assert!(!stdout.contains("notes.txt"));
}

#[test]
fn list_json_respects_limit() {
    let ws = setup_workspace();
    for i in 0..5 {
        write_fixture(&ws.logs, &format!("crash_170000000000{i}.log"), "x");
    }
    let output = ck_cmd(&ws)
        .args(["--format", "json", "list", "--limit", "3"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let json = stdout_json(&output);
    let records = json.as_array().expect("array");
    assert_eq!(records.len(), 3);
    assert_eq!(records[0]["id"]["millis"], 1_700_000_000_004u64);
    assert!(records[0]["path"].as_str().unwrap().ends_with(".log"));
}

#[test]
fn dir_flag_overrides_config() {
    let ws = setup_workspace();
    let other = ws.logs.parent().unwrap().join("elsewhere");
    fs::create_dir_all(&other).unwrap();
    write_fixture(&other, "crash_42.log", "x");

    ck_cmd(&ws)
        .arg("--dir")
        .arg(&other)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("crash_42.log"));
}

// =============================================================================
// show
// =============================================================================

#[test]
fn show_latest_prints_content() {
    let ws = setup_workspace();
    write_fixture(&ws.logs, "crash_1.log", "first record\n");
    write_fixture(&ws.logs, "crash_2.log", "second record\n");

    ck_cmd(&ws)
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("second record"));
    ck_cmd(&ws)
        .args(["show", "crash_1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("first record"));
}

#[test]
fn show_json_includes_content_and_name() {
    let ws = setup_workspace();
    write_fixture(&ws.logs, "crash_7.log", "body");
    let output = ck_cmd(&ws)
        .args(["--format", "json", "show", "crash_7.log"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["name"], "crash_7.log");
    assert_eq!(json["content"], "body");
    assert_eq!(json["len"], 4);
}

#[test]
fn show_missing_fails_with_hint() {
    let ws = setup_workspace();
    ck_cmd(&ws)
        .args(["show", "crash_999.log"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no crash record matching").and(predicate::str::contains("ck list")));
}

// =============================================================================
// sweep
// =============================================================================

#[test]
fn sweep_deletes_only_expired_records() {
    let ws = setup_workspace();
    let old = write_fixture(&ws.logs, "crash_1.log", "old");
    let fresh = write_fixture(&ws.logs, "crash_2.log", "fresh");
    File::options()
        .write(true)
        .open(&old)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(10 * 86_400))
        .unwrap();

    let output = ck_cmd(&ws)
        .args(["--format", "json", "sweep", "--max-age-days", "7"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["scanned"], 2);
    assert_eq!(json["deleted"].as_array().unwrap().len(), 1);
    assert!(!old.exists());
    assert!(fresh.exists());
}

#[test]
fn sweep_zero_days_is_disabled() {
    let ws = setup_workspace();
    let record = write_fixture(&ws.logs, "crash_1.log", "x");
    ck_cmd(&ws)
        .args(["sweep", "--max-age-days", "0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("retention disabled"));
    assert!(record.exists());
}

// =============================================================================
// config
// =============================================================================

#[test]
fn config_prints_effective_toml() {
    let ws = setup_workspace();
    let output = ck_cmd(&ws).arg("config").output().expect("run");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("[storage]"));
    assert!(stdout.contains("retention_days = 7"));
    assert!(stdout.contains("grace_period_ms = 0"));
    assert!(stdout.contains(&ws.logs.display().to_string()));
}

#[test]
fn invalid_config_value_is_rejected() {
    let ws = setup_workspace_with("\n[general]\napp_name = \"\"\n");
    ck_cmd(&ws)
        .arg("config")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid config value"));
}

// =============================================================================
// upload
// =============================================================================

#[test]
fn upload_ships_and_deletes_records() {
    let ws = setup_workspace();
    write_fixture(&ws.logs, "crash_1.log", "first");
    write_fixture(&ws.logs, "crash_2.log", "second");
    let (url, bodies) = fake_collector(vec![200, 200]);

    let output = ck_cmd(&ws)
        .args(["--format", "json", "upload", "--endpoint", &url])
        .output()
        .expect("run");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let json = stdout_json(&output);
    assert_eq!(json["succeeded"], 2);
    assert_eq!(json["deleted"], 2);

    // Oldest first.
    assert_eq!(bodies.recv_timeout(Duration::from_secs(5)).unwrap(), b"first");
    assert_eq!(bodies.recv_timeout(Duration::from_secs(5)).unwrap(), b"second");
    assert_eq!(fs::read_dir(&ws.logs).unwrap().count(), 0);
}

#[test]
fn upload_rejection_keeps_record_and_fails() {
    let ws = setup_workspace();
    let record = write_fixture(&ws.logs, "crash_1.log", "kept");
    let (url, _bodies) = fake_collector(vec![500]);

    ck_cmd(&ws)
        .args(["upload", "--endpoint", &url])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("upload(s) failed"));
    assert!(record.exists());
}

#[test]
fn upload_without_endpoint_fails() {
    let ws = setup_workspace();
    ck_cmd(&ws)
        .arg("upload")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no upload endpoint"));
}

// =============================================================================
// demo-crash
// =============================================================================

#[test]
fn demo_crash_writes_record_and_exits_101() {
    let ws = setup_workspace();
    ck_cmd(&ws)
        .args(["demo-crash", "--thread"])
        .assert()
        .code(101);

    let records: Vec<_> = fs::read_dir(&ws.logs)
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.path())
        .collect();
    assert_eq!(records.len(), 1, "{records:?}");
    let text = fs::read_to_string(&records[0]).unwrap();
    assert!(text.contains("========== Crash Report =========="));
    assert!(text.contains("demo crash requested from ck"));
    assert!(text.contains("Thread: ck-demo"));
}

#[test]
fn demo_crash_oom_terminates_without_record() {
    let ws = setup_workspace();
    ck_cmd(&ws).args(["demo-crash", "--oom"]).assert().code(101);
    assert_eq!(fs::read_dir(&ws.logs).unwrap().count(), 0);
}
