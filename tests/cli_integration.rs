//! Integration tests for the drover binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn drover(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("drover").expect("binary");
    cmd.current_dir(dir)
        .env("NO_COLOR", "1")
        .env("CLICOLOR", "0")
        .env_remove("DROVER_CONFIG")
        .env_remove("DROVER_HEARTBEAT_FILE")
        .env_remove("RUST_LOG");
    cmd
}

const FAST_CONFIG: &str = r#"
jobs_file = "jobs.json"

[supervisor]
workers = 2
stagger = { min_ms = 0, max_ms = 0 }

[pipeline]
pre_delay = { min_ms = 0, max_ms = 0 }
post_delay = { min_ms = 0, max_ms = 0 }

[executor]
command = "sh"
args = ["-c", '''echo '{"initialPoints": 10, "collectedPoints": 2, "completedUnits": ["daily"]}' ''']
"#;

const JOBS: &str = r#"[
    {"id": "alpha", "account": "alpha@example.com"},
    {"id": "beta", "account": "beta@example.com"},
    {"id": "gamma", "account": "gamma@example.com"}
]"#;

fn project(config: &str, jobs: &str) -> TempDir {
    let dir = TempDir::new().expect("temp dir");
    fs::write(dir.path().join("drover.toml"), config).expect("write config");
    fs::write(dir.path().join("jobs.json"), jobs).expect("write jobs");
    dir
}

#[test]
fn test_help_lists_commands() {
    let dir = TempDir::new().expect("temp dir");
    drover(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("ledger"))
        .stdout(predicate::str::contains("Serve one assignment").not());
}

#[test]
fn test_config_show_prints_defaults() {
    let dir = TempDir::new().expect("temp dir");
    drover(dir.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[supervisor]"))
        .stdout(predicate::str::contains("workers = 2"));
}

#[cfg(unix)]
#[test]
fn test_config_check_passes_for_valid_project() {
    let dir = project(FAST_CONFIG, JOBS);
    drover(dir.path())
        .args(["config", "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("3 job(s)"));
}

#[test]
fn test_config_check_reports_missing_executor() {
    let dir = project("", JOBS);
    drover(dir.path())
        .args(["config", "check"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("executor.command is not set"));
}

#[test]
fn test_invalid_config_exit_code() {
    let dir = project("[supervisor]\nworkers = 0\n", JOBS);
    drover(dir.path())
        .arg("run")
        .assert()
        .code(7)
        .stderr(predicate::str::contains("supervisor.workers"));
}

#[test]
fn test_missing_job_file_exit_code() {
    let dir = TempDir::new().expect("temp dir");
    fs::write(dir.path().join("drover.toml"), FAST_CONFIG).expect("write config");
    drover(dir.path())
        .arg("run")
        .assert()
        .code(8)
        .stderr(predicate::str::contains("Failed to load jobs"));
}

#[test]
fn test_ledger_status_and_prune() {
    let dir = TempDir::new().expect("temp dir");
    drover(dir.path())
        .args(["ledger", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no recorded days"));

    let old_day = dir.path().join(".drover/ledger/2020-01-01");
    fs::create_dir_all(&old_day).expect("mkdir");
    fs::write(old_day.join("abc.json"), "{}").expect("write");

    drover(dir.path())
        .args(["ledger", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2020-01-01  1 account(s)"));

    drover(dir.path())
        .args(["ledger", "prune", "--keep-days", "3"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 day(s)"));
    assert!(!old_day.exists());
}

#[cfg(unix)]
#[test]
fn test_run_with_shell_executor() {
    let dir = project(FAST_CONFIG, JOBS);
    let heartbeat = dir.path().join("alive");

    drover(dir.path())
        .arg("run")
        .env("DROVER_HEARTBEAT_FILE", &heartbeat)
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .success()
        .stdout(predicate::str::contains("Run summary"))
        .stdout(predicate::str::contains("Collected: 12"));

    assert!(heartbeat.exists());

    // Every account has today's unit recorded
    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    let day_dir = dir.path().join(".drover/ledger").join(today);
    let entries = fs::read_dir(day_dir).expect("ledger day").count();
    assert!(entries >= 3);
}

#[cfg(unix)]
#[test]
fn test_run_reports_banned_account() {
    let config = FAST_CONFIG.replace(
        r#"args = ["-c", '''echo '{"initialPoints": 10, "collectedPoints": 2, "completedUnits": ["daily"]}' ''']"#,
        r#"args = ["-c", '''if [ "$DROVER_JOB_ID" = beta ]; then echo 'Account has been suspended' >&2; exit 1; fi; echo '{"initialPoints": 1, "collectedPoints": 1}' ''']"#,
    );
    let mut config = config;
    config.push_str("\n[worker]\nhold_on_standby = false\n");
    let dir = project(&config, JOBS);

    drover(dir.path())
        .arg("run")
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .code(3)
        .stdout(predicate::str::contains("BANNED"));
}
