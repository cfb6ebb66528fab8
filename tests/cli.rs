use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn relay() -> Command {
    let mut cmd = Command::cargo_bin("quota-relay").unwrap();
    for (key, _) in std::env::vars() {
        if key.starts_with("QUOTA_RELAY_") {
            cmd.env_remove(key);
        }
    }
    cmd
}

#[test]
fn test_cli_version() {
    relay()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("quota-relay 0.1.0"));
}

#[test]
fn test_cli_help() {
    relay()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Rate-limited request/response relay over a durable queue",
        ));
}

#[test]
fn test_cli_invoke_missing_url() {
    relay()
        .arg("invoke")
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "required arguments were not provided",
        ));
}

#[test]
fn test_cli_check_config_defaults() {
    let dir = TempDir::new().unwrap();
    relay()
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("[listener]"))
        .stdout(predicate::str::contains("max_frame_size = 1048576"));
}

#[test]
fn test_cli_check_config_rejects_invalid() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("relay.toml");
    std::fs::write(&path, "[admission]\njitter = 3.0\n").unwrap();

    relay()
        .arg("--config")
        .arg(&path)
        .arg("check-config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("jitter"));
}

#[test]
fn test_cli_buckets_empty_store() {
    let dir = TempDir::new().unwrap();
    relay()
        .env("QUOTA_RELAY_DATABASE_PATH", dir.path().join("buckets.db"))
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .arg("buckets")
        .assert()
        .success()
        .stdout(predicate::str::contains("No buckets recorded"));
}

#[test]
fn test_cli_invoke_rejects_bad_header() {
    let dir = TempDir::new().unwrap();
    relay()
        .env("QUOTA_RELAY_DATABASE_PATH", dir.path().join("buckets.db"))
        .env("QUOTA_RELAY_BIND_ADDRESS", "127.0.0.1:0")
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .args(["invoke", "--url", "https://api.test/users/1", "--header", "no-colon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected NAME:VALUE"));
}
