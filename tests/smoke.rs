//! Smoke tests -- verify the binary runs and key subcommands exist.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("tenantguard")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "Tenant isolation enforcement and security anomaly monitoring",
        ));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("tenantguard")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("tenantguard"));
}

#[test]
fn test_serve_subcommand_exists() {
    Command::cargo_bin("tenantguard")
        .unwrap()
        .args(["serve", "--help"])
        .assert()
        .success();
}

#[test]
fn test_retention_subcommand_exists() {
    Command::cargo_bin("tenantguard")
        .unwrap()
        .args(["retention", "--help"])
        .assert()
        .success();
}

#[test]
fn test_alerts_list_subcommand_exists() {
    Command::cargo_bin("tenantguard")
        .unwrap()
        .args(["alerts", "list", "--help"])
        .assert()
        .success();
}

#[test]
fn test_metrics_subcommand_exists() {
    Command::cargo_bin("tenantguard")
        .unwrap()
        .args(["metrics", "--help"])
        .assert()
        .success();
}

#[test]
fn test_retention_on_empty_database() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("tenantguard.db");
    Command::cargo_bin("tenantguard")
        .unwrap()
        .args(["--db", db.to_str().unwrap(), "retention"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No tenants with stored data."));
}
