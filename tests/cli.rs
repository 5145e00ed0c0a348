use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

fn labprov() -> assert_cmd::Command {
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("labprov").into();
    for var in [
        "OPNSENSE_API_KEY",
        "OPNSENSE_API_SECRET",
        "SMTP_PASSWORD",
        "SERVICE_ACCOUNT_PATH",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn write_config(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
    let config_path = dir.path().join("labprov.toml");
    let mut f = std::fs::File::create(&config_path).unwrap();
    write!(f, "{contents}").unwrap();
    config_path
}

const VALID: &str = r#"
[calendar]
calendar_id = "lab@group.calendar.google.com"
service_account_path = "/etc/labprov/sa.json"

[inventory]
snapshot_name = "clean"

[inventory.user_machines]
student1 = ["lab-vm-1"]
student2 = ["lab-vm-2"]

[wireguard]
enabled = true
server_public_key = "YWJjZGVmZ2hpamtsbW5vcHFyc3R1dnd4eXoxMjM0NTY="
server_endpoint = "vpn.example.com:51820"
allowed_ips = ["10.10.0.0/16"]
client_addresses = ["10.0.0.2/32", "10.0.0.3/32"]
"#;

#[test]
fn help_works() {
    labprov()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Restore booked lab machines"));
}

#[test]
fn missing_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    labprov()
        .args(["--config", dir.path().join("nope.toml").to_str().unwrap(), "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn check_accepts_valid_config() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, VALID);
    labprov()
        .args(["--config", config_path.to_str().unwrap(), "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"))
        .stdout(predicate::str::contains("snapshot:   clean"))
        .stdout(predicate::str::contains("2 client slot(s)"));
}

#[test]
fn check_rejects_bad_server_key() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &dir,
        &VALID.replace("YWJjZGVmZ2hpamtsbW5vcHFyc3R1dnd4eXoxMjM0NTY=", "dG9vIHNob3J0"),
    );
    labprov()
        .args(["--config", config_path.to_str().unwrap(), "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("32-byte"));
}

#[test]
fn check_rejects_short_password() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, "[password]\nlength = 4\n");
    labprov()
        .args(["--config", config_path.to_str().unwrap(), "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("password.length"));
}

#[test]
fn check_warns_without_service_account() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, "");
    labprov()
        .args(["--config", config_path.to_str().unwrap(), "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("snapshot:   <latest>"))
        .stdout(predicate::str::contains("no calendar service account key"));
}

#[test]
fn service_account_from_env_satisfies_check() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_config(&dir, "");
    labprov()
        .env("SERVICE_ACCOUNT_PATH", "/etc/labprov/sa.json")
        .args(["--config", config_path.to_str().unwrap(), "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no calendar service account key").not());
}
