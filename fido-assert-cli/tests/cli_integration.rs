//! CLI integration tests for fido-assert-cli.
//!
//! These tests run the actual binary against simulated devices and check
//! outputs and exit codes.

use assert_cmd::Command;
use predicates::prelude::*;

/// Get a Command for the fido-assert binary.
fn fido_assert() -> Command {
    let mut cmd = Command::cargo_bin("fido-assert").unwrap();
    for var in [
        "FIDO_RACE_DEADLINE_SECS",
        "FIDO_TRANSPORT_RETRIES",
        "FIDO_RETRY_INITIAL_MS",
        "FIDO_RETRY_MAX_MS",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

/// A race subcommand with one allowed credential (c0ffee).
fn race() -> Command {
    let mut cmd = fido_assert();
    cmd.args(["race", "--credential", "c0ffee"]);
    cmd
}

// ============================================================================
// Help and Version Tests
// ============================================================================

#[test]
fn test_help_displays_usage() {
    fido_assert()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("FIDO get-assertion race driver"))
        .stdout(predicate::str::contains("race"))
        .stdout(predicate::str::contains("encode"));
}

#[test]
fn test_version_displays_version() {
    fido_assert()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("fido-assert"));
}

#[test]
fn test_help_shows_exit_codes() {
    fido_assert()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Exit codes:"))
        .stdout(predicate::str::contains("65"))
        .stdout(predicate::str::contains("130"));
}

#[test]
fn test_race_help_shows_device_format() {
    fido_assert()
        .args(["race", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--device"))
        .stdout(predicate::str::contains("NAME=KIND"));
}

#[test]
fn test_unknown_flag_is_usage_error() {
    fido_assert()
        .args(["race", "--no-such-flag"])
        .assert()
        .code(64);
}

// ============================================================================
// Race Outcome Tests
// ============================================================================

#[test]
fn test_race_modern_success() {
    race()
        .args(["--device", "usb-0=modern", "--color=never"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ASSERTION OBTAINED"))
        .stdout(predicate::str::contains("c0ffee"))
        .stdout(predicate::str::contains("\x1b[").not());
}

#[test]
fn test_race_falls_back_to_legacy() {
    race()
        .args(["--device", "usb-0=modern:mismatch:success"])
        .assert()
        .success();
}

#[test]
fn test_race_quiet_prints_nothing() {
    race()
        .args(["--quiet", "--device", "nfc-0=legacy"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_race_json_output() {
    race()
        .args(["--json", "--device", "a=modern", "--device", "b=legacy:timeout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"credential_id\": \"wP_u\""))
        .stdout(predicate::str::contains("\"request_id\""))
        .stdout(predicate::str::contains("\"user_present\": true"));
}

#[test]
fn test_race_no_eligible_device() {
    race()
        .args(["--device", "a=modern:invalid", "--device", "b=legacy:invalid"])
        .assert()
        .code(65)
        .stderr(predicate::str::contains("No eligible device"));
}

#[test]
fn test_race_all_devices_failed() {
    race()
        .args([
            "--device",
            "a=modern:timeout",
            "--device",
            "b=unreachable",
            "--device",
            "c=legacy:invalid",
        ])
        .assert()
        .code(69);
}

#[test]
fn test_race_transport_retry() {
    race()
        .args(["--device", "a=modern:io:success"])
        .assert()
        .code(69);

    race()
        .args(["--retries", "1", "--device", "a=modern:io:success"])
        .env("FIDO_RETRY_INITIAL_MS", "1")
        .assert()
        .success();
}

#[test]
fn test_race_deadline_is_timeout() {
    race()
        .args(["--deadline-secs", "1", "--device", "a=modern:success@10000"])
        .assert()
        .code(75);
}

#[test]
fn test_race_cancel_after() {
    race()
        .args([
            "--cancel-after-ms",
            "50",
            "--device",
            "a=modern:success@10000",
        ])
        .assert()
        .code(130);
}

// ============================================================================
// Usage Error Tests
// ============================================================================

#[test]
fn test_race_bad_device_spec() {
    race()
        .args(["--device", "a=bluetooth"])
        .assert()
        .code(64)
        .stderr(predicate::str::contains("Invalid device spec"));
}

#[test]
fn test_race_without_devices() {
    race()
        .assert()
        .code(64)
        .stderr(predicate::str::contains("no --device given"));
}

#[test]
fn test_race_bad_credential_hex() {
    fido_assert()
        .args(["race", "--credential", "xyz", "--device", "a=modern"])
        .assert()
        .code(64)
        .stderr(predicate::str::contains("Invalid hex"));
}

// ============================================================================
// Encode Tests
// ============================================================================

#[test]
fn test_encode_modern() {
    fido_assert()
        .args(["encode", "--quiet", "--credential", "c0ffee"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("02a3"));
}

#[test]
fn test_encode_legacy_pairs_frames() {
    let output = fido_assert()
        .args([
            "encode",
            "--protocol",
            "legacy",
            "--quiet",
            "--credential",
            "01",
            "--credential",
            "02",
        ])
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let frames: Vec<&str> = stdout.lines().collect();
    assert_eq!(frames.len(), 4);
    assert!(frames[0].starts_with("00020700"));
    assert!(frames[1].starts_with("00020300"));
}

#[test]
fn test_encode_legacy_presence_check() {
    fido_assert()
        .args(["encode", "--protocol", "legacy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("presence check"));
}
