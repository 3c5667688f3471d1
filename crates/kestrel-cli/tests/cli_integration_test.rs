//! CLI Integration Tests
//!
//! Runs the `kestrel` binary as a subprocess. Only scenarios that need no
//! external registry are covered here; the memory registry is private to a
//! process, so a `call` against it can only ever find no provider.

use std::process::Command;

fn kestrel() -> Command {
    Command::new(env!("CARGO_BIN_EXE_kestrel"))
}

fn memory_config_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("application.toml"),
        "[rpc]\nretry_strategy = \"noRetry\"\n\n[rpc.registry]\nkind = \"memory\"\n",
    )
    .unwrap();
    dir
}

#[test]
fn test_help_lists_subcommands() {
    let output = kestrel().arg("--help").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("provider"), "{}", stdout);
    assert!(stdout.contains("call"), "{}", stdout);
}

#[test]
fn test_call_without_provider_fails_with_resolve_error() {
    let dir = memory_config_dir();
    let output = kestrel()
        .args(["call", "UserService", "getUser", "--args", "[1]", "--config-dir"])
        .arg(dir.path())
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no provider available for service 'UserService'"), "{}", stderr);
    assert!(output.stdout.is_empty());
}

#[test]
fn test_call_rejects_invalid_args_json() {
    let dir = memory_config_dir();
    let output = kestrel()
        .args(["call", "UserService", "getUser", "--args", "{oops", "--config-dir"])
        .arg(dir.path())
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid JSON in args"));
}

#[test]
fn test_invalid_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("application.toml"), "[rpc]\nserializer = \"xml\"\n").unwrap();

    let output = kestrel()
        .args(["call", "UserService", "getUser", "--config-dir"])
        .arg(dir.path())
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid rpc configuration"));
}
