#![cfg(feature = "cli")]

use std::path::PathBuf;
use std::process::Command;

fn streamplex() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_streamplex"));
    command.env_remove("STREAMPLEX_FORCE_BASE64");
    command.arg("--log-level").arg("error");
    command
}

fn temp_file(tag: &str, data: &[u8]) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "streamplex-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::write(&path, data).expect("temp file should be writable");
    path
}

fn json_stdout(output: &std::process::Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).expect("stdout should be one json document")
}

#[test]
fn echo_reports_matching_bytes() {
    let output = streamplex()
        .args(["--format", "json", "echo", "--data", "foobar", "--streams", "2"])
        .output()
        .expect("echo should run");

    assert!(output.status.success());
    let report = json_stdout(&output);
    assert_eq!(report["matched"], true);
    assert_eq!(report["bytes_sent"], 12);
    assert_eq!(report["bytes_echoed"], 12);
    assert_eq!(report["open_streams"], 0);
}

#[test]
fn echo_raw_prints_payload() {
    let output = streamplex()
        .args(["--format", "raw", "echo", "--data", "abc", "--repeat", "3"])
        .output()
        .expect("echo should run");

    assert!(output.status.success());
    assert_eq!(output.stdout, b"abcabcabc");
}

#[test]
fn force_base64_from_env() {
    let output = streamplex()
        .env("STREAMPLEX_FORCE_BASE64", "true")
        .args(["--format", "json", "echo"])
        .output()
        .expect("echo should run");

    assert!(output.status.success());
    assert_eq!(json_stdout(&output)["base64"], true);
}

#[test]
fn zero_streams_is_a_usage_error() {
    let output = streamplex()
        .args(["echo", "--streams", "0"])
        .output()
        .expect("echo should run");

    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn transfer_verifies_file_contents() {
    let data: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let path = temp_file("transfer", &data);

    let output = streamplex()
        .args(["--format", "json", "transfer"])
        .arg(&path)
        .output()
        .expect("transfer should run");

    assert!(output.status.success());
    let report = json_stdout(&output);
    assert_eq!(report["matched"], true);
    assert_eq!(report["bytes_echoed"], 100_000);
    assert_eq!(report["digest_sent"], report["digest_echoed"]);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn transfer_missing_file_fails() {
    let output = streamplex()
        .args(["transfer", "/nonexistent/streamplex-input.bin"])
        .output()
        .expect("transfer should run");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("open failed"));
}

#[test]
fn version_prints_package_version() {
    let output = streamplex()
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("streamplex {}", env!("CARGO_PKG_VERSION")));
}
