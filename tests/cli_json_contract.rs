use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn vmpilot_bin() -> String {
    if let Some(path) = option_env!("CARGO_BIN_EXE_vmpilot") {
        return path.to_string();
    }
    std::env::var("CARGO_BIN_EXE_vmpilot")
        .expect("CARGO_BIN_EXE_vmpilot should be set (compile-time or runtime) for integration tests")
}

fn run_command(config_dir: &Path, args: &[&str]) -> Output {
    Command::new(vmpilot_bin())
        .arg("--config-dir")
        .arg(config_dir)
        .args(args)
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to execute vmpilot")
}

fn parse_stdout(args: &[&str], output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    serde_json::from_str::<Value>(&stdout).unwrap_or_else(|error| {
        panic!(
            "stdout should be pure JSON for args `{}`: {error}\nstdout:\n{}\nstderr:\n{}",
            args.join(" "),
            stdout,
            stderr
        )
    })
}

fn run_json_command(config_dir: &Path, args: &[&str]) -> Value {
    let output = run_command(config_dir, args);
    assert!(
        output.status.success(),
        "command failed: {}\nstderr:\n{}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    parse_stdout(args, &output)
}

fn assert_report_contract(json: &Value, expected_report_type: &str) {
    assert_eq!(
        json.get("schema_version").and_then(Value::as_u64),
        Some(1),
        "missing/invalid schema_version: {json}"
    );
    assert_eq!(
        json.get("report_type").and_then(Value::as_str),
        Some(expected_report_type),
        "missing/invalid report_type: {json}"
    );
}

const SUBMIT_FRAME: &str = r#"{
  "frame_id": 4,
  "detections": [
    {"box": {"format": "xyxy", "x1": 5, "y1": 5, "x2": 70, "y2": 35}, "label": "button", "confidence": 0.8},
    {"box": {"format": "xywh", "x": 400, "y": 5, "w": 10, "h": 10}, "label": "icon", "confidence": 0.2}
  ],
  "texts": [
    {"box": {"format": "xywh", "x": 10, "y": 10, "w": 50, "h": 20}, "text": "Submit", "confidence": 0.9},
    {"box": {"format": "xywh", "x": 10, "y": 10, "w": -5, "h": 20}, "text": "broken", "confidence": 0.9}
  ]
}"#;

fn write_fixture(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write fixture");
    path.to_str().expect("fixture path should be valid UTF-8").to_string()
}

#[test]
fn fuse_json_is_parseable_and_has_contract_fields() {
    let tmp = tempdir().expect("tempdir");
    let input = write_fixture(tmp.path(), "frame.json", SUBMIT_FRAME);
    let json = run_json_command(tmp.path(), &["fuse", "--input", &input, "--json"]);
    assert_report_contract(&json, "fuse");
    assert_eq!(json.get("frame_id").and_then(Value::as_u64), Some(4));

    let elements = json
        .get("elements")
        .and_then(Value::as_array)
        .expect("expected elements array");
    assert_eq!(elements.len(), 1, "low-confidence icon should be filtered: {json}");
    assert_eq!(elements[0].get("merged_text").and_then(Value::as_str), Some("Submit"));
    assert_eq!(elements[0].get("role").and_then(Value::as_str), Some("clickable"));
    assert_eq!(json.get("discarded").and_then(Value::as_array).map(Vec::len), Some(1));
    assert_eq!(json.get("filtered").and_then(Value::as_u64), Some(1));
}

#[test]
fn resolve_json_reports_strategy() {
    let tmp = tempdir().expect("tempdir");
    let input = write_fixture(tmp.path(), "frame.json", SUBMIT_FRAME);
    let json = run_json_command(
        tmp.path(),
        &["resolve", "--input", &input, "submit button", "--json"],
    );
    assert_report_contract(&json, "resolve");
    assert_eq!(
        json.get("strategy_used").and_then(Value::as_str),
        Some("exact_text_match")
    );
    assert!(json.get("element").is_some_and(Value::is_object));
}

#[test]
fn check_banner_failure_keeps_stdout_json_and_exits_non_zero() {
    let tmp = tempdir().expect("tempdir");
    let input = write_fixture(tmp.path(), "banner.json", r#"["JOHN DOE", "MRN 999999"]"#);
    let args = [
        "check-banner",
        "--input",
        input.as_str(),
        "--name",
        "John Doe",
        "--mrn",
        "123456",
        "--dob",
        "01/01/1980",
        "--json",
    ];
    let output = run_command(tmp.path(), &args);
    assert!(!output.status.success(), "one matching identifier must fail");

    let json = parse_stdout(&args, &output);
    assert_report_contract(&json, "check_banner");
    assert_eq!(json.get("passed").and_then(Value::as_bool), Some(false));
    assert_eq!(json.get("match_count").and_then(Value::as_u64), Some(1));
    assert_eq!(json.get("required").and_then(Value::as_u64), Some(2));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("John"), "identifier values must not be echoed");
}

#[test]
fn check_banner_passes_with_two_identifiers() {
    let tmp = tempdir().expect("tempdir");
    let input = write_fixture(tmp.path(), "banner.json", r#"["DOE, JOHN", "DOB: 1/1/1980"]"#);
    let json = run_json_command(
        tmp.path(),
        &[
            "check-banner",
            "--input",
            &input,
            "--name",
            "John Doe",
            "--mrn",
            "123456",
            "--dob",
            "01/01/1980",
            "--json",
        ],
    );
    assert_eq!(json.get("passed").and_then(Value::as_bool), Some(true));
    assert_eq!(json["matched_fields"], serde_json::json!(["name", "dob"]));
}

#[test]
fn config_schema_is_pure_json() {
    let tmp = tempdir().expect("tempdir");
    let json = run_json_command(tmp.path(), &["config", "schema"]);
    let properties = json
        .get("properties")
        .and_then(Value::as_object)
        .expect("schema should list properties");
    for key in ["vision", "resolver", "verifier", "safety", "session", "backend"] {
        assert!(properties.contains_key(key), "schema missing '{key}'");
    }
}

#[test]
fn config_init_refuses_to_overwrite_without_force() {
    let tmp = tempdir().expect("tempdir");
    let first = run_command(tmp.path(), &["config", "init"]);
    assert!(first.status.success());
    assert!(tmp.path().join("config.toml").exists());

    let second = run_command(tmp.path(), &["config", "init"]);
    assert!(!second.status.success());

    let forced = run_command(tmp.path(), &["config", "init", "--force"]);
    assert!(forced.status.success());
}

#[test]
fn invalid_config_is_rejected() {
    let tmp = tempdir().expect("tempdir");
    std::fs::write(tmp.path().join("config.toml"), "[safety]\nmin_matches = 1\n").expect("write config");
    let output = run_command(tmp.path(), &["config", "show"]);
    assert!(!output.status.success());
}

#[test]
fn completions_are_stdout_only() {
    let tmp = tempdir().expect("tempdir");
    let output = run_command(tmp.path(), &["completions", "bash"]);
    assert!(output.status.success());
    assert!(output.stderr.is_empty());
    assert!(String::from_utf8_lossy(&output.stdout).contains("vmpilot"));
}
