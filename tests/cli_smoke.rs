use std::process::{Command, Output};

use serde_json::Value;
use tempfile::tempdir;

fn assess(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_assess"))
        .args(args)
        .env_remove("ASSESS_CONFIG")
        .env_remove("REASONING_API_KEY")
        .env("RUST_LOG", "off")
        .output()
        .unwrap()
}

#[test]
fn catalog_lists_baselines_families_and_templates() {
    let out = assess(&["catalog"]);
    assert!(out.status.success());
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.contains("moderate"));
    assert!(stdout.contains("251"));
    assert!(stdout.contains("Access Control"));
    assert!(stdout.contains("cloud_security"));
}

#[test]
fn estimate_prints_scope_and_cost() {
    let out = assess(&["estimate", "--control", "AC-2", "--control", "IA-5", "--mode", "deep"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let body: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(body["controls"], serde_json::json!(["AC-2", "IA-5"]));
    assert_eq!(body["estimate"]["mode"], "deep");
    assert_eq!(body["estimate"]["estimated_tokens"], 16_000);
}

#[test]
fn estimate_honours_config_file_and_scope_json() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("assess.toml");
    std::fs::write(&config, "[estimator.quick]\ntokens_per_control = 300\nseconds_per_control = 0.5\n").unwrap();
    let scope = dir.path().join("scope.json");
    std::fs::write(&scope, r#"{"specific_controls": ["AU-6"], "mode": "quick"}"#).unwrap();

    let out = assess(&[
        "--config",
        config.to_str().unwrap(),
        "estimate",
        "--scope-json",
        scope.to_str().unwrap(),
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let body: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(body["estimate"]["estimated_tokens"], 300);
}

#[test]
fn invalid_scope_and_missing_credentials_fail() {
    let out = assess(&["estimate", "--family", "QQ"]);
    assert!(!out.status.success());

    let dir = tempdir().unwrap();
    let evidence = dir.path().join("policy.txt");
    std::fs::write(&evidence, "AC-2 accounts reviewed").unwrap();
    let out = assess(&["run", "--control", "AC-2", evidence.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("REASONING_API_KEY"));
}
