use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn trials_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("trials");
    path
}

/// A config whose registry is unreachable, so retrieval always fails fast.
fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(config_dir.join("keywords")).unwrap();
    fs::write(
        config_dir.join("keywords/conditions.txt"),
        "diabetes:Endocrine\ninsulin:Endocrine\nlung cancer:Oncology\nasthma\n",
    )
    .unwrap();
    fs::write(
        config_dir.join("keywords/genetic.json"),
        r#"{"Genetic": ["BRCA1", "gene therapy"]}"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/trials.sqlite"

[registry]
base_url = "http://127.0.0.1:9/api/v2/studies"
max_retries = 0
retry_backoff_ms = 0
timeout_secs = 2

[[classification.lists]]
column = "condition_group"
path = "keywords/conditions.txt"
unmatched = "OTHER"

[[classification.lists]]
column = "genetic"
path = "keywords/genetic.json"

[output]
dir = "{root}/output"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("trials.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_trials(config_path: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    let binary = trials_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run trials binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

#[test]
fn test_init_creates_ledger() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_trials(&config_path, &["init"]);
    assert_eq!(code, Some(0), "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/trials.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_trials(&config_path, &["init"]);
    assert_eq!(first, Some(0), "First init failed");

    let (_, _, second) = run_trials(&config_path, &["init"]);
    assert_eq!(second, Some(0), "Second init failed (not idempotent)");
}

#[test]
fn test_check_reports_lists() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_trials(&config_path, &["check"]);
    assert_eq!(code, Some(0), "check failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("condition_group"));
    assert!(stdout.contains("genetic"));
    assert!(stdout.contains("cursor: none"));
    assert!(stdout.contains("countTotal=true"));
    assert!(stdout.trim_end().ends_with("ok"));
    // check never creates the ledger
    assert!(!tmp.path().join("data/trials.sqlite").exists());
}

#[test]
fn test_check_missing_keyword_file_exits_2() {
    let (tmp, config_path) = setup_test_env();
    fs::remove_file(tmp.path().join("config/keywords/genetic.json")).unwrap();

    let (_, stderr, code) = run_trials(&config_path, &["check"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains("configuration"));
    assert!(stderr.contains("genetic.json"));
}

#[test]
fn test_missing_config_exits_2() {
    let tmp = TempDir::new().unwrap();
    let (_, _, code) = run_trials(&tmp.path().join("absent.toml"), &["check"]);
    assert_eq!(code, Some(2));
}

#[test]
fn test_unreachable_registry_exits_3_without_output() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_trials(&config_path, &["run", "--as-of", "2024-06-01"]);
    assert_eq!(code, Some(3), "stdout={}, stderr={}", stdout, stderr);
    assert!(stderr.contains("retrieval"));
    assert!(stderr.contains("0/? pages complete"));

    let output_dir = tmp.path().join("output");
    let written = output_dir.exists() && fs::read_dir(&output_dir).unwrap().next().is_some();
    assert!(!written, "a failed run must not leave output files");

    let (stdout, _, code) = run_trials(&config_path, &["cursor", "show"]);
    assert_eq!(code, Some(0));
    assert_eq!(stdout.trim(), "none");
}

#[test]
fn test_future_as_of_rejected_without_cursor() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, code) = run_trials(&config_path, &["run", "--as-of", "2999-01-01"]);
    assert_eq!(code, Some(2), "stderr={}", stderr);
    assert!(stderr.contains("after today"));

    let (stdout, _, code) = run_trials(&config_path, &["cursor", "show"]);
    assert_eq!(code, Some(0));
    assert_eq!(stdout.trim(), "none");
}

#[test]
fn test_full_and_since_conflict() {
    let (_tmp, config_path) = setup_test_env();
    let (_, _, code) = run_trials(&config_path, &["run", "--full", "--since", "2024-01-01"]);
    assert_ne!(code, Some(0));
}

#[test]
fn test_cursor_reset_and_stats() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, code) = run_trials(&config_path, &["cursor", "reset"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("no cursor stored"));

    let (stdout, stderr, code) = run_trials(&config_path, &["stats"]);
    assert_eq!(code, Some(0), "stats failed: {}", stderr);
    assert!(stdout.contains("Cursor:      none"));
}

#[test]
fn test_failed_run_is_recorded_in_stats() {
    let (_tmp, config_path) = setup_test_env();

    run_trials(&config_path, &["run", "--full", "--as-of", "2024-06-01"]);
    let (stdout, _, code) = run_trials(&config_path, &["stats"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("failed"));
    assert!(stdout.contains("retrieval"));
}
