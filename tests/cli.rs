// Runs the compiled binary against a throwaway store; each invocation is a
// separate process, so these also cover restore-on-start.

use assert_cmd::Command;
use std::path::Path;
use tempfile::TempDir;

fn popout(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("popout").unwrap();
    cmd.arg("--config")
        .arg(dir.join("config.json"))
        .arg("--store")
        .arg(dir.join("state").join("snapshots.db"));
    cmd
}

fn stdout(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).unwrap()
}

#[test]
fn start_is_idempotent_across_processes() {
    let dir = TempDir::new().unwrap();
    let first = stdout(popout(dir.path()).arg("start"));
    assert!(first.starts_with("started session session_"));

    let second = stdout(popout(dir.path()).arg("start"));
    assert!(second.contains("already running"));
}

#[test]
fn clicks_survive_between_invocations() {
    let dir = TempDir::new().unwrap();
    let trial = stdout(popout(dir.path()).args(["trial", "milk", "--items", "12"]));
    assert!(trial.starts_with("task_"));

    stdout(popout(dir.path()).args(["click", "bread", "-x", "3", "-y", "4"]));
    let hit = stdout(popout(dir.path()).args([
        "click",
        "milk",
        "--correct",
        "--product-name",
        "Whole milk",
    ]));
    assert!(hit.starts_with("click 2 on milk (trial 1)"));

    let stats = stdout(popout(dir.path()).args(["stats", "--json"]));
    let stats: serde_json::Value = serde_json::from_str(&stats).unwrap();
    assert_eq!(stats["total_clicks"], 2);
    assert_eq!(stats["total_correct"], 1);
    assert_eq!(stats["accuracy_percent"], 50.0);
    assert_eq!(stats["completed_trials"], 1);

    let csv = stdout(popout(dir.path()).args(["export", "--stdout"]));
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("trial,target_id,product_name,field_name"));
    assert!(lines[1].starts_with("1,bread,,,1,"));
    assert!(lines[2].starts_with("1,milk,Whole milk,,2,"));
}

#[test]
fn export_writes_named_file() {
    let dir = TempDir::new().unwrap();
    let out = dir.path().join("exports");
    stdout(popout(dir.path()).args(["click", "a", "--correct"]));

    let msg = stdout(popout(dir.path()).arg("export").arg("--out").arg(&out));
    assert!(msg.starts_with("wrote 1 rows to"));

    let files: Vec<String> = std::fs::read_dir(&out)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with("popout_experiment_session_"));
    assert!(files[0].ends_with(".csv"));
}

#[test]
fn empty_batch_export_is_refused_without_failing() {
    let dir = TempDir::new().unwrap();
    let assert = popout(dir.path())
        .args(["--mode", "batch", "export", "--stdout"])
        .assert()
        .success();
    let stderr = String::from_utf8(assert.get_output().stderr.clone()).unwrap();
    assert!(stderr.contains("nothing to export"));
    assert!(assert.get_output().stdout.is_empty());
}

#[test]
fn reset_replaces_the_session() {
    let dir = TempDir::new().unwrap();
    stdout(popout(dir.path()).arg("start"));
    stdout(popout(dir.path()).args(["click", "a"]));

    let reset = stdout(popout(dir.path()).arg("reset"));
    let id = reset.trim().trim_start_matches("new session ").to_string();

    let stats = stdout(popout(dir.path()).arg("stats"));
    assert!(stats.contains(&id));
    assert!(stats.contains("clicks            0"));
}

#[test]
fn trial_needs_a_target() {
    let dir = TempDir::new().unwrap();
    popout(dir.path()).arg("trial").assert().failure();
}

#[test]
fn single_mode_trial_accepts_any_listed_target() {
    let dir = TempDir::new().unwrap();
    stdout(popout(dir.path()).args(["trial", "milk", "oat-milk"]));
    stdout(popout(dir.path()).args(["click", "oat-milk", "--correct"]));

    let stats = stdout(popout(dir.path()).args(["stats", "--json"]));
    let stats: serde_json::Value = serde_json::from_str(&stats).unwrap();
    assert_eq!(stats["completed_trials"], 1);
    assert_eq!(stats["total_correct"], 1);

    let help = stdout(popout(dir.path()).args(["trial", "--help"]));
    assert!(help.contains("in single mode"));
}
