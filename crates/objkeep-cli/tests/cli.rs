use std::fs;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use serde_json::Value;

const OBJECT_ID: &str = "5d7b3a8f6c2e4d1b9a0f8e7d6c5b4a3928171605";

fn objkeep(root: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("objkeep");
    cmd.arg("-C")
        .arg(root)
        .env_remove("OBJKEEP_OBJECTS_ROOT")
        .env_remove("OBJKEEP_REPO_URL")
        .env_remove("OBJKEEP_CACHE_SERVER_URL")
        .env("NO_COLOR", "1");
    cmd
}

fn parse_json(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("valid json")
}

fn seed_store(root: &Path) {
    fs::create_dir_all(root.join(".git").join("objects").join("pack")).expect("objects dir");
}

#[test]
fn help_lists_the_three_verbs() {
    let assert = cargo_bin_cmd!("objkeep").arg("--help").assert().success();
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    for verb in ["run", "download", "watch"] {
        assert!(stdout.contains(verb), "help is missing {verb}: {stdout}");
    }
}

#[test]
fn unknown_task_is_rejected_by_the_parser() {
    let temp = tempfile::tempdir().expect("tempdir");
    objkeep(temp.path())
        .args(["run", "gc"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn missing_store_reports_user_error_with_hint() {
    let temp = tempfile::tempdir().expect("tempdir");
    let assert = objkeep(temp.path())
        .args(["--json", "run", "loose-objects", "--force"])
        .assert()
        .code(1);
    let payload = parse_json(&assert.get_output().stdout);
    assert_eq!(payload["command"], "run");
    assert_eq!(payload["status"], "user-error");
    assert!(payload["details"]["hint"].is_string());
}

#[test]
fn outdated_layout_blocks_maintenance() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed_store(temp.path());
    let metadata = temp.path().join(".git").join("objkeep");
    fs::create_dir_all(&metadata).expect("metadata dir");
    fs::write(metadata.join("disk-layout-version"), "0\n").expect("layout version");

    let assert = objkeep(temp.path())
        .args(["--json", "run", "pack-files"])
        .assert()
        .code(1);
    let payload = parse_json(&assert.get_output().stdout);
    assert!(payload["message"]
        .as_str()
        .is_some_and(|message| message.contains("disk layout")));
}

#[test]
fn download_validates_id_and_server() {
    let temp = tempfile::tempdir().expect("tempdir");
    let assert = objkeep(temp.path())
        .args(["--json", "download", "not-an-id"])
        .assert()
        .code(1);
    assert_eq!(parse_json(&assert.get_output().stdout)["status"], "user-error");

    let assert = objkeep(temp.path())
        .args(["--json", "download", OBJECT_ID, "--source", "file-access"])
        .assert()
        .code(1);
    let payload = parse_json(&assert.get_output().stdout);
    assert_eq!(payload["details"]["object_id"], OBJECT_ID);
}

#[test]
fn watch_stops_on_request() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed_store(temp.path());
    let assert = objkeep(temp.path())
        .env("OBJKEEP_UNATTENDED", "1")
        .args(["--json", "watch"])
        .write_stdin("nonsense\nstop\n")
        .assert()
        .success();
    let payload = parse_json(&assert.get_output().stdout);
    assert_eq!(payload["status"], "ok");
    assert_eq!(payload["details"]["enqueued"], serde_json::json!([]));
    assert_eq!(payload["details"]["rejected"], serde_json::json!(["nonsense"]));
    assert_eq!(payload["details"]["finished"], 0);
    assert_eq!(payload["details"]["timers"], false);
}

#[test]
fn watch_runs_queued_task_before_stopping() {
    let temp = tempfile::tempdir().expect("tempdir");
    seed_store(temp.path());
    let assert = objkeep(temp.path())
        .env("OBJKEEP_UNATTENDED", "1")
        .args(["--json", "watch"])
        .write_stdin("config\nstop\n")
        .assert()
        .success();
    let payload = parse_json(&assert.get_output().stdout);
    assert_eq!(payload["details"]["enqueued"], serde_json::json!(["config"]));
    assert_eq!(payload["details"]["finished"], 1);
}

#[test]
fn bad_configuration_fails_before_dispatch() {
    let temp = tempfile::tempdir().expect("tempdir");
    let assert = objkeep(temp.path())
        .env("OBJKEEP_RETRY_ATTEMPTS", "many")
        .args(["run", "status"])
        .assert()
        .failure();
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("OBJKEEP_RETRY_ATTEMPTS"), "stderr: {stderr}");
}
