//! CLI tests for the objectstore binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn objectstore(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("objectstore").unwrap();
    cmd.current_dir(dir.path()).arg("--dir").arg(dir.path().join("stores"));
    cmd
}

#[test]
fn test_put_then_get() {
    let temp = TempDir::new().unwrap();

    objectstore(&temp)
        .args(["put", "prefs", r#"{"theme":"dark","size":12}"#])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stored"));

    assert!(temp.path().join("stores").join("prefs.obj").exists());

    objectstore(&temp)
        .args(["get", "prefs", "--compact"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#"{"size":12,"theme":"dark"}"#));
}

#[test]
fn test_get_missing_fails() {
    let temp = TempDir::new().unwrap();

    objectstore(&temp)
        .args(["get", "nothing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No value stored"));
}

#[test]
fn test_put_rejects_invalid_json() {
    let temp = TempDir::new().unwrap();

    objectstore(&temp)
        .args(["put", "prefs", "{not json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("valid JSON"));
}

#[test]
fn test_clear_and_list() {
    let temp = TempDir::new().unwrap();

    objectstore(&temp).args(["put", "alpha", "1"]).assert().success();
    objectstore(&temp).args(["put", "beta", "[1,2]"]).assert().success();

    objectstore(&temp)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("alpha").and(predicate::str::contains("beta")));

    objectstore(&temp).args(["clear", "alpha"]).assert().success();

    objectstore(&temp)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("alpha").not().and(predicate::str::contains("beta")));
}

#[test]
fn test_info_reports_files() {
    let temp = TempDir::new().unwrap();
    objectstore(&temp).args(["put", "prefs", "true"]).assert().success();

    objectstore(&temp)
        .args(["info", "prefs"])
        .assert()
        .success()
        .stdout(predicate::str::contains("prefs.obj").and(predicate::str::contains("Temp:")));
}
