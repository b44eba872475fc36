use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn ossxfer() -> Command {
    let mut cmd = Command::cargo_bin("ossxfer").unwrap();
    cmd.env_remove("OSSXFER_CONFIG").env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_help_lists_commands() {
    ossxfer()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("upload"))
        .stdout(predicate::str::contains("download"))
        .stdout(predicate::str::contains("copy"));
}

#[test]
fn test_config_validate_accepts_valid_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[endpoint]
url = "http://127.0.0.1:9000"
access_key_id = "ak"
secret_access_key = "sk"
"#,
    );

    ossxfer()
        .args(["config", "validate", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Valid configuration"));
}

#[test]
fn test_config_validate_rejects_missing_credentials() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[endpoint]
url = "http://127.0.0.1:9000"
"#,
    );

    ossxfer()
        .args(["config", "validate", "--config"])
        .arg(&path)
        .assert()
        .failure();
}

#[test]
fn test_config_show_masks_access_key() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[endpoint]
url = "http://127.0.0.1:9000"
access_key_id = "AKIAEXAMPLEKEY"
secret_access_key = "topsecret"

[transfer]
parallel_num = 6
"#,
    );

    ossxfer()
        .args(["config", "show", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("AKIA****"))
        .stdout(predicate::str::contains("Parallel: 6"))
        .stdout(predicate::str::contains("topsecret").not());
}

#[test]
fn test_missing_config_fails() {
    let dir = TempDir::new().unwrap();
    ossxfer()
        .args(["config", "show", "--config"])
        .arg(dir.path().join("absent.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_upload_rejects_bad_target() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[endpoint]
url = "http://127.0.0.1:9000"
access_key_id = "ak"
secret_access_key = "sk"
"#,
    );
    let file = dir.path().join("data.bin");
    std::fs::write(&file, b"hello").unwrap();

    ossxfer()
        .args(["upload", "--no-progress", "--config"])
        .arg(&path)
        .arg(&file)
        .arg("just-a-bucket")
        .assert()
        .failure()
        .stderr(predicate::str::contains("<bucket>/<key>"));
}

#[test]
fn test_completion_bash() {
    ossxfer()
        .args(["completion", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ossxfer"));
}
