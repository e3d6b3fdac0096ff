//! Integration tests for the parmap CLI

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Command running in `dir` with no user config and no PARMAP_* variables
fn parmap(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("parmap").unwrap();
    cmd.current_dir(dir.path()).env("HOME", dir.path());
    for var in ["PARMAP_MODE", "PARMAP_CPUS", "PARMAP_LEVEL", "PARMAP_LOGGING", "PARMAP_STORAGE_DIR"] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_cli_help() {
    let dir = TempDir::new().unwrap();
    parmap(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("parallel map"));
}

#[test]
fn test_cli_version() {
    let dir = TempDir::new().unwrap();
    parmap(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("parmap"));
}

#[test]
fn test_invalid_subcommand() {
    let dir = TempDir::new().unwrap();
    parmap(&dir)
        .arg("invalid-command")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_config_show_merges_repo_file() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("parmap.toml"), "mode = \"socket\"\ncpus = 3\n").unwrap();

    parmap(&dir)
        .args(["config", "show", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"socket\""))
        .stdout(predicate::str::contains("\"cpus\": 3"));
}

#[test]
fn test_environment_overrides_files() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("parmap.toml"), "mode = \"socket\"\n").unwrap();

    parmap(&dir)
        .env("PARMAP_MODE", "mpi")
        .args(["config", "show", "--format", "yaml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("mode: mpi"));
}

#[test]
fn test_config_validate() {
    let dir = TempDir::new().unwrap();
    parmap(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_config_validate_rejects_conflicts() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("conflict.yaml");
    fs::write(&config, "mode: local\ncpus: 2\n").unwrap();

    parmap(&dir)
        .args(["config", "validate", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("cpus must not be set in local mode"));
}

#[test]
fn test_missing_custom_config() {
    let dir = TempDir::new().unwrap();
    parmap(&dir)
        .args(["config", "show", "--config", "nope.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("config file not found"));
}

#[test]
fn test_levels_lists_demo_level() {
    let dir = TempDir::new().unwrap();
    parmap(&dir)
        .arg("levels")
        .assert()
        .success()
        .stdout(predicate::str::contains("parmap.demo"));

    parmap(&dir)
        .args(["levels", "--owner", "someone-else", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("parmap.demo").not());
}

#[test]
fn test_demo_runs_in_parallel() {
    let dir = TempDir::new().unwrap();
    parmap(&dir)
        .args(["demo", "--mode", "multiprocess", "--cpus", "2", "--count", "5", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"mode\": \"multiprocess\""))
        .stdout(predicate::str::contains("\"parallel\": true"));
}

#[test]
fn test_demo_is_reproducible_with_seed() {
    let dir = TempDir::new().unwrap();
    let run = || {
        let output = parmap(&dir)
            .args(["demo", "--mode", "socket", "--cpus", "3", "--seed", "7", "--format", "json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        String::from_utf8(output.stdout).unwrap()
    };

    let first = run();
    assert_eq!(first, run());
    assert!(first.contains("\"seed\": 7"));
}

#[test]
fn test_demo_toml_output_with_large_seed() {
    let dir = TempDir::new().unwrap();
    parmap(&dir)
        .args(["demo", "--mode", "socket", "--cpus", "2", "--count", "3"])
        .args(["--seed", "18446744073709551615", "--format", "toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("seed = \"18446744073709551615\""));
}

#[test]
fn test_demo_level_gating() {
    let dir = TempDir::new().unwrap();
    parmap(&dir)
        .args(["demo", "--mode", "multiprocess", "--cpus", "2", "--level", "other.level"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ran sequentially"))
        .stderr(predicate::str::contains("not registered"));
}

#[test]
fn test_demo_batch_queue_cleans_up_registry() {
    let dir = TempDir::new().unwrap();
    let storage = dir.path().join("storage");
    fs::create_dir(&storage).unwrap();

    parmap(&dir)
        .args(["demo", "--mode", "batchqueue", "--cpus", "2", "--count", "4", "--storage-dir"])
        .arg(&storage)
        .assert()
        .success();

    let leftovers = fs::read_dir(&storage)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("parallelMap_reg_"))
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn test_demo_writes_logs() {
    let dir = TempDir::new().unwrap();
    parmap(&dir)
        .args(["demo", "--mode", "socket", "--cpus", "2", "--count", "3", "--logging"])
        .assert()
        .success();

    let log = fs::read_to_string(dir.path().join("parallelMap_log_1").join("2.log")).unwrap();
    assert!(log.starts_with("element 2 drew "));
}

#[test]
fn test_demo_rejects_local_logging() {
    let dir = TempDir::new().unwrap();
    parmap(&dir)
        .args(["demo", "--mode", "local", "--logging"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("logging is not supported in local mode"));
}
