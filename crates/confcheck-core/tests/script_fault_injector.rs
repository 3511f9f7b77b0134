//! ScriptFaultInjector against spy scripts that record their arguments
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use confcheck_core::config::HarnessConfig;
use confcheck_core::{FaultInjector, FaultInjectorExt, HarnessError, ScriptFaultInjector};
use tempfile::TempDir;

/// Write an executable script that appends its arguments to `calls.log`
fn spy_script(dir: &TempDir, exit_code: i32) -> (PathBuf, PathBuf) {
    let log = dir.path().join("calls.log");
    let script = dir.path().join("firewall.sh");
    let body = format!(
        "#!/bin/sh\necho \"$@\" >> '{}'\necho 'rule engine says no' >&2\nexit {}\n",
        log.display(),
        exit_code
    );
    fs::write(&script, body).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    (script, log)
}

fn recorded_calls(log: &Path) -> Vec<String> {
    fs::read_to_string(log)
        .map(|content| content.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_block_and_clear_invoke_script() {
    let dir = TempDir::new().unwrap();
    let (script, log) = spy_script(&dir, 0);
    let injector = ScriptFaultInjector::new(&script).unwrap();

    assert_eq!(injector.block_port_checked("5000").await.unwrap(), 5000);
    injector.clear_all_rules().await.unwrap();

    assert_eq!(recorded_calls(&log), vec!["--block-port 5000", "--clear-rules"]);
}

#[tokio::test]
async fn test_invalid_port_runs_nothing() {
    let dir = TempDir::new().unwrap();
    let (script, log) = spy_script(&dir, 0);
    let injector = ScriptFaultInjector::new(&script).unwrap();

    for port in ["-1", "65536", "port"] {
        let err = injector.block_port_checked(port).await.unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)), "{}", err);
    }
    assert!(injector.block_port_checked(-1i64).await.is_err());

    assert!(recorded_calls(&log).is_empty());
}

#[tokio::test]
async fn test_non_zero_exit_is_an_external_process_error() {
    let dir = TempDir::new().unwrap();
    let (script, log) = spy_script(&dir, 3);
    let injector = ScriptFaultInjector::new(&script).unwrap();

    let err = injector.block_port(10000).await.unwrap_err();

    match err {
        HarnessError::ExternalProcess { command, status, stderr } => {
            assert!(command.ends_with("--block-port 10000"));
            assert!(status.contains('3'));
            assert_eq!(stderr, "rule engine says no");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(recorded_calls(&log), vec!["--block-port 10000"]);
}

#[tokio::test]
async fn test_injector_from_configuration() {
    let dir = TempDir::new().unwrap();
    let (script, log) = spy_script(&dir, 0);
    let config = HarnessConfig::from_toml_str(&format!(
        "[fault_injection]\nscript_path = '{}'\n",
        script.display()
    ))
    .unwrap();

    let injector = config.fault_injection.injector().unwrap().unwrap();
    assert_eq!(injector.script(), script.as_path());

    injector.clear_all_rules().await.unwrap();
    assert_eq!(recorded_calls(&log), vec!["--clear-rules"]);
}
