#![cfg(unix)]

use std::time::Duration;

use cbench_core::ExitKind;
use cbench_proc::ProcSet;

fn sh(script: &str) -> Vec<String> {
    vec!["-c".to_string(), script.to_string()]
}

#[tokio::test]
async fn sighup_terminates_default_handler() {
    let mut set = ProcSet::new()
        .with_poll_interval(Duration::from_millis(20))
        .with_output(Box::new(std::io::sink()));
    set.spawn("sleep", &["30".to_string()], false, true).unwrap();
    set.wait_for(Some(Duration::from_millis(200)), Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(set.exit().unwrap().classify(), ExitKind::Hangup);
    assert!(!set.was_killed());
}

#[tokio::test]
async fn process_ignoring_sighup_is_killed() {
    let mut set = ProcSet::new()
        .with_poll_interval(Duration::from_millis(20))
        .with_output(Box::new(std::io::sink()));
    set.spawn("sh", &sh("trap '' HUP; exec sleep 30"), false, true)
        .unwrap();
    set.wait_for(Some(Duration::from_millis(200)), Some(Duration::from_millis(600)))
        .await
        .unwrap();

    assert_eq!(set.exit().unwrap().classify(), ExitKind::Killed);
    assert!(set.was_killed());
    assert_eq!(set.exit_code(), Some(-9));
}

#[tokio::test]
async fn clean_exit_reports_code() {
    let mut set = ProcSet::new()
        .with_poll_interval(Duration::from_millis(20))
        .with_output(Box::new(std::io::sink()));
    set.spawn("sh", &sh("exit 3"), true, true).unwrap();
    set.wait_for(Some(Duration::from_secs(5)), Some(Duration::from_secs(10)))
        .await
        .unwrap();

    assert_eq!(set.exit_code(), Some(3));
    assert!(!set.any_killed());
}

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let mut set = ProcSet::new();
    let err = set
        .spawn("/nonexistent/cbench-binary", &[], false, true)
        .unwrap_err();
    assert!(err.to_string().contains("failed to spawn"));
}
