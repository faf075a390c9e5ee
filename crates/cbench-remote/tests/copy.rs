use std::sync::Arc;

use cbench_core::Node;
use cbench_remote::{LocalTransport, MemorySink, RemoteCopier, RemoteError};

fn copier() -> RemoteCopier {
    RemoteCopier::new(Arc::new(LocalTransport), Arc::new(MemorySink::new()))
}

fn nodes() -> Vec<Node> {
    vec![Node::new("meru", "n01", 1), Node::new("meru", "n02", 1)]
}

#[tokio::test]
async fn pushes_local_file_into_remote_directory() {
    let src_dir = tempfile::tempdir().unwrap();
    let dst_dir = tempfile::tempdir().unwrap();
    let src = src_dir.path().join("serverip.txt");
    std::fs::write(&src, "n01:6666:6667\n").unwrap();

    let specs = vec![
        src.display().to_string(),
        format!("remote:{}/", dst_dir.path().display()),
    ];
    let report = copier().copy(&nodes(), &specs).await.unwrap();

    assert_eq!(report.copied, 2);
    assert_eq!(report.summary_code(), 0);
    let copied = std::fs::read_to_string(dst_dir.path().join("serverip.txt")).unwrap();
    assert_eq!(copied, "n01:6666:6667\n");
}

#[tokio::test]
async fn retrieves_templated_remote_files() {
    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    for i in 1..=2 {
        std::fs::write(remote.path().join(format!("trace-{i:04}.txt")), format!("trace {i}")).unwrap();
    }

    let specs = vec![
        format!("remote:{}/trace-{{node:04}}.txt", remote.path().display()),
        local.path().display().to_string(),
    ];
    let report = copier().copy(&nodes(), &specs).await.unwrap();

    assert_eq!(report.copied, 2);
    for i in 1..=2 {
        let got = std::fs::read_to_string(local.path().join(format!("trace-{i:04}.txt"))).unwrap();
        assert_eq!(got, format!("trace {i}"));
    }
}

#[tokio::test]
async fn missing_source_is_reported_per_node() {
    let dir = tempfile::tempdir().unwrap();
    let specs = vec![
        "remote:/nonexistent/cbench/trace.txt".to_string(),
        format!("{}/", dir.path().display()),
    ];
    let report = copier().copy(&nodes(), &specs).await.unwrap();

    assert_eq!(report.copied, 0);
    assert_eq!(report.failures.len(), 2);
    assert_eq!(report.failures[0].label, "meru@n01");
    assert_eq!(report.summary_code(), -1);
}

#[tokio::test]
async fn needs_source_and_destination() {
    let err = copier().copy(&nodes(), &["only".to_string()]).await.unwrap_err();
    assert_eq!(err, RemoteError::MissingCopyOperands);
}
