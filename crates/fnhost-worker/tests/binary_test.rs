// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drives the real `fnhost-worker` binary over its stdin/stdout.

mod common;

use std::process::Stdio;
use std::time::Duration;

use common::{invoke, reload, shutdown};
use fnhost_protocol::{
    ARTIFACT_FILE, AckResult, Envelope, FunctionEntry, InvokeOutcome, read_frame, write_frame,
};
use serde_json::json;
use tokio::process::Command;

async fn recv<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Envelope {
    let frame = tokio::time::timeout(Duration::from_secs(10), read_frame(reader))
        .await
        .expect("timed out waiting for worker")
        .unwrap();
    Envelope::from_frame(&frame).unwrap()
}

#[tokio::test]
async fn test_worker_binary_serves_over_stdio() {
    let data = tempfile::TempDir::new().unwrap();
    let artifact_dir = data.path().join("hello").join("v1");
    std::fs::create_dir_all(&artifact_dir).unwrap();
    std::fs::write(
        artifact_dir.join(ARTIFACT_FILE),
        serde_json::to_vec(&json!({
            "code": {"runtime": "template", "body": {"message": "hello, {{name}}"}}
        }))
        .unwrap(),
    )
    .unwrap();

    let mut child = Command::new(env!("CARGO_BIN_EXE_fnhost-worker"))
        .env("FNHOST_PROJECT", "demo")
        .env("RUST_LOG", "fnhost_worker=debug")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    let mut stdin = child.stdin.take().unwrap();
    let mut stdout = child.stdout.take().unwrap();

    match recv(&mut stdout).await {
        Envelope::Ready(ready) => {
            assert_eq!(ready.project, "demo");
            assert_eq!(Some(ready.pid), child.id());
        }
        other => panic!("expected Ready, got {:?}", other),
    }

    let functions = vec![FunctionEntry {
        name: "hello".into(),
        artifact_dir,
        env_dir: None,
    }];
    write_frame(&mut stdin, &reload(1, 1, functions).to_frame().unwrap())
        .await
        .unwrap();
    match recv(&mut stdout).await {
        Envelope::ControlAck(ack) => assert_eq!(ack.result, AckResult::Ok),
        other => panic!("expected ack, got {:?}", other),
    }

    write_frame(
        &mut stdin,
        &invoke(2, "hello", json!({"name": "A"})).to_frame().unwrap(),
    )
    .await
    .unwrap();
    match recv(&mut stdout).await {
        Envelope::InvokeResponse(resp) => assert_eq!(
            resp.outcome,
            InvokeOutcome::Success {
                result: json!({"message": "hello, A"})
            }
        ),
        other => panic!("expected response, got {:?}", other),
    }

    write_frame(&mut stdin, &shutdown(3).to_frame().unwrap())
        .await
        .unwrap();
    assert!(matches!(recv(&mut stdout).await, Envelope::ControlAck(_)));

    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_worker_binary_requires_project() {
    let status = Command::new(env!("CARGO_BIN_EXE_fnhost-worker"))
        .env_remove("FNHOST_PROJECT")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .unwrap();
    assert!(!status.success());
}
