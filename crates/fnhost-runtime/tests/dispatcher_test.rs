// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation routing and admission tests.

mod common;

use std::time::Duration;

use common::*;
use fnhost_runtime::InvokeError;
use serde_json::json;

#[tokio::test]
async fn test_hello() {
    let host = TestHost::new().await;
    host.running("shop", "hello", json!({"message": "hello, {{name}}"}))
        .await;

    let invocation = host
        .dispatcher
        .invoke("shop", "hello", json!({"name": "Ada"}), None)
        .await
        .unwrap();

    assert_eq!(invocation.result, json!({"message": "hello, Ada"}));
    let record = host.supervisor.catalog().function("shop", "hello").unwrap();
    assert_eq!(record.invocations, 1);
}

#[tokio::test]
async fn test_project_not_running() {
    let host = TestHost::new().await;
    host.deploy_template("shop", "hello", json!("hi")).await;

    let err = host
        .dispatcher
        .invoke("shop", "hello", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::ProjectNotRunning(p) if p == "shop"));

    let err = host
        .dispatcher
        .invoke("nowhere", "hello", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::ProjectNotRunning(_)));
}

#[tokio::test]
async fn test_unknown_function() {
    let host = TestHost::new().await;
    host.running("shop", "hello", json!("hi")).await;

    let err = host
        .dispatcher
        .invoke("shop", "goodbye", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        InvokeError::FunctionNotFound { ref function, .. } if function == "goodbye"
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_function_failure_carries_message() {
    let host = TestHost::new().await;
    let request = serde_json::from_value(json!({
        "function": "boom",
        "artifact": {"code": {"runtime": "exec", "source": "#!/bin/sh\necho kaboom >&2\nexit 3\n"}},
    }))
    .unwrap();
    host.deployer.deploy("shop", request).await.unwrap();
    host.supervisor.start_project("shop").await.unwrap();

    let err = host
        .dispatcher
        .invoke("shop", "boom", json!({}), None)
        .await
        .unwrap_err();
    match err {
        InvokeError::FunctionFailed(message) => assert_eq!(message, "kaboom"),
        other => panic!("expected FunctionFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_invocation_timeout() {
    let host = TestHost::new().await;
    host.running("shop", "slow", json!("late")).await;

    let started = tokio::time::Instant::now();
    let err = host
        .dispatcher
        .invoke(
            "shop",
            "slow",
            json!({"sleep_ms": 2000}),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, InvokeError::Timeout));
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_eq!(host.dispatcher.admission().in_flight(), 0);
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn test_ceiling_and_backlog_reject_fourth_caller() {
    let host = TestHost::with(HostOptions {
        max_concurrent: 2,
        backlog: 1,
        ..HostOptions::default()
    })
    .await;
    host.running("shop", "slow", json!("ok")).await;

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let dispatcher = host.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .invoke("shop", "slow", json!({"sleep_ms": 300}), None)
                    .await
            })
        })
        .collect();

    let admission = host.dispatcher.admission().clone();
    assert!(wait_until(|| admission.in_flight() == 2 && admission.waiting() == 1).await);

    let err = host
        .dispatcher
        .invoke("shop", "slow", json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::Overloaded));

    for call in calls {
        let invocation = call.await.unwrap().unwrap();
        assert_eq!(invocation.result, json!("ok"));
    }
    assert_eq!(admission.in_flight(), 0);
    assert_eq!(admission.waiting(), 0);
}

#[tokio::test]
async fn test_backlog_wait_counts_against_timeout() {
    let host = TestHost::with(HostOptions {
        max_concurrent: 1,
        backlog: 4,
        ..HostOptions::default()
    })
    .await;
    host.running("shop", "slow", json!("ok")).await;

    let dispatcher = host.dispatcher.clone();
    let holder = tokio::spawn(async move {
        dispatcher
            .invoke("shop", "slow", json!({"sleep_ms": 1000}), None)
            .await
    });
    let admission = host.dispatcher.admission().clone();
    assert!(wait_until(|| admission.in_flight() == 1).await);

    let err = host
        .dispatcher
        .invoke("shop", "slow", json!({}), Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, InvokeError::Timeout));
    assert_eq!(admission.waiting(), 0);

    assert!(holder.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_concurrent_replies_reach_their_callers() {
    let host = TestHost::with(HostOptions {
        max_concurrent: 64,
        ..HostOptions::default()
    })
    .await;
    host.running("shop", "echo", json!({"i": "{{i}}"})).await;

    let calls: Vec<_> = (0..50u64)
        .map(|i| {
            let dispatcher = host.dispatcher.clone();
            tokio::spawn(async move {
                let payload = json!({"i": i, "sleep_ms": (i * 7) % 30});
                let invocation = dispatcher.invoke("shop", "echo", payload, None).await;
                (i, invocation)
            })
        })
        .collect();

    for call in calls {
        let (i, invocation) = call.await.unwrap();
        assert_eq!(invocation.unwrap().result, json!({"i": i.to_string()}));
    }

    let worker = host.supervisor.running_worker("shop").unwrap();
    assert_eq!(worker.channel().pending_count(), 0);
    assert_eq!(worker.channel().stale_replies(), 0);
    assert_eq!(
        host.supervisor
            .catalog()
            .function("shop", "echo")
            .unwrap()
            .invocations,
        50
    );
}
