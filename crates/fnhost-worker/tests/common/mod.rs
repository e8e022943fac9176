// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for worker integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fnhost_protocol::{
    ControlCommand, ControlKind, Envelope, FunctionEntry, InvokeRequest, read_frame, write_frame,
};
use fnhost_worker::{FunctionHandler, FunctionLoader, LoadError, WorkerConfig, WorkerRuntime};
use serde_json::{Value, json};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

/// Handler answering `{"marker": <artifact dir name>, "echo": <payload>}`
/// after sleeping `payload.sleep_ms` milliseconds.
pub struct MarkerHandler {
    marker: String,
}

#[async_trait]
impl FunctionHandler for MarkerHandler {
    async fn call(&self, payload: Value) -> Result<Value, String> {
        if let Some(ms) = payload.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if payload.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err("asked to fail".to_string());
        }
        Ok(json!({"marker": self.marker, "echo": payload}))
    }
}

/// Loader that needs no files: the marker is the artifact directory's name.
/// Entries named `broken` fail to load.
pub struct MarkerLoader;

#[async_trait]
impl FunctionLoader for MarkerLoader {
    async fn load(&self, entry: &FunctionEntry) -> Result<Arc<dyn FunctionHandler>, LoadError> {
        if entry.name == "broken" {
            return Err(LoadError::MissingEntry(entry.artifact_dir.clone()));
        }
        let marker = entry
            .artifact_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Arc::new(MarkerHandler { marker }))
    }
}

/// [`MarkerLoader`] that takes `delay` to load any entry whose artifact
/// directory is named `slow_marker`.
pub struct SlowMarkerLoader {
    pub slow_marker: String,
    pub delay: Duration,
}

#[async_trait]
impl FunctionLoader for SlowMarkerLoader {
    async fn load(&self, entry: &FunctionEntry) -> Result<Arc<dyn FunctionHandler>, LoadError> {
        if entry.artifact_dir.file_name() == Some(std::ffi::OsStr::new(&self.slow_marker)) {
            tokio::time::sleep(self.delay).await;
        }
        MarkerLoader.load(entry).await
    }
}

pub fn entry(name: &str, dir: &str) -> FunctionEntry {
    FunctionEntry {
        name: name.to_string(),
        artifact_dir: PathBuf::from(dir),
        env_dir: None,
    }
}

pub fn reload(correlation_id: u64, version: u64, functions: Vec<FunctionEntry>) -> Envelope {
    Envelope::ControlCommand(ControlCommand {
        correlation_id,
        kind: ControlKind::Reload,
        version,
        functions,
    })
}

pub fn shutdown(correlation_id: u64) -> Envelope {
    Envelope::ControlCommand(ControlCommand {
        correlation_id,
        kind: ControlKind::Shutdown,
        version: 0,
        functions: vec![],
    })
}

pub fn invoke(correlation_id: u64, function: &str, payload: Value) -> Envelope {
    invoke_with_deadline(correlation_id, function, payload, Duration::from_secs(10))
}

pub fn invoke_with_deadline(
    correlation_id: u64,
    function: &str,
    payload: Value,
    within: Duration,
) -> Envelope {
    let now = Utc::now();
    Envelope::InvokeRequest(InvokeRequest {
        correlation_id,
        function: function.to_string(),
        payload,
        issued_at: now,
        deadline: now + chrono::Duration::from_std(within).unwrap(),
    })
}

/// A worker runtime served over an in-memory pipe, seen from the master end.
pub struct TestWorker {
    pub runtime: Arc<WorkerRuntime>,
    pub reader: ReadHalf<DuplexStream>,
    pub writer: WriteHalf<DuplexStream>,
    pub handle: JoinHandle<fnhost_worker::error::Result<()>>,
}

impl TestWorker {
    pub fn spawn(config: WorkerConfig) -> Self {
        Self::spawn_with_loader(config, Arc::new(MarkerLoader))
    }

    pub fn spawn_with_loader(config: WorkerConfig, loader: Arc<dyn FunctionLoader>) -> Self {
        let (master, worker) = tokio::io::duplex(1024 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker);
        let (reader, writer) = tokio::io::split(master);

        let runtime = Arc::new(WorkerRuntime::new(config, loader));
        let handle = tokio::spawn(runtime.clone().serve(worker_read, worker_write));

        Self {
            runtime,
            reader,
            writer,
            handle,
        }
    }

    /// Spawn and consume the `Ready` handshake.
    pub async fn ready(config: WorkerConfig) -> Self {
        Self::ready_with_loader(config, Arc::new(MarkerLoader)).await
    }

    pub async fn ready_with_loader(config: WorkerConfig, loader: Arc<dyn FunctionLoader>) -> Self {
        let mut worker = Self::spawn_with_loader(config, loader);
        match worker.recv().await {
            Envelope::Ready(_) => worker,
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    pub async fn send(&mut self, envelope: Envelope) {
        write_frame(&mut self.writer, &envelope.to_frame().unwrap())
            .await
            .unwrap();
    }

    pub async fn recv(&mut self) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(10), read_frame(&mut self.reader))
            .await
            .expect("timed out waiting for worker frame")
            .unwrap();
        Envelope::from_frame(&frame).unwrap()
    }

    /// Send a reload and assert it was acknowledged OK.
    pub async fn load(&mut self, correlation_id: u64, version: u64, functions: Vec<FunctionEntry>) {
        self.send(reload(correlation_id, version, functions)).await;
        match self.recv().await {
            Envelope::ControlAck(ack) => {
                assert_eq!(ack.correlation_id, correlation_id);
                assert_eq!(ack.result, fnhost_protocol::AckResult::Ok);
            }
            other => panic!("expected ControlAck, got {:?}", other),
        }
    }
}
