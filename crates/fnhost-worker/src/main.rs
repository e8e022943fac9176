// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost worker process.
//!
//! Spawned by the master with the IPC channel on stdin/stdout.

use std::sync::Arc;

use fnhost_worker::{DefaultLoader, WorkerConfig, WorkerRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is the IPC channel; logs must stay on stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fnhost_worker=info".into()),
        )
        .init();

    let config = WorkerConfig::from_env()?;
    let runtime = Arc::new(WorkerRuntime::new(config, Arc::new(DefaultLoader)));

    runtime
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await?;

    Ok(())
}
