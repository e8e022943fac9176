// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! fnhost - multi-tenant function runtime
//!
//! An HTTP server responsible for:
//! - Project lifecycle (start, stop, restart, one worker process each)
//! - Function deploy with hot reload into running workers
//! - Invocation dispatch under global admission control
//! - Background invocations (async tasks)

use tracing::{info, warn};

use fnhost_runtime::config::Config;
use fnhost_runtime::runtime::FnHostRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fnhost_runtime=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        bind_addr = %config.bind_addr,
        data_dir = %config.data_dir.display(),
        worker_bin = %config.worker_bin.display(),
        "Starting fnhost"
    );

    let runtime = FnHostRuntime::builder()
        .bind_addr(config.bind_addr)
        .config(config)
        .build()?
        .start()
        .await?;

    info!(addr = ?runtime.local_addr(), "fnhost ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("fnhost shut down");

    Ok(())
}
