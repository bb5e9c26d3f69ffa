// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Direktiv Action Sidecar
//!
//! Runs next to a user container and:
//! - Accepts actions from the flow engine (ingress, port 8890)
//! - Serves log and variable endpoints to the container (127.0.0.1:8889)
//! - Reports action results to the flow engine over gRPC

use std::sync::Arc;
use tracing::{info, warn};

use direktiv_protocol::FlowClient;
use direktiv_sidecar::config::{Config, LogFormat};
use direktiv_sidecar::engine::GrpcEngine;
use direktiv_sidecar::runtime::SidecarRuntime;

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "direktiv_sidecar=info,direktiv_protocol=info".into());

    match LogFormat::from_env() {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    init_logging();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        flow_host = %config.flow_host,
        user_port = config.user_port,
        shared_dir = %config.shared_dir.display(),
        workers = config.workers,
        "Starting Direktiv sidecar"
    );

    // Engine client connects on first report
    let client = FlowClient::connect_lazy(&config.flow_client_config())?;
    let engine = Arc::new(GrpcEngine::new(client));

    let code = SidecarRuntime::builder(config)
        .engine(engine)
        .handle_signals(true)
        .build()?
        .run()
        .await?;
    info!(exit_code = code, "Direktiv sidecar shut down");
    std::process::exit(code);
}
