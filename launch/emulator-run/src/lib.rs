// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use anyhow::Context as _;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use vllm_emulator::{Emulator, EmulatorConfig, PrometheusMetrics};

mod flags;
pub use flags::Flags;
pub mod http;
pub mod loadgen;

/// Load the configuration, start the engine and serve HTTP until `cancel_token` fires.
pub async fn run(flags: Flags, cancel_token: CancellationToken) -> anyhow::Result<()> {
    //
    // Configure
    //

    let mut config = EmulatorConfig::from_settings(flags.config.as_deref())
        .context("failed to load emulator configuration")?;
    flags.apply(&mut config);
    config
        .validate_config()
        .context("invalid emulator configuration")?;

    //
    // Start
    //

    let metrics = Arc::new(
        PrometheusMetrics::new(config.model_name.clone())
            .context("failed to create metrics")?,
    );
    let registry = Registry::new();
    metrics
        .register(&registry)
        .context("failed to register metrics")?;

    let emulator = Arc::new(
        Emulator::start(config, metrics, Some(cancel_token.clone()))
            .context("failed to start emulator")?,
    );

    //
    // Serve
    //

    let state = Arc::new(http::AppState {
        emulator: emulator.clone(),
        registry,
    });
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(flags.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", flags.http_addr))?;
    tracing::info!(addr = %flags.http_addr, "Emulator HTTP server listening");

    let shutdown = cancel_token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    emulator.shutdown().await;
    tracing::info!("Emulator stopped");
    Ok(())
}
