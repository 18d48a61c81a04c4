// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use tokio_util::sync::CancellationToken;

use vllm_emulator_run::Flags;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vllm_emulator::logging::init();
    let flags = Flags::parse();

    let cancel_token = CancellationToken::new();
    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        tracing::info!("Ctrl-C received, shutting down");
        signal_token.cancel();
    });

    vllm_emulator_run::run(flags, cancel_token).await
}
