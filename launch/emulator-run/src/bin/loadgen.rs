// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use tokio_util::sync::CancellationToken;

use vllm_emulator_run::loadgen::{self, LoadgenArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    vllm_emulator::logging::init();
    let args = LoadgenArgs::parse();

    let cancel_token = CancellationToken::new();
    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_token.cancel();
        }
    });

    let summary = loadgen::run(args, cancel_token).await?;
    if summary.failed > 0 {
        tracing::warn!(failed = summary.failed, sent = summary.sent, "Some requests failed");
    }
    Ok(())
}
