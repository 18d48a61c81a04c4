// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use vllm_emulator::{EmulatorConfig, OutputLengthDistribution, Pacing};

/// Emulated vLLM server. Values not given on the command line come from the config file and
/// the environment.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Flags {
    /// Address the HTTP server listens on
    #[arg(long, env = "VLLME_HTTP_ADDR", default_value = "0.0.0.0:30000")]
    pub http_addr: SocketAddr,

    /// TOML file with emulator settings
    #[arg(long, env = "VLLME_CONFIG")]
    pub config: Option<PathBuf>,

    /// Model name used in metric labels
    #[arg(long)]
    pub model_name: Option<String>,

    /// Memory held by the model weights, in MB
    #[arg(long)]
    pub weights_mb: Option<u64>,

    /// KV-cache memory per token, in MB
    #[arg(long)]
    pub kv_per_token_mb: Option<u64>,

    #[arg(long)]
    pub prefill_time_ms: Option<u64>,

    /// Duration of one decode step in milliseconds
    #[arg(long)]
    pub decode_time_ms: Option<u64>,

    /// Device memory, in MB
    #[arg(long)]
    pub total_memory_mb: Option<u64>,

    #[arg(long)]
    pub usable_ratio: Option<f64>,

    #[arg(long)]
    pub max_batch_size: Option<usize>,

    /// Average number of generated tokens per request
    #[arg(long)]
    pub avg_output_len: Option<usize>,

    /// One of `uniform`, `fixed` (or `deterministic`), `exponential`
    #[arg(long, value_parser = parse_distribution)]
    pub distribution: Option<OutputLengthDistribution>,

    /// `real_time` paces steps to wall-clock time, `fast_forward` runs as fast as possible
    #[arg(long)]
    pub pacing: Option<Pacing>,

    #[arg(long)]
    pub seed: Option<u64>,
}

fn parse_distribution(value: &str) -> Result<OutputLengthDistribution, String> {
    OutputLengthDistribution::parse(value).map_err(|e| e.to_string())
}

impl Flags {
    /// Overwrite the loaded configuration with every flag given on the command line.
    pub fn apply(&self, config: &mut EmulatorConfig) {
        if let Some(model_name) = &self.model_name {
            config.model_name = model_name.clone();
        }
        if let Some(v) = self.weights_mb {
            config.weights_mb = v;
        }
        if let Some(v) = self.kv_per_token_mb {
            config.kv_per_token_mb = v;
        }
        if let Some(v) = self.prefill_time_ms {
            config.prefill_time_ms = v;
        }
        if let Some(v) = self.decode_time_ms {
            config.decode_time_ms = v;
        }
        if let Some(v) = self.total_memory_mb {
            config.total_memory_mb = v;
        }
        if let Some(v) = self.usable_ratio {
            config.usable_ratio = v;
        }
        if let Some(v) = self.max_batch_size {
            config.max_batch_size = v;
        }
        if let Some(v) = self.avg_output_len {
            config.avg_output_len = v;
        }
        if let Some(v) = self.distribution {
            config.distribution = v;
        }
        if let Some(v) = self.pacing {
            config.pacing = v;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
    }
}
