// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use derive_getters::Getters;
use serde::{Deserialize, Serialize};

use crate::protocols::{ConfigError, MemoryMb};

/// Static parameters of one emulated model deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
pub struct Model {
    name: String,

    /// Memory held by the weights for the lifetime of the engine
    #[getter(copy)]
    weights_mb: MemoryMb,

    /// KV-cache cost of a single token of context
    #[getter(copy)]
    kv_per_token_mb: MemoryMb,

    /// Duration of the one-off prefill step
    #[getter(copy)]
    prefill_time: Duration,

    /// Duration of one decode step (one token for every running request)
    #[getter(copy)]
    decode_time: Duration,
}

impl Model {
    pub fn new(
        name: impl Into<String>,
        weights_mb: MemoryMb,
        kv_per_token_mb: MemoryMb,
        prefill_time: Duration,
        decode_time: Duration,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigError::Invalid("model name must not be empty".into()));
        }
        if weights_mb == 0 {
            return Err(ConfigError::non_positive("weights_mb", weights_mb));
        }
        if kv_per_token_mb == 0 {
            return Err(ConfigError::non_positive("kv_per_token_mb", kv_per_token_mb));
        }
        if prefill_time.is_zero() {
            return Err(ConfigError::non_positive("prefill_time", format!("{prefill_time:?}")));
        }
        if decode_time.is_zero() {
            return Err(ConfigError::non_positive("decode_time", format!("{decode_time:?}")));
        }

        Ok(Self {
            name,
            weights_mb,
            kv_per_token_mb,
            prefill_time,
            decode_time,
        })
    }

    /// KV-cache memory needed to hold `num_tokens` tokens of context
    pub fn kv_cost(&self, num_tokens: usize) -> MemoryMb {
        (num_tokens as MemoryMb).saturating_mul(self.kv_per_token_mb)
    }
}
