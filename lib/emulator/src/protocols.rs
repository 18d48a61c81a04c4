// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Memory quantities are expressed in megabytes throughout the emulator
pub type MemoryMb = u64;

/// Errors that prevent the emulator from being constructed
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: String },

    #[error("usable memory ratio must be in (0, 1], got {0}")]
    UsableRatio(f64),

    #[error("model weights ({weights_mb} MB) exceed the usable device budget ({budget_mb} MB)")]
    WeightsExceedBudget {
        weights_mb: MemoryMb,
        budget_mb: MemoryMb,
    },

    #[error("model weights are already loaded on this device")]
    WeightsAlreadyLoaded,

    #[error("unknown output length distribution '{0}'")]
    UnknownDistribution(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

impl ConfigError {
    pub(crate) fn non_positive(field: &'static str, value: impl ToString) -> Self {
        ConfigError::NonPositive {
            field,
            value: value.to_string(),
        }
    }
}

/// Errors observed by a caller waiting on a submitted request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("request {0} was cancelled before completion")]
    Cancelled(Uuid),

    #[error("request {id} did not complete within {timeout:?}")]
    TimedOut { id: Uuid, timeout: Duration },

    #[error("engine is shut down")]
    ShutDown,
}

/// Point-in-time view of the scheduler, published after every step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    /// Virtual time at the end of the step
    pub now: Duration,
    pub num_waiting: usize,
    pub num_running: usize,
    pub weights_mb: MemoryMb,
    pub kv_committed_mb: MemoryMb,
    pub usage_fraction: f64,
    /// Share of the KV-cache space left after weights that is committed
    pub kv_usage_fraction: f64,
    pub requests_arrived: u64,
    pub requests_admitted: u64,
    pub requests_completed: u64,
    pub requests_cancelled: u64,
    pub tokens_processed: u64,
    /// True when the batch is empty and the head of the queue cannot fit
    pub stalled: bool,
}

impl SchedulerSnapshot {
    /// Returns true if nothing is queued or running
    pub fn is_idle(&self) -> bool {
        self.num_waiting == 0 && self.num_running == 0
    }
}
