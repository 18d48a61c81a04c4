// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Emulated vLLM inference server.
//!
//! This crate models the scheduling behavior of a continuous-batching LLM server on a single
//! accelerator without running a model: requests queue in FIFO order, are admitted against a
//! device memory budget, prefill once and then decode one token per step in a shared batch.
//! Queue lengths, memory usage and latencies are exported with the same names vLLM uses, so
//! autoscalers and dashboards can be exercised against it.

pub mod clock;
pub mod config;
pub mod device;
pub mod engine;
pub mod loadgen;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod protocols;
pub mod request;
pub mod scheduler;

// Re-export commonly used types
pub use clock::{Clock, Pacing};
pub use config::{EmulatorConfig, EmulatorConfigBuilder};
pub use device::Device;
pub use engine::Emulator;
pub use loadgen::{LoadGenerator, OutputLengthDistribution};
pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
pub use model::Model;
pub use protocols::{ConfigError, EngineError, MemoryMb, SchedulerSnapshot};
pub use request::{Request, RequestPhase, RequestResult};
pub use scheduler::Scheduler;
