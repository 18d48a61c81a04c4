// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Emulated vLLM engine: one model on one device, fed by a single scheduler.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::EmulatorConfig;
use crate::device::Device;
use crate::loadgen::LoadGenerator;
use crate::metrics::MetricsSink;
use crate::model::Model;
use crate::protocols::{ConfigError, EngineError, SchedulerSnapshot};
use crate::request::{Request, RequestResult};
use crate::scheduler::Scheduler;

pub struct Emulator {
    config: EmulatorConfig,
    model: Arc<Model>,
    device: Arc<Device>,
    scheduler: Scheduler,
    load: Mutex<LoadGenerator>,
    cancel_token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Emulator {
    /// Validate `config`, load the model onto a fresh device and spawn the scheduling loop.
    ///
    /// Must be called from within a tokio runtime. The loop stops when `cancel_token` (or a
    /// child of it) is cancelled, or on [`Emulator::shutdown`].
    pub fn start(
        config: EmulatorConfig,
        metrics: Arc<dyn MetricsSink>,
        cancel_token: Option<CancellationToken>,
    ) -> Result<Self, ConfigError> {
        config.validate_config()?;

        let model = Arc::new(config.model()?);
        let device = Arc::new(Device::new(config.total_memory_mb, config.usable_ratio)?);
        device.load_weights(&model)?;

        let clock = Clock::new(config.decode_time(), config.pacing);
        let load = LoadGenerator::new(config.avg_output_len, config.distribution, config.seed);
        let cancel_token = cancel_token
            .map(|token| token.child_token())
            .unwrap_or_default();

        let (scheduler, handle) = Scheduler::start(
            model.clone(),
            device.clone(),
            clock,
            config.max_batch_size,
            metrics,
            cancel_token.clone(),
        );

        tracing::info!(
            model = %model.name(),
            budget_mb = device.budget(),
            weights_mb = device.weights(),
            max_batch_size = config.max_batch_size,
            distribution = %config.distribution,
            pacing = %config.pacing,
            "Emulator started"
        );

        Ok(Self {
            config,
            model,
            device,
            scheduler,
            load: Mutex::new(load),
            cancel_token,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Submit a request with an explicit prompt and target output length.
    pub async fn submit(&self, request: Request) -> Result<RequestResult, EngineError> {
        self.scheduler.submit(request).await
    }

    pub async fn submit_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<RequestResult, EngineError> {
        self.scheduler.submit_with_timeout(request, timeout).await
    }

    /// Build a request for a prompt of `input_len` tokens with a sampled output length,
    /// then submit it.
    pub async fn generate(&self, input_len: usize) -> Result<RequestResult, EngineError> {
        let request = self.new_request(input_len)?;
        self.submit(request).await
    }

    /// Submit a chat prompt; every character counts as one prompt token.
    pub async fn submit_prompt(&self, content: &str) -> Result<RequestResult, EngineError> {
        self.generate(content.chars().count()).await
    }

    /// Sample an output length and build the request without submitting it.
    pub fn new_request(&self, input_len: usize) -> Result<Request, EngineError> {
        if self.cancel_token.is_cancelled() {
            return Err(EngineError::ShutDown);
        }
        let output_len = self
            .load
            .lock()
            .map_err(|_| EngineError::ShutDown)?
            .sample_output_length(input_len);
        Ok(Request::new(input_len, output_len))
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn clock(&self) -> &Clock {
        self.scheduler.clock()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.scheduler.snapshot()
    }

    pub fn snapshot_receiver(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.scheduler.snapshot_receiver()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Stop the scheduling loop after its current step and wait for it to exit.
    /// Requests still queued or running are abandoned and their callers see
    /// [`EngineError::Cancelled`].
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handle = self.handle.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Scheduler task failed");
        }
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Pacing;
    use crate::loadgen::OutputLengthDistribution;
    use crate::metrics::NoopMetrics;

    fn config() -> EmulatorConfig {
        EmulatorConfig::builder()
            .kv_per_token_mb(4)
            .prefill_time_ms(20)
            .decode_time_ms(20)
            .avg_output_len(10)
            .distribution(OutputLengthDistribution::Fixed)
            .pacing(Pacing::FastForward)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_prompt_uses_char_count() {
        let emulator = Emulator::start(config(), Arc::new(NoopMetrics), None).unwrap();
        let result = emulator.submit_prompt("héllo").await.unwrap();
        assert_eq!(result.input_len, 5);
        assert_eq!(result.tokens_generated, 10);
        assert_eq!(emulator.device().kv_committed(), 0);
        emulator.shutdown().await;
    }

    #[tokio::test]
    async fn test_weights_exceeding_budget_fail_start() {
        let mut config = config();
        config.weights_mb = 64_001;
        let err = Emulator::start(config, Arc::new(NoopMetrics), None)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::WeightsExceedBudget { .. }));
    }

    #[tokio::test]
    async fn test_parent_token_stops_engine() {
        let parent = CancellationToken::new();
        let emulator =
            Emulator::start(config(), Arc::new(NoopMetrics), Some(parent.clone())).unwrap();
        parent.cancel();
        emulator.shutdown().await;
        assert!(emulator.is_shut_down());
        assert_eq!(emulator.generate(4).await, Err(EngineError::ShutDown));
    }
}
