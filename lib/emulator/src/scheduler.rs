// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Continuous-batching scheduler
//!
//! This module implements the asynchronous scheduler at the heart of the emulator:
//! 1. Receiving submitted requests and placing them in a FIFO waiting queue
//! 2. Admitting waiting requests into the running batch against the device memory budget
//! 3. Stepping the running batch in virtual time and resolving finished requests
//!
//! ## Admission
//! Requests are admitted strictly in arrival order. A request is admitted when the running
//! batch has a free slot and the device can reserve KV-cache for its whole projected context
//! (prompt plus full target output). The first request that does not fit stops admission for
//! the step, even if smaller requests behind it would fit (head-of-line blocking).
//!
//! ## Stepping
//! Newly admitted requests are charged one prefill step together, after which their first
//! token time is recorded. Then every decoding request in the batch generates exactly one
//! token in a shared decode step. Requests that reach their target length release their
//! reservation and resolve their caller.
//!
//! ## Liveness
//! When nothing is queued the loop sleeps until a request arrives. When the batch is empty and
//! the head of the queue cannot fit, nothing can ever free memory, so the loop reports the
//! stall and waits for the next arrival or cancellation instead of spinning the clock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::clock::{Clock, Pacing};
use crate::device::Device;
use crate::metrics::{Counter, Gauge, Histogram, MetricsSink};
use crate::model::Model;
use crate::protocols::{EngineError, SchedulerSnapshot};
use crate::request::{Request, RequestPhase, RequestResult};

enum SchedulerEvent {
    Submit {
        request: Request,
        done_tx: oneshot::Sender<RequestResult>,
    },
    Cancel(Uuid),
}

struct Entry {
    request: Request,
    done_tx: oneshot::Sender<RequestResult>,
}

/// Shared, read-only collaborators of a scheduling step
pub(crate) struct StepContext<'a> {
    pub model: &'a Model,
    pub device: &'a Device,
    pub clock: &'a Clock,
    pub metrics: &'a dyn MetricsSink,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StepOutcome {
    pub admitted: usize,
    pub completed: usize,
    /// Virtual time charged by the step
    pub elapsed: Duration,
    pub stalled: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    arrived: u64,
    admitted: u64,
    completed: u64,
    cancelled: u64,
    tokens: u64,
}

pub(crate) struct SchedulerState {
    waiting: VecDeque<Entry>,
    running: Vec<Entry>,
    /// Completed in the last step, resolved once the step's time has been paced
    finished: Vec<(oneshot::Sender<RequestResult>, RequestResult)>,
    max_batch_size: usize,
    totals: Totals,
}

impl SchedulerState {
    pub(crate) fn new(max_batch_size: usize) -> Self {
        Self {
            waiting: VecDeque::new(),
            running: Vec::with_capacity(max_batch_size),
            finished: Vec::new(),
            max_batch_size,
            totals: Totals::default(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiting.is_empty() && self.running.is_empty()
    }

    pub(crate) fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    pub(crate) fn num_running(&self) -> usize {
        self.running.len()
    }

    /// Append a request to the back of the waiting queue.
    fn receive(
        &mut self,
        mut request: Request,
        done_tx: oneshot::Sender<RequestResult>,
        ctx: &StepContext<'_>,
    ) {
        request.mark_arrived(ctx.clock.now());
        tracing::trace!(id = %request.id(), input_len = request.input_len(), output_len = request.output_len(), "Request queued");
        self.totals.arrived += 1;
        ctx.metrics.inc_counter(Counter::RequestArrival, 1);
        ctx.metrics.inc_counter(Counter::RequestsCount, 1);
        self.waiting.push_back(Entry { request, done_tx });
    }

    fn handle(&mut self, event: SchedulerEvent, ctx: &StepContext<'_>) {
        match event {
            SchedulerEvent::Submit { request, done_tx } => self.receive(request, done_tx, ctx),
            SchedulerEvent::Cancel(id) => {
                self.cancel(id, ctx);
            }
        }
    }

    /// Remove a request from whichever structure holds it, returning its reservation.
    /// Returns false if the request is unknown (already finished or never submitted).
    pub(crate) fn cancel(&mut self, id: Uuid, ctx: &StepContext<'_>) -> bool {
        let entry = if let Some(pos) = self.waiting.iter().position(|e| e.request.id() == id) {
            self.waiting.remove(pos)
        } else if let Some(pos) = self.running.iter().position(|e| e.request.id() == id) {
            Some(self.running.remove(pos))
        } else {
            None
        };

        let Some(mut entry) = entry else {
            return false;
        };

        let reserved_mb = entry.request.take_reservation();
        if reserved_mb > 0 {
            ctx.device.release(reserved_mb);
        }
        self.totals.cancelled += 1;
        ctx.metrics.inc_counter(Counter::RequestCancelled, 1);
        tracing::debug!(
            %id,
            phase = %entry.request.phase(),
            released_mb = reserved_mb,
            "Request cancelled"
        );
        true
    }

    /// Admit waiting requests in FIFO order while the batch has room and the device has memory.
    fn admit(&mut self, ctx: &StepContext<'_>) -> usize {
        let mut admitted = 0;
        while self.running.len() < self.max_batch_size {
            let Some(head) = self.waiting.front() else {
                break;
            };

            let required_mb = ctx.model.kv_cost(head.request.projected_len());
            if !ctx.device.try_reserve(required_mb) {
                tracing::trace!(
                    id = %head.request.id(),
                    required_mb,
                    available_mb = ctx.device.available(),
                    "Head of queue does not fit, blocking admission"
                );
                break;
            }

            let Some(mut entry) = self.waiting.pop_front() else {
                break;
            };
            entry.request.admit(ctx.clock.now(), required_mb);
            self.running.push(entry);
            admitted += 1;
        }

        self.totals.admitted += admitted as u64;
        if admitted > 0 {
            ctx.metrics.inc_counter(Counter::RequestAdmitted, admitted as u64);
        }
        admitted
    }

    /// One full scheduling step: admission, prefill of new arrivals, one shared decode step,
    /// retirement of finished requests, and metrics emission.
    pub(crate) fn step(&mut self, ctx: &StepContext<'_>) -> StepOutcome {
        let admitted = self.admit(ctx);
        let start = ctx.clock.now();

        if self.running.is_empty() {
            let stalled = !self.waiting.is_empty();
            self.emit_gauges(ctx);
            return StepOutcome {
                admitted,
                stalled,
                ..Default::default()
            };
        }

        // prefill everything admitted this step
        if self
            .running
            .iter()
            .any(|e| e.request.phase() == RequestPhase::Prefill)
        {
            let now = ctx.clock.tick(ctx.model.prefill_time());
            for entry in self
                .running
                .iter_mut()
                .filter(|e| e.request.phase() == RequestPhase::Prefill)
            {
                let request = &mut entry.request;
                request.finish_prefill(now);
                let input_tokens = request.input_len() as u64;
                self.totals.tokens += input_tokens;
                ctx.metrics.inc_counter(Counter::Tokens, input_tokens);
                ctx.metrics.inc_counter(Counter::TokensCount, input_tokens);
                if let Some(arrival) = request.arrival_time() {
                    ctx.metrics.observe(
                        Histogram::TimeToFirstToken,
                        now.saturating_sub(arrival).as_secs_f64(),
                    );
                }
            }
        }

        // one token for every decoding request
        if self
            .running
            .iter()
            .any(|e| e.request.phase() == RequestPhase::Decoding)
        {
            let now = ctx.clock.tick(ctx.model.decode_time());
            let mut decoded = 0u64;
            for entry in self
                .running
                .iter_mut()
                .filter(|e| e.request.phase() == RequestPhase::Decoding)
            {
                let (itl, _) = entry.request.decode_step(now);
                ctx.metrics
                    .observe(Histogram::TimePerOutputToken, itl.as_secs_f64());
                decoded += 1;
            }
            self.totals.tokens += decoded;
            ctx.metrics.inc_counter(Counter::Tokens, decoded);
            ctx.metrics.inc_counter(Counter::TokensCount, decoded);
        }

        let completed = self.retire(ctx);
        self.emit_gauges(ctx);

        let outcome = StepOutcome {
            admitted,
            completed,
            elapsed: ctx.clock.now().saturating_sub(start),
            stalled: false,
        };
        tracing::debug!(
            admitted,
            completed,
            running = self.running.len(),
            waiting = self.waiting.len(),
            kv_committed_mb = ctx.device.kv_committed(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Scheduler step"
        );
        outcome
    }

    /// Move finished requests out of the batch and release their memory. Callers are resolved
    /// by [`SchedulerState::resolve_finished`].
    fn retire(&mut self, ctx: &StepContext<'_>) -> usize {
        let (done, live): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut self.running)
            .into_iter()
            .partition(|e| e.request.is_done());
        self.running = live;

        let completed = done.len();
        for mut entry in done {
            let reserved_mb = entry.request.take_reservation();
            ctx.device.release(reserved_mb);

            let result = entry.request.result();
            ctx.metrics.inc_counter(Counter::RequestSuccess, 1);
            ctx.metrics
                .observe(Histogram::RequestQueueTime, result.queue_time().as_secs_f64());
            ctx.metrics
                .observe(Histogram::E2eRequestLatency, result.e2e_latency().as_secs_f64());
            ctx.metrics
                .observe(Histogram::RequestPromptTokens, result.input_len as f64);
            ctx.metrics.observe(
                Histogram::RequestGenerationTokens,
                result.tokens_generated as f64,
            );

            self.finished.push((entry.done_tx, result));
        }
        self.totals.completed += completed as u64;
        completed
    }

    /// Hand results of completed requests to their callers.
    pub(crate) fn resolve_finished(&mut self) -> usize {
        let count = self.finished.len();
        for (done_tx, result) in self.finished.drain(..) {
            let id = result.id;
            if done_tx.send(result).is_err() {
                // caller went away; its cancel event will find nothing to remove
                tracing::trace!(%id, "Completed request has no waiting caller");
            }
        }
        count
    }

    /// Drop every queued and running request, returning their memory. Callers observe
    /// cancellation through their closed completion channel.
    fn abandon_all(&mut self, ctx: &StepContext<'_>) -> usize {
        let abandoned: Vec<Entry> = self.waiting.drain(..).chain(self.running.drain(..)).collect();
        let count = abandoned.len();
        for mut entry in abandoned {
            let reserved_mb = entry.request.take_reservation();
            if reserved_mb > 0 {
                ctx.device.release(reserved_mb);
            }
        }
        if count > 0 {
            self.totals.cancelled += count as u64;
            ctx.metrics.inc_counter(Counter::RequestCancelled, count as u64);
        }
        self.emit_gauges(ctx);
        count
    }

    fn emit_gauges(&self, ctx: &StepContext<'_>) {
        ctx.metrics
            .set_gauge(Gauge::NumRequestsRunning, self.running.len() as f64);
        ctx.metrics
            .set_gauge(Gauge::NumRequestsWaiting, self.waiting.len() as f64);
        ctx.metrics
            .set_gauge(Gauge::GpuCacheUsagePerc, ctx.device.usage_fraction());
    }

    fn snapshot(&self, ctx: &StepContext<'_>, stalled: bool) -> SchedulerSnapshot {
        SchedulerSnapshot {
            now: ctx.clock.now(),
            num_waiting: self.waiting.len(),
            num_running: self.running.len(),
            weights_mb: ctx.device.weights(),
            kv_committed_mb: ctx.device.kv_committed(),
            usage_fraction: ctx.device.usage_fraction(),
            kv_usage_fraction: ctx.device.kv_usage_fraction(),
            requests_arrived: self.totals.arrived,
            requests_admitted: self.totals.admitted,
            requests_completed: self.totals.completed,
            requests_cancelled: self.totals.cancelled,
            tokens_processed: self.totals.tokens,
            stalled,
        }
    }
}

/// Cancels the request on the scheduler if the waiting caller goes away before completion
struct CancelOnDrop {
    id: Uuid,
    event_tx: mpsc::UnboundedSender<SchedulerEvent>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.event_tx.send(SchedulerEvent::Cancel(self.id));
        }
    }
}

/// Handle to the background scheduling loop
#[derive(Clone)]
pub struct Scheduler {
    event_tx: mpsc::UnboundedSender<SchedulerEvent>,
    snapshot_rx: watch::Receiver<SchedulerSnapshot>,
    clock: Clock,
}

impl Scheduler {
    /// Spawn the scheduling loop on the current tokio runtime.
    ///
    /// The loop stops when `cancel_token` is cancelled or every handle is dropped; the
    /// returned join handle completes once it has exited.
    pub fn start(
        model: Arc<Model>,
        device: Arc<Device>,
        clock: Clock,
        max_batch_size: usize,
        metrics: Arc<dyn MetricsSink>,
        cancel_token: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SchedulerEvent>();
        let (snapshot_tx, snapshot_rx) = watch::channel(SchedulerSnapshot {
            weights_mb: device.weights(),
            usage_fraction: device.usage_fraction(),
            kv_usage_fraction: device.kv_usage_fraction(),
            ..Default::default()
        });

        let loop_clock = clock.clone();
        let handle = tokio::spawn(async move {
            run_loop(
                model,
                device,
                loop_clock,
                max_batch_size,
                metrics,
                event_rx,
                snapshot_tx,
                cancel_token,
            )
            .await;
        });

        (
            Self {
                event_tx,
                snapshot_rx,
                clock,
            },
            handle,
        )
    }

    /// Enqueue a request and wait until it completes.
    ///
    /// Dropping the returned future before it resolves cancels the request and returns its
    /// memory to the device.
    pub async fn submit(&self, mut request: Request) -> Result<RequestResult, EngineError> {
        let id = request.id();
        request.mark_arrived(self.clock.now());

        let (done_tx, done_rx) = oneshot::channel();
        self.event_tx
            .send(SchedulerEvent::Submit { request, done_tx })
            .map_err(|_| EngineError::ShutDown)?;

        let mut guard = CancelOnDrop {
            id,
            event_tx: self.event_tx.clone(),
            armed: true,
        };
        let result = done_rx.await.map_err(|_| EngineError::Cancelled(id));
        // either completed, or the loop is gone and nothing is left to remove
        guard.armed = false;
        result
    }

    /// Like [`Scheduler::submit`] but gives up after `timeout`, cancelling the request.
    pub async fn submit_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<RequestResult, EngineError> {
        let id = request.id();
        match tokio::time::timeout(timeout, self.submit(request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(%id, ?timeout, "Request timed out");
                Err(EngineError::TimedOut { id, timeout })
            }
        }
    }

    /// Cancel a submitted request by id. Returns false if the loop has stopped.
    pub fn cancel(&self, id: Uuid) -> bool {
        self.event_tx.send(SchedulerEvent::Cancel(id)).is_ok()
    }

    /// Latest snapshot published by the loop
    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Watch receiver for the snapshot published after every step
    pub fn snapshot_receiver(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    model: Arc<Model>,
    device: Arc<Device>,
    clock: Clock,
    max_batch_size: usize,
    metrics: Arc<dyn MetricsSink>,
    mut event_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    snapshot_tx: watch::Sender<SchedulerSnapshot>,
    cancel_token: CancellationToken,
) {
    let ctx = StepContext {
        model: &model,
        device: &device,
        clock: &clock,
        metrics: metrics.as_ref(),
    };
    let mut state = SchedulerState::new(max_batch_size);
    let mut stalled = false;

    tracing::info!(
        model = %model.name(),
        max_batch_size,
        pacing = %clock.pacing(),
        "Scheduler loop started"
    );

    loop {
        // 1. Receive events, blocking only when there is nothing that can make progress
        if receive_events(&mut state, &mut event_rx, &cancel_token, &ctx, stalled)
            .await
            .is_none()
        {
            break;
        }

        // 2. Admit, prefill, decode, retire
        let outcome = state.step(&ctx);

        if outcome.stalled && !stalled {
            tracing::warn!(
                waiting = state.num_waiting(),
                available_mb = device.available(),
                "Head of queue cannot fit on an idle device; waiting for new events"
            );
        }
        stalled = outcome.stalled;

        // 3. Pace to wall-clock time, then resolve the step's completions
        clock.pace(outcome.elapsed, Some(&cancel_token)).await;
        state.resolve_finished();

        // 4. Publish state once per step
        let _ = snapshot_tx.send(state.snapshot(&ctx, stalled));

        if clock.pacing() == Pacing::FastForward {
            tokio::task::yield_now().await;
        }
    }

    state.resolve_finished();
    let abandoned = state.abandon_all(&ctx);
    let _ = snapshot_tx.send(state.snapshot(&ctx, false));
    tracing::info!(abandoned, "Scheduler loop stopped");
}

/// Receive events from the channel.
/// Returns `Some(())` to continue the loop, `None` to break (on cancellation or when every
/// handle has been dropped).
async fn receive_events(
    state: &mut SchedulerState,
    event_rx: &mut mpsc::UnboundedReceiver<SchedulerEvent>,
    cancel_token: &CancellationToken,
    ctx: &StepContext<'_>,
    stalled: bool,
) -> Option<()> {
    if cancel_token.is_cancelled() {
        return None;
    }

    if state.is_empty() || stalled {
        // nothing can progress until something arrives or is cancelled
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                return None;
            }
            event = event_rx.recv() => {
                state.handle(event?, ctx);
            }
        }
    }

    // collect anything else pending without blocking
    while let Ok(event) = event_rx.try_recv() {
        state.handle(event, ctx);
    }

    Some(())
}
