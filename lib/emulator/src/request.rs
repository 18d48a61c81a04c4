// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-request state tracked by the scheduler.
//!
//! A request moves through `Waiting -> Prefill -> Decoding -> Done`. Every timestamp is virtual
//! time, set at most once, and never earlier than the timestamp of the previous phase.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::protocols::MemoryMb;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestPhase {
    Waiting,
    Prefill,
    Decoding,
    Done,
}

#[derive(Debug, Clone)]
pub struct Request {
    id: Uuid,
    input_len: usize,
    output_len: usize,
    phase: RequestPhase,
    tokens_generated: usize,
    /// KV-cache held on the device while admitted
    reserved_mb: MemoryMb,
    arrival_time: Option<Duration>,
    admission_time: Option<Duration>,
    ttft_time: Option<Duration>,
    completion_time: Option<Duration>,
    /// Time the previous token (or the prefill) finished, for inter-token latency
    last_token_time: Option<Duration>,
}

impl Request {
    pub fn new(input_len: usize, output_len: usize) -> Self {
        Self::with_id(Uuid::new_v4(), input_len, output_len)
    }

    pub fn with_id(id: Uuid, input_len: usize, output_len: usize) -> Self {
        Self {
            id,
            input_len,
            output_len,
            phase: RequestPhase::Waiting,
            tokens_generated: 0,
            reserved_mb: 0,
            arrival_time: None,
            admission_time: None,
            ttft_time: None,
            completion_time: None,
            last_token_time: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn input_len(&self) -> usize {
        self.input_len
    }

    pub fn output_len(&self) -> usize {
        self.output_len
    }

    /// Prompt plus full target output, the context size reserved at admission
    pub fn projected_len(&self) -> usize {
        self.input_len.saturating_add(self.output_len)
    }

    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    pub fn tokens_generated(&self) -> usize {
        self.tokens_generated
    }

    pub fn reserved_mb(&self) -> MemoryMb {
        self.reserved_mb
    }

    pub fn arrival_time(&self) -> Option<Duration> {
        self.arrival_time
    }

    pub fn admission_time(&self) -> Option<Duration> {
        self.admission_time
    }

    pub fn ttft_time(&self) -> Option<Duration> {
        self.ttft_time
    }

    pub fn completion_time(&self) -> Option<Duration> {
        self.completion_time
    }

    pub fn is_done(&self) -> bool {
        self.phase == RequestPhase::Done
    }

    pub(crate) fn mark_arrived(&mut self, now: Duration) {
        debug_assert_eq!(self.phase, RequestPhase::Waiting);
        if self.arrival_time.is_none() {
            self.arrival_time = Some(now);
        }
    }

    /// WAITING -> PREFILL once the device reservation is held
    pub(crate) fn admit(&mut self, now: Duration, reserved_mb: MemoryMb) {
        debug_assert_eq!(self.phase, RequestPhase::Waiting);
        let arrival = *self.arrival_time.get_or_insert(now);
        self.admission_time = Some(now.max(arrival));
        self.reserved_mb = reserved_mb;
        self.phase = RequestPhase::Prefill;
        tracing::trace!(id = %self.id, reserved_mb, "Request admitted");
    }

    /// PREFILL -> DECODING, or straight to DONE when there is nothing to generate.
    /// Returns true if the request completed.
    pub(crate) fn finish_prefill(&mut self, now: Duration) -> bool {
        debug_assert_eq!(self.phase, RequestPhase::Prefill);
        self.ttft_time = Some(now);
        self.last_token_time = Some(now);
        if self.output_len == 0 {
            self.complete(now);
            return true;
        }
        self.phase = RequestPhase::Decoding;
        false
    }

    /// Generate one token. Returns the latency since the previous token and whether the
    /// request reached its target length.
    pub(crate) fn decode_step(&mut self, now: Duration) -> (Duration, bool) {
        debug_assert_eq!(self.phase, RequestPhase::Decoding);
        let previous = self.last_token_time.unwrap_or(now);
        self.tokens_generated += 1;
        self.last_token_time = Some(now);

        let done = self.tokens_generated >= self.output_len;
        if done {
            self.complete(now);
        }
        (now.saturating_sub(previous), done)
    }

    fn complete(&mut self, now: Duration) {
        self.completion_time = Some(now);
        self.phase = RequestPhase::Done;
        tracing::trace!(id = %self.id, tokens = self.tokens_generated, "Request completed");
    }

    /// Hand back the reservation exactly once; later calls return zero.
    pub(crate) fn take_reservation(&mut self) -> MemoryMb {
        std::mem::take(&mut self.reserved_mb)
    }

    pub(crate) fn result(&self) -> RequestResult {
        RequestResult {
            id: self.id,
            input_len: self.input_len,
            output_len: self.output_len,
            tokens_generated: self.tokens_generated,
            arrival_time: self.arrival_time.unwrap_or_default(),
            admission_time: self.admission_time.unwrap_or_default(),
            ttft_time: self.ttft_time.unwrap_or_default(),
            completion_time: self.completion_time.unwrap_or_default(),
        }
    }
}

/// Stats of a finished request, returned to the submitter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestResult {
    pub id: Uuid,
    pub input_len: usize,
    pub output_len: usize,
    pub tokens_generated: usize,
    pub arrival_time: Duration,
    pub admission_time: Duration,
    pub ttft_time: Duration,
    pub completion_time: Duration,
}

impl RequestResult {
    /// Time spent in the waiting queue
    pub fn queue_time(&self) -> Duration {
        self.admission_time.saturating_sub(self.arrival_time)
    }

    /// Time from arrival to the first token
    pub fn ttft(&self) -> Duration {
        self.ttft_time.saturating_sub(self.arrival_time)
    }

    /// Time from arrival to completion
    pub fn e2e_latency(&self) -> Duration {
        self.completion_time.saturating_sub(self.arrival_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_lifecycle_timestamps() {
        let mut request = Request::new(100, 3);
        request.mark_arrived(ms(10));
        request.admit(ms(30), 412);
        assert_eq!(request.phase(), RequestPhase::Prefill);
        assert_eq!(request.reserved_mb(), 412);

        assert!(!request.finish_prefill(ms(50)));
        assert_eq!(request.phase(), RequestPhase::Decoding);

        assert_eq!(request.decode_step(ms(70)), (ms(20), false));
        assert_eq!(request.decode_step(ms(90)), (ms(20), false));
        assert_eq!(request.decode_step(ms(110)), (ms(20), true));
        assert!(request.is_done());
        assert_eq!(request.tokens_generated(), 3);

        let result = request.result();
        assert_eq!(result.queue_time(), ms(20));
        assert_eq!(result.ttft(), ms(40));
        assert_eq!(result.e2e_latency(), ms(100));
        assert!(result.arrival_time <= result.admission_time);
        assert!(result.admission_time <= result.ttft_time);
        assert!(result.ttft_time <= result.completion_time);
    }

    #[test]
    fn test_zero_output_completes_after_prefill() {
        let mut request = Request::new(16, 0);
        request.mark_arrived(ms(0));
        request.admit(ms(0), 64);
        assert!(request.finish_prefill(ms(20)));
        assert!(request.is_done());
        assert_eq!(request.completion_time(), Some(ms(20)));
        assert_eq!(request.tokens_generated(), 0);
    }

    #[test]
    fn test_projected_len_saturates() {
        assert_eq!(Request::new(100, 50).projected_len(), 150);
        assert_eq!(Request::new(usize::MAX, 10).projected_len(), usize::MAX);
    }

    #[test]
    fn test_reservation_taken_once() {
        let mut request = Request::new(1, 1);
        request.admit(ms(0), 8);
        assert_eq!(request.take_reservation(), 8);
        assert_eq!(request.take_reservation(), 0);
    }

    #[test]
    fn test_arrival_set_once() {
        let mut request = Request::new(1, 1);
        request.mark_arrived(ms(5));
        request.mark_arrived(ms(9));
        assert_eq!(request.arrival_time(), Some(ms(5)));
        assert_eq!(request.phase().to_string(), "WAITING");
    }
}
