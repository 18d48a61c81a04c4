// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Virtual clock for the emulated engine.
//!
//! Time is kept in microseconds since engine start. Only the scheduling loop moves it
//! forward; any number of handles may read it concurrently (submitters use it to stamp
//! arrival times).
//!
//! In [`Pacing::RealTime`] mode every advance is followed by a wall-clock sleep of the same
//! length so that the emulator behaves like a live server. In [`Pacing::FastForward`] mode
//! advancing is instantaneous, which lets tests and offline runs go as fast as the host allows.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio_util::sync::CancellationToken;

/// How virtual time relates to wall-clock time
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Pacing {
    /// Each step blocks for its duration of wall-clock time
    #[default]
    #[strum(serialize = "real_time", serialize = "realtime")]
    RealTime,
    /// Steps complete instantly
    #[strum(serialize = "fast_forward", serialize = "fast")]
    FastForward,
}

#[derive(Debug, Clone)]
pub struct Clock {
    now_us: Arc<AtomicU64>,
    step: Duration,
    pacing: Pacing,
}

impl Clock {
    /// Create a clock at time zero that advances by `step` per [`Clock::advance`].
    pub fn new(step: Duration, pacing: Pacing) -> Self {
        Self {
            now_us: Arc::new(AtomicU64::new(0)),
            step,
            pacing,
        }
    }

    /// Current virtual time since the clock was created.
    pub fn now(&self) -> Duration {
        Duration::from_micros(self.now_us.load(Ordering::Acquire))
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    /// Move virtual time forward by one step, pacing to wall-clock time if configured.
    pub async fn advance(&self) -> Duration {
        self.advance_by(self.step).await
    }

    /// Move virtual time forward by `delta`, pacing to wall-clock time if configured.
    pub async fn advance_by(&self, delta: Duration) -> Duration {
        let now = self.tick(delta);
        self.pace(delta, None).await;
        now
    }

    /// Move virtual time forward by `delta` without any pacing. Returns the new time.
    ///
    /// The increment is applied synchronously so a step is never left half-charged when the
    /// pacing sleep that follows is interrupted.
    pub(crate) fn tick(&self, delta: Duration) -> Duration {
        let delta_us = u64::try_from(delta.as_micros()).unwrap_or(u64::MAX);
        let prev = self.now_us.fetch_add(delta_us, Ordering::AcqRel);
        Duration::from_micros(prev.saturating_add(delta_us))
    }

    /// Sleep for `delta` of wall-clock time in real-time mode. Returns early on cancellation.
    pub(crate) async fn pace(&self, delta: Duration, cancel: Option<&CancellationToken>) {
        if self.pacing == Pacing::FastForward || delta.is_zero() {
            return;
        }
        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = tokio::time::sleep(delta) => {}
                    _ = token.cancelled() => {}
                }
            }
            None => tokio::time::sleep(delta).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn test_fast_forward_advances_without_sleeping() {
        let clock = Clock::new(Duration::from_millis(20), Pacing::FastForward);
        assert_eq!(clock.now(), Duration::ZERO);

        let wall = std::time::Instant::now();
        for _ in 0..1000 {
            clock.advance().await;
        }
        assert_eq!(clock.now(), Duration::from_secs(20));
        assert!(wall.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_time_sleeps_for_each_step() {
        let clock = Clock::new(Duration::from_millis(50), Pacing::RealTime);
        let start = tokio::time::Instant::now();

        clock.advance().await;
        clock.advance_by(Duration::from_millis(100)).await;

        assert_eq!(clock.now(), Duration::from_millis(150));
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_pace_keeps_virtual_time() {
        let clock = Clock::new(Duration::from_secs(60), Pacing::RealTime);
        let token = CancellationToken::new();
        token.cancel();

        let now = clock.tick(clock.step());
        clock.pace(clock.step(), Some(&token)).await;

        assert_eq!(now, Duration::from_secs(60));
        assert_eq!(clock.now(), Duration::from_secs(60));
    }

    #[test]
    fn test_handles_share_time() {
        let clock = Clock::new(Duration::from_millis(10), Pacing::FastForward);
        let reader = clock.clone();
        clock.tick(Duration::from_millis(30));
        assert_eq!(reader.now(), Duration::from_millis(30));
    }

    #[test]
    fn test_pacing_from_str() {
        assert_eq!(Pacing::from_str("realtime").unwrap(), Pacing::RealTime);
        assert_eq!(Pacing::from_str("Real_Time").unwrap(), Pacing::RealTime);
        assert_eq!(Pacing::from_str("fast").unwrap(), Pacing::FastForward);
        assert!(Pacing::from_str("sometimes").is_err());
    }
}
