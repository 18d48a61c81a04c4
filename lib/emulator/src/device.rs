// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! # Device
//! Memory accounting for one emulated accelerator.
//!
//! The usable budget is `total * usable_ratio`; the remainder models fragmentation and
//! runtime overhead. Model weights are committed once at startup, after which KV-cache
//! reservations come and go with requests. The invariant
//! `weights + kv_committed <= budget` holds at every point a reader can observe.
//!
//! Counters are atomics so that metrics readers never see a torn update, but only the
//! scheduling loop is expected to reserve and release.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::Model;
use crate::protocols::{ConfigError, MemoryMb};

#[derive(Debug)]
pub struct Device {
    total_mb: MemoryMb,
    usable_ratio: f64,
    budget_mb: MemoryMb,
    weights_mb: AtomicU64,
    kv_committed_mb: AtomicU64,
    release_anomalies: AtomicU64,
}

impl Device {
    pub fn new(total_mb: MemoryMb, usable_ratio: f64) -> Result<Self, ConfigError> {
        if total_mb == 0 {
            return Err(ConfigError::non_positive("total_memory_mb", total_mb));
        }
        if !(usable_ratio > 0.0 && usable_ratio <= 1.0) {
            return Err(ConfigError::UsableRatio(usable_ratio));
        }
        let budget_mb = (total_mb as f64 * usable_ratio).floor() as MemoryMb;
        if budget_mb == 0 {
            return Err(ConfigError::non_positive("usable budget", budget_mb));
        }

        Ok(Self {
            total_mb,
            usable_ratio,
            budget_mb,
            weights_mb: AtomicU64::new(0),
            kv_committed_mb: AtomicU64::new(0),
            release_anomalies: AtomicU64::new(0),
        })
    }

    /// Commit the model's weights. Must be called once, before any KV reservation.
    pub fn load_weights(&self, model: &Model) -> Result<(), ConfigError> {
        let weights_mb = model.weights_mb();
        if weights_mb > self.budget_mb {
            return Err(ConfigError::WeightsExceedBudget {
                weights_mb,
                budget_mb: self.budget_mb,
            });
        }
        self.weights_mb
            .compare_exchange(0, weights_mb, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ConfigError::WeightsAlreadyLoaded)?;

        tracing::info!(
            model = %model.name(),
            weights_mb,
            budget_mb = self.budget_mb,
            "Loaded model weights onto device"
        );
        Ok(())
    }

    /// Atomically reserve `mb` of KV-cache if it fits within the budget.
    /// Returns false and leaves the device untouched otherwise.
    pub fn try_reserve(&self, mb: MemoryMb) -> bool {
        let weights_mb = self.weights_mb.load(Ordering::Acquire);
        self.kv_committed_mb
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |kv| {
                let committed = weights_mb.checked_add(kv)?.checked_add(mb)?;
                (committed <= self.budget_mb).then_some(kv + mb)
            })
            .is_ok()
    }

    /// Return `mb` of KV-cache to the device.
    ///
    /// Releasing more than is committed clamps the counter to zero. That only happens on a
    /// caller bug (e.g. a double release), so it is logged and counted.
    pub fn release(&self, mb: MemoryMb) {
        let prev = self
            .kv_committed_mb
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |kv| {
                Some(kv.saturating_sub(mb))
            })
            .unwrap_or_else(|kv| kv);

        if mb > prev {
            self.release_anomalies.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                requested_mb = mb,
                committed_mb = prev,
                "Released more KV-cache than was committed; clamping to zero"
            );
        }
    }

    /// Fraction of the usable budget currently committed (weights and KV-cache).
    pub fn usage_fraction(&self) -> f64 {
        self.committed() as f64 / self.budget_mb as f64
    }

    /// Fraction of the KV-cache space (budget minus weights) currently committed.
    pub fn kv_usage_fraction(&self) -> f64 {
        let kv_space = self.budget_mb.saturating_sub(self.weights());
        if kv_space == 0 {
            return 1.0;
        }
        self.kv_committed() as f64 / kv_space as f64
    }

    pub fn total(&self) -> MemoryMb {
        self.total_mb
    }

    pub fn usable_ratio(&self) -> f64 {
        self.usable_ratio
    }

    pub fn budget(&self) -> MemoryMb {
        self.budget_mb
    }

    pub fn weights(&self) -> MemoryMb {
        self.weights_mb.load(Ordering::Acquire)
    }

    pub fn kv_committed(&self) -> MemoryMb {
        self.kv_committed_mb.load(Ordering::Acquire)
    }

    /// Weights plus live KV-cache
    pub fn committed(&self) -> MemoryMb {
        self.weights() + self.kv_committed()
    }

    /// Budget still free for KV-cache reservations
    pub fn available(&self) -> MemoryMb {
        self.budget_mb.saturating_sub(self.committed())
    }

    /// Number of releases that exceeded the committed amount
    pub fn release_anomalies(&self) -> u64 {
        self.release_anomalies.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn model(weights_mb: MemoryMb) -> Model {
        Model::new(
            "test-model",
            weights_mb,
            4,
            Duration::from_millis(20),
            Duration::from_millis(20),
        )
        .unwrap()
    }

    fn device(weights_mb: MemoryMb) -> Device {
        let device = Device::new(80000, 0.8).unwrap();
        device.load_weights(&model(weights_mb)).unwrap();
        device
    }

    #[test]
    fn test_budget_and_weights() {
        let device = device(25000);
        assert_eq!(device.budget(), 64000);
        assert_eq!(device.weights(), 25000);
        assert_eq!(device.available(), 39000);
        assert_relative_eq!(device.usage_fraction(), 25000.0 / 64000.0);
        assert_relative_eq!(device.kv_usage_fraction(), 0.0);
    }

    #[test]
    fn test_reserve_up_to_budget() {
        let device = device(25000);
        assert!(device.try_reserve(38000));
        assert!(device.try_reserve(1000));
        assert_eq!(device.available(), 0);

        // exactly full, nothing more fits and a failed reserve changes nothing
        assert!(!device.try_reserve(1));
        assert_eq!(device.kv_committed(), 39000);
        assert_relative_eq!(device.usage_fraction(), 1.0);
    }

    #[test]
    fn test_release_restores_budget() {
        let device = device(25000);
        assert!(device.try_reserve(600));
        device.release(600);
        assert_eq!(device.kv_committed(), 0);
        assert_eq!(device.release_anomalies(), 0);
    }

    #[test]
    fn test_double_release_clamps_and_counts() {
        let device = device(25000);
        assert!(device.try_reserve(600));
        device.release(600);
        device.release(600);
        assert_eq!(device.kv_committed(), 0);
        assert_eq!(device.weights(), 25000);
        assert_eq!(device.release_anomalies(), 1);
    }

    #[test]
    fn test_weights_exceeding_budget_rejected() {
        let device = Device::new(80000, 0.8).unwrap();
        let err = device.load_weights(&model(64001)).unwrap_err();
        assert!(matches!(err, ConfigError::WeightsExceedBudget { .. }));
    }

    #[test]
    fn test_weights_load_once() {
        let device = device(25000);
        assert!(matches!(
            device.load_weights(&model(100)),
            Err(ConfigError::WeightsAlreadyLoaded)
        ));
    }

    #[test]
    fn test_invalid_construction() {
        assert!(Device::new(0, 0.8).is_err());
        assert!(Device::new(1000, 0.0).is_err());
        assert!(Device::new(1000, 1.5).is_err());
        assert!(Device::new(1000, f64::NAN).is_err());
        assert!(Device::new(1000, 1.0).is_ok());
    }

    #[test]
    fn test_concurrent_reservations_never_oversubscribe() {
        let device = Arc::new(device(25000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let device = device.clone();
                std::thread::spawn(move || (0..1000).filter(|_| device.try_reserve(7)).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(device.kv_committed(), granted as u64 * 7);
        assert!(device.committed() <= device.budget());
        assert_eq!(granted, 39000 / 7);
    }
}
