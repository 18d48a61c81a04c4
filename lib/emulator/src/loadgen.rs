// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Synthetic output lengths for incoming requests.

use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::protocols::ConfigError;

/// Family of the output length distribution
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OutputLengthDistribution {
    /// Uniform over `[avg - avg/2, avg + avg/2]`
    #[default]
    Uniform,
    /// Always the average
    #[serde(alias = "deterministic")]
    #[strum(serialize = "fixed", serialize = "deterministic")]
    Fixed,
    /// Exponential with the average as its mean
    Exponential,
}

impl OutputLengthDistribution {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        Self::from_str(name.trim()).map_err(|_| ConfigError::UnknownDistribution(name.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct LoadGenerator {
    avg_output_len: usize,
    distribution: OutputLengthDistribution,
    rng: StdRng,
}

impl LoadGenerator {
    /// Create a generator. A `seed` makes the sequence of samples reproducible.
    pub fn new(
        avg_output_len: usize,
        distribution: OutputLengthDistribution,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            avg_output_len,
            distribution,
            rng,
        }
    }

    pub fn avg_output_len(&self) -> usize {
        self.avg_output_len
    }

    pub fn distribution(&self) -> OutputLengthDistribution {
        self.distribution
    }

    /// Sample the number of tokens to generate for a request with `input_len` prompt tokens.
    ///
    /// The prompt length does not currently shift the distribution.
    pub fn sample_output_length(&mut self, _input_len: usize) -> usize {
        let avg = self.avg_output_len;
        match self.distribution {
            OutputLengthDistribution::Fixed => avg,
            OutputLengthDistribution::Uniform => {
                let spread = avg / 2;
                self.rng
                    .random_range(avg - spread..=avg.saturating_add(spread))
                    .max(1)
            }
            OutputLengthDistribution::Exponential => {
                // inverse CDF; 1 - u is in (0, 1] so the log is finite
                let u: f64 = self.rng.random();
                let sample = -(avg as f64) * (1.0 - u).ln();
                (sample.round() as usize).max(1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("uniform", OutputLengthDistribution::Uniform)]
    #[case("Uniform", OutputLengthDistribution::Uniform)]
    #[case("fixed", OutputLengthDistribution::Fixed)]
    #[case("deterministic", OutputLengthDistribution::Fixed)]
    #[case("exponential", OutputLengthDistribution::Exponential)]
    fn test_parse_distribution(#[case] name: &str, #[case] expected: OutputLengthDistribution) {
        assert_eq!(OutputLengthDistribution::parse(name).unwrap(), expected);
    }

    #[test]
    fn test_unknown_distribution() {
        let err = OutputLengthDistribution::parse("zipf").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDistribution(name) if name == "zipf"));
    }

    #[test]
    fn test_fixed_returns_average() {
        let mut generator = LoadGenerator::new(50, OutputLengthDistribution::Fixed, None);
        for input_len in [0, 1, 100, 10_000] {
            assert_eq!(generator.sample_output_length(input_len), 50);
        }
    }

    #[test]
    fn test_uniform_stays_in_band() {
        let mut generator = LoadGenerator::new(100, OutputLengthDistribution::Uniform, Some(7));
        let samples: Vec<usize> = (0..5000).map(|_| generator.sample_output_length(10)).collect();

        assert!(samples.iter().all(|&s| (50..=150).contains(&s)));
        let mean = samples.iter().sum::<usize>() as f64 / samples.len() as f64;
        assert!((mean - 100.0).abs() < 3.0, "mean {mean}");
    }

    #[test]
    fn test_uniform_with_huge_average_does_not_overflow() {
        let avg = usize::MAX - 1;
        let mut generator = LoadGenerator::new(avg, OutputLengthDistribution::Uniform, Some(3));
        for _ in 0..100 {
            assert!(generator.sample_output_length(1) >= avg - avg / 2);
        }
    }

    #[test]
    fn test_uniform_clamps_to_one() {
        let mut generator = LoadGenerator::new(1, OutputLengthDistribution::Uniform, Some(1));
        assert!((0..100).all(|_| generator.sample_output_length(5) == 1));

        let mut generator = LoadGenerator::new(0, OutputLengthDistribution::Uniform, Some(1));
        assert!((0..100).all(|_| generator.sample_output_length(5) == 1));
    }

    #[test]
    fn test_exponential_mean_and_floor() {
        let mut generator =
            LoadGenerator::new(200, OutputLengthDistribution::Exponential, Some(11));
        let samples: Vec<usize> = (0..20_000)
            .map(|_| generator.sample_output_length(10))
            .collect();

        assert!(samples.iter().all(|&s| s >= 1));
        let mean = samples.iter().sum::<usize>() as f64 / samples.len() as f64;
        assert!((mean - 200.0).abs() < 10.0, "mean {mean}");
    }

    #[test]
    fn test_seed_is_reproducible() {
        let mut a = LoadGenerator::new(128, OutputLengthDistribution::Uniform, Some(42));
        let mut b = LoadGenerator::new(128, OutputLengthDistribution::Uniform, Some(42));
        let xs: Vec<_> = (0..64).map(|i| a.sample_output_length(i)).collect();
        let ys: Vec<_> = (0..64).map(|i| b.sample_output_length(i)).collect();
        assert_eq!(xs, ys);
    }
}
