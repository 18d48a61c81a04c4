// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Emulator configuration.
//!
//! Configuration is layered, where the last source has the highest priority:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `VLLME_` (for example `VLLME_DECODE_TIME_MS`)
//! 4. The legacy environment names understood by the original emulator image
//!    (`MODEL_NAME`, `DECODE_TIME`, `MODEL_SIZE`, ...)
//!
//! Command line flags are applied on top by the launcher.

use std::path::Path;
use std::time::Duration;

use derive_builder::Builder;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::clock::Pacing;
use crate::loadgen::OutputLengthDistribution;
use crate::model::Model;
use crate::protocols::{ConfigError, MemoryMb};

pub const DEFAULT_MODEL_NAME: &str = "default";
pub const DEFAULT_WEIGHTS_MB: MemoryMb = 25_000;
pub const DEFAULT_KV_PER_TOKEN_MB: MemoryMb = 2;
pub const DEFAULT_PREFILL_TIME_MS: u64 = 20;
pub const DEFAULT_DECODE_TIME_MS: u64 = 20;
pub const DEFAULT_TOTAL_MEMORY_MB: MemoryMb = 80_000;
pub const DEFAULT_USABLE_RATIO: f64 = 0.8;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1;
pub const DEFAULT_AVG_OUTPUT_LEN: usize = 100;

/// Prefix of the environment variables read by [`EmulatorConfig::from_settings`]
pub const ENV_PREFIX: &str = "VLLME_";

/// Legacy environment names and the fields they set
const LEGACY_ENV: &[(&str, &str)] = &[
    ("MODEL_NAME", "model_name"),
    ("MODEL_SIZE", "weights_mb"),
    ("KVC_PER_TOKEN", "kv_per_token_mb"),
    ("PREFILL_TIME", "prefill_time_ms"),
    ("DECODE_TIME", "decode_time_ms"),
    ("MEM_SIZE", "total_memory_mb"),
    ("USABLE_RATIO", "usable_ratio"),
    ("MAX_BATCH_SIZE", "max_batch_size"),
    ("AVG_TOKENS", "avg_output_len"),
    ("TOKENS_DISTRIBUTION", "distribution"),
    ("SEED", "seed"),
];

/// Legacy boolean switch between real-time and fast-forward pacing
const LEGACY_REALTIME_ENV: &str = "REALTIME";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, Builder)]
#[builder(pattern = "owned", build_fn(private, name = "build_internal"))]
#[serde(default)]
pub struct EmulatorConfig {
    /// Model name reported in the `model_name` metric label
    #[builder(default = "DEFAULT_MODEL_NAME.to_string()", setter(into))]
    #[validate(length(min = 1))]
    pub model_name: String,

    /// Memory held by the model weights
    #[builder(default = "DEFAULT_WEIGHTS_MB")]
    #[validate(range(min = 1))]
    pub weights_mb: MemoryMb,

    /// KV-cache memory per token of context
    #[builder(default = "DEFAULT_KV_PER_TOKEN_MB")]
    #[validate(range(min = 1))]
    pub kv_per_token_mb: MemoryMb,

    #[builder(default = "DEFAULT_PREFILL_TIME_MS")]
    #[validate(range(min = 1))]
    pub prefill_time_ms: u64,

    /// Duration of one decode step, which is also the clock step
    #[builder(default = "DEFAULT_DECODE_TIME_MS")]
    #[validate(range(min = 1))]
    pub decode_time_ms: u64,

    #[builder(default = "DEFAULT_TOTAL_MEMORY_MB")]
    #[validate(range(min = 1))]
    pub total_memory_mb: MemoryMb,

    /// Share of device memory usable for weights and KV-cache
    #[builder(default = "DEFAULT_USABLE_RATIO")]
    #[validate(range(exclusive_min = 0.0, max = 1.0))]
    pub usable_ratio: f64,

    #[builder(default = "DEFAULT_MAX_BATCH_SIZE")]
    #[validate(range(min = 1))]
    pub max_batch_size: usize,

    /// Average number of generated tokens per request
    #[builder(default = "DEFAULT_AVG_OUTPUT_LEN")]
    #[validate(range(min = 1))]
    pub avg_output_len: usize,

    #[builder(default)]
    pub distribution: OutputLengthDistribution,

    #[builder(default)]
    pub pacing: Pacing,

    /// Seed for the output length generator; random when unset
    #[builder(default)]
    pub seed: Option<u64>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL_NAME.to_string(),
            weights_mb: DEFAULT_WEIGHTS_MB,
            kv_per_token_mb: DEFAULT_KV_PER_TOKEN_MB,
            prefill_time_ms: DEFAULT_PREFILL_TIME_MS,
            decode_time_ms: DEFAULT_DECODE_TIME_MS,
            total_memory_mb: DEFAULT_TOTAL_MEMORY_MB,
            usable_ratio: DEFAULT_USABLE_RATIO,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            avg_output_len: DEFAULT_AVG_OUTPUT_LEN,
            distribution: OutputLengthDistribution::default(),
            pacing: Pacing::default(),
            seed: None,
        }
    }
}

impl EmulatorConfigBuilder {
    pub fn build(self) -> Result<EmulatorConfig, ConfigError> {
        let config = self
            .build_internal()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate_config()?;
        Ok(config)
    }
}

impl EmulatorConfig {
    pub fn builder() -> EmulatorConfigBuilder {
        EmulatorConfigBuilder::default()
    }

    pub(crate) fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(EmulatorConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).filter_map(|k| {
                let full_key = format!("{ENV_PREFIX}{}", k.as_str().to_ascii_uppercase());
                // filters out empty environment variables
                match std::env::var(&full_key) {
                    Ok(v) if !v.is_empty() => Some(k.into()),
                    _ => None,
                }
            }))
            .merge(Env::raw().filter_map(|k| {
                let name = k.as_str().to_ascii_uppercase();
                let (_, field) = LEGACY_ENV.iter().find(|(env, _)| *env == name)?;
                match std::env::var(&name) {
                    Ok(v) if !v.is_empty() => Some((*field).into()),
                    _ => None,
                }
            }))
    }

    /// Load the configuration from defaults, an optional TOML file and the environment.
    pub fn from_settings(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path
            && !path.is_file()
        {
            return Err(ConfigError::Invalid(format!(
                "config file {} does not exist",
                path.display()
            )));
        }

        let mut config: EmulatorConfig = Self::figment(path).extract().map_err(Box::new)?;

        if let Ok(value) = std::env::var(LEGACY_REALTIME_ENV)
            && !value.is_empty()
        {
            config.pacing = if is_truthy(&value) {
                Pacing::RealTime
            } else if is_falsey(&value) {
                Pacing::FastForward
            } else {
                return Err(ConfigError::Invalid(format!(
                    "{LEGACY_REALTIME_ENV} must be a boolean, got '{value}'"
                )));
            };
        }

        config.validate_config()?;
        tracing::debug!(?config, "Loaded emulator configuration");
        Ok(config)
    }

    /// Check field ranges, then that the weights fit the usable budget.
    pub fn validate_config(&self) -> Result<(), ConfigError> {
        self.validate().map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let budget_mb = (self.total_memory_mb as f64 * self.usable_ratio).floor() as MemoryMb;
        if self.weights_mb > budget_mb {
            return Err(ConfigError::WeightsExceedBudget {
                weights_mb: self.weights_mb,
                budget_mb,
            });
        }
        Ok(())
    }

    pub fn prefill_time(&self) -> Duration {
        Duration::from_millis(self.prefill_time_ms)
    }

    pub fn decode_time(&self) -> Duration {
        Duration::from_millis(self.decode_time_ms)
    }

    pub fn model(&self) -> Result<Model, ConfigError> {
        Model::new(
            self.model_name.clone(),
            self.weights_mb,
            self.kv_per_token_mb,
            self.prefill_time(),
            self.decode_time(),
        )
    }
}

/// Check if a string is truthy
/// This will be used to evaluate environment variables or any other subjective
/// configuration parameters that can be set by the user that should be evaluated
/// as a boolean value.
pub fn is_truthy(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Check if a string is falsey
pub fn is_falsey(val: &str) -> bool {
    matches!(val.to_lowercase().as_str(), "0" | "false" | "off" | "no")
}

/// Check if an environment variable is truthy
pub fn env_is_truthy(env: &str) -> bool {
    match std::env::var(env) {
        Ok(val) => is_truthy(val.as_str()),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    /// Every variable `from_settings` reads, cleared so the host environment cannot leak in
    fn cleared_env() -> Vec<(String, Option<String>)> {
        let mut vars: Vec<(String, Option<String>)> = LEGACY_ENV
            .iter()
            .map(|(env, _)| (env.to_string(), None))
            .collect();
        vars.push((LEGACY_REALTIME_ENV.to_string(), None));
        for field in [
            "MODEL_NAME",
            "WEIGHTS_MB",
            "DECODE_TIME_MS",
            "MAX_BATCH_SIZE",
            "PACING",
            "DISTRIBUTION",
        ] {
            vars.push((format!("{ENV_PREFIX}{field}"), None));
        }
        vars
    }

    fn with_env<R>(overrides: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let mut vars = cleared_env();
        for (key, value) in overrides {
            vars.retain(|(k, _)| k != key);
            vars.push((key.to_string(), Some(value.to_string())));
        }
        temp_env::with_vars(vars, f)
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = with_env(&[], || EmulatorConfig::from_settings(None)).unwrap();
        assert_eq!(config, EmulatorConfig::default());
        assert_eq!(config.decode_time(), Duration::from_millis(20));
        assert_eq!(config.pacing, Pacing::RealTime);
        assert_eq!(config.distribution, OutputLengthDistribution::Uniform);
    }

    #[test]
    fn test_builder() {
        let config = EmulatorConfig::builder()
            .model_name("llama")
            .weights_mb(30_000)
            .max_batch_size(8)
            .pacing(Pacing::FastForward)
            .seed(Some(3))
            .build()
            .unwrap();
        assert_eq!(config.model_name, "llama");
        assert_eq!(config.max_batch_size, 8);
        assert_eq!(config.kv_per_token_mb, DEFAULT_KV_PER_TOKEN_MB);
        assert_eq!(config.model().unwrap().weights_mb(), 30_000);
    }

    #[rstest]
    #[case::zero_batch(EmulatorConfig::builder().max_batch_size(0))]
    #[case::zero_decode(EmulatorConfig::builder().decode_time_ms(0))]
    #[case::zero_kv(EmulatorConfig::builder().kv_per_token_mb(0))]
    #[case::ratio_zero(EmulatorConfig::builder().usable_ratio(0.0))]
    #[case::ratio_above_one(EmulatorConfig::builder().usable_ratio(1.5))]
    #[case::empty_name(EmulatorConfig::builder().model_name(""))]
    fn test_builder_rejects_invalid(#[case] builder: EmulatorConfigBuilder) {
        assert!(matches!(builder.build(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_weights_must_fit_budget() {
        let err = EmulatorConfig::builder()
            .weights_mb(70_000)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::WeightsExceedBudget {
                weights_mb: 70_000,
                budget_mb: 64_000
            }
        ));
    }

    #[test]
    fn test_legacy_environment() {
        let config = with_env(
            &[
                ("MODEL_NAME", "opt-125m"),
                ("DECODE_TIME", "35"),
                ("MODEL_SIZE", "12000"),
                ("KVC_PER_TOKEN", "4"),
                ("MAX_BATCH_SIZE", "16"),
                ("TOKENS_DISTRIBUTION", "deterministic"),
                ("REALTIME", "False"),
            ],
            || EmulatorConfig::from_settings(None),
        )
        .unwrap();

        assert_eq!(config.model_name, "opt-125m");
        assert_eq!(config.decode_time_ms, 35);
        assert_eq!(config.weights_mb, 12_000);
        assert_eq!(config.kv_per_token_mb, 4);
        assert_eq!(config.max_batch_size, 16);
        assert_eq!(config.distribution, OutputLengthDistribution::Fixed);
        assert_eq!(config.pacing, Pacing::FastForward);
    }

    #[test]
    fn test_prefixed_environment_and_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "model_name = \"from-file\"\nmax_batch_size = 4\ndecode_time_ms = 10"
        )
        .unwrap();

        let config = with_env(
            &[("VLLME_MAX_BATCH_SIZE", "32"), ("VLLME_PACING", "fast_forward")],
            || EmulatorConfig::from_settings(Some(file.path())),
        )
        .unwrap();

        // file overrides defaults, environment overrides file
        assert_eq!(config.model_name, "from-file");
        assert_eq!(config.decode_time_ms, 10);
        assert_eq!(config.max_batch_size, 32);
        assert_eq!(config.pacing, Pacing::FastForward);
    }

    #[test]
    fn test_unknown_distribution_is_rejected() {
        let err = with_env(&[("TOKENS_DISTRIBUTION", "zipf")], || {
            EmulatorConfig::from_settings(None)
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    fn test_missing_file_is_rejected() {
        let err = with_env(&[], || {
            EmulatorConfig::from_settings(Some(Path::new("/nonexistent/emulator.toml")))
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[rstest]
    #[case("1", true)]
    #[case("True", true)]
    #[case("on", true)]
    #[case("0", false)]
    #[case("nope", false)]
    fn test_is_truthy(#[case] value: &str, #[case] expected: bool) {
        assert_eq!(is_truthy(value), expected);
    }
}
