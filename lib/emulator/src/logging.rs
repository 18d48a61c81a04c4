// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Emulator logging.
//!
//! Logging can take two forms: `READABLE` or `JSONL`. The default is `READABLE`. `JSONL`
//! can be enabled by setting the `VLLME_LOGGING_JSONL` environment variable to `1`.
//!
//! Filters are read from the `VLLME_LOG` environment variable using the usual
//! `tracing_subscriber` directive syntax, for example `VLLME_LOG=vllm_emulator::scheduler=debug`.
//! The default log level is `info`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::config::env_is_truthy;

/// Filter directives
pub const VLLME_LOG: &str = "VLLME_LOG";

/// Emit one JSON object per line
pub const VLLME_LOGGING_JSONL: &str = "VLLME_LOGGING_JSONL";

/// Disable ANSI colors in readable output
pub const VLLME_LOG_DISABLE_ANSI: &str = "VLLME_LOG_DISABLE_ANSI";

/// Default log level
const DEFAULT_FILTER_LEVEL: &str = "info";

/// Noisy dependencies held at `error` unless overridden
const QUIET_TARGETS: &[&str] = &["h2", "hyper_util", "tower", "reqwest"];

/// Once instance to ensure the logger is only initialized once
static INIT: Once = Once::new();

/// Initialize the logger. Later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        if let Err(e) = setup_logging() {
            eprintln!("Failed to initialize logging: {}", e);
        }
    });
}

fn setup_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = filters()?;

    if env_is_truthy(VLLME_LOGGING_JSONL) {
        let layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_writer(std::io::stderr)
            .with_filter(filter);
        tracing_subscriber::registry().with(layer).try_init()?;
    } else {
        let layer = fmt::layer()
            .compact()
            .with_ansi(!env_is_truthy(VLLME_LOG_DISABLE_ANSI))
            .with_writer(std::io::stderr)
            .with_filter(filter);
        tracing_subscriber::registry().with(layer).try_init()?;
    }
    Ok(())
}

fn filters() -> Result<EnvFilter, Box<dyn std::error::Error + Send + Sync>> {
    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(DEFAULT_FILTER_LEVEL.parse::<Directive>()?)
        .with_env_var(VLLME_LOG)
        .from_env_lossy();

    // user directives for the same target take precedence over these
    let user_filters = std::env::var(VLLME_LOG).unwrap_or_default();
    for target in QUIET_TARGETS {
        if user_filters.contains(target) {
            continue;
        }
        filter_layer = filter_layer.add_directive(format!("{target}=error").parse()?);
    }
    Ok(filter_layer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        tracing::info!("logging initialized twice without panicking");
    }

    #[test]
    fn test_filters_respect_user_override() {
        temp_env::with_var(VLLME_LOG, Some("debug,h2=trace"), || {
            let filter = filters().unwrap().to_string().to_lowercase();
            assert!(filter.contains("h2=trace"));
            assert!(filter.contains("reqwest=error"));
            assert!(!filter.contains("h2=error"));
        });
    }
}
