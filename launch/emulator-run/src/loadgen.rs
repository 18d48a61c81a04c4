// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Open-loop HTTP load generator for the emulated server.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Request rate in requests per minute, constant or as a schedule of phases
#[derive(Debug, Clone, PartialEq)]
pub enum RateSpec {
    Constant(f64),
    /// `(duration_secs, rpm)` phases played in order; the rate is zero afterwards
    Schedule(Vec<(f64, f64)>),
}

impl RateSpec {
    /// Rate in effect `elapsed` after the start
    pub fn rate_at(&self, elapsed: Duration) -> f64 {
        match self {
            RateSpec::Constant(rpm) => *rpm,
            RateSpec::Schedule(phases) => {
                let elapsed = elapsed.as_secs_f64();
                let mut marker = 0.0;
                for (duration, rpm) in phases {
                    if elapsed <= marker + duration {
                        return *rpm;
                    }
                    marker += duration;
                }
                0.0
            }
        }
    }

    /// Total length of a schedule; `None` for a constant rate
    pub fn total_duration(&self) -> anyhow::Result<Option<Duration>> {
        match self {
            RateSpec::Constant(_) => Ok(None),
            RateSpec::Schedule(phases) => {
                let secs: f64 = phases.iter().map(|(d, _)| d.max(0.0)).sum();
                let total = Duration::try_from_secs_f64(secs)
                    .with_context(|| format!("rate schedule of {secs} seconds is too long"))?;
                Ok(Some(total))
            }
        }
    }
}

/// Checks that a rate in requests per minute yields a representable gap
fn check_rpm(rpm: f64) -> anyhow::Result<()> {
    anyhow::ensure!(rpm.is_finite(), "rate must be finite, got {rpm}");
    if rpm > 0.0 {
        Duration::try_from_secs_f64(60.0 / rpm)
            .with_context(|| format!("rate {rpm} per minute is too small"))?;
    }
    Ok(())
}

impl FromStr for RateSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        if let Ok(rpm) = s.trim().parse::<f64>() {
            anyhow::ensure!(rpm > 0.0, "rate must be positive, got {rpm}");
            check_rpm(rpm)?;
            return Ok(RateSpec::Constant(rpm));
        }
        let phases: Vec<(f64, f64)> = serde_json::from_str(s)
            .with_context(|| format!("rate '{s}' is neither a number nor a [[secs, rpm], ...] list"))?;
        anyhow::ensure!(!phases.is_empty(), "rate schedule must not be empty");
        for (duration, rpm) in &phases {
            anyhow::ensure!(
                *duration >= 0.0 && *rpm >= 0.0,
                "rate schedule entries must be non-negative, got [{duration}, {rpm}]"
            );
            check_rpm(*rpm)?;
        }
        let spec = RateSpec::Schedule(phases);
        spec.total_duration()?;
        Ok(spec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ArrivalMode {
    /// Exponential inter-arrival times
    Poisson,
    /// Fixed inter-arrival times
    Deterministic,
}

/// Gap before the next request at `rpm` requests per minute
pub fn inter_arrival(mode: ArrivalMode, rpm: f64, rng: &mut StdRng) -> anyhow::Result<Duration> {
    let mean = 60.0 / rpm;
    let secs = match mode {
        ArrivalMode::Deterministic => mean,
        ArrivalMode::Poisson => {
            let u: f64 = rng.random();
            -mean * (1.0 - u).ln()
        }
    };
    Duration::try_from_secs_f64(secs)
        .with_context(|| format!("inter-arrival gap of {secs} seconds at {rpm} per minute"))
}

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Open-loop load generator for an OpenAI-compatible server")]
pub struct LoadgenArgs {
    /// Base URL of the server
    #[arg(long, default_value = "http://localhost:30000/v1")]
    pub url: String,

    /// API key sent as a bearer token
    #[arg(long, default_value = "fake-api-key")]
    pub api_key: String,

    #[arg(long, default_value = "gpt-1337-turbo-pro-max")]
    pub model: String,

    /// Characters in each prompt
    #[arg(long, default_value_t = 150)]
    pub content_length: usize,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long, value_enum, default_value_t = ArrivalMode::Deterministic)]
    pub mode: ArrivalMode,

    /// Requests per minute, either a number or a JSON schedule like `[[60, 4], [60, 8]]`
    #[arg(long)]
    pub rate: RateSpec,
}

/// Totals of a load generation run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadgenSummary {
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
}

pub async fn run(args: LoadgenArgs, cancel_token: CancellationToken) -> anyhow::Result<LoadgenSummary> {
    let mut rng = match args.seed {
        Some(seed) => {
            tracing::info!(seed, "Random seed set");
            StdRng::seed_from_u64(seed)
        }
        None => StdRng::from_os_rng(),
    };
    tracing::info!(
        mode = ?args.mode,
        url = %args.url,
        rate = ?args.rate,
        model = %args.model,
        content_length = args.content_length,
        "Starting load generator"
    );

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;
    let endpoint = format!("{}/chat/completions", args.url.trim_end_matches('/'));
    let content = "x".repeat(args.content_length);
    let total_duration = args.rate.total_duration()?;

    let start = Instant::now();
    let mut last_report = start;
    let mut sent_this_minute = 0u64;
    let mut summary = LoadgenSummary::default();
    let mut in_flight = JoinSet::new();

    loop {
        let elapsed = start.elapsed();
        if total_duration.is_some_and(|total| elapsed > total) {
            break;
        }
        let rpm = args.rate.rate_at(elapsed);
        if rpm <= 0.0 {
            break;
        }

        let gap = inter_arrival(args.mode, rpm, &mut rng)?;
        tokio::select! {
            _ = cancel_token.cancelled() => {
                tracing::info!("Load generator stopped by user");
                break;
            }
            _ = tokio::time::sleep(gap) => {}
        }

        let request = client
            .post(&endpoint)
            .bearer_auth(&args.api_key)
            .json(&json!({
                "model": args.model,
                "messages": [{"role": "user", "content": content}],
            }));
        in_flight.spawn(async move {
            let response = request.send().await.and_then(|r| r.error_for_status());
            if let Err(e) = &response {
                tracing::warn!(error = %e, "Request failed");
            }
            response.is_ok()
        });
        summary.sent += 1;
        sent_this_minute += 1;

        // reap finished requests so the set does not grow with the run
        while let Some(done) = in_flight.try_join_next() {
            tally(&mut summary, done);
        }

        if last_report.elapsed() >= Duration::from_secs(60) {
            tracing::info!(sent = sent_this_minute, "Requests sent in the last minute");
            sent_this_minute = 0;
            last_report = Instant::now();
        }
    }

    if sent_this_minute > 0 {
        tracing::info!(sent = sent_this_minute, "Requests sent in the last minute");
    }

    tracing::info!(in_flight = in_flight.len(), "Load generation finished, waiting for in-flight requests");
    while let Some(done) = in_flight.join_next().await {
        tally(&mut summary, done);
    }
    tracing::info!(
        sent = summary.sent,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "All requests completed"
    );
    Ok(summary)
}

fn tally(summary: &mut LoadgenSummary, done: Result<bool, tokio::task::JoinError>) {
    match done {
        Ok(true) => summary.succeeded += 1,
        Ok(false) => summary.failed += 1,
        Err(e) => {
            tracing::warn!(error = %e, "Request task failed");
            summary.failed += 1;
        }
    }
}
