// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Metrics emitted by the scheduler.
//!
//! The scheduler only knows about the [`MetricsSink`] trait; [`PrometheusMetrics`] is the
//! implementation used by the server, registered into a [`prometheus::Registry`] and labelled
//! with the model name.

pub mod prometheus_names;

use prometheus::{GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use prometheus_names::{counters, gauges, histograms, labels};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gauge {
    NumRequestsRunning,
    NumRequestsWaiting,
    GpuCacheUsagePerc,
}

impl Gauge {
    pub const ALL: [Gauge; 3] = [
        Gauge::NumRequestsRunning,
        Gauge::NumRequestsWaiting,
        Gauge::GpuCacheUsagePerc,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Gauge::NumRequestsRunning => gauges::NUM_REQUESTS_RUNNING,
            Gauge::NumRequestsWaiting => gauges::NUM_REQUESTS_WAITING,
            Gauge::GpuCacheUsagePerc => gauges::GPU_CACHE_USAGE_PERC,
        }
    }

    fn help(&self) -> &'static str {
        match self {
            Gauge::NumRequestsRunning => "Number of requests currently running on GPU.",
            Gauge::NumRequestsWaiting => "Number of requests waiting to be processed.",
            Gauge::GpuCacheUsagePerc => "GPU KV-cache usage. 1 means 100 percent usage.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    RequestArrival,
    RequestAdmitted,
    RequestSuccess,
    RequestCancelled,
    Tokens,
    RequestsCount,
    TokensCount,
}

impl Counter {
    pub const ALL: [Counter; 7] = [
        Counter::RequestArrival,
        Counter::RequestAdmitted,
        Counter::RequestSuccess,
        Counter::RequestCancelled,
        Counter::Tokens,
        Counter::RequestsCount,
        Counter::TokensCount,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::RequestArrival => counters::REQUEST_ARRIVAL_TOTAL,
            Counter::RequestAdmitted => counters::REQUEST_ADMITTED_TOTAL,
            Counter::RequestSuccess => counters::REQUEST_SUCCESS_TOTAL,
            Counter::RequestCancelled => counters::REQUEST_CANCELLED_TOTAL,
            Counter::Tokens => counters::TOKENS_TOTAL,
            Counter::RequestsCount => counters::REQUESTS_COUNT_TOTAL,
            Counter::TokensCount => counters::TOKENS_COUNT_TOTAL,
        }
    }

    fn help(&self) -> &'static str {
        match self {
            Counter::RequestArrival => "Total number of requests received (arrivals).",
            Counter::RequestAdmitted => "Total number of requests admitted to the running batch.",
            Counter::RequestSuccess => {
                "Total number of requests successfully completed (departures)."
            }
            Counter::RequestCancelled => "Total number of requests cancelled before completion.",
            Counter::Tokens => "Total number of tokens processed (prompt and generation).",
            Counter::RequestsCount => "Total number of requests received.",
            Counter::TokensCount => "Total number of tokens generated.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Histogram {
    RequestQueueTime,
    TimePerOutputToken,
    TimeToFirstToken,
    E2eRequestLatency,
    RequestPromptTokens,
    RequestGenerationTokens,
}

impl Histogram {
    pub const ALL: [Histogram; 6] = [
        Histogram::RequestQueueTime,
        Histogram::TimePerOutputToken,
        Histogram::TimeToFirstToken,
        Histogram::E2eRequestLatency,
        Histogram::RequestPromptTokens,
        Histogram::RequestGenerationTokens,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Histogram::RequestQueueTime => histograms::REQUEST_QUEUE_TIME_SECONDS,
            Histogram::TimePerOutputToken => histograms::TIME_PER_OUTPUT_TOKEN_SECONDS,
            Histogram::TimeToFirstToken => histograms::TIME_TO_FIRST_TOKEN_SECONDS,
            Histogram::E2eRequestLatency => histograms::E2E_REQUEST_LATENCY_SECONDS,
            Histogram::RequestPromptTokens => histograms::REQUEST_PROMPT_TOKENS,
            Histogram::RequestGenerationTokens => histograms::REQUEST_GENERATION_TOKENS,
        }
    }

    pub fn buckets(&self) -> &'static [f64] {
        match self {
            Histogram::RequestQueueTime | Histogram::E2eRequestLatency => {
                histograms::REQUEST_LATENCY_BUCKETS
            }
            Histogram::TimePerOutputToken => histograms::TIME_PER_OUTPUT_TOKEN_BUCKETS,
            Histogram::TimeToFirstToken => histograms::TIME_TO_FIRST_TOKEN_BUCKETS,
            Histogram::RequestPromptTokens | Histogram::RequestGenerationTokens => {
                histograms::TOKEN_COUNT_BUCKETS
            }
        }
    }

    fn help(&self) -> &'static str {
        match self {
            Histogram::RequestQueueTime => "Histogram of time spent in WAITING phase for request.",
            Histogram::TimePerOutputToken => "Histogram of inter-token latency in seconds.",
            Histogram::TimeToFirstToken => "Histogram of time to first token in seconds.",
            Histogram::E2eRequestLatency => "Histogram of end to end request latency in seconds.",
            Histogram::RequestPromptTokens => "Number of prefill tokens processed.",
            Histogram::RequestGenerationTokens => "Number of generation tokens processed.",
        }
    }
}

/// Destination for the scheduler's numeric observations
pub trait MetricsSink: Send + Sync {
    fn set_gauge(&self, gauge: Gauge, value: f64);

    fn inc_counter(&self, counter: Counter, value: u64);

    fn observe(&self, histogram: Histogram, value: f64);
}

/// Sink that drops every observation
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn set_gauge(&self, _gauge: Gauge, _value: f64) {}

    fn inc_counter(&self, _counter: Counter, _value: u64) {}

    fn observe(&self, _histogram: Histogram, _value: f64) {}
}

/// Prometheus-backed sink for a single model deployment
pub struct PrometheusMetrics {
    model_name: String,
    gauges: Vec<GaugeVec>,
    counters: Vec<IntCounterVec>,
    histograms: Vec<HistogramVec>,
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics")
            .field("model_name", &self.model_name)
            .finish_non_exhaustive()
    }
}

impl PrometheusMetrics {
    /// Create every vLLM metric, labelled with `model_name`.
    pub fn new(model_name: impl Into<String>) -> Result<Self, prometheus::Error> {
        let label_names = &[labels::MODEL_NAME];

        let gauges = Gauge::ALL
            .iter()
            .map(|g| GaugeVec::new(Opts::new(g.name(), g.help()), label_names))
            .collect::<Result<Vec<_>, prometheus::Error>>()?;

        let counters = Counter::ALL
            .iter()
            .map(|c| IntCounterVec::new(Opts::new(c.name(), c.help()), label_names))
            .collect::<Result<Vec<_>, prometheus::Error>>()?;

        let histograms = Histogram::ALL
            .iter()
            .map(|h| {
                let opts = HistogramOpts::new(h.name(), h.help()).buckets(h.buckets().to_vec());
                HistogramVec::new(opts, label_names)
            })
            .collect::<Result<Vec<_>, prometheus::Error>>()?;

        Ok(Self {
            model_name: model_name.into(),
            gauges,
            counters,
            histograms,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        for gauge in &self.gauges {
            registry.register(Box::new(gauge.clone()))?;
        }
        for counter in &self.counters {
            registry.register(Box::new(counter.clone()))?;
        }
        for histogram in &self.histograms {
            registry.register(Box::new(histogram.clone()))?;
        }
        Ok(())
    }

    // vectors are built from `ALL`, which lists variants in declaration order
    fn gauge_vec(&self, gauge: Gauge) -> &GaugeVec {
        &self.gauges[gauge as usize]
    }

    fn counter_vec(&self, counter: Counter) -> &IntCounterVec {
        &self.counters[counter as usize]
    }

    fn histogram_vec(&self, histogram: Histogram) -> &HistogramVec {
        &self.histograms[histogram as usize]
    }

    /// Current value of a gauge
    pub fn gauge(&self, gauge: Gauge) -> f64 {
        self.gauge_vec(gauge)
            .with_label_values(&[self.model_name.as_str()])
            .get()
    }

    /// Current value of a counter
    pub fn counter(&self, counter: Counter) -> u64 {
        self.counter_vec(counter)
            .with_label_values(&[self.model_name.as_str()])
            .get()
    }

    /// Number of observations recorded by a histogram
    pub fn histogram_count(&self, histogram: Histogram) -> u64 {
        self.histogram_vec(histogram)
            .with_label_values(&[self.model_name.as_str()])
            .get_sample_count()
    }

    /// Sum of the observations recorded by a histogram
    pub fn histogram_sum(&self, histogram: Histogram) -> f64 {
        self.histogram_vec(histogram)
            .with_label_values(&[self.model_name.as_str()])
            .get_sample_sum()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn set_gauge(&self, gauge: Gauge, value: f64) {
        self.gauge_vec(gauge)
            .with_label_values(&[self.model_name.as_str()])
            .set(value);
    }

    fn inc_counter(&self, counter: Counter, value: u64) {
        self.counter_vec(counter)
            .with_label_values(&[self.model_name.as_str()])
            .inc_by(value);
    }

    fn observe(&self, histogram: Histogram, value: f64) {
        self.histogram_vec(histogram)
            .with_label_values(&[self.model_name.as_str()])
            .observe(value);
    }
}
