// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Prometheus metric names and bucket layouts of the vLLM observability contract.
//!
//! Autoscalers and dashboards scrape these names verbatim, so they must not change.
//! Counter names include the `_total` suffix that Python clients append implicitly.

/// Label names
pub mod labels {
    /// Model deployment the observation belongs to
    pub const MODEL_NAME: &str = "model_name";
}

/// Scheduler state gauges
pub mod gauges {
    /// Number of requests currently running on GPU
    pub const NUM_REQUESTS_RUNNING: &str = "vllm:num_requests_running";

    /// Number of requests waiting to be processed
    pub const NUM_REQUESTS_WAITING: &str = "vllm:num_requests_waiting";

    /// GPU memory usage, 1 means 100 percent
    pub const GPU_CACHE_USAGE_PERC: &str = "vllm:gpu_cache_usage_perc";
}

/// Cumulative counters
pub mod counters {
    /// Requests received
    pub const REQUEST_ARRIVAL_TOTAL: &str = "vllm:request_arrival_total";

    /// Requests admitted into the running batch
    pub const REQUEST_ADMITTED_TOTAL: &str = "vllm:request_admitted_total";

    /// Requests completed (departures)
    pub const REQUEST_SUCCESS_TOTAL: &str = "vllm:request_success_total";

    /// Requests abandoned by their caller or by shutdown
    pub const REQUEST_CANCELLED_TOTAL: &str = "vllm:request_cancelled_total";

    /// Tokens processed, prompt plus generated
    pub const TOKENS_TOTAL: &str = "vllm:tokens_total";

    /// Requests received, under the name autoscaler arrival-rate queries read
    pub const REQUESTS_COUNT_TOTAL: &str = "vllm:requests_count_total";

    /// Tokens processed, under the name autoscaler average-length queries read
    pub const TOKENS_COUNT_TOTAL: &str = "vllm:tokens_count_total";
}

/// Histograms and their buckets
pub mod histograms {
    /// Time spent in the WAITING phase
    pub const REQUEST_QUEUE_TIME_SECONDS: &str = "vllm:request_queue_time_seconds";

    /// Inter-token latency
    pub const TIME_PER_OUTPUT_TOKEN_SECONDS: &str = "vllm:time_per_output_token_seconds";

    /// Arrival to first token
    pub const TIME_TO_FIRST_TOKEN_SECONDS: &str = "vllm:time_to_first_token_seconds";

    /// Arrival to completion
    pub const E2E_REQUEST_LATENCY_SECONDS: &str = "vllm:e2e_request_latency_seconds";

    /// Prompt tokens per request
    pub const REQUEST_PROMPT_TOKENS: &str = "vllm:request_prompt_tokens";

    /// Generated tokens per request
    pub const REQUEST_GENERATION_TOKENS: &str = "vllm:request_generation_tokens";

    pub const REQUEST_LATENCY_BUCKETS: &[f64] = &[
        0.3, 0.5, 0.8, 1.0, 1.5, 2.0, 2.5, 5.0, 10.0, 15.0, 20.0, 30.0, 40.0, 50.0, 60.0, 120.0,
        240.0, 480.0, 960.0, 1920.0, 7680.0,
    ];

    pub const TIME_PER_OUTPUT_TOKEN_BUCKETS: &[f64] = &[
        0.01, 0.025, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.4, 0.5, 0.75, 1.0, 2.5,
    ];

    pub const TIME_TO_FIRST_TOKEN_BUCKETS: &[f64] = &[
        0.001, 0.005, 0.01, 0.02, 0.04, 0.06, 0.08, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5,
        10.0,
    ];

    pub const TOKEN_COUNT_BUCKETS: &[f64] = &[
        1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0, 2000.0, 5000.0,
    ];
}
