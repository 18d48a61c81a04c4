// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! OpenAI-shaped HTTP front end for the emulator.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use prometheus::{Encoder, Registry};
use serde::{Deserialize, Serialize};
use serde_json::json;
use vllm_emulator::{Emulator, EngineError, RequestResult};

pub struct AppState {
    pub emulator: Arc<Emulator>,
    pub registry: Registry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default = "default_model")]
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub stream: Option<bool>,
}

fn default_model() -> String {
    "mock-gpt-model".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

impl ChatCompletionResponse {
    fn from_result(model: String, first_role: &str, result: &RequestResult) -> Self {
        let content = if first_role == "user" {
            format!(
                "Request stats: arrival time = {:.3}s, admission time = {:.3}s, ttft = {:.3}s, \
                 completion time = {:.3}s, input_token_len = {}, output_token_len = {}",
                result.arrival_time.as_secs_f64(),
                result.admission_time.as_secs_f64(),
                result.ttft_time.as_secs_f64(),
                result.completion_time.as_secs_f64(),
                result.input_len,
                result.tokens_generated,
            )
        } else {
            "Empty message sent!".to_string()
        };

        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            id: format!("chatcmpl-{}", result.id),
            object: "chat.completion".to_string(),
            created,
            model,
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: "length".to_string(),
            }],
            usage: Usage {
                prompt_tokens: result.input_len,
                completion_tokens: result.tokens_generated,
                total_tokens: result.input_len + result.tokens_generated,
            },
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/metrics", get(handler_metrics))
        .route("/health", get(health_handler))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "message": message.into(),
                "code": status.as_u16(),
            }
        })),
    )
        .into_response()
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let (Some(first), Some(last)) = (request.messages.first(), request.messages.last()) else {
        return error_response(StatusCode::BAD_REQUEST, "messages must not be empty");
    };
    if request.stream.unwrap_or(false) {
        tracing::debug!("Streaming requested; answering with a single response");
    }

    match state.emulator.submit_prompt(&last.content).await {
        Ok(result) => {
            tracing::debug!(
                id = %result.id,
                input_len = result.input_len,
                output_len = result.tokens_generated,
                e2e_ms = result.e2e_latency().as_millis() as u64,
                "Chat completion finished"
            );
            Json(ChatCompletionResponse::from_result(
                request.model,
                &first.role,
                &result,
            ))
            .into_response()
        }
        Err(e @ (EngineError::ShutDown | EngineError::Cancelled(_))) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e @ EngineError::TimedOut { .. }) => {
            error_response(StatusCode::GATEWAY_TIMEOUT, e.to_string())
        }
    }
}

/// Metrics Handler
async fn handler_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = state.registry.gather();
    let mut buffer = vec![];
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    let metrics = match String::from_utf8(buffer) {
        Ok(metrics) => metrics,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics",
            )
                .into_response();
        }
    };

    (StatusCode::OK, metrics).into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.emulator.snapshot();
    let (status, label) = if state.emulator.is_shut_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else {
        (StatusCode::OK, "healthy")
    };
    (
        status,
        Json(json!({
            "status": label,
            "model": state.emulator.model().name(),
            "scheduler": snapshot,
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use vllm_emulator::{
        EmulatorConfig, OutputLengthDistribution, Pacing, PrometheusMetrics,
    };

    fn app() -> (Router, Arc<AppState>) {
        let config = EmulatorConfig::builder()
            .model_name("gpt-1337-turbo-pro-max")
            .avg_output_len(7)
            .distribution(OutputLengthDistribution::Fixed)
            .pacing(Pacing::FastForward)
            .build()
            .unwrap();
        let metrics = Arc::new(PrometheusMetrics::new(config.model_name.clone()).unwrap());
        let registry = Registry::new();
        metrics.register(&registry).unwrap();
        let emulator = Arc::new(Emulator::start(config, metrics, None).unwrap());
        let state = Arc::new(AppState { emulator, registry });
        (router(state.clone()), state)
    }

    fn chat(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_chat_completion_reports_usage() {
        let (app, _) = app();
        let response = app
            .oneshot(chat(json!({
                "model": "gpt-1337-turbo-pro-max",
                "messages": [{"role": "user", "content": "xxxxxxxxxx"}],
            })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: ChatCompletionResponse =
            serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body.object, "chat.completion");
        assert_eq!(body.model, "gpt-1337-turbo-pro-max");
        assert_eq!(body.usage.prompt_tokens, 10);
        assert_eq!(body.usage.completion_tokens, 7);
        assert!(body.choices[0].message.content.starts_with("Request stats"));
    }

    #[tokio::test]
    async fn test_empty_messages_rejected() {
        let (app, _) = app();
        let response = app
            .oneshot(chat(json!({"model": "m", "messages": []})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_shutdown_returns_service_unavailable() {
        let (app, state) = app();
        state.emulator.shutdown().await;

        let response = app
            .clone()
            .oneshot(chat(json!({"messages": [{"role": "user", "content": "hi"}]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (app, _) = app();
        let response = app
            .clone()
            .oneshot(chat(json!({"messages": [{"role": "user", "content": "abc"}]})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_string(response).await;
        assert!(text.contains(
            "vllm:request_success_total{model_name=\"gpt-1337-turbo-pro-max\"} 1"
        ));
        assert!(text.contains("vllm:num_requests_waiting"));
        assert!(text.contains(
            "vllm:requests_count_total{model_name=\"gpt-1337-turbo-pro-max\"} 1"
        ));
        assert!(text.contains(
            "vllm:tokens_count_total{model_name=\"gpt-1337-turbo-pro-max\"} 10"
        ));
    }
}
