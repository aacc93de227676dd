use crate::error::AppError;
use axum::http::StatusCode;
use serde_json::{Value, json};
use std::time::{Duration, Instant};

const CHAT_TIMEOUT: Duration = Duration::from_secs(120);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BackendCallError {
    #[error("backend unreachable: {0}")]
    Network(String),
    #[error("backend returned {status}: {message}")]
    Http {
        status: StatusCode,
        message: String,
    },
}

impl From<BackendCallError> for AppError {
    fn from(err: BackendCallError) -> Self {
        match err {
            BackendCallError::Network(message) => {
                AppError::backend_error(None, format!("backend unreachable: {message}"))
            }
            BackendCallError::Http { status, message } => {
                AppError::backend_error(Some(status), message)
            }
        }
    }
}

/// Buffered chat completion against a vLLM-style backend. The generous
/// timeout covers long generations; anything slower is treated as a dead
/// backend.
pub async fn post_chat_completions(
    client: &reqwest::Client,
    base_url: &str,
    body: &Value,
) -> Result<Value, BackendCallError> {
    let resp = client
        .post(format!("{base_url}/v1/chat/completions"))
        .timeout(CHAT_TIMEOUT)
        .json(body)
        .send()
        .await
        .map_err(|err| BackendCallError::Network(err.to_string()))?;
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|err| BackendCallError::Network(err.to_string()))?;
    if !status.is_success() {
        return Err(BackendCallError::Http {
            status,
            message: extract_error_message(&text)
                .unwrap_or_else(|| format!("upstream status {status}: {text}")),
        });
    }
    serde_json::from_str(&text).map_err(|err| BackendCallError::Http {
        status,
        message: format!("invalid JSON from backend: {err}"),
    })
}

/// Opens a streaming chat completion and hands back the raw response for
/// SSE relaying. No overall timeout; the stream lives as long as the
/// generation does.
pub async fn open_chat_stream(
    client: &reqwest::Client,
    base_url: &str,
    body: &Value,
) -> Result<reqwest::Response, BackendCallError> {
    let resp = client
        .post(format!("{base_url}/v1/chat/completions"))
        .json(body)
        .send()
        .await
        .map_err(|err| BackendCallError::Network(err.to_string()))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        return Err(BackendCallError::Http {
            status,
            message: extract_error_message(&text)
                .unwrap_or_else(|| format!("upstream status {status}: {text}")),
        });
    }
    Ok(resp)
}

/// Health probe against a backend's model listing. Never fails the caller;
/// the outcome is reported in the returned value.
pub async fn probe_models(client: &reqwest::Client, host: &str, port: u16) -> Value {
    let started = Instant::now();
    let result = client
        .get(format!("http://{host}:{port}/v1/models"))
        .timeout(PROBE_TIMEOUT)
        .send()
        .await;
    let latency_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(resp) if resp.status().is_success() => {
            let models = match resp.json::<Value>().await {
                Ok(body) => body
                    .get("data")
                    .and_then(|v| v.as_array())
                    .map(|models| {
                        models
                            .iter()
                            .filter_map(|m| m.get("id").and_then(|v| v.as_str()))
                            .map(|s| s.to_string())
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default(),
                Err(_) => Vec::new(),
            };
            json!({ "ok": true, "latency_ms": latency_ms, "models": models })
        }
        Ok(resp) => json!({
            "ok": false,
            "latency_ms": latency_ms,
            "error": format!("upstream status {}", resp.status()),
        }),
        Err(err) => json!({
            "ok": false,
            "latency_ms": latency_ms,
            "error": err.to_string(),
        }),
    }
}

fn extract_error_message(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    let error = value.get("error")?;
    if let Some(message) = error.get("message").and_then(|v| v.as_str()) {
        return Some(message.to_string());
    }
    error.as_str().map(|s| s.to_string())
}
