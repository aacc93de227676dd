use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::registry::ModelRecord;
use crate::toolcalls::{self, ToolCallAccumulators};
use crate::upstream;
use crate::usage::TokenCounts;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub async fn root() -> Response {
    axum::Json(json!({ "service": "modelgate", "status": "ok" })).into_response()
}

pub async fn health() -> Response {
    axum::Json(json!({ "status": "ok" })).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    state.metrics.render().into_response()
}

pub async fn list_models(State(state): State<AppState>) -> AppResult<Response> {
    metrics::counter!(
        "modelgate_requests_total",
        "endpoint" => "models",
        "method" => "GET"
    )
    .increment(1);
    let models = state
        .model_store
        .list_enabled_models()
        .await
        .map_err(AppError::internal)?;
    let data: Vec<Value> = models
        .iter()
        .map(|m| {
            json!({
                "id": m.name,
                "object": "model",
                "created": m.created_at.timestamp(),
                "owned_by": "modelgate",
            })
        })
        .collect();
    Ok(axum::Json(json!({ "object": "list", "data": data })).into_response())
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(mut body): axum::Json<Value>,
) -> AppResult<Response> {
    let started_at = Instant::now();
    metrics::counter!(
        "modelgate_requests_total",
        "endpoint" => "chat_completions",
        "method" => "POST"
    )
    .increment(1);

    let secret = bearer_secret(&headers)
        .ok_or_else(|| AppError::unauthorized("missing API key"))?;
    let mut admission = state.gate.admit(&secret).await?;

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| AppError::invalid_request("model is required").with_param("model"))?;
    sanitize_chat_request(&mut body, &state.runtime)?;

    let record = state
        .model_store
        .resolve_backend(&model)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::model_not_found(&model))?;

    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    if stream {
        return relay_chat_stream(state, admission, record, model, body, started_at).await;
    }

    admission.guard.mark_backend_started();
    let upstream_body = upstream::post_chat_completions(&state.http, &record.backend_url(), &body)
        .await
        .map_err(AppError::from)?;

    let counts = TokenCounts::from_usage_value(upstream_body.get("usage").unwrap_or(&Value::Null));
    if let Err(err) = state
        .usage_store
        .record(&admission.api_key.id, &model, counts)
        .await
    {
        tracing::warn!(api_key_id = %admission.api_key.id, "failed to record usage: {err}");
    }
    record_token_metrics(&model, counts);
    state.gate.note_usage_recorded(&admission.api_key).await;

    let response = rebuild_chat_completion(&state, &upstream_body, &model);
    metrics::histogram!(
        "modelgate_request_duration_seconds",
        "endpoint" => "chat_completions"
    )
    .record(started_at.elapsed().as_secs_f64());
    Ok(axum::Json(response).into_response())
}

/// Reduces an upstream chat completion to the strict OpenAI shape: assistant
/// text flattened, tool calls normalized, finish_reason defaulted.
fn rebuild_chat_completion(state: &AppState, upstream_body: &Value, model: &str) -> Value {
    let id = upstream_body
        .get("id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("chatcmpl_{}", uuid::Uuid::new_v4()));
    let created = upstream_body
        .get("created")
        .and_then(|v| v.as_i64())
        .unwrap_or_else(now_ts);

    let empty = Vec::new();
    let upstream_choices = upstream_body
        .get("choices")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);
    let mut choices = Vec::with_capacity(upstream_choices.len());
    for (position, choice) in upstream_choices.iter().enumerate() {
        let message = choice.get("message").cloned().unwrap_or_else(|| json!({}));
        let content = flatten_content(message.get("content").unwrap_or(&Value::Null));
        let mut rebuilt = json!({ "role": "assistant", "content": content });
        let mut finish_reason = choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .unwrap_or("stop")
            .to_string();
        if let Some(raw_calls) = message.get("tool_calls") {
            state
                .debug_buffer
                .record("response", Some(model), raw_calls, None);
            let normalized = toolcalls::normalize_tool_calls(raw_calls, toolcalls::STAGE_NORMALIZE);
            if !normalized.is_empty() {
                rebuilt["tool_calls"] = Value::Array(normalized);
                finish_reason = "tool_calls".to_string();
            }
        }
        let index = choice
            .get("index")
            .and_then(|v| v.as_u64())
            .unwrap_or(position as u64);
        choices.push(json!({
            "index": index,
            "message": rebuilt,
            "finish_reason": finish_reason,
        }));
    }

    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": choices,
        "usage": upstream_body.get("usage").cloned().unwrap_or(Value::Null),
    })
}

async fn relay_chat_stream(
    state: AppState,
    mut admission: crate::gate::Admission,
    record: ModelRecord,
    model: String,
    body: Value,
    started_at: Instant,
) -> AppResult<Response> {
    let upstream_resp =
        match upstream::open_chat_stream(&state.http, &record.backend_url(), &body).await {
            Ok(resp) => resp,
            Err(err) => return Ok(error_sse(&AppError::from(err))),
        };
    admission.guard.mark_backend_started();

    let (tx, rx) = mpsc::channel::<Event>(64);
    tokio::spawn(async move {
        // The admission guard lives inside this task so the concurrency slot
        // is held for exactly as long as the relay runs.
        let admission = admission;
        let id = format!("chatcmpl_{}", uuid::Uuid::new_v4());
        let created = now_ts();
        let mut accumulators = ToolCallAccumulators::new();
        let mut usage: Option<TokenCounts> = None;
        let mut usage_value: Option<Value> = None;

        let mut stream = upstream_resp.bytes_stream().eventsource();
        'relay: while let Some(ev) = stream.next().await {
            let Ok(ev) = ev else { continue };
            if ev.data.trim() == "[DONE]" {
                break;
            }
            let mut chunk: Value = match serde_json::from_str(&ev.data) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if let Some(u) = chunk.get("usage").filter(|u| !u.is_null()) {
                usage = Some(TokenCounts::from_usage_value(u));
                usage_value = Some(u.clone());
            }
            patch_chunk(&mut chunk, &id, created, &model);

            let Some(choice) = chunk
                .get_mut("choices")
                .and_then(|v| v.as_array_mut())
                .and_then(|arr| arr.first_mut())
            else {
                // Usage-only chunks are held back and re-emitted at the end.
                continue;
            };

            let mut buffered_tool_delta = false;
            if let Some(delta) = choice.get_mut("delta").and_then(|v| v.as_object_mut()) {
                if let Some(deltas) = delta.remove("tool_calls") {
                    state
                        .debug_buffer
                        .record("stream_chunk", Some(&model), &deltas, Some(&ev.data));
                    accumulators.absorb(&deltas);
                    buffered_tool_delta = true;
                }
            }

            let finish_reason = choice
                .get("finish_reason")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            if finish_reason.as_deref() == Some("tool_calls") {
                let finalized = std::mem::take(&mut accumulators).finalize();
                if !finalized.is_empty() {
                    let tool_chunk = json!({
                        "id": id,
                        "object": "chat.completion.chunk",
                        "created": created,
                        "model": model,
                        "choices": [{
                            "index": 0,
                            "delta": { "tool_calls": finalized },
                            "finish_reason": Value::Null,
                        }]
                    });
                    if tx
                        .send(Event::default().data(tool_chunk.to_string()))
                        .await
                        .is_err()
                    {
                        break 'relay;
                    }
                }
                let finish_chunk = json!({
                    "id": id,
                    "object": "chat.completion.chunk",
                    "created": created,
                    "model": model,
                    "choices": [{ "index": 0, "delta": {}, "finish_reason": "tool_calls" }]
                });
                if tx
                    .send(Event::default().data(finish_chunk.to_string()))
                    .await
                    .is_err()
                {
                    break 'relay;
                }
                continue;
            }

            let delta_is_empty = choice
                .get("delta")
                .and_then(|v| v.as_object())
                .map(|d| d.is_empty())
                .unwrap_or(true);
            if buffered_tool_delta && delta_is_empty && finish_reason.is_none() {
                continue;
            }
            if tx
                .send(Event::default().data(chunk.to_string()))
                .await
                .is_err()
            {
                break 'relay;
            }
        }

        if let Some(usage_value) = usage_value {
            let usage_chunk = json!({
                "id": id,
                "object": "chat.completion.chunk",
                "created": created,
                "model": model,
                "choices": [],
                "usage": usage_value,
            });
            let _ = tx.send(Event::default().data(usage_chunk.to_string())).await;
        }
        let _ = tx.send(Event::default().data("[DONE]")).await;

        // Record whatever the backend reported, including partial counts
        // observed before a disconnect.
        let counts = usage.unwrap_or_default();
        if let Err(err) = state
            .usage_store
            .record(&admission.api_key.id, &model, counts)
            .await
        {
            tracing::warn!(api_key_id = %admission.api_key.id, "failed to record usage: {err}");
        }
        record_token_metrics(&model, counts);
        state.gate.note_usage_recorded(&admission.api_key).await;
        metrics::histogram!(
            "modelgate_request_duration_seconds",
            "endpoint" => "chat_completions"
        )
        .record(started_at.elapsed().as_secs_f64());
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Ok(Sse::new(stream).into_response())
}

pub async fn create_response(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<Value>,
) -> AppResult<Response> {
    let started_at = Instant::now();
    metrics::counter!(
        "modelgate_requests_total",
        "endpoint" => "responses",
        "method" => "POST"
    )
    .increment(1);

    let secret = bearer_secret(&headers)
        .ok_or_else(|| AppError::unauthorized("missing API key"))?;
    let mut admission = state.gate.admit(&secret).await?;

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| AppError::invalid_request("model is required").with_param("model"))?;
    let messages = responses_input_to_messages(body.get("input").unwrap_or(&Value::Null))?;
    let max_tokens = body
        .get("max_output_tokens")
        .and_then(coerce_positive_int)
        .unwrap_or(state.runtime.default_max_tokens);
    let stream = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    let mut chat_body = json!({
        "model": model,
        "messages": messages,
        "max_tokens": max_tokens,
    });
    if let Some(temperature) = body.get("temperature").filter(|v| v.is_number()) {
        chat_body["temperature"] = temperature.clone();
    }
    sanitize_chat_request(&mut chat_body, &state.runtime)?;

    let record = state
        .model_store
        .resolve_backend(&model)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::model_not_found(&model))?;

    admission.guard.mark_backend_started();
    let upstream_body =
        upstream::post_chat_completions(&state.http, &record.backend_url(), &chat_body)
            .await
            .map_err(AppError::from)?;

    let counts = TokenCounts::from_usage_value(upstream_body.get("usage").unwrap_or(&Value::Null));
    if let Err(err) = state
        .usage_store
        .record(&admission.api_key.id, &model, counts)
        .await
    {
        tracing::warn!(api_key_id = %admission.api_key.id, "failed to record usage: {err}");
    }
    record_token_metrics(&model, counts);
    state.gate.note_usage_recorded(&admission.api_key).await;

    let text = upstream_body
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|c| c.get("message"))
        .map(|m| flatten_content(m.get("content").unwrap_or(&Value::Null)))
        .unwrap_or_default();
    let response = json!({
        "id": format!("resp_{}", uuid::Uuid::new_v4().to_string().replace("-", "")),
        "object": "response",
        "created_at": now_ts(),
        "model": model,
        "status": "completed",
        "output": [{
            "type": "message",
            "id": format!("msg_{}", uuid::Uuid::new_v4().to_string().replace("-", "")),
            "role": "assistant",
            "content": [{ "type": "output_text", "text": text }],
        }],
        "usage": {
            "input_tokens": counts.prompt_tokens,
            "output_tokens": counts.completion_tokens,
            "total_tokens": counts.total_tokens,
        },
    });
    metrics::histogram!(
        "modelgate_request_duration_seconds",
        "endpoint" => "responses"
    )
    .record(started_at.elapsed().as_secs_f64());

    if !stream {
        return Ok(axum::Json(response).into_response());
    }
    // The backend call already ran buffered; replay it as the minimal
    // Responses event pair.
    let delta = json!({
        "type": "response.output_text.delta",
        "delta": text,
    });
    let completed = json!({
        "type": "response.completed",
        "response": response,
    });
    let events = vec![
        Ok::<_, Infallible>(
            Event::default()
                .event("response.output_text.delta")
                .data(delta.to_string()),
        ),
        Ok(Event::default()
            .event("response.completed")
            .data(completed.to_string())),
    ];
    Ok(Sse::new(futures_util::stream::iter(events)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct DebugToolCallsQuery {
    pub limit: Option<usize>,
    #[serde(default)]
    pub clear: bool,
}

pub async fn debug_tool_calls(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DebugToolCallsQuery>,
) -> AppResult<Response> {
    crate::admin::require_admin(&state, &headers)?;
    let capacity = state.debug_buffer.capacity();
    let limit = query.limit.unwrap_or(capacity).clamp(1, capacity);
    let entries = state.debug_buffer.snapshot(limit);
    if query.clear {
        state.debug_buffer.clear();
    }
    Ok(axum::Json(json!({
        "count": entries.len(),
        "capacity": capacity,
        "cleared": query.clear,
        "entries": entries,
    }))
    .into_response())
}

fn bearer_secret(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = auth.strip_prefix("Bearer ").or_else(|| auth.strip_prefix("bearer ")) {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Strips the fields vLLM rejects, settles `max_tokens`, flattens message
/// content parts, and caps the request to the configured context window.
fn sanitize_chat_request(body: &mut Value, runtime: &crate::app::RuntimeConfig) -> AppResult<()> {
    let obj = body
        .as_object_mut()
        .ok_or_else(|| AppError::invalid_request("request body must be a JSON object"))?;
    obj.remove("strict");
    obj.remove("response_format");

    let mut max_tokens = obj
        .get("max_tokens")
        .and_then(coerce_positive_int)
        .or_else(|| obj.get("max_output_tokens").and_then(coerce_positive_int))
        .or_else(|| obj.get("max_completion_tokens").and_then(coerce_positive_int))
        .unwrap_or(runtime.default_max_tokens);
    obj.remove("max_output_tokens");
    obj.remove("max_completion_tokens");

    let mut prompt_chars = 0usize;
    if let Some(messages) = obj.get_mut("messages").and_then(|v| v.as_array_mut()) {
        for message in messages {
            let Some(message) = message.as_object_mut() else {
                continue;
            };
            let flat = flatten_content(message.get("content").unwrap_or(&Value::Null));
            prompt_chars += flat.len();
            message.insert("content".to_string(), Value::String(flat));
        }
    }

    let stream = obj.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    if stream {
        obj.insert(
            "stream_options".to_string(),
            json!({ "include_usage": true }),
        );
    } else {
        obj.remove("stream_options");
    }

    let chars_per_token = if runtime.chars_per_token > 0.0 {
        runtime.chars_per_token
    } else {
        4.0
    };
    let estimated_prompt = (prompt_chars as f64 / chars_per_token).ceil() as usize;
    if estimated_prompt >= runtime.max_model_len {
        return Err(AppError::invalid_request(format!(
            "prompt is too large: roughly {} tokens against a context window of {}",
            estimated_prompt, runtime.max_model_len
        ))
        .with_param("messages"));
    }
    let remaining = (runtime.max_model_len - estimated_prompt) as i64;
    max_tokens = max_tokens.min(remaining);
    obj.insert("max_tokens".to_string(), json!(max_tokens));
    Ok(())
}

fn responses_input_to_messages(input: &Value) -> AppResult<Vec<Value>> {
    match input {
        Value::String(text) => Ok(vec![json!({ "role": "user", "content": text })]),
        Value::Array(items) => {
            let mut messages = Vec::with_capacity(items.len());
            for item in items {
                let role = item
                    .get("role")
                    .and_then(|v| v.as_str())
                    .unwrap_or("user");
                let content = flatten_content(item.get("content").unwrap_or(&Value::Null));
                messages.push(json!({ "role": role, "content": content }));
            }
            Ok(messages)
        }
        _ => Err(AppError::invalid_request("input must be a string or an array").with_param("input")),
    }
}

fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                if let Some(s) = part.as_str() {
                    out.push_str(s);
                } else if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                    out.push_str(text);
                }
            }
            out
        }
        _ => String::new(),
    }
}

fn coerce_positive_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .filter(|n| *n > 0),
        Value::String(s) => s.trim().parse::<i64>().ok().filter(|n| *n > 0),
        _ => None,
    }
}

fn patch_chunk(chunk: &mut Value, id: &str, created: i64, model: &str) {
    if let Some(obj) = chunk.as_object_mut() {
        obj.insert("model".to_string(), Value::String(model.to_string()));
        if !obj.contains_key("id") {
            obj.insert("id".to_string(), Value::String(id.to_string()));
        }
        if !obj.contains_key("object") {
            obj.insert(
                "object".to_string(),
                Value::String("chat.completion.chunk".to_string()),
            );
        }
        if !obj.contains_key("created") {
            obj.insert("created".to_string(), Value::Number(created.into()));
        }
    }
}

fn error_sse(err: &AppError) -> Response {
    let payload = json!({
        "error": {
            "message": err.message,
            "type": err.error_type,
            "code": err.code,
            "param": err.param,
        }
    });
    let events = vec![
        Ok::<_, Infallible>(Event::default().data(payload.to_string())),
        Ok(Event::default().data("[DONE]")),
    ];
    Sse::new(futures_util::stream::iter(events)).into_response()
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

fn record_token_metrics(model: &str, counts: TokenCounts) {
    if counts.total_tokens > 0 {
        metrics::counter!(
            "modelgate_tokens_processed_total",
            "model" => model.to_string()
        )
        .increment(counts.total_tokens as u64);
    }
}
