use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{Request, StatusCode};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::net::SocketAddr;
use tempfile::TempDir;
use tower::ServiceExt;

const ADMIN_KEY: &str = "test-admin";

struct TestContext {
    router: axum::Router,
    auth_header: String,
    state: modelgate::app::AppState,
    api_key: modelgate::users::ApiKey,
    _temp_dir: TempDir,
}

/// Mock vLLM backend. Responds with tool calls in deliberately messy shapes
/// when the request carries `tools`, plain text otherwise.
async fn mock_chat(Json(body): Json<Value>) -> Response {
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("mock")
        .to_string();
    let prompt = body
        .get("messages")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.last())
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let wants_tools = body
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    let streaming = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    if streaming {
        let mut chunks: Vec<Value> = Vec::new();
        let chunk = |choice: Value| {
            json!({
                "id": "cmpl-mock",
                "object": "chat.completion.chunk",
                "created": 1700000000,
                "model": model,
                "choices": [choice],
            })
        };
        chunks.push(chunk(json!({ "index": 0, "delta": { "role": "assistant" } })));
        if wants_tools {
            // Fragments interleave across two indices; index 0 splits its
            // argument JSON across two chunks.
            chunks.push(chunk(json!({
                "index": 0,
                "delta": { "tool_calls": [{
                    "index": 0, "id": "call_a",
                    "function": { "name": "lookup", "arguments": "{\"q\":" }
                }]},
            })));
            chunks.push(chunk(json!({
                "index": 0,
                "delta": { "tool_calls": [{
                    "index": 1, "id": "call_b",
                    "function": { "name": "fetch", "arguments": "{\"url\":\"x\"}" }
                }]},
            })));
            chunks.push(chunk(json!({
                "index": 0,
                "delta": { "tool_calls": [{
                    "index": 0,
                    "function": { "arguments": "\"rust\"}" }
                }]},
            })));
            chunks.push(chunk(
                json!({ "index": 0, "delta": {}, "finish_reason": "tool_calls" }),
            ));
        } else {
            chunks.push(chunk(json!({ "index": 0, "delta": { "content": "Hello" } })));
            chunks.push(chunk(json!({ "index": 0, "delta": { "content": " world" } })));
            chunks.push(chunk(
                json!({ "index": 0, "delta": {}, "finish_reason": "stop" }),
            ));
        }
        chunks.push(json!({
            "id": "cmpl-mock",
            "object": "chat.completion.chunk",
            "created": 1700000000,
            "model": body.get("model").cloned().unwrap_or(Value::Null),
            "choices": [],
            "usage": { "prompt_tokens": 9, "completion_tokens": 4, "total_tokens": 13 },
        }));
        let mut events: Vec<Result<Event, Infallible>> = chunks
            .into_iter()
            .map(|c| Ok(Event::default().data(c.to_string())))
            .collect();
        events.push(Ok(Event::default().data("[DONE]")));
        return Sse::new(futures_util::stream::iter(events)).into_response();
    }

    if wants_tools {
        // A "nameless" prompt swaps in a payload whose second entry carries
        // neither a name nor arguments.
        let tool_calls = if prompt.contains("nameless") {
            json!([
                { "id": "call_a", "type": "function",
                  "function": { "name": "get_weather", "arguments": "{\"city\":\"Oslo\"}" } },
                { "id": "call_c", "type": "function", "function": {} }
            ])
        } else {
            json!([
                { "id": "call_a", "type": "function",
                  "function": { "name": "get_weather", "arguments": { "city": "Oslo" } } },
                { "name": "search", "arguments": "find the docs" }
            ])
        };
        return Json(json!({
            "id": "cmpl-mock",
            "object": "chat.completion",
            "created": 1700000000,
            "model": model,
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": tool_calls,
                },
                "finish_reason": "tool_calls",
            }],
            "usage": { "prompt_tokens": 7, "completion_tokens": 5, "total_tokens": 12 },
        }))
        .into_response();
    }

    Json(json!({
        "id": "cmpl-mock",
        "object": "chat.completion",
        "created": 1700000000,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": format!("echo: {prompt}") },
            "finish_reason": "stop",
        }],
        "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 },
    }))
    .into_response()
}

async fn mock_models() -> Response {
    Json(json!({
        "object": "list",
        "data": [{ "id": "mock-model", "object": "model" }],
    }))
    .into_response()
}

async fn start_upstream() -> SocketAddr {
    let router = Router::new()
        .route("/v1/chat/completions", post(mock_chat))
        .route("/v1/models", get(mock_models));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn setup_with_limits(
    rate_limit_per_minute: i64,
    max_concurrent_sessions: i64,
    max_tokens_per_day: i64,
) -> TestContext {
    let upstream_addr = start_upstream().await;

    let temp_dir = tempfile::tempdir().unwrap();
    let db_path = temp_dir.path().join("modelgate.db");
    let state = modelgate::app::load_state_with_runtime(modelgate::app::RuntimeConfig {
        listen: "127.0.0.1:0".to_string(),
        metrics_path: "/metrics".to_string(),
        database_dsn: format!("sqlite://{}", db_path.display()),
        admin_key: ADMIN_KEY.to_string(),
        debug_buffer_capacity: 50,
        max_model_len: 129_000,
        chars_per_token: 4.0,
        default_max_tokens: 2048,
    })
    .await
    .expect("load state");

    let user = state
        .user_store
        .create_user("tenant-1", None)
        .await
        .expect("create user");
    let api_key = state
        .user_store
        .create_api_key(modelgate::users::CreateApiKeyInput {
            user_id: user.id,
            name: "test-key".to_string(),
            max_tokens_per_day,
            max_tokens_per_month: 1_000_000,
            rate_limit_per_minute,
            max_concurrent_sessions,
        })
        .await
        .expect("create api key");

    state
        .model_store
        .create_model(modelgate::registry::CreateModelInput {
            name: "mock-model".to_string(),
            backend_host: upstream_addr.ip().to_string(),
            backend_port: upstream_addr.port(),
            description: None,
        })
        .await
        .expect("register model");

    let router = modelgate::app::build_app(state.clone());
    TestContext {
        router,
        auth_header: format!("Bearer {}", api_key.key),
        state,
        api_key,
        _temp_dir: temp_dir,
    }
}

async fn setup() -> TestContext {
    setup_with_limits(100, 10, 100_000).await
}

async fn json_post(ctx: &TestContext, path: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, ctx.auth_header.clone())
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn sse_post(ctx: &TestContext, path: &str, body: Value) -> (StatusCode, String) {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, ctx.auth_header.clone())
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

async fn admin_request(
    ctx: &TestContext,
    method: &str,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("x-admin-key", ADMIN_KEY);
    if body.is_some() {
        builder = builder.header(CONTENT_TYPE, "application/json");
    }
    let req = builder
        .body(match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn scrape_metrics(ctx: &TestContext) -> String {
    let req = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).to_string()
}

/// Value of the counter series matching every given label pair, 0 if the
/// series has not been touched yet.
fn counter_value(metrics_text: &str, name: &str, labels: &[&str]) -> u64 {
    metrics_text
        .lines()
        .filter(|line| line.starts_with(name))
        .filter(|line| labels.iter().all(|label| line.contains(label)))
        .filter_map(|line| line.rsplit(' ').next())
        .filter_map(|value| value.parse::<u64>().ok())
        .sum()
}

fn sse_data_chunks(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .filter(|data| data.trim() != "[DONE]")
        .filter_map(|data| serde_json::from_str(data).ok())
        .collect()
}

#[tokio::test]
async fn chat_requires_api_key() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "model": "mock-model", "messages": [] }).to_string(),
        ))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_api_key_is_rejected_with_openai_envelope() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, "Bearer mg-doesnotexist")
        .body(Body::from(
            json!({ "model": "mock-model", "messages": [] }).to_string(),
        ))
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], json!("unauthorized"));
}

#[tokio::test]
async fn unregistered_model_is_not_found() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/v1/chat/completions",
        json!({ "model": "no-such-model", "messages": [{ "role": "user", "content": "hi" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], json!("model_not_found"));
}

#[tokio::test]
async fn buffered_chat_roundtrip_records_usage() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/v1/chat/completions",
        json!({ "model": "mock-model", "messages": [{ "role": "user", "content": "ping" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], json!("chat.completion"));
    assert_eq!(body["model"], json!("mock-model"));
    assert_eq!(
        body["choices"][0]["message"]["content"],
        json!("echo: ping")
    );
    assert_eq!(body["choices"][0]["finish_reason"], json!("stop"));
    assert_eq!(body["usage"]["total_tokens"], json!(15));

    let tokens = ctx
        .state
        .usage_store
        .tokens_today(&ctx.api_key.id)
        .await
        .unwrap();
    assert_eq!(tokens, 15);
}

#[tokio::test]
async fn buffered_tool_calls_come_out_strict() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/v1/chat/completions",
        json!({
            "model": "mock-model",
            "messages": [{ "role": "user", "content": "weather in Oslo" }],
            "tools": [{ "type": "function", "function": { "name": "get_weather" } }],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["choices"][0]["finish_reason"], json!("tool_calls"));
    let calls = body["choices"][0]["message"]["tool_calls"]
        .as_array()
        .unwrap();
    assert_eq!(calls.len(), 2);

    // Object arguments are re-encoded as a JSON string.
    assert_eq!(calls[0]["id"], json!("call_a"));
    assert_eq!(calls[0]["type"], json!("function"));
    let args: Value =
        serde_json::from_str(calls[0]["function"]["arguments"].as_str().unwrap()).unwrap();
    assert_eq!(args, json!({ "city": "Oslo" }));

    // The relaxed entry gets a synthesized id and wrapped free-text arguments.
    assert!(calls[1]["id"].as_str().unwrap().starts_with("call_"));
    assert_eq!(calls[1]["function"]["name"], json!("search"));
    let args: Value =
        serde_json::from_str(calls[1]["function"]["arguments"].as_str().unwrap()).unwrap();
    assert_eq!(args, json!({ "input": "find the docs" }));
}

#[tokio::test]
async fn nameless_tool_call_is_dropped_and_counted_once() {
    let ctx = setup().await;
    let missing_name = |text: &str| {
        counter_value(
            text,
            "modelgate_tool_calls_malformed_total",
            &["stage=\"normalize\"", "reason=\"missing_name\""],
        )
    };
    let before = missing_name(&scrape_metrics(&ctx).await);

    let (status, body) = json_post(
        &ctx,
        "/v1/chat/completions",
        json!({
            "model": "mock-model",
            "messages": [{ "role": "user", "content": "emit a nameless call" }],
            "tools": [{ "type": "function", "function": { "name": "get_weather" } }],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The entry with neither name nor arguments is absent from the output.
    let calls = body["choices"][0]["message"]["tool_calls"]
        .as_array()
        .unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["function"]["name"], json!("get_weather"));

    let after = missing_name(&scrape_metrics(&ctx).await);
    assert_eq!(after - before, 1);
}

#[tokio::test]
async fn streaming_passes_text_through_and_forwards_usage() {
    let ctx = setup().await;
    let (status, body) = sse_post(
        &ctx,
        "/v1/chat/completions",
        json!({
            "model": "mock-model",
            "messages": [{ "role": "user", "content": "hi" }],
            "stream": true,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("[DONE]"));

    let chunks = sse_data_chunks(&body);
    let text: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(text, "Hello world");

    let usage_chunk = chunks
        .iter()
        .find(|c| !c["usage"].is_null())
        .expect("trailing usage chunk");
    assert_eq!(usage_chunk["usage"]["total_tokens"], json!(13));

    let tokens = ctx
        .state
        .usage_store
        .tokens_today(&ctx.api_key.id)
        .await
        .unwrap();
    assert_eq!(tokens, 13);
}

#[tokio::test]
async fn streaming_tool_call_fragments_are_assembled_per_index() {
    let ctx = setup().await;
    let (status, body) = sse_post(
        &ctx,
        "/v1/chat/completions",
        json!({
            "model": "mock-model",
            "messages": [{ "role": "user", "content": "look things up" }],
            "tools": [{ "type": "function", "function": { "name": "lookup" } }],
            "stream": true,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let chunks = sse_data_chunks(&body);
    let tool_chunk = chunks
        .iter()
        .find(|c| !c["choices"][0]["delta"]["tool_calls"].is_null())
        .expect("normalized tool-call chunk");
    let calls = tool_chunk["choices"][0]["delta"]["tool_calls"]
        .as_array()
        .unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0]["id"], json!("call_a"));
    assert_eq!(calls[0]["function"]["arguments"], json!("{\"q\":\"rust\"}"));
    assert_eq!(calls[1]["id"], json!("call_b"));
    assert_eq!(calls[1]["function"]["arguments"], json!("{\"url\":\"x\"}"));

    // No partial tool-call fragments leak through before finalization.
    let fragment_leaks = chunks
        .iter()
        .filter(|c| !c["choices"][0]["delta"]["tool_calls"].is_null())
        .count();
    assert_eq!(fragment_leaks, 1);

    let finish = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["finish_reason"].as_str())
        .last();
    assert_eq!(finish, Some("tool_calls"));
}

#[tokio::test]
async fn rate_limit_rejects_the_excess_request() {
    let ctx = setup_with_limits(2, 10, 100_000).await;
    let body = json!({ "model": "mock-model", "messages": [{ "role": "user", "content": "hi" }] });
    for _ in 0..2 {
        let (status, _) = json_post(&ctx, "/v1/chat/completions", body.clone()).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, resp) = json_post(&ctx, "/v1/chat/completions", body).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp["error"]["code"], json!("rate_limited"));
}

#[tokio::test]
async fn exhausted_daily_quota_rejects_with_quota_exceeded() {
    let ctx = setup_with_limits(100, 10, 500).await;
    ctx.state
        .usage_store
        .record(
            &ctx.api_key.id,
            "mock-model",
            modelgate::usage::TokenCounts {
                prompt_tokens: 100,
                completion_tokens: 400,
                total_tokens: 500,
            },
        )
        .await
        .unwrap();
    let (status, resp) = json_post(
        &ctx,
        "/v1/chat/completions",
        json!({ "model": "mock-model", "messages": [{ "role": "user", "content": "hi" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp["error"]["code"], json!("quota_exceeded"));
}

#[tokio::test]
async fn responses_endpoint_adapts_input_to_chat() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/v1/responses",
        json!({ "model": "mock-model", "input": "ping" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], json!("response"));
    assert_eq!(body["status"], json!("completed"));
    assert_eq!(
        body["output"][0]["content"][0]["text"],
        json!("echo: ping")
    );
    assert_eq!(body["usage"]["total_tokens"], json!(15));
}

#[tokio::test]
async fn model_listing_is_openai_shaped() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .body(Body::empty())
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["object"], json!("list"));
    assert_eq!(body["data"][0]["id"], json!("mock-model"));
}

#[tokio::test]
async fn admin_surface_requires_the_admin_key() {
    let ctx = setup().await;
    let req = Request::builder()
        .method("GET")
        .uri("/admin/users")
        .body(Body::empty())
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_user_lifecycle_with_conflicts() {
    let ctx = setup().await;
    let (status, user) = admin_request(
        &ctx,
        "POST",
        "/admin/users",
        Some(json!({ "username": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let user_id = user["id"].as_str().unwrap().to_string();

    let (status, conflict) = admin_request(
        &ctx,
        "POST",
        "/admin/users",
        Some(json!({ "username": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(conflict["error"]["code"], json!("user_exists"));

    let (status, key) = admin_request(
        &ctx,
        "POST",
        "/admin/api-keys",
        Some(json!({ "user_id": user_id, "name": "alice-key" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let secret = key["key"].as_str().unwrap();
    assert!(secret.starts_with("mg-"));

    // Listing masks secrets by default.
    let (_, listing) = admin_request(&ctx, "GET", "/admin/api-keys", None).await;
    let listed = listing["api_keys"]
        .as_array()
        .unwrap()
        .iter()
        .find(|k| k["name"] == json!("alice-key"))
        .unwrap();
    assert!(listed["key"].as_str().unwrap().ends_with("..."));

    let (status, _) = admin_request(
        &ctx,
        "DELETE",
        &format!("/admin/users/{user_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, listing) = admin_request(&ctx, "GET", "/admin/api-keys", None).await;
    assert!(
        listing["api_keys"]
            .as_array()
            .unwrap()
            .iter()
            .all(|k| k["name"] != json!("alice-key"))
    );
}

#[tokio::test]
async fn duplicate_model_registration_conflicts() {
    let ctx = setup().await;
    let (status, body) = admin_request(
        &ctx,
        "POST",
        "/admin/models",
        Some(json!({ "name": "mock-model", "backend_host": "127.0.0.1", "backend_port": 9 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], json!("model_exists"));
}

#[tokio::test]
async fn deleted_model_stops_resolving() {
    let ctx = setup().await;
    let body = json!({ "model": "mock-model", "messages": [{ "role": "user", "content": "hi" }] });
    let (status, _) = json_post(&ctx, "/v1/chat/completions", body.clone()).await;
    assert_eq!(status, StatusCode::OK);

    let (_, listing) = admin_request(&ctx, "GET", "/admin/models", None).await;
    let model_id = listing["models"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["name"] == json!("mock-model"))
        .and_then(|m| m["id"].as_str())
        .unwrap()
        .to_string();
    let (status, _) = admin_request(
        &ctx,
        "DELETE",
        &format!("/admin/models/{model_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, resp) = json_post(&ctx, "/v1/chat/completions", body).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(resp["error"]["code"], json!("model_not_found"));
}

#[tokio::test]
async fn debug_buffer_captures_and_clears_tool_call_payloads() {
    let ctx = setup().await;
    let (status, _) = json_post(
        &ctx,
        "/v1/chat/completions",
        json!({
            "model": "mock-model",
            "messages": [{ "role": "user", "content": "weather" }],
            "tools": [{ "type": "function", "function": { "name": "get_weather" } }],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Gated: without the admin header the buffer is not readable.
    let req = Request::builder()
        .method("GET")
        .uri("/proxy/debug/tool-calls")
        .body(Body::empty())
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let (status, body) = admin_request(&ctx, "GET", "/proxy/debug/tool-calls?clear=true", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["count"].as_u64().unwrap() >= 1);
    assert_eq!(body["entries"][0]["source"], json!("response"));

    let (_, body) = admin_request(&ctx, "GET", "/proxy/debug/tool-calls", None).await;
    assert_eq!(body["count"], json!(0));
}

#[tokio::test]
async fn metrics_endpoint_renders_prometheus_text() {
    let ctx = setup().await;
    let (status, _) = json_post(
        &ctx,
        "/v1/chat/completions",
        json!({ "model": "mock-model", "messages": [{ "role": "user", "content": "hi" }] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let req = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let resp = ctx.router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("modelgate_requests_total"));
}

#[tokio::test]
async fn oversized_prompt_is_a_bad_request() {
    let ctx = setup().await;
    let (status, body) = json_post(
        &ctx,
        "/v1/chat/completions",
        json!({
            "model": "mock-model",
            "messages": [{ "role": "user", "content": "x".repeat(600_000) }],
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!("invalid_request"));
}
