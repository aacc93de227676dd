//! Admin surface: user, key, model and server management plus usage reads.
//! Every handler is gated by the `X-Admin-Key` header.

use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::upstream;
use crate::users::{ApiKey, CreateApiKeyInput, UpdateApiKeyInput};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};

pub fn require_admin(state: &AppState, headers: &HeaderMap) -> AppResult<()> {
    let provided = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided.is_empty() || provided != state.runtime.admin_key {
        return Err(AppError::forbidden("invalid admin key"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct CreateUserBody {
    pub username: String,
    pub email: Option<String>,
}

pub async fn create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<CreateUserBody>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let username = body.username.trim();
    if username.is_empty() {
        return Err(AppError::invalid_request("username is required").with_param("username"));
    }
    if state
        .user_store
        .get_user_by_username(username)
        .await
        .map_err(AppError::internal)?
        .is_some()
    {
        return Err(AppError::conflict(
            "user_exists",
            format!("user '{username}' already exists"),
        ));
    }
    if let Some(email) = body.email.as_deref() {
        if state
            .user_store
            .get_user_by_email(email)
            .await
            .map_err(AppError::internal)?
            .is_some()
        {
            return Err(AppError::conflict(
                "email_exists",
                format!("email '{email}' already in use"),
            ));
        }
    }
    let user = state
        .user_store
        .create_user(username, body.email.as_deref())
        .await
        .map_err(AppError::internal)?;
    tracing::info!(user_id = %user.id, username = %user.username, "created user");
    Ok(axum::Json(user).into_response())
}

pub async fn list_users(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let users = state
        .user_store
        .list_users()
        .await
        .map_err(AppError::internal)?;
    Ok(axum::Json(json!({ "users": users })).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserBody {
    pub enabled: Option<bool>,
    pub email: Option<String>,
}

pub async fn update_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    axum::Json(body): axum::Json<UpdateUserBody>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let user = state
        .user_store
        .update_user(&user_id, body.enabled, body.email.map(Some))
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("user '{user_id}' not found")))?;
    Ok(axum::Json(user).into_response())
}

pub async fn delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    if state
        .user_store
        .get_user_by_id(&user_id)
        .await
        .map_err(AppError::internal)?
        .is_none()
    {
        return Err(AppError::not_found(format!("user '{user_id}' not found")));
    }
    let deleted_keys = state
        .user_store
        .delete_user(&user_id)
        .await
        .map_err(AppError::internal)?;
    state.gate.forget_keys(&deleted_keys);
    tracing::info!(user_id = %user_id, keys = deleted_keys.len(), "deleted user");
    Ok(axum::Json(json!({ "status": "deleted", "user_id": user_id })).into_response())
}

pub async fn create_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(input): axum::Json<CreateApiKeyInput>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    if state
        .user_store
        .get_user_by_id(&input.user_id)
        .await
        .map_err(AppError::internal)?
        .is_none()
    {
        return Err(AppError::not_found(format!(
            "user '{}' not found",
            input.user_id
        )));
    }
    let key = state
        .user_store
        .create_api_key(input)
        .await
        .map_err(AppError::internal)?;
    tracing::info!(api_key_id = %key.id, user_id = %key.user_id, "created api key");
    // The only response that carries the full secret.
    Ok(axum::Json(key).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListKeysQuery {
    pub mask: Option<bool>,
}

pub async fn list_api_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListKeysQuery>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let keys = state
        .user_store
        .list_api_keys()
        .await
        .map_err(AppError::internal)?;
    let mask = query.mask.unwrap_or(true);
    let keys: Vec<Value> = keys.iter().map(|k| key_to_json(k, mask)).collect();
    Ok(axum::Json(json!({ "api_keys": keys })).into_response())
}

pub async fn update_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
    axum::Json(input): axum::Json<UpdateApiKeyInput>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let key = state
        .user_store
        .update_api_key(&key_id, input)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("api key '{key_id}' not found")))?;
    Ok(axum::Json(key_to_json(&key, true)).into_response())
}

pub async fn delete_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let deleted = state
        .user_store
        .delete_api_key(&key_id)
        .await
        .map_err(AppError::internal)?;
    if !deleted {
        return Err(AppError::not_found(format!("api key '{key_id}' not found")));
    }
    state.gate.forget_keys(std::slice::from_ref(&key_id));
    Ok(axum::Json(json!({ "status": "deleted", "api_key_id": key_id })).into_response())
}

pub async fn create_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(input): axum::Json<crate::registry::CreateModelInput>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    if state
        .model_store
        .resolve_backend(&input.name)
        .await
        .map_err(AppError::internal)?
        .is_some()
    {
        return Err(AppError::conflict(
            "model_exists",
            format!("model '{}' already registered", input.name),
        ));
    }
    let record = state
        .model_store
        .create_model(input)
        .await
        .map_err(AppError::internal)?;
    tracing::info!(
        model = %record.name,
        backend = %record.backend_url(),
        "registered model"
    );
    Ok(axum::Json(record).into_response())
}

pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let models = state
        .model_store
        .list_models()
        .await
        .map_err(AppError::internal)?;
    Ok(axum::Json(json!({ "models": models })).into_response())
}

pub async fn delete_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(model_id): Path<String>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let record = state
        .model_store
        .delete_model(&model_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("model '{model_id}' not found")))?;
    tracing::info!(model = %record.name, "deleted model");
    Ok(axum::Json(json!({ "status": "deleted", "model_id": model_id })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct TestModelBody {
    pub backend_host: String,
    #[serde(default = "default_probe_port")]
    pub backend_port: u16,
}

fn default_probe_port() -> u16 {
    8000
}

pub async fn test_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<TestModelBody>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let mut result = upstream::probe_models(&state.http, &body.backend_host, body.backend_port).await;
    result["endpoint"] = json!(format!("http://{}:{}", body.backend_host, body.backend_port));
    Ok(axum::Json(result).into_response())
}

pub async fn create_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(input): axum::Json<crate::registry::CreateServerInput>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    if state
        .model_store
        .get_server_by_hostname(&input.hostname)
        .await
        .map_err(AppError::internal)?
        .is_some()
    {
        return Err(AppError::conflict(
            "server_exists",
            format!("server '{}' already registered", input.hostname),
        ));
    }
    let probe = upstream::probe_models(&state.http, &input.hostname, input.port).await;
    let ok = probe.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
    if !ok {
        let detail = probe
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("server unreachable");
        return Err(AppError::invalid_request(format!(
            "server probe failed: {detail}"
        )));
    }
    let record = state
        .model_store
        .create_server(input, ok)
        .await
        .map_err(AppError::internal)?;
    tracing::info!(hostname = %record.hostname, port = record.port, "registered server");
    Ok(axum::Json(record).into_response())
}

pub async fn list_servers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let servers = state
        .model_store
        .list_enabled_servers()
        .await
        .map_err(AppError::internal)?;
    Ok(axum::Json(json!({ "servers": servers })).into_response())
}

pub async fn delete_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(server_id): Path<String>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let deleted = state
        .model_store
        .delete_server(&server_id)
        .await
        .map_err(AppError::internal)?;
    if !deleted {
        return Err(AppError::not_found(format!(
            "server '{server_id}' not found"
        )));
    }
    Ok(axum::Json(json!({ "status": "deleted", "server_id": server_id })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct TestServerBody {
    pub hostname: String,
    #[serde(default = "default_probe_port")]
    pub port: u16,
}

pub async fn test_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<TestServerBody>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let mut result = upstream::probe_models(&state.http, &body.hostname, body.port).await;
    result["endpoint"] = json!(format!("http://{}:{}", body.hostname, body.port));
    Ok(axum::Json(result).into_response())
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub api_key: Option<String>,
    pub days: Option<i64>,
}

pub async fn usage_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let stats = state
        .usage_store
        .stats(query.api_key.as_deref(), query.days.unwrap_or(30))
        .await
        .map_err(AppError::internal)?;
    Ok(axum::Json(stats).into_response())
}

#[derive(Debug, Deserialize)]
pub struct DaysQuery {
    pub days: Option<i64>,
}

pub async fn usage_by_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DaysQuery>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let report = state
        .usage_store
        .by_user(query.days.unwrap_or(30))
        .await
        .map_err(AppError::internal)?;
    Ok(axum::Json(report).into_response())
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<i64>,
}

pub async fn usage_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> AppResult<Response> {
    require_admin(&state, &headers)?;
    let logs = state
        .usage_store
        .logs(query.limit.unwrap_or(100))
        .await
        .map_err(AppError::internal)?;
    Ok(axum::Json(logs).into_response())
}

fn key_to_json(key: &ApiKey, mask: bool) -> Value {
    let mut value = serde_json::to_value(key).unwrap_or(Value::Null);
    if mask {
        if let Some(obj) = value.as_object_mut() {
            obj.insert("key".to_string(), Value::String(key.masked_key()));
        }
    }
    value
}
