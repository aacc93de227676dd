use crate::error::{AppError, AppResult};
use crate::gate::Gate;
use crate::registry::ModelStore;
use crate::toolcalls::DebugBuffer;
use crate::usage::UsageStore;
use crate::users::UserStore;
use axum::Router;
use axum::routing::{delete, get, patch, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub user_store: UserStore,
    pub model_store: ModelStore,
    pub usage_store: UsageStore,
    pub gate: Gate,
    pub debug_buffer: DebugBuffer,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub admin_key: String,
    pub debug_buffer_capacity: usize,
    pub max_model_len: usize,
    pub chars_per_token: f64,
    pub default_max_tokens: i64,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_or("MODELGATE_LISTEN", "0.0.0.0:8080");
        let metrics_path = env_or("MODELGATE_METRICS_PATH", "/metrics");
        let database_dsn = resolve_database_dsn();
        let admin_key = env_or("MODELGATE_ADMIN_KEY", "modelgate-admin");
        let debug_buffer_capacity = env_parsed("TOOL_CALL_DEBUG_MAX", 200usize).max(1);
        let max_model_len = env_parsed("MODELGATE_MAX_MODEL_LEN", 129_000usize);
        let chars_per_token = env_parsed("MODELGATE_CHARS_PER_TOKEN", 4.0f64);
        let default_max_tokens = env_parsed("MODELGATE_DEFAULT_MAX_TOKENS", 2048i64);
        Self {
            listen,
            metrics_path,
            database_dsn,
            admin_key,
            debug_buffer_capacity,
            max_model_len,
            chars_per_token,
            default_max_tokens,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parsed<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("modelgate/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    ensure_sqlite_file(&runtime.database_dsn).map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "database_init_failed",
            err,
        )
    })?;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| {
                    AppError::new(
                        axum::http::StatusCode::BAD_REQUEST,
                        "database_dsn_parse_failed",
                        err.to_string(),
                    )
                })?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5)),
        )
        .await
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "database_init_failed",
                err.to_string(),
            )
        })?;

    let user_store = UserStore::new(pool.clone()).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "user_store_init_failed",
            err,
        )
    })?;
    let model_store = ModelStore::new(pool.clone()).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "model_store_init_failed",
            err,
        )
    })?;
    let usage_store = UsageStore::new(pool).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "usage_store_init_failed",
            err,
        )
    })?;

    let metrics = init_metrics()?;
    let gate = Gate::new(user_store.clone(), usage_store.clone());
    let debug_buffer = DebugBuffer::new(runtime.debug_buffer_capacity);

    Ok(AppState {
        runtime: Arc::new(runtime),
        http,
        metrics,
        user_store,
        model_store,
        usage_store,
        gate,
        debug_buffer,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

fn resolve_database_dsn() -> String {
    std::env::var("MODELGATE_DATABASE_DSN")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
        .unwrap_or_else(|| "sqlite://./data/modelgate.db".to_string())
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .merge(build_proxy_router(&metrics_path))
        .merge(build_admin_router())
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

fn build_proxy_router(metrics_path: &str) -> Router<AppState> {
    Router::new()
        .route("/", get(crate::handlers::root))
        .route("/health", get(crate::handlers::health))
        .route("/v1/models", get(crate::handlers::list_models))
        .route("/proxy/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route(
            "/proxy/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route("/v1/responses", post(crate::handlers::create_response))
        .route("/proxy/responses", post(crate::handlers::create_response))
        .route(
            "/proxy/debug/tool-calls",
            get(crate::handlers::debug_tool_calls),
        )
        .route(metrics_path, get(crate::handlers::metrics))
}

fn build_admin_router() -> Router<AppState> {
    Router::new()
        .route("/admin/users", post(crate::admin::create_user))
        .route("/admin/users", get(crate::admin::list_users))
        .route("/admin/users/{user_id}", patch(crate::admin::update_user))
        .route("/admin/users/{user_id}", delete(crate::admin::delete_user))
        .route("/admin/api-keys", post(crate::admin::create_api_key))
        .route("/admin/api-keys", get(crate::admin::list_api_keys))
        .route(
            "/admin/api-keys/{key_id}",
            patch(crate::admin::update_api_key),
        )
        .route(
            "/admin/api-keys/{key_id}",
            delete(crate::admin::delete_api_key),
        )
        .route("/admin/models", post(crate::admin::create_model))
        .route("/admin/models", get(crate::admin::list_models))
        .route(
            "/admin/models/{model_id}",
            delete(crate::admin::delete_model),
        )
        .route("/admin/models/test", post(crate::admin::test_model))
        .route("/admin/servers", post(crate::admin::create_server))
        .route("/admin/servers", get(crate::admin::list_servers))
        .route(
            "/admin/servers/{server_id}",
            delete(crate::admin::delete_server),
        )
        .route("/admin/servers/test", post(crate::admin::test_server))
        .route("/admin/usage/stats", get(crate::admin::usage_stats))
        .route("/admin/usage/by-user", get(crate::admin::usage_by_user))
        .route("/admin/usage/logs", get(crate::admin::usage_logs))
}
