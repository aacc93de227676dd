use modelgate::error::AppError;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,modelgate=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let state = modelgate::app::load_state().await?;
    let runtime = state.runtime.clone();
    let app = modelgate::app::build_app(state);

    let listener = bind_listener(&runtime.listen).await?;
    tracing::info!(
        listen = %runtime.listen,
        metrics_path = %runtime.metrics_path,
        "modelgate up"
    );
    axum::serve(listener, app)
        .await
        .map_err(|err| startup_error("serve_failed", err))
}

async fn bind_listener(listen: &str) -> Result<tokio::net::TcpListener, AppError> {
    let addr: std::net::SocketAddr = listen
        .parse()
        .map_err(|err| startup_error("listen_invalid", err))?;
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| startup_error("listen_failed", err))
}

fn startup_error(code: &'static str, err: impl std::fmt::Display) -> AppError {
    AppError::new(axum::http::StatusCode::BAD_REQUEST, code, err.to_string())
}
