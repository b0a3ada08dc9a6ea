mod args;
mod dump;
mod handler;
mod handlers;
mod metrics;
mod state;
mod telemetry;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use clap::Parser;
use tokio::net::TcpListener;

use gwcore::{Config, EngineManager, Metrics};

use crate::args::Args;
use crate::handler::RequestHandler;
use crate::handlers::{chat_completions, completions, embeddings, healthz, list_models};
use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            eprintln!("failed to load config '{}': {e}", args.config);
            std::process::exit(1);
        }
    };

    let log_format = args.log_format.clone().unwrap_or_else(|| config.server.log_format.clone());
    let _otel_guard = telemetry::init_tracing(
        "gwd",
        &log_format,
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );

    tracing::info!(config = %args.config, models = config.models.len(), "gwd starting");

    if config.server.clear_dumps_on_start {
        if let Some(dir) = &config.server.dumps_dir {
            dump::clear_dumps(dir);
        }
    }

    let metrics = Arc::new(Metrics::default());
    let primary = Arc::new(EngineManager::new(config.clone(), metrics.clone()));
    let secondary = Arc::new(EngineManager::new(config.clone(), metrics.clone()));
    let handler = RequestHandler::new(config.clone(), primary, secondary, metrics.clone());

    let state = AppState {
        config: config.clone(),
        handler: handler.clone(),
        metrics,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state);

    let mut listeners = Vec::new();
    if config.server.listen_v4 != "none" {
        match TcpListener::bind(&config.server.listen_v4).await {
            Ok(l) => listeners.push(l),
            Err(e) => tracing::error!(addr = %config.server.listen_v4, error = %e, "failed to bind IPv4 listener"),
        }
    }
    if config.server.listen_v6 != "none" {
        match TcpListener::bind(&config.server.listen_v6).await {
            Ok(l) => listeners.push(l),
            Err(e) => tracing::error!(addr = %config.server.listen_v6, error = %e, "failed to bind IPv6 listener"),
        }
    }
    if listeners.is_empty() {
        tracing::error!("no listener bound, exiting");
        std::process::exit(1);
    }

    let mut tasks = Vec::new();
    for listener in listeners {
        let app = app.clone();
        let handler = handler.clone();
        let addr = listener.local_addr().ok();
        tracing::info!(?addr, "listening");
        tasks.push(tokio::spawn(async move {
            let shutdown = shutdown_signal(handler);
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                tracing::error!(error = %e, "server exited with error");
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }
}

/// Waits for SIGINT or SIGTERM, then drains in-flight work via
/// `RequestHandler::shutdown` before letting axum stop accepting
/// connections.
async fn shutdown_signal(handler: Arc<RequestHandler>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sig = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sig.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, draining in-flight requests");
    handler.stop();
    handler.shutdown().await;
}
