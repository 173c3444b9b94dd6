mod cli;
mod config;
mod devices;
mod error;
mod fsls;
mod mux;
mod proxy;
mod recorder;
mod sync;
mod web;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::cli::Args;
use crate::web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = config::resolve(&args)?;

    tokio::fs::create_dir_all(&config.server.recordings_dir)
        .await
        .with_context(|| format!("creating recordings dir {}", config.server.recordings_dir))?;
    tokio::fs::create_dir_all(&config.server.uploads_dir)
        .await
        .with_context(|| format!("creating uploads dir {}", config.server.uploads_dir))?;

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("invalid bind address")?;

    let state = AppState::new(config);
    state.device_tracker.start();

    let app = web::build_router(std::sync::Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                    tracing::event!(Level::INFO, "started");
                })
                .on_response(
                    |response: &axum::http::Response<_>, latency: std::time::Duration, _span: &tracing::Span| {
                        tracing::event!(
                            Level::INFO,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!("===========================================");
    tracing::info!("  tether-server (ADB/scrcpy gateway)");
    tracing::info!("  Listening on http://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    tracing::info!("server ready, accepting connections");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("failed to accept TCP connection: {e}");
                        continue;
                    }
                };

                let app = app.clone();
                tokio::spawn(async move {
                    let io = hyper_util::rt::TokioIo::new(stream);
                    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );
                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, "connection error: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, initiating graceful shutdown");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, initiating graceful shutdown");
                break;
            }
        }
    }

    tracing::info!("flushing active recordings before shutdown...");
    let sessions: Vec<_> = state.sessions.read().await.values().cloned().collect();
    for session in sessions {
        if let Err(e) = session.stop().await {
            tracing::warn!(session_id = %session.session_id(), "failed to flush session on shutdown: {e}");
        }
    }

    tracing::info!("tether-server shut down cleanly");
    Ok(())
}
