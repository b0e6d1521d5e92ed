//! HTTP surface for the botweave runtime (axum).
//!
//! Routes: webhook ingest (`/tg/{bot_id}`), health probes, the preview
//! tester, bot/spec administration, broadcasts, and `/metrics`.
//!
//! **Public API**: [`run_serve`], [`run_serve_on_listener`], [`app::router`].

pub mod app;
mod bots;
mod broadcasts;
mod error;
mod health;
mod metrics_ep;
mod preview;
mod webhook;

use std::sync::Arc;

use botweave::Runtime;
use tokio::net::TcpListener;
use tracing::info;

const DEFAULT_ADDR: &str = "127.0.0.1:8000";

/// Serve on an existing listener. Tests bind `127.0.0.1:0` and pass it in.
pub async fn run_serve_on_listener(
    runtime: Arc<Runtime>,
    listener: TcpListener,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("listening on http://{}", addr);
    runtime.start_background().await;

    let router = app::router(runtime.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            runtime.shutdown().await;
        })
        .await?;
    Ok(())
}

/// Bind `addr` (default 127.0.0.1:8000) and serve until ctrl-c.
pub async fn run_serve(
    runtime: Arc<Runtime>,
    addr: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = addr.unwrap_or(DEFAULT_ADDR);
    let listener = TcpListener::bind(addr).await?;
    run_serve_on_listener(runtime, listener).await
}
