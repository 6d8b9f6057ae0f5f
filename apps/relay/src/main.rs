//! Binary entry point. Grounded in the teacher's `apps/gproxy/src/main.rs`:
//! init tracing, bootstrap state, mount the router, bind, serve, shut down
//! background workers on signal.

mod bootstrap;
mod cli;

use std::sync::Arc;

use relay_core::token_stats::SHUTDOWN_WRITE_BOUND;
use relay_core::ProxyState;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let boot = bootstrap::bootstrap_from_env().await?;
    let addr = format!("{}:{}", boot.global.host, boot.global.port);

    let router = relay_router::proxy_router(boot.state.clone());
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "relay listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(boot.state.clone()))
        .await?;

    boot.health_join.abort();

    drop(boot.state);
    if tokio::time::timeout(SHUTDOWN_WRITE_BOUND, boot.token_stats_join).await.is_err() {
        tracing::warn!("token-stats worker did not drain within the shutdown bound");
    }

    Ok(())
}

async fn shutdown_signal(state: Arc<ProxyState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
    state.token_stats.begin_shutdown();
}
