use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use companion_chat_server::config::Settings;
use companion_chat_server::logging::init_tracing;
use companion_chat_server::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    let _log_guard = init_tracing(&settings.logging)?;

    info!("Starting companion chat server...");

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    let sweep_every = Duration::from_secs(settings.streaming.keepalive_interval_seconds.max(1));

    let state = AppState::build(settings).await?;
    info!(
        storage = if state.db_pool.is_some() { "postgres" } else { "in_memory" },
        "Services initialised"
    );

    let shutdown = CancellationToken::new();
    let reaper = state
        .registry
        .spawn_reaper(sweep_every, state.activity.clone(), shutdown.clone());

    let db_pool = state.db_pool.clone();
    let app = build_router(state);

    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let signal = shutdown.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = reaper.await;
    if let Some(pool) = db_pool {
        pool.close().await;
    }

    info!("Server stopped");
    Ok(())
}
