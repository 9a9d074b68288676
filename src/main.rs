//! Flag Rush Server - authoritative capture-the-flag match server
//!
//! This is the main entry point for the game server. It handles:
//! - WebSocket connections for real-time gameplay
//! - The single authoritative match loop
//! - HTTP endpoints for health and match status

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flagrush_server::app::AppState;
use flagrush_server::config::Config;
use flagrush_server::game::map::load_or_default;
use flagrush_server::game::physics::{init_with_retry, ArcadeWorld, PhysicsSettings};
use flagrush_server::game::{CommandBuffer, GameMatch, MatchContext};
use flagrush_server::http::build_router;
use flagrush_server::util::time::{init_server_time, unix_millis};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log_level);

    // Initialize server time tracking
    init_server_time();

    info!("Starting Flag Rush Server");
    info!("Server address: {}", config.server_addr);

    // The match cannot run without a physics world
    let physics = init_with_retry(config.physics_init_attempts, || {
        ArcadeWorld::new(PhysicsSettings::default())
    })
    .map_err(|e| {
        error!(error = %e, "Giving up on physics initialization");
        e
    })?;

    let map = load_or_default(config.map_path.as_deref());
    let ctx = MatchContext::new(
        config.game.clone(),
        map,
        Box::new(physics),
        CommandBuffer::default(),
        unix_millis(),
    );
    let (game_match, match_handle) = GameMatch::new(ctx);
    let match_task = tokio::spawn(game_match.run());

    // Build router
    let state = AppState::new(config.clone(), match_handle);
    let router = build_router(state);

    // Start server
    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    match_task.abort();
    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
