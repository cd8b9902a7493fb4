//! Pulse Server - Main entry point.
//!
//! Boots the relay: loads configuration from the environment, wires the
//! [`RelayServer`] into the HTTP router, and serves until SIGTERM/SIGINT.
//! Logs are structured JSON on stdout.
//!
//! # Configuration
//!
//! See [`pulse_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! PULSE_ACCESS_TOKEN_SECRET="change-me-to-a-32-plus-char-secret!!" \
//! PULSE_REFRESH_TOKEN_SECRET="another-32-plus-char-secret-here!!!!" \
//! PULSE_ALLOWED_ORIGIN="http://localhost:5000" \
//! PORT=8080 \
//! cargo run --release --bin pulse-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use pulse_server::config::Config;
use pulse_server::routes::{create_router, AppState};
use pulse_server::server::RelayServer;
use pulse_server::session::MemoryIdentityStore;

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  PULSE_ACCESS_TOKEN_SECRET  - HS256 secret for access tokens (min 32 chars)");
            eprintln!("  PULSE_REFRESH_TOKEN_SECRET - HS256 secret for refresh tokens (min 32 chars)");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                          - HTTP server port (default: 8080)");
            eprintln!("  PULSE_ACCESS_TOKEN_TTL_SECS   - Access-token TTL (default: 900)");
            eprintln!("  PULSE_REFRESH_TOKEN_TTL_SECS  - Refresh-token TTL (default: 864000)");
            eprintln!("  PULSE_ALLOWED_ORIGIN          - Allowed cross-origin client address");
            eprintln!("  PULSE_HANDSHAKE_TIMEOUT_SECS  - Handshake deadline (default: 10)");
            eprintln!("  PULSE_OUTBOUND_BUFFER         - Outbound queue capacity (default: 256)");
            eprintln!("  PULSE_MAX_DELIVERY_FAILURES   - Failure bound (default: 8)");
            eprintln!("  RUST_LOG                      - Log level filter (default: info)");
            return ExitCode::from(1);
        }
    };

    info!(
        port = config.port,
        access_ttl_secs = config.access_token_ttl.as_secs(),
        refresh_ttl_secs = config.refresh_token_ttl.as_secs(),
        allowed_origin = config.allowed_origin.as_deref().unwrap_or("*"),
        "pulse server starting"
    );

    let port = config.port;
    let server = Arc::new(RelayServer::new(
        config,
        Arc::new(MemoryIdentityStore::new()),
    ));
    let app = create_router(AppState::new(server));

    let bind_addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(address = %bind_addr, "listening");
            listener
        }
        Err(err) => {
            error!(error = %err, address = %bind_addr, "failed to bind");
            return ExitCode::from(1);
        }
    };

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("ready to accept connections");

    if let Err(err) = serve.await {
        error!(error = %err, "server error");
        return ExitCode::from(1);
    }

    info!("shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize structured JSON logging, filtered via RUST_LOG.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGTERM (orchestrator shutdown) or SIGINT (Ctrl+C) arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received SIGINT, shutting down gracefully");
        }
        _ = terminate => {
            info!("received SIGTERM, shutting down gracefully");
        }
    }
}
