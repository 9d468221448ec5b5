//! blelink-service - persistent BLE connections over HTTP and WebSocket.
//!
//! Run with: `cargo run -p blelink-service`

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use blelink_core::RadioAdapter;
use blelink_core::device::{BtleAdapter, ConnectionConfig};
use blelink_core::mock::MockAdapter;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use blelink_service::{AppState, BleConfig, Config, api, ws};

/// Name advertised by both devices of the simulated radio.
const SIMULATED_NAME: &str = "blelink-sim";

/// blelink-service - persistent BLE connections over HTTP and WebSocket.
#[derive(Parser, Debug)]
#[command(name = "blelink-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config).
    #[arg(short, long)]
    bind: Option<String>,

    /// Serve a simulated radio with two rolling-counter devices.
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("blelink_service=info".parse()?)
                .add_directive("blelink_core=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_default(),
    };

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    config.validate()?;

    let adapter: Arc<dyn RadioAdapter> = if args.simulate {
        info!("Using simulated radio (devices named {:?})", SIMULATED_NAME);
        Arc::new(MockAdapter::simulated(SIMULATED_NAME))
    } else {
        Arc::new(BtleAdapter::new().await?.with_config(radio_timeouts(&config.ble)))
    };

    let addr: SocketAddr = config.server.bind.parse()?;
    let state = AppState::new(adapter, config);

    let app = Router::new()
        .merge(api::router())
        .merge(ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(Arc::clone(&state));

    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped, releasing connections");
    state.shutdown().await;

    Ok(())
}

/// Session timeouts for the hardware radio.
///
/// Only the connect timeout comes from configuration; service discovery and
/// reads keep their defaults.
fn radio_timeouts(ble: &BleConfig) -> ConnectionConfig {
    ConnectionConfig::new().connection_timeout(ble.connect_timeout())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
