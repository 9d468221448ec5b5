//! HTTP and WebSocket front end for persistent BLE connections.
//!
//! This crate provides a service that:
//! - Scans for peripherals and resolves advertised names to addresses
//! - Keeps persistent connections open across requests
//! - Reads decoded 64-sample windows on demand
//! - Streams newly seen samples over WebSocket
//!
//! # REST API Endpoints
//!
//! - `GET /api/health` - Service health check
//! - `GET /ble/scan?timeout=5` - Devices seen during a scan, one per address
//! - `GET /ble/name?name=Sensor&timeout=5` - Addresses advertising a name
//! - `POST /ble/connect/persistent?name=Sensor&scan_timeout=5&connect_timeout=10` -
//!   Connect to the strongest device advertising a name, failing over to the rest
//! - `POST /ble/connect/address?address=AA:BB:CC:DD:EE:FF&connect_timeout=10` -
//!   Connect to one address without scanning
//! - `POST /ble/disconnect?address=..` - Disconnect and stop tracking
//! - `GET /ble/status?address=..` - Live status of one address
//! - `GET /ble/connections` - Every tracked address with its live status
//! - `GET /ble/read?address=..&characteristic=2a19` - One decoded sample window
//! - `WS /ble/stream?address=..&characteristic=2a19&interval_ms=250&include_aggregate=false` -
//!   Live sample batches
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/blelink/server.toml`:
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [ble]
//! scan_timeout_secs = 5.0
//! connect_timeout_secs = 10.0
//! stream_interval_ms = 250
//! stream_buffer = 16
//! ```
//!
//! The `[ble]` values are defaults for requests that omit the matching
//! query parameter.

pub mod api;
pub mod config;
pub mod state;
pub mod ws;

pub use api::AppError;
pub use config::{BleConfig, Config, ConfigError, ServerConfig, ValidationError};
pub use state::AppState;
