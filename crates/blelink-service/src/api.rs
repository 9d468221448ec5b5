//! REST API endpoints for the blelink-service.
//!
//! Every handler is a thin adapter over [`blelink_core`]: it validates query
//! parameters, fills in defaults from [`BleConfig`](crate::config::BleConfig)
//! and shapes the result into a response model.
//!
//! # Outcomes vs errors
//!
//! Name lookups and name-based connects report "not found" and "found but
//! unreachable" as **outcomes**: HTTP 200 with a `status` tag the caller
//! switches on. Only invalid parameters and failures of the operation itself
//! are errors, returned through [`AppError`].
//!
//! ## Error Handling
//!
//! | Cause | Status |
//! |---|---|
//! | invalid query parameter | 400 |
//! | no tracked connection / no such device | 404 |
//! | connect failure, decode error | 502 |
//! | session error | 500 |
//!
//! Every error body is `{"error": "<message>"}`; errors raised by the radio
//! core also carry `"kind"`.
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use blelink_service::api;
//!
//! let app = api::router().with_state(state);
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use blelink_core::{
    ConnectOutcome, ConnectionStatus, DiscoveredDevice, ErrorKind, NameMatch, SampleReading,
    find_by_name, read_window, scan,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::config::{
    MAX_CONNECT_TIMEOUT_SECS, MAX_SCAN_TIMEOUT_SECS, MIN_CONNECT_TIMEOUT_SECS,
    MIN_SCAN_TIMEOUT_SECS,
};
use crate::state::AppState;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        // Discovery
        .route("/ble/scan", get(scan_devices))
        .route("/ble/name", get(lookup_name))
        // Connection lifecycle
        .route("/ble/connect/persistent", post(connect_by_name))
        .route("/ble/connect/address", post(connect_by_address))
        .route("/ble/disconnect", post(disconnect))
        .route("/ble/status", get(connection_status))
        .route("/ble/connections", get(list_connections))
        // Data
        .route("/ble/read", get(read_samples))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Number of addresses currently tracked.
    pub tracked_connections: usize,
}

/// Health check endpoint.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
        tracked_connections: state.registry.len().await,
    })
}

fn scan_timeout(value: Option<f64>, default: Duration) -> Result<Duration, AppError> {
    bounded_secs("timeout", value, default, MIN_SCAN_TIMEOUT_SECS, MAX_SCAN_TIMEOUT_SECS)
}

fn connect_timeout(value: Option<f64>, default: Duration) -> Result<Duration, AppError> {
    bounded_secs(
        "connect_timeout",
        value,
        default,
        MIN_CONNECT_TIMEOUT_SECS,
        MAX_CONNECT_TIMEOUT_SECS,
    )
}

fn bounded_secs(
    field: &str,
    value: Option<f64>,
    default: Duration,
    min: f64,
    max: f64,
) -> Result<Duration, AppError> {
    match value {
        None => Ok(default),
        Some(secs) if (min..=max).contains(&secs) => Ok(Duration::from_secs_f64(secs)),
        Some(secs) => Err(AppError::BadRequest(format!(
            "'{}' must be between {} and {} seconds, got {}",
            field, min, max, secs
        ))),
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, AppError> {
    if value.trim().is_empty() {
        Err(AppError::BadRequest(format!("'{}' is required", field)))
    } else {
        Ok(value)
    }
}

/// Query parameters for `/ble/scan`.
#[derive(Debug, Deserialize, Default)]
pub struct ScanQuery {
    /// Scan duration in seconds (1-30).
    pub timeout: Option<f64>,
}

/// Scan and return each address once.
async fn scan_devices(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ScanQuery>,
) -> Result<Json<Vec<DiscoveredDevice>>, AppError> {
    let default = state.config.read().await.ble.scan_timeout();
    let timeout = scan_timeout(params.timeout, default)?;

    let devices = scan(state.registry.adapter().as_ref(), timeout).await?;
    Ok(Json(devices))
}

/// Query parameters for `/ble/name`.
#[derive(Debug, Deserialize, Default)]
pub struct NameQuery {
    #[serde(default)]
    pub name: String,
    /// Scan duration in seconds (1-30).
    pub timeout: Option<f64>,
}

/// Result of a name lookup.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NameLookupResponse {
    Found {
        name: String,
        addresses: Vec<String>,
    },
    NotFound {
        name: String,
        message: String,
    },
}

impl From<NameMatch> for NameLookupResponse {
    fn from(lookup: NameMatch) -> Self {
        let addresses = lookup.addresses();
        match lookup {
            NameMatch::Found { name, .. } => Self::Found { name, addresses },
            NameMatch::NotFound { name } => Self::NotFound {
                name,
                message: "Device not found".to_string(),
            },
        }
    }
}

/// Addresses of every device advertising a name.
async fn lookup_name(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NameQuery>,
) -> Result<Json<NameLookupResponse>, AppError> {
    let name = required("name", &params.name)?;
    let default = state.config.read().await.ble.scan_timeout();
    let timeout = scan_timeout(params.timeout, default)?;

    let lookup = find_by_name(state.registry.adapter().as_ref(), name, timeout).await?;
    Ok(Json(lookup.into()))
}

/// Query parameters for `/ble/connect/persistent`.
#[derive(Debug, Deserialize, Default)]
pub struct ConnectByNameQuery {
    #[serde(default)]
    pub name: String,
    /// Scan duration in seconds (1-30).
    pub scan_timeout: Option<f64>,
    /// Per-candidate connect timeout in seconds (1-60).
    pub connect_timeout: Option<f64>,
}

/// Response for `/ble/connect/persistent`.
///
/// The outcome's fields are inlined next to `message`, tagged by `status`.
#[derive(Debug, Serialize)]
pub struct ConnectResponse {
    pub message: &'static str,
    pub is_connected: bool,
    #[serde(flatten)]
    pub outcome: ConnectOutcome,
}

impl From<ConnectOutcome> for ConnectResponse {
    fn from(outcome: ConnectOutcome) -> Self {
        let message = match &outcome {
            ConnectOutcome::Connected { .. } => "Persistent connection established",
            ConnectOutcome::NotFound { .. } => "Device not found",
            ConnectOutcome::Failed { .. } => "Could not connect to any device with that name",
        };
        Self {
            message,
            is_connected: outcome.is_connected(),
            outcome,
        }
    }
}

/// Scan for a name and keep a connection to the best candidate that connects.
async fn connect_by_name(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectByNameQuery>,
) -> Result<Json<ConnectResponse>, AppError> {
    let name = required("name", &params.name)?;
    let (scan_default, connect_default) = {
        let config = state.config.read().await;
        (config.ble.scan_timeout(), config.ble.connect_timeout())
    };
    let scan_timeout = bounded_secs(
        "scan_timeout",
        params.scan_timeout,
        scan_default,
        MIN_SCAN_TIMEOUT_SECS,
        MAX_SCAN_TIMEOUT_SECS,
    )?;
    let connect_timeout = connect_timeout(params.connect_timeout, connect_default)?;

    let outcome = state
        .connector
        .connect_by_name(name, scan_timeout, connect_timeout)
        .await?;
    Ok(Json(outcome.into()))
}

/// Query parameters for endpoints addressing one device.
#[derive(Debug, Deserialize, Default)]
pub struct AddressQuery {
    #[serde(default)]
    pub address: String,
    /// Connect timeout in seconds (1-60); only used by connect.
    pub connect_timeout: Option<f64>,
}

/// Response for `/ble/connect/address`.
#[derive(Debug, Serialize)]
pub struct ConnectAddressResponse {
    pub message: &'static str,
    pub address: String,
    pub is_connected: bool,
}

/// Connect straight to an address, without a scan.
async fn connect_by_address(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AddressQuery>,
) -> Result<Json<ConnectAddressResponse>, AppError> {
    let address = required("address", &params.address)?;
    let default = state.config.read().await.ble.connect_timeout();
    let timeout = connect_timeout(params.connect_timeout, default)?;

    let is_connected = state.connector.connect_by_address(address, timeout).await?;
    Ok(Json(ConnectAddressResponse {
        message: if is_connected {
            "Persistent connection established"
        } else {
            "Connect returned but the device is not connected"
        },
        address: address.to_string(),
        is_connected,
    }))
}

/// Response for `/ble/disconnect`.
#[derive(Debug, Serialize)]
pub struct DisconnectResponse {
    pub message: &'static str,
    pub address: String,
    pub was_connected: bool,
}

/// Disconnect an address and stop tracking it.
async fn disconnect(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AddressQuery>,
) -> Result<Json<DisconnectResponse>, AppError> {
    let address = required("address", &params.address)?;

    let was_connected = state.registry.disconnect(address).await;
    Ok(Json(DisconnectResponse {
        message: if was_connected {
            "Disconnected"
        } else {
            "No active connection for that address"
        },
        address: address.to_string(),
        was_connected,
    }))
}

/// Live status of one address. Untracked addresses report not connected.
async fn connection_status(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AddressQuery>,
) -> Result<Json<ConnectionStatus>, AppError> {
    let address = required("address", &params.address)?;

    Ok(Json(ConnectionStatus {
        address: address.to_string(),
        is_connected: state.registry.is_connected(address).await,
    }))
}

/// Response for `/ble/connections`.
#[derive(Debug, Serialize)]
pub struct ConnectionsResponse {
    pub connections: Vec<ConnectionStatus>,
}

/// Every tracked address with its live status.
async fn list_connections(State(state): State<Arc<AppState>>) -> Json<ConnectionsResponse> {
    Json(ConnectionsResponse {
        connections: state.registry.list_connections().await,
    })
}

/// Query parameters for `/ble/read`.
#[derive(Debug, Deserialize, Default)]
pub struct ReadQuery {
    #[serde(default)]
    pub address: String,
    /// Full UUID or 16-bit short form.
    #[serde(default)]
    pub characteristic: String,
}

/// Read and decode one sample window from a connected device.
async fn read_samples(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ReadQuery>,
) -> Result<Json<SampleReading>, AppError> {
    let address = required("address", &params.address)?;
    let characteristic = blelink_types::parse_characteristic(&params.characteristic)
        .map_err(|e| AppError::BadRequest(format!("'characteristic': {}", e)))?;

    let reading = read_window(&state.registry, address, characteristic).await?;
    debug!("Read {} samples from {}", reading.samples.len(), address);
    Ok(Json(reading))
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Ble(blelink_core::Error),
}

impl From<blelink_core::Error> for AppError {
    fn from(e: blelink_core::Error) -> Self {
        AppError::Ble(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match self {
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": msg }),
            ),
            AppError::Ble(e) => {
                let kind = e.kind();
                let status = match kind {
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::ConnectFailure | ErrorKind::DecodeError => StatusCode::BAD_GATEWAY,
                    ErrorKind::SessionError => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (
                    status,
                    serde_json::json!({ "error": e.to_string(), "kind": kind }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
