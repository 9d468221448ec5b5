//! WebSocket handler for live sample streams.
//!
//! `GET /ble/stream?address=..&characteristic=..` upgrades to a socket that
//! receives one JSON text frame per polling cycle. If the session fails, a
//! single `{"error": {"kind", "message"}}` frame is sent and the socket is
//! closed. A client Close frame or a dropped socket cancels the session
//! without an error frame.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use blelink_core::{SampleStream, StreamOptions};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::AppError;
use crate::config::{BleConfig, MIN_STREAM_INTERVAL_MS};
use crate::state::AppState;

/// Create the WebSocket router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/ble/stream", get(stream_handler))
}

/// Query parameters for `/ble/stream`.
#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    #[serde(default)]
    pub address: String,
    /// Full UUID or 16-bit short form.
    #[serde(default)]
    pub characteristic: String,
    /// Delay between reads in milliseconds; values below 50 are raised to 50.
    pub interval_ms: Option<u64>,
    /// Attach the full aggregate to every frame.
    #[serde(default)]
    pub include_aggregate: bool,
}

impl StreamQuery {
    /// Validate the query and build session options, filling gaps from `ble`.
    pub fn into_options(self, ble: &BleConfig) -> Result<StreamOptions, AppError> {
        if self.address.trim().is_empty() {
            return Err(AppError::BadRequest("'address' is required".to_string()));
        }

        let interval_ms = self.interval_ms.unwrap_or(ble.stream_interval_ms);
        if interval_ms < MIN_STREAM_INTERVAL_MS {
            debug!(
                "Raising interval_ms {} to {}",
                interval_ms, MIN_STREAM_INTERVAL_MS
            );
        }

        let characteristic = blelink_types::parse_characteristic(&self.characteristic)
            .map_err(|e| AppError::BadRequest(format!("'characteristic': {}", e)))?;

        Ok(StreamOptions::new(self.address, characteristic)
            .poll_interval_ms(interval_ms)
            .include_aggregate(self.include_aggregate)
            .buffer_size(ble.stream_buffer))
    }
}

/// WebSocket upgrade handler. Parameters are checked before upgrading.
async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let options = query.into_options(&state.config.read().await.ble)?;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, options))
        .into_response())
}

/// Run one streaming session on an upgraded socket.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, options: StreamOptions) {
    let address = options.address.clone();
    info!("Stream client connected for {}", address);

    let (sender, receiver) = socket.split();
    let stream = SampleStream::start(
        Arc::clone(&state.registry),
        Arc::clone(&state.merge),
        options,
    );
    let frames = forward(stream, sender, receiver).await;

    info!("Stream for {} ended after {} frame(s)", address, frames);
}

/// Render the terminal error frame for a failed session.
fn error_frame(error: &blelink_core::Error) -> String {
    serde_json::json!({
        "error": {
            "kind": error.kind(),
            "message": error.to_string(),
        }
    })
    .to_string()
}

/// Pump batches from `stream` into `sink` until the session ends or the
/// client goes away, then stop the poller. Returns the number of frames sent.
async fn forward<S, R>(mut stream: SampleStream, mut sink: S, mut inbound: R) -> usize
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut frames = 0;

    loop {
        tokio::select! {
            item = stream.next() => {
                let Some(item) = item else { break };
                let (text, last) = match item {
                    Ok(batch) => match serde_json::to_string(&batch) {
                        Ok(json) => (json, false),
                        Err(e) => {
                            warn!("Failed to serialize batch: {}", e);
                            break;
                        }
                    },
                    Err(e) => {
                        warn!("Stream session failed: {}", e);
                        (error_frame(&e), true)
                    }
                };

                if sink.send(Message::Text(text.into())).await.is_err() {
                    debug!("Client went away mid-send");
                    break;
                }
                frames += 1;
                if last {
                    break;
                }
            }
            message = inbound.next() => match message {
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Client closed the stream");
                    break;
                }
                Some(Err(e)) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
                // Pings are answered by axum; anything else is ignored
                Some(Ok(_)) => {}
            },
        }
    }

    stream.close();
    let _ = sink.close().await;
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use blelink_core::mock::MockAdapter;
    use blelink_core::{ConnectionRegistry, OverlapMerge};
    use futures::channel::mpsc;
    use std::time::Duration;

    type Inbound = Result<Message, axum::Error>;

    fn json(message: Message) -> serde_json::Value {
        match message {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    fn query(address: &str, interval_ms: Option<u64>) -> StreamQuery {
        StreamQuery {
            address: address.to_string(),
            characteristic: "2a19".to_string(),
            interval_ms,
            include_aggregate: false,
        }
    }

    async fn connected(address: &str) -> (Arc<MockAdapter>, Arc<ConnectionRegistry>) {
        let adapter = Arc::new(MockAdapter::new());
        let registry = Arc::new(ConnectionRegistry::new(adapter.clone()));
        registry
            .connect_persistent(address, Duration::from_secs(1), None)
            .await
            .unwrap();
        (adapter, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_until_client_closes() {
        let (adapter, registry) = connected("AA").await;
        let mut query = query("AA", Some(50));
        query.include_aggregate = true;
        let options = query.into_options(&BleConfig::default()).unwrap();
        let stream = SampleStream::start(registry, Arc::new(OverlapMerge), options);

        let (out_tx, mut out_rx) = mpsc::unbounded::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded::<Inbound>();
        let task = tokio::spawn(forward(stream, out_tx, in_rx));

        let first = json(out_rx.next().await.unwrap());
        assert_eq!(first["address"], "AA");
        assert_eq!(first["new_samples"].as_array().unwrap().len(), 64);
        assert_eq!(first["aggregated_len"], 64);
        assert_eq!(first["aggregate"].as_array().unwrap().len(), 64);

        let second = json(out_rx.next().await.unwrap());
        assert_eq!(second["new_samples"].as_array().unwrap().len(), 8);
        assert_eq!(second["new_samples"][0], 64);
        assert_eq!(second["aggregated_len"], 72);

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        let frames = task.await.unwrap();
        assert!(frames >= 2);

        while let Some(message) = out_rx.next().await {
            assert!(json(message).get("error").is_none());
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let reads = adapter.peripheral("AA").read_count();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(adapter.peripheral("AA").read_count(), reads);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untracked_address_sends_one_error_frame() {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(MockAdapter::new())));
        let options = query("ZZ", None).into_options(&BleConfig::default()).unwrap();
        let stream = SampleStream::start(registry, Arc::new(OverlapMerge), options);

        let (out_tx, mut out_rx) = mpsc::unbounded::<Message>();
        let (_in_tx, in_rx) = mpsc::unbounded::<Inbound>();

        let frames = forward(stream, out_tx, in_rx).await;

        assert_eq!(frames, 1);
        let error = json(out_rx.next().await.unwrap());
        assert_eq!(error["error"]["kind"], "not_found");
        assert!(error["error"]["message"].as_str().unwrap().contains("ZZ"));
        assert!(out_rx.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_payload_ends_session_with_error_frame() {
        let (adapter, registry) = connected("AA").await;
        adapter.peripheral("AA").set_payloads(vec![vec![0; 127]]);
        let options = query("AA", Some(50)).into_options(&BleConfig::default()).unwrap();
        let stream = SampleStream::start(registry.clone(), Arc::new(OverlapMerge), options);

        let (out_tx, mut out_rx) = mpsc::unbounded::<Message>();
        let (_in_tx, in_rx) = mpsc::unbounded::<Inbound>();

        let frames = forward(stream, out_tx, in_rx).await;

        assert_eq!(frames, 1);
        let error = json(out_rx.next().await.unwrap());
        assert_eq!(error["error"]["kind"], "decode_error");
        assert!(registry.is_connected("AA").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_client_stops_silently() {
        let (_adapter, registry) = connected("AA").await;
        let options = query("AA", Some(50)).into_options(&BleConfig::default()).unwrap();
        let stream = SampleStream::start(registry, Arc::new(OverlapMerge), options);

        let (out_tx, mut out_rx) = mpsc::unbounded::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded::<Inbound>();
        drop(in_tx);

        forward(stream, out_tx, in_rx).await;

        while let Some(message) = out_rx.next().await {
            assert!(json(message).get("error").is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_sink_stops_forwarding() {
        let (_adapter, registry) = connected("AA").await;
        let options = query("AA", Some(50)).into_options(&BleConfig::default()).unwrap();
        let stream = SampleStream::start(registry, Arc::new(OverlapMerge), options);

        let (out_tx, out_rx) = mpsc::unbounded::<Message>();
        drop(out_rx);
        let (_in_tx, in_rx) = mpsc::unbounded::<Inbound>();

        assert_eq!(forward(stream, out_tx, in_rx).await, 0);
    }

    #[test]
    fn test_query_defaults_from_config() {
        let ble = BleConfig {
            stream_interval_ms: 400,
            stream_buffer: 3,
            ..Default::default()
        };

        let options = query("AA", None).into_options(&ble).unwrap();

        assert_eq!(options.address, "AA");
        assert_eq!(options.poll_interval, Duration::from_millis(400));
        assert_eq!(options.buffer_size, 3);
        assert!(!options.include_aggregate);
        assert_eq!(
            options.characteristic.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_query_validation() {
        let ble = BleConfig::default();

        let err = query(" ", Some(100)).into_options(&ble).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(msg) if msg == "'address' is required"));

        let mut bad = query("AA", Some(100));
        bad.characteristic = "not-a-uuid".to_string();
        let err = bad.into_options(&ble).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(msg) if msg.starts_with("'characteristic'")));

        assert!(query("AA", Some(50)).into_options(&ble).is_ok());
    }

    #[test]
    fn test_short_interval_is_clamped() {
        let ble = BleConfig::default();

        for requested in [0, 10, 49] {
            let options = query("AA", Some(requested)).into_options(&ble).unwrap();
            assert_eq!(
                options.poll_interval,
                Duration::from_millis(MIN_STREAM_INTERVAL_MS),
                "interval_ms = {requested}"
            );
        }

        let options = query("AA", Some(75)).into_options(&ble).unwrap();
        assert_eq!(options.poll_interval, Duration::from_millis(75));
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = error_frame(&blelink_core::Error::not_connected("AA"));
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(json["error"]["kind"], "connect_failure");
        assert!(json["error"]["message"].is_string());
        assert_eq!(json.as_object().unwrap().len(), 1);
    }
}
