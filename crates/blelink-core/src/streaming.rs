//! Live sample streaming with overlap-aware aggregation.
//!
//! A [`SampleStream`] polls one connected device, decodes each reading into a
//! [`SampleWindow`], folds it into a growing aggregate through a
//! [`WindowMerge`], and yields only the newly appended samples each cycle.
//!
//! The stream ends when:
//!
//! - it is cancelled (via [`SampleStream::close`], its cancellation token or
//!   by dropping it); no error is yielded;
//! - any cycle fails; the error is yielded once and the stream ends.
//!
//! The device is borrowed from the [`ConnectionRegistry`] for one read at a
//! time, never across the poll interval.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use blelink_types::SampleWindow;

use crate::error::{Error, Result};
use crate::merge::WindowMerge;
use crate::registry::ConnectionRegistry;

/// Shortest accepted polling interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Options for a sample stream.
///
/// ```
/// use std::time::Duration;
/// use blelink_core::streaming::{StreamOptions, MIN_POLL_INTERVAL};
/// use blelink_types::uuid::from_short;
///
/// let options = StreamOptions::new("AA:BB", from_short(0x2a19))
///     .poll_interval(Duration::from_millis(10))
///     .include_aggregate(true);
/// assert_eq!(options.poll_interval, MIN_POLL_INTERVAL);
/// ```
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Address of a device with a persistent connection.
    pub address: String,
    /// Characteristic holding the 128-byte sample window.
    pub characteristic: Uuid,
    /// Delay between cycles; never below [`MIN_POLL_INTERVAL`].
    pub poll_interval: Duration,
    /// Attach the full aggregate to every batch.
    pub include_aggregate: bool,
    /// Buffer size for the batch channel.
    pub buffer_size: usize,
}

impl StreamOptions {
    /// Options with the default interval and a 16-batch buffer.
    pub fn new(address: impl Into<String>, characteristic: Uuid) -> Self {
        Self {
            address: address.into(),
            characteristic,
            poll_interval: DEFAULT_POLL_INTERVAL,
            include_aggregate: false,
            buffer_size: 16,
        }
    }

    /// Set the polling interval, clamped to [`MIN_POLL_INTERVAL`].
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Set the polling interval in milliseconds, clamped to [`MIN_POLL_INTERVAL`].
    #[must_use]
    pub fn poll_interval_ms(self, millis: u64) -> Self {
        self.poll_interval(Duration::from_millis(millis))
    }

    /// Set whether every batch carries the full aggregate.
    #[must_use]
    pub fn include_aggregate(mut self, include: bool) -> Self {
        self.include_aggregate = include;
        self
    }

    /// Set the buffer size.
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::invalid_config("address must not be empty"));
        }
        if self.buffer_size == 0 {
            return Err(Error::invalid_config("buffer_size must be > 0"));
        }
        Ok(())
    }
}

/// One decoded reading, returned by [`read_window`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleReading {
    /// Device address.
    pub address: String,
    /// Characteristic that was read.
    pub characteristic: Uuid,
    /// When the payload was received.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// The 64 decoded samples.
    pub samples: Vec<u16>,
}

/// What one streaming cycle produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleBatch {
    /// Device address.
    pub address: String,
    /// Characteristic that was read.
    pub characteristic: Uuid,
    /// When the payload was received.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Samples appended to the aggregate this cycle.
    pub new_samples: Vec<u16>,
    /// Total aggregate length after this cycle.
    pub aggregated_len: usize,
    /// The full aggregate, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<Vec<u16>>,
}

/// Per-session aggregation state. Never shared between sessions.
#[derive(Debug, Default)]
pub struct AggregationState {
    previous: Option<SampleWindow>,
    aggregated: Vec<u16>,
    /// Length of the aggregate already handed to the caller.
    emitted_len: usize,
}

impl AggregationState {
    /// An empty state, waiting for the first window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `window` in and return the samples that are new since the last fold.
    ///
    /// The first window seeds the aggregate and is returned whole.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Session`] if `merge` produces an aggregate shorter than
    /// what was already emitted.
    pub fn fold(&mut self, window: SampleWindow, merge: &dyn WindowMerge) -> Result<&[u16]> {
        match self.previous {
            None => self.aggregated = window.to_vec(),
            Some(previous) => {
                let aggregated = std::mem::take(&mut self.aggregated);
                let merged = merge.merge(aggregated, &previous, &window);
                if merged.len() < self.emitted_len {
                    return Err(Error::session(format!(
                        "merge shrank the aggregate from {} to {} samples",
                        self.emitted_len,
                        merged.len()
                    )));
                }
                self.aggregated = merged;
            }
        }

        self.previous = Some(window);
        let start = self.emitted_len;
        self.emitted_len = self.aggregated.len();
        Ok(&self.aggregated[start..])
    }

    /// The aggregate so far.
    pub fn aggregated(&self) -> &[u16] {
        &self.aggregated
    }

    /// Length of the aggregate already emitted.
    pub fn emitted_len(&self) -> usize {
        self.emitted_len
    }
}

/// Read and decode one sample window from a tracked device.
///
/// Holds the device's lock for the duration of the read.
pub async fn read_window(
    registry: &ConnectionRegistry,
    address: &str,
    characteristic: Uuid,
) -> Result<SampleReading> {
    let payload = registry.read_characteristic(address, characteristic).await?;
    let window = SampleWindow::from_bytes(&payload)?;

    Ok(SampleReading {
        address: address.to_string(),
        characteristic,
        timestamp: OffsetDateTime::now_utc(),
        samples: window.to_vec(),
    })
}

/// Result type for stream items.
pub type BatchResult = std::result::Result<SampleBatch, Error>;

/// A stream of sample batches from one device.
pub struct SampleStream {
    receiver: mpsc::Receiver<BatchResult>,
    cancel_token: CancellationToken,
}

impl SampleStream {
    /// Spawn the polling task.
    ///
    /// The device must already have a live persistent connection; otherwise
    /// the stream yields that error once and ends.
    pub fn start(
        registry: Arc<ConnectionRegistry>,
        merge: Arc<dyn WindowMerge>,
        options: StreamOptions,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.buffer_size.max(1));
        let cancel_token = CancellationToken::new();
        let task_token = cancel_token.clone();

        tokio::spawn(run_session(registry, merge, options, tx, task_token));

        Self {
            receiver: rx,
            cancel_token,
        }
    }

    /// Close the stream and stop the background polling task.
    pub fn close(self) {
        self.cancel_token.cancel();
    }

    /// Get a cancellation token that can be used to cancel the stream externally.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }
}

impl Drop for SampleStream {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl Stream for SampleStream {
    type Item = BatchResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_recv(cx)
    }
}

fn next_batch(
    state: &mut AggregationState,
    payload: &[u8],
    merge: &dyn WindowMerge,
    options: &StreamOptions,
) -> Result<SampleBatch> {
    let window = SampleWindow::from_bytes(payload)?;
    let new_samples = state.fold(window, merge)?.to_vec();

    Ok(SampleBatch {
        address: options.address.clone(),
        characteristic: options.characteristic,
        timestamp: OffsetDateTime::now_utc(),
        new_samples,
        aggregated_len: state.aggregated().len(),
        aggregate: options.include_aggregate.then(|| state.aggregated().to_vec()),
    })
}

/// Deliver the session's terminal error unless the session is being torn down anyway.
async fn report_failure(tx: &mpsc::Sender<BatchResult>, cancel: &CancellationToken, error: Error) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tx.send(Err(error)) => {
            if result.is_err() {
                debug!("Stream receiver dropped before the final error");
            }
        }
    }
}

#[tracing::instrument(level = "info", skip_all, fields(address = %options.address, characteristic = %options.characteristic))]
async fn run_session(
    registry: Arc<ConnectionRegistry>,
    merge: Arc<dyn WindowMerge>,
    options: StreamOptions,
    tx: mpsc::Sender<BatchResult>,
    cancel: CancellationToken,
) {
    if let Err(e) = registry.require_connected(&options.address).await {
        warn!("Cannot stream: {}", e);
        report_failure(&tx, &cancel, e).await;
        return;
    }

    info!("Streaming every {:?}", options.poll_interval);
    let mut state = AggregationState::new();

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Stream cancelled, stopping gracefully");
                return;
            }
            _ = tx.closed() => {
                debug!("Stream receiver dropped, stopping");
                return;
            }
            read = registry.read_characteristic(&options.address, options.characteristic) => read,
        };

        let batch = match read.and_then(|payload| next_batch(&mut state, &payload, merge.as_ref(), &options)) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Stream ended: {}", e);
                report_failure(&tx, &cancel, e).await;
                return;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            sent = tx.send(Ok(batch)) => {
                if sent.is_err() {
                    debug!("Stream receiver dropped, stopping");
                    return;
                }
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Stream cancelled, stopping gracefully");
                return;
            }
            _ = tx.closed() => return,
            _ = sleep(options.poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::merge::OverlapMerge;
    use crate::mock::{MockAdapter, counter_window};
    use futures::StreamExt;
    use tokio::time::Instant;

    const CHAR: Uuid = blelink_types::uuid::from_short(0x2a19);
    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn connected(address: &str) -> (Arc<MockAdapter>, Arc<ConnectionRegistry>) {
        let adapter = Arc::new(MockAdapter::new());
        let registry = Arc::new(ConnectionRegistry::new(adapter.clone()));
        registry.connect_persistent(address, TIMEOUT, None).await.unwrap();
        (adapter, registry)
    }

    fn overlap() -> Arc<dyn WindowMerge> {
        Arc::new(OverlapMerge)
    }

    // --- AggregationState ---

    #[test]
    fn test_first_fold_seeds_aggregate() {
        let mut state = AggregationState::new();
        let w0 = counter_window(100);

        let new = state.fold(w0, &OverlapMerge).unwrap().to_vec();

        assert_eq!(new, w0.to_vec());
        assert_eq!(state.aggregated(), w0.as_slice());
        assert_eq!(state.emitted_len(), 64);
    }

    #[test]
    fn test_second_fold_emits_appended_suffix() {
        let mut state = AggregationState::new();
        state.fold(counter_window(0), &OverlapMerge).unwrap();

        let new = state.fold(counter_window(5), &OverlapMerge).unwrap().to_vec();

        assert_eq!(new, vec![64, 65, 66, 67, 68]);
        assert_eq!(state.aggregated().len(), 69);
        assert_eq!(&state.aggregated()[64..], new.as_slice());
    }

    #[test]
    fn test_noop_merge_emits_nothing() {
        let mut state = AggregationState::new();
        let w0 = counter_window(0);
        state.fold(w0, &OverlapMerge).unwrap();

        let new = state.fold(w0, &OverlapMerge).unwrap();
        assert!(new.is_empty());
    }

    #[test]
    fn test_shrinking_merge_is_session_error() {
        let mut state = AggregationState::new();
        state.fold(counter_window(0), &OverlapMerge).unwrap();

        let truncate = |_: Vec<u16>, _: &SampleWindow, _: &SampleWindow| vec![1u16, 2, 3];
        let err = state.fold(counter_window(8), &truncate).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SessionError);
    }

    #[test]
    fn test_interval_is_clamped() {
        let options = StreamOptions::new("AA", CHAR).poll_interval_ms(1);
        assert_eq!(options.poll_interval, MIN_POLL_INTERVAL);

        let options = StreamOptions::new("AA", CHAR).poll_interval_ms(125);
        assert_eq!(options.poll_interval, Duration::from_millis(125));
    }

    #[test]
    fn test_options_validate() {
        assert!(StreamOptions::new("AA", CHAR).validate().is_ok());
        assert!(StreamOptions::new(" ", CHAR).validate().is_err());
        assert!(StreamOptions::new("AA", CHAR).buffer_size(0).validate().is_err());
    }

    #[test]
    fn test_batch_serialization() {
        let batch = SampleBatch {
            address: "AA".into(),
            characteristic: CHAR,
            timestamp: OffsetDateTime::UNIX_EPOCH,
            new_samples: vec![1, 2],
            aggregated_len: 66,
            aggregate: None,
        };

        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(json["timestamp"], "1970-01-01T00:00:00Z");
        assert_eq!(json["characteristic"], "00002a19-0000-1000-8000-00805f9b34fb");
        assert_eq!(json["aggregated_len"], 66);
        assert!(json.get("aggregate").is_none());
    }

    // --- read_window ---

    #[tokio::test]
    async fn test_read_window_decodes_samples() {
        let (adapter, registry) = connected("AA").await;
        let payload: Vec<u8> = (0u16..64).flat_map(|v| v.to_le_bytes()).collect();
        adapter.peripheral("AA").set_payloads(vec![payload]);

        let reading = read_window(&registry, "AA", CHAR).await.unwrap();

        assert_eq!(reading.samples, (0..64).collect::<Vec<u16>>());
        assert_eq!(reading.characteristic, CHAR);
    }

    #[tokio::test]
    async fn test_read_window_rejects_short_payload() {
        let (adapter, registry) = connected("AA").await;
        adapter.peripheral("AA").set_payloads(vec![vec![0; 127]]);

        let err = read_window(&registry, "AA", CHAR).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodeError);
    }

    #[tokio::test]
    async fn test_read_window_untracked() {
        let adapter = Arc::new(MockAdapter::new());
        let registry = ConnectionRegistry::new(adapter);

        let err = read_window(&registry, "AA", CHAR).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    // --- SampleStream ---

    #[tokio::test(start_paused = true)]
    async fn test_stream_first_and_second_cycle() {
        let (adapter, registry) = connected("AA").await;
        adapter.peripheral("AA").set_rolling_counter(0, 8);

        let options = StreamOptions::new("AA", CHAR).include_aggregate(true);
        let mut stream = SampleStream::start(registry, overlap(), options);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.new_samples, counter_window(0).to_vec());
        assert_eq!(first.aggregated_len, 64);
        assert_eq!(first.aggregate.as_deref(), Some(counter_window(0).as_slice()));

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.new_samples, (64..72).collect::<Vec<u16>>());
        assert_eq!(second.aggregated_len, 72);
        let aggregate = second.aggregate.unwrap();
        assert_eq!(&aggregate[72 - 8..], second.new_samples.as_slice());
        assert_eq!(second.address, "AA");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_waits_for_interval() {
        let (_adapter, registry) = connected("AA").await;
        let options = StreamOptions::new("AA", CHAR).poll_interval_ms(300);
        let mut stream = SampleStream::start(registry, overlap(), options);

        stream.next().await.unwrap().unwrap();
        let start = Instant::now();
        stream.next().await.unwrap().unwrap();

        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_omits_aggregate_by_default() {
        let (_adapter, registry) = connected("AA").await;
        let mut stream = SampleStream::start(registry, overlap(), StreamOptions::new("AA", CHAR));

        let batch = stream.next().await.unwrap().unwrap();
        assert!(batch.aggregate.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_requires_tracked_connection() {
        let adapter = Arc::new(MockAdapter::new());
        let registry = Arc::new(ConnectionRegistry::new(adapter.clone()));

        let mut stream = SampleStream::start(registry, overlap(), StreamOptions::new("AA", CHAR));

        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(stream.next().await.is_none());
        assert_eq!(adapter.peripheral("AA").read_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_requires_live_connection() {
        let (adapter, registry) = connected("AA").await;
        adapter.peripheral("AA").drop_link();

        let mut stream = SampleStream::start(registry, overlap(), StreamOptions::new("AA", CHAR));

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::NotConnected { .. }));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_read_failure_ends_session_once() {
        let (adapter, registry) = connected("AA").await;
        let mut stream = SampleStream::start(registry, overlap(), StreamOptions::new("AA", CHAR));

        stream.next().await.unwrap().unwrap();
        adapter.peripheral("AA").set_read_failure(true);

        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectFailure);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_decode_failure_ends_session() {
        let (adapter, registry) = connected("AA").await;
        adapter
            .peripheral("AA")
            .set_payloads(vec![counter_window(0).to_bytes(), vec![0; 130]]);
        let mut stream = SampleStream::start(registry, overlap(), StreamOptions::new("AA", CHAR));

        stream.next().await.unwrap().unwrap();
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodeError);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_rejects_shrinking_merge() {
        let (_adapter, registry) = connected("AA").await;
        let shrink: Arc<dyn WindowMerge> =
            Arc::new(|_: Vec<u16>, _: &SampleWindow, _: &SampleWindow| Vec::<u16>::new());
        let mut stream = SampleStream::start(registry, shrink, StreamOptions::new("AA", CHAR));

        stream.next().await.unwrap().unwrap();
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SessionError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_stream_silently() {
        let (adapter, registry) = connected("AA").await;
        let mut stream = SampleStream::start(registry, overlap(), StreamOptions::new("AA", CHAR));

        stream.next().await.unwrap().unwrap();
        stream.next().await.unwrap().unwrap();
        let token = stream.cancellation_token();
        token.cancel();

        assert!(stream.next().await.is_none());
        assert!(token.is_cancelled());
        assert_eq!(adapter.peripheral("AA").read_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_read_yields_no_error() {
        let (adapter, registry) = connected("AA").await;
        adapter
            .peripheral("AA")
            .set_read_latency(Duration::from_secs(2));
        let mut stream = SampleStream::start(registry, overlap(), StreamOptions::new("AA", CHAR));

        sleep(Duration::from_millis(100)).await;
        stream.cancellation_token().cancel();

        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_polling() {
        let (adapter, registry) = connected("AA").await;
        let mut stream = SampleStream::start(registry, overlap(), StreamOptions::new("AA", CHAR));

        stream.next().await.unwrap().unwrap();
        stream.close();
        sleep(Duration::from_secs(5)).await;

        assert_eq!(adapter.peripheral("AA").read_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_polling() {
        let (adapter, registry) = connected("AA").await;
        let mut stream = SampleStream::start(registry.clone(), overlap(), StreamOptions::new("AA", CHAR));

        stream.next().await.unwrap().unwrap();
        drop(stream);
        sleep(Duration::from_secs(5)).await;

        assert_eq!(adapter.peripheral("AA").read_count(), 1);
        // The registry is untouched by the session ending.
        assert!(registry.is_connected("AA").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_mid_stream_ends_session() {
        let (_adapter, registry) = connected("AA").await;
        let mut stream = SampleStream::start(registry.clone(), overlap(), StreamOptions::new("AA", CHAR));

        stream.next().await.unwrap().unwrap();
        registry.disconnect("AA").await;

        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(stream.next().await.is_none());
    }
}
