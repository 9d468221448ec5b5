//! Mock radio implementation for testing.
//!
//! This module provides an in-memory radio that can be used for unit testing
//! and for running the service without BLE hardware.
//!
//! [`MockAdapter`] implements [`RadioAdapter`], and the sessions it opens
//! implement [`RadioSession`], so they can be used interchangeably with the
//! btleplug backend.
//!
//! # Features
//!
//! - **Failure injection**: make scan, connect, service discovery, disconnect,
//!   liveness or read fail
//! - **Half-open links**: connect "succeeds" but the link never comes up
//! - **Latency simulation**: add artificial delays to connects, reads and scans
//! - **Payloads**: scripted payload queues or a rolling-counter generator

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use blelink_types::{SAMPLES_PER_WINDOW, SampleWindow};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::scan::DiscoveredDevice;
use crate::traits::{RadioAdapter, RadioSession};

/// New samples produced per read by the default rolling counter.
pub const DEFAULT_COUNTER_STEP: u16 = 8;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn sleep_ms(counter: &AtomicU64) -> Option<Duration> {
    match counter.load(Ordering::Relaxed) {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    }
}

/// Where a mock peripheral's characteristic payloads come from.
#[derive(Debug)]
enum PayloadSource {
    /// Pop scripted payloads in order, repeating the last one when drained.
    Scripted {
        queue: VecDeque<Vec<u8>>,
        last: Option<Vec<u8>>,
    },
    /// A device-side rolling buffer of a wrapping u16 counter.
    Counter { next: u16, step: u16 },
}

impl PayloadSource {
    fn next_payload(&mut self) -> Vec<u8> {
        match self {
            Self::Scripted { queue, last } => {
                if let Some(payload) = queue.pop_front() {
                    *last = Some(payload.clone());
                    payload
                } else {
                    last.clone()
                        .unwrap_or_else(|| SampleWindow::from([0; SAMPLES_PER_WINDOW]).to_bytes())
                }
            }
            Self::Counter { next, step } => {
                let payload = counter_window(*next).to_bytes();
                *next = next.wrapping_add(*step);
                payload
            }
        }
    }
}

/// The window a rolling counter device reports when its oldest sample is `start`.
pub fn counter_window(start: u16) -> SampleWindow {
    let mut samples = [0u16; SAMPLES_PER_WINDOW];
    for (i, sample) in samples.iter_mut().enumerate() {
        *sample = start.wrapping_add(i as u16);
    }
    SampleWindow::from(samples)
}

/// One simulated peripheral, shared by every session opened against its address.
pub struct MockPeripheral {
    address: String,
    connected: AtomicBool,
    connect_attempts: AtomicU32,
    disconnect_attempts: AtomicU32,
    read_count: AtomicU32,
    fail_connect: AtomicBool,
    /// The link comes up but service discovery fails afterwards.
    fail_discovery: AtomicBool,
    fail_disconnect: AtomicBool,
    fail_liveness: AtomicBool,
    fail_read: AtomicBool,
    /// Connect returns `Ok` but the link stays down.
    half_open: AtomicBool,
    /// Simulated connect latency in milliseconds (0 = no delay).
    connect_latency_ms: AtomicU64,
    /// Simulated read latency in milliseconds (0 = no delay).
    read_latency_ms: AtomicU64,
    payloads: Mutex<PayloadSource>,
    /// `None` exposes every characteristic.
    characteristics: Mutex<Option<HashSet<Uuid>>>,
}

impl std::fmt::Debug for MockPeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPeripheral")
            .field("address", &self.address)
            .field("connected", &self.connected.load(Ordering::Relaxed))
            .field("connect_attempts", &self.connect_attempts())
            .field("read_count", &self.read_count())
            .finish_non_exhaustive()
    }
}

impl MockPeripheral {
    /// Create a disconnected peripheral serving the default rolling counter.
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            connected: AtomicBool::new(false),
            connect_attempts: AtomicU32::new(0),
            disconnect_attempts: AtomicU32::new(0),
            read_count: AtomicU32::new(0),
            fail_connect: AtomicBool::new(false),
            fail_discovery: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            fail_liveness: AtomicBool::new(false),
            fail_read: AtomicBool::new(false),
            half_open: AtomicBool::new(false),
            connect_latency_ms: AtomicU64::new(0),
            read_latency_ms: AtomicU64::new(0),
            payloads: Mutex::new(PayloadSource::Counter {
                next: 0,
                step: DEFAULT_COUNTER_STEP,
            }),
            characteristics: Mutex::new(None),
        }
    }

    /// The peripheral's address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the simulated link is up.
    pub fn is_connected_sync(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = sleep_ms(&self.connect_latency_ms) {
            sleep(latency).await;
        }

        if self.fail_connect.load(Ordering::Relaxed) {
            return Err(Error::connection_failed(
                Some(self.address.clone()),
                ConnectionFailureReason::OutOfRange,
            ));
        }
        if !self.half_open.load(Ordering::Relaxed) {
            self.connected.store(true, Ordering::SeqCst);
        }
        if self.fail_discovery.load(Ordering::Relaxed) {
            // A session that cannot finish setup tears its own link down.
            self.disconnect().await?;
            return Err(Error::connection_failed(
                Some(self.address.clone()),
                ConnectionFailureReason::BleError("injected discovery failure".to_string()),
            ));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnect_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::Relaxed) {
            return Err(Error::connection_failed(
                Some(self.address.clone()),
                ConnectionFailureReason::BleError("injected disconnect failure".to_string()),
            ));
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> Result<bool> {
        if self.fail_liveness.load(Ordering::Relaxed) {
            return Err(Error::session("injected liveness failure"));
        }
        Ok(self.is_connected_sync())
    }

    async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        if let Some(latency) = sleep_ms(&self.read_latency_ms) {
            sleep(latency).await;
        }
        self.read_count.fetch_add(1, Ordering::SeqCst);

        if !self.is_connected_sync() {
            return Err(Error::not_connected(self.address.clone()));
        }
        if self.fail_read.load(Ordering::Relaxed) {
            return Err(Error::connection_failed(
                Some(self.address.clone()),
                ConnectionFailureReason::BleError("injected read failure".to_string()),
            ));
        }
        if let Some(exposed) = lock(&self.characteristics).as_ref()
            && !exposed.contains(&uuid)
        {
            return Err(Error::characteristic_not_found(uuid.to_string(), 1));
        }

        Ok(lock(&self.payloads).next_payload())
    }

    // --- Test control methods ---

    /// Number of connect calls that reached this peripheral.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of disconnect calls that reached this peripheral.
    pub fn disconnect_attempts(&self) -> u32 {
        self.disconnect_attempts.load(Ordering::SeqCst)
    }

    /// Number of characteristic reads performed.
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::SeqCst)
    }

    /// Make connect calls fail.
    pub fn set_connect_failure(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::Relaxed);
    }

    /// Make service discovery fail after the link comes up.
    pub fn set_discovery_failure(&self, fail: bool) {
        self.fail_discovery.store(fail, Ordering::Relaxed);
    }

    /// Make disconnect calls fail (the link stays up).
    pub fn set_disconnect_failure(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::Relaxed);
    }

    /// Make liveness queries fail.
    pub fn set_liveness_failure(&self, fail: bool) {
        self.fail_liveness.store(fail, Ordering::Relaxed);
    }

    /// Make characteristic reads fail.
    pub fn set_read_failure(&self, fail: bool) {
        self.fail_read.store(fail, Ordering::Relaxed);
    }

    /// Let connect return `Ok` without bringing the link up.
    pub fn set_half_open(&self, half_open: bool) {
        self.half_open.store(half_open, Ordering::Relaxed);
    }

    /// Drop the link as if the device went out of range.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Set simulated connect latency.
    ///
    /// Set to `Duration::ZERO` to disable latency simulation.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Set simulated read latency.
    ///
    /// Set to `Duration::ZERO` to disable latency simulation.
    pub fn set_read_latency(&self, latency: Duration) {
        self.read_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Serve these payloads in order; the last one repeats once drained.
    pub fn set_payloads(&self, payloads: Vec<Vec<u8>>) {
        *lock(&self.payloads) = PayloadSource::Scripted {
            queue: payloads.into(),
            last: None,
        };
    }

    /// Serve a rolling counter that advances `step` samples per read.
    pub fn set_rolling_counter(&self, start: u16, step: u16) {
        *lock(&self.payloads) = PayloadSource::Counter { next: start, step };
    }

    /// Only expose the given characteristics; reads of others fail.
    pub fn restrict_characteristics(&self, uuids: &[Uuid]) {
        *lock(&self.characteristics) = Some(uuids.iter().copied().collect());
    }
}

/// A session handed out by [`MockAdapter::open_session`].
#[derive(Debug)]
pub struct MockSession {
    peripheral: Arc<MockPeripheral>,
    connect_timeout: Duration,
}

#[async_trait]
impl RadioSession for MockSession {
    fn address(&self) -> &str {
        self.peripheral.address()
    }

    async fn connect(&self) -> Result<()> {
        timeout(self.connect_timeout, self.peripheral.connect())
            .await
            .map_err(|_| Error::timeout("connect to device", self.connect_timeout))?
    }

    async fn disconnect(&self) -> Result<()> {
        self.peripheral.disconnect().await
    }

    async fn is_connected(&self) -> Result<bool> {
        self.peripheral.is_connected().await
    }

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>> {
        self.peripheral.read(uuid).await
    }
}

/// An in-memory radio.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use blelink_core::mock::MockAdapter;
/// use blelink_core::{DiscoveredDevice, RadioAdapter};
///
/// #[tokio::main]
/// async fn main() {
///     let adapter = MockAdapter::new();
///     adapter.advertise(DiscoveredDevice::new("AA:BB", Some("Sensor"), Some(-50)));
///
///     let seen = adapter.scan(Duration::from_secs(1)).await.unwrap();
///     assert_eq!(seen.len(), 1);
/// }
/// ```
#[derive(Debug, Default)]
pub struct MockAdapter {
    advertised: Mutex<Vec<DiscoveredDevice>>,
    peripherals: Mutex<HashMap<String, Arc<MockPeripheral>>>,
    scan_count: AtomicU32,
    sessions_opened: AtomicU32,
    fail_scan: AtomicBool,
    /// Upper bound on how long a scan actually sleeps, in milliseconds.
    scan_latency_ms: AtomicU64,
}

impl MockAdapter {
    /// Create an empty radio: nothing advertises, scans return immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// A radio with two rolling-counter devices sharing one name, for running
    /// the service without hardware.
    pub fn simulated(name: &str) -> Self {
        let adapter = Self::new();
        adapter.set_scan_latency(Duration::from_millis(500));
        for (address, rssi) in [("5A:11:00:00:00:01", -48), ("5A:11:00:00:00:02", -71)] {
            adapter.advertise(DiscoveredDevice::new(address, Some(name), Some(rssi)));
            let peripheral = adapter.peripheral(address);
            peripheral.set_connect_latency(Duration::from_millis(150));
            peripheral.set_read_latency(Duration::from_millis(20));
        }
        adapter
    }

    /// Add an advertisement record to every subsequent scan.
    ///
    /// Duplicate records for one address are kept, as a real radio reports them.
    pub fn advertise(&self, device: DiscoveredDevice) {
        if !device.address.is_empty() {
            self.peripheral(&device.address);
        }
        lock(&self.advertised).push(device);
    }

    /// Get (or create) the peripheral behind `address`.
    pub fn peripheral(&self, address: &str) -> Arc<MockPeripheral> {
        lock(&self.peripherals)
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(MockPeripheral::new(address)))
            .clone()
    }

    /// Number of scans performed.
    pub fn scan_count(&self) -> u32 {
        self.scan_count.load(Ordering::SeqCst)
    }

    /// Number of sessions handed out.
    pub fn sessions_opened(&self) -> u32 {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    /// Make scans fail as if the adapter were powered off.
    pub fn set_scan_failure(&self, fail: bool) {
        self.fail_scan.store(fail, Ordering::Relaxed);
    }

    /// Let scans sleep for up to `latency` (never longer than the requested duration).
    pub fn set_scan_latency(&self, latency: Duration) {
        self.scan_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }
}

#[async_trait]
impl RadioAdapter for MockAdapter {
    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        self.scan_count.fetch_add(1, Ordering::SeqCst);

        if let Some(latency) = sleep_ms(&self.scan_latency_ms) {
            sleep(latency.min(duration)).await;
        }
        if self.fail_scan.load(Ordering::Relaxed) {
            return Err(Error::connection_failed(
                None,
                ConnectionFailureReason::AdapterUnavailable,
            ));
        }

        Ok(lock(&self.advertised).clone())
    }

    fn open_session(&self, address: &str, connect_timeout: Duration) -> Box<dyn RadioSession> {
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Box::new(MockSession {
            peripheral: self.peripheral(address),
            connect_timeout,
        })
    }
}
