//! btleplug-backed radio.
//!
//! [`BtleAdapter`] and [`BtleSession`] implement the radio traits on top of
//! the host's Bluetooth stack.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DeviceNotFoundReason, Error, Result};
use crate::scan::DiscoveredDevice;
use crate::traits::{RadioAdapter, RadioSession};
use crate::util::{create_identifier, format_peripheral_id, same_identifier};

/// Default timeout for BLE characteristic read operations.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for BLE connection operations.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for service discovery.
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a connect re-checks the adapter while waiting for an advertisement.
const RESOLVE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Configuration for BLE connection timeouts.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use blelink_core::device::ConnectionConfig;
///
/// let config = ConnectionConfig::default()
///     .connection_timeout(Duration::from_secs(20))
///     .read_timeout(Duration::from_secs(15));
/// assert_eq!(config.connection_timeout, Duration::from_secs(20));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for finding the peripheral and establishing the link.
    pub connection_timeout: Duration,
    /// Timeout for service discovery after connection.
    pub discovery_timeout: Duration,
    /// Timeout for BLE read operations.
    pub read_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Create a new connection config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the service discovery timeout.
    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    /// Set the read timeout.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter))
}

/// The host Bluetooth adapter.
#[derive(Clone)]
pub struct BtleAdapter {
    adapter: Adapter,
    config: ConnectionConfig,
    /// One scan window at a time; a second `stop_scan` would cut the first short.
    scan_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for BtleAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleAdapter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BtleAdapter {
    /// Open the first available adapter with default timeouts.
    pub async fn new() -> Result<Self> {
        Ok(Self::from_adapter(get_adapter().await?))
    }

    /// Wrap an adapter obtained elsewhere.
    pub fn from_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            config: ConnectionConfig::default(),
            scan_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Use these timeouts for sessions opened from now on.
    ///
    /// The connection timeout is replaced per session by the caller's value.
    #[must_use]
    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl RadioAdapter for BtleAdapter {
    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        let _scan = self.scan_lock.lock().await;
        info!("Starting BLE scan for {:.1} seconds...", duration.as_secs_f64());

        self.adapter.start_scan(ScanFilter::default()).await?;
        sleep(duration).await;
        self.adapter.stop_scan().await?;

        let peripherals = self.adapter.peripherals().await?;
        let mut discovered = Vec::with_capacity(peripherals.len());

        for peripheral in peripherals {
            match describe_peripheral(&peripheral).await {
                Ok(Some(device)) if heard_this_scan(&device) => discovered.push(device),
                Ok(Some(device)) => debug!("Skipping {}: not heard in this scan", device.address),
                Ok(None) => {}
                Err(e) => debug!("Error processing peripheral: {}", e),
            }
        }

        Ok(discovered)
    }

    fn open_session(&self, address: &str, connect_timeout: Duration) -> Box<dyn RadioSession> {
        let config = self.config.clone().connection_timeout(connect_timeout);
        Box::new(BtleSession::new(self.adapter.clone(), address, config))
    }
}

async fn describe_peripheral(peripheral: &Peripheral) -> Result<Option<DiscoveredDevice>> {
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };

    let address = create_identifier(&properties.address.to_string(), &peripheral.id());
    Ok(Some(DiscoveredDevice {
        name: properties.local_name,
        address,
        rssi: properties.rssi,
    }))
}

/// Whether a peripheral the adapter reports was actually heard in this scan.
///
/// The adapter keeps every peripheral it has ever seen; only those with a
/// fresh RSSI were advertising during the window.
fn heard_this_scan(device: &DiscoveredDevice) -> bool {
    device.rssi.is_some()
}

/// Find `uuid` in `cache`, falling back to a walk of the discovered services.
///
/// A hit found by the walk is written back so the next read skips it.
async fn cached_lookup(
    cache: &RwLock<HashMap<Uuid, Characteristic>>,
    uuid: Uuid,
    services: impl FnOnce() -> BTreeSet<Service>,
) -> Result<Characteristic> {
    if let Some(characteristic) = cache.read().await.get(&uuid) {
        return Ok(characteristic.clone());
    }

    let services = services();
    let characteristic = services
        .iter()
        .flat_map(|s| s.characteristics.iter())
        .find(|c| c.uuid == uuid)
        .cloned()
        .ok_or_else(|| Error::characteristic_not_found(uuid.to_string(), services.len()))?;

    cache.write().await.insert(uuid, characteristic.clone());
    Ok(characteristic)
}

/// A connection handle for one peripheral on the host adapter.
///
/// The peripheral is resolved lazily on [`RadioSession::connect`]; until then
/// the session holds only the address.
pub struct BtleSession {
    adapter: Adapter,
    address: String,
    peripheral: RwLock<Option<Peripheral>>,
    /// Built after service discovery so reads avoid walking every service.
    characteristics_cache: RwLock<HashMap<Uuid, Characteristic>>,
    config: ConnectionConfig,
}

impl std::fmt::Debug for BtleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleSession")
            .field("address", &self.address)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BtleSession {
    /// Create an unconnected session.
    pub fn new(adapter: Adapter, address: &str, config: ConnectionConfig) -> Self {
        Self {
            adapter,
            address: address.to_string(),
            peripheral: RwLock::new(None),
            characteristics_cache: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Number of characteristics cached by the last service discovery.
    pub async fn cached_characteristic_count(&self) -> usize {
        self.characteristics_cache.read().await.len()
    }

    async fn find_known_peripheral(&self) -> Result<Option<Peripheral>> {
        for peripheral in self.adapter.peripherals().await? {
            let id = format_peripheral_id(&peripheral.id());
            if same_identifier(&id, &self.address) {
                return Ok(Some(peripheral));
            }
            if let Some(props) = peripheral.properties().await?
                && same_identifier(
                    &create_identifier(&props.address.to_string(), &peripheral.id()),
                    &self.address,
                )
            {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    /// Find the peripheral among those the adapter knows, scanning until the
    /// connection deadline if it has not been seen yet.
    async fn resolve_peripheral(&self, deadline: Instant) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripheral.read().await.clone() {
            return Ok(peripheral);
        }
        if let Some(peripheral) = self.find_known_peripheral().await? {
            return Ok(peripheral);
        }

        debug!("{} not cached by adapter, scanning", self.address);
        self.adapter.start_scan(ScanFilter::default()).await?;
        let found = loop {
            if let Some(peripheral) = self.find_known_peripheral().await? {
                break Some(peripheral);
            }
            if Instant::now() + RESOLVE_POLL_INTERVAL > deadline {
                break None;
            }
            sleep(RESOLVE_POLL_INTERVAL).await;
        };
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        found.ok_or_else(|| Error::device_not_found(self.address.clone()))
    }

    async fn find_characteristic(&self, peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        cached_lookup(&self.characteristics_cache, uuid, || peripheral.services()).await
    }
}

#[async_trait]
impl RadioSession for BtleSession {
    fn address(&self) -> &str {
        &self.address
    }

    #[tracing::instrument(level = "info", skip(self), fields(address = %self.address, connect_timeout = ?self.config.connection_timeout))]
    async fn connect(&self) -> Result<()> {
        let deadline = Instant::now() + self.config.connection_timeout;
        let peripheral = timeout(self.config.connection_timeout, self.resolve_peripheral(deadline))
            .await
            .map_err(|_| Error::timeout("find device", self.config.connection_timeout))??;

        let remaining = deadline.saturating_duration_since(Instant::now());
        info!("Connecting to device...");
        let linked: Result<()> = async {
            timeout(remaining, peripheral.connect())
                .await
                .map_err(|_| Error::timeout("connect to device", self.config.connection_timeout))??;
            info!("Connected!");

            timeout(self.config.discovery_timeout, peripheral.discover_services())
                .await
                .map_err(|_| Error::timeout("discover services", self.config.discovery_timeout))??;
            Ok(())
        }
        .await;

        // The stack may hold a link even when connect timed out, so release it
        // before the session is discarded.
        if let Err(e) = linked {
            if let Err(disconnect_err) = peripheral.disconnect().await {
                debug!("Cleanup disconnect from {} failed: {}", self.address, disconnect_err);
            }
            return Err(e);
        }

        let mut cache = HashMap::new();
        for service in peripheral.services() {
            for characteristic in service.characteristics {
                cache.insert(characteristic.uuid, characteristic);
            }
        }
        debug!("Cached {} characteristics for fast lookup", cache.len());

        *self.characteristics_cache.write().await = cache;
        *self.peripheral.write().await = Some(peripheral);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let peripheral = self.peripheral.read().await.clone();
        if let Some(peripheral) = peripheral {
            info!("Disconnecting from {}...", self.address);
            peripheral.disconnect().await?;
        }
        self.characteristics_cache.write().await.clear();
        Ok(())
    }

    async fn is_connected(&self) -> Result<bool> {
        match self.peripheral.read().await.as_ref() {
            Some(peripheral) => Ok(peripheral.is_connected().await?),
            None => Ok(false),
        }
    }

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let peripheral = self
            .peripheral
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::not_connected(self.address.clone()))?;

        let characteristic = self.find_characteristic(&peripheral, uuid).await?;
        let data = timeout(self.config.read_timeout, peripheral.read(&characteristic))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("read characteristic {}", uuid),
                duration: self.config.read_timeout,
            })??;
        Ok(data)
    }
}
