//! Persistent connection registry.
//!
//! The [`ConnectionRegistry`] is the single source of truth for which
//! addresses have a managed connection. It uses two levels of locking:
//!
//! - a registry-wide `RwLock` over the address map, held only for point
//!   lookups and inserts/removals and never across radio I/O;
//! - a per-entry `Mutex` that serializes connect, disconnect and read
//!   operations for one address while other addresses proceed in parallel.
//!
//! After taking an entry's lock, every operation checks that the entry is
//! still the one registered for its address. An entry removed by a failed
//! connect or a disconnect is never driven again; the caller starts over with
//! whatever is registered now. A connect whose future is dropped before it
//! finishes retires its entry the same way.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::traits::{RadioAdapter, RadioSession};

/// One tracked address and its exclusively-owned radio session.
pub struct ManagedConnection {
    address: String,
    session: Box<dyn RadioSession>,
    /// Serializes connect/disconnect/read for this address.
    op_lock: Mutex<()>,
    last_known_name: RwLock<Option<String>>,
    /// Set once an abandoned connect gives the entry up.
    retired: AtomicBool,
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl ManagedConnection {
    fn new(address: &str, session: Box<dyn RadioSession>) -> Self {
        Self {
            address: address.to_string(),
            session,
            op_lock: Mutex::new(()),
            last_known_name: RwLock::new(None),
            retired: AtomicBool::new(false),
        }
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// The tracked address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Best-effort label recorded by the last connect that supplied a name.
    pub async fn last_known_name(&self) -> Option<String> {
        self.last_known_name.read().await.clone()
    }

    async fn set_name(&self, name: Option<&str>) {
        if let Some(name) = name {
            *self.last_known_name.write().await = Some(name.to_string());
        }
    }

    /// Live connection state; a failing query counts as disconnected.
    pub async fn is_connected(&self) -> bool {
        match self.session.is_connected().await {
            Ok(connected) => connected,
            Err(e) => {
                debug!("Liveness query for {} failed: {}", self.address, e);
                false
            }
        }
    }
}

type ConnectionMap = HashMap<String, Arc<ManagedConnection>>;

fn remove_entry(connections: &mut ConnectionMap, address: &str, entry: &Arc<ManagedConnection>) {
    if connections
        .get(address)
        .is_some_and(|current| Arc::ptr_eq(current, entry))
    {
        connections.remove(address);
    }
}

/// Retires the entry of a connect that never reached a result.
///
/// Armed while the radio connect is in flight. Dropping it armed (the caller's
/// future was cancelled) marks the entry retired, so waiters on its lock start
/// over, and unregisters it.
struct PendingConnect {
    connections: Arc<RwLock<ConnectionMap>>,
    entry: Arc<ManagedConnection>,
    armed: bool,
}

impl PendingConnect {
    fn new(connections: &Arc<RwLock<ConnectionMap>>, entry: &Arc<ManagedConnection>) -> Self {
        Self {
            connections: Arc::clone(connections),
            entry: Arc::clone(entry),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingConnect {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let address = self.entry.address.clone();
        warn!("Connect to {} was abandoned before it finished", address);
        self.entry.retired.store(true, Ordering::SeqCst);

        match self.connections.try_write() {
            Ok(mut connections) => remove_entry(&mut connections, &address, &self.entry),
            Err(_) => {
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    // Retired entries are skipped by every lookup until replaced.
                    return;
                };
                let connections = Arc::clone(&self.connections);
                let entry = Arc::clone(&self.entry);
                handle.spawn(async move {
                    remove_entry(&mut *connections.write().await, &address, &entry);
                });
            }
        }
    }
}

/// Live status of one tracked address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// The tracked address.
    pub address: String,
    /// Whether the link is up right now.
    pub is_connected: bool,
}

/// Registry of persistent connections, keyed by address.
///
/// Construct one per process and share it behind an `Arc`.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use blelink_core::ConnectionRegistry;
/// use blelink_core::mock::MockAdapter;
///
/// #[tokio::main]
/// async fn main() {
///     let registry = ConnectionRegistry::new(Arc::new(MockAdapter::new()));
///
///     let live = registry
///         .connect_persistent("AA:BB", Duration::from_secs(5), Some("Sensor"))
///         .await
///         .unwrap();
///     assert!(live);
///     assert_eq!(registry.list_addresses().await, vec!["AA:BB".to_string()]);
///
///     assert!(registry.disconnect("AA:BB").await);
///     assert!(registry.list_addresses().await.is_empty());
/// }
/// ```
pub struct ConnectionRegistry {
    adapter: Arc<dyn RadioAdapter>,
    connections: Arc<RwLock<ConnectionMap>>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry").finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// Create an empty registry on top of `adapter`.
    pub fn new(adapter: Arc<dyn RadioAdapter>) -> Self {
        Self {
            adapter,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The radio this registry opens sessions on.
    pub fn adapter(&self) -> &Arc<dyn RadioAdapter> {
        &self.adapter
    }

    async fn get(&self, address: &str) -> Option<Arc<ManagedConnection>> {
        self.connections
            .read()
            .await
            .get(address)
            .filter(|entry| !entry.is_retired())
            .cloned()
    }

    async fn get_or_insert(&self, address: &str, connect_timeout: Duration) -> Arc<ManagedConnection> {
        let mut connections = self.connections.write().await;
        if let Some(entry) = connections.get(address)
            && !entry.is_retired()
        {
            return Arc::clone(entry);
        }

        debug!("Tracking new address {}", address);
        let session = self.adapter.open_session(address, connect_timeout);
        let entry = Arc::new(ManagedConnection::new(address, session));
        connections.insert(address.to_string(), Arc::clone(&entry));
        entry
    }

    /// Whether `entry` is still the one registered for `address`.
    async fn is_current(&self, address: &str, entry: &Arc<ManagedConnection>) -> bool {
        !entry.is_retired()
            && self
                .connections
                .read()
                .await
                .get(address)
                .is_some_and(|current| Arc::ptr_eq(current, entry))
    }

    async fn remove_if_current(&self, address: &str, entry: &Arc<ManagedConnection>) {
        remove_entry(&mut *self.connections.write().await, address, entry);
    }

    async fn live_entries(&self) -> Vec<Arc<ManagedConnection>> {
        self.connections
            .read()
            .await
            .values()
            .filter(|entry| !entry.is_retired())
            .cloned()
            .collect()
    }

    /// Whether `address` is tracked and its link is up.
    ///
    /// Returns `false` when nothing is tracked or the liveness query fails.
    pub async fn is_connected(&self, address: &str) -> bool {
        match self.get(address).await {
            Some(entry) => entry.is_connected().await,
            None => false,
        }
    }

    /// Snapshot of the tracked addresses, sorted.
    pub async fn list_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .live_entries()
            .await
            .iter()
            .map(|entry| entry.address.clone())
            .collect();
        addresses.sort();
        addresses
    }

    /// Live status of every tracked address, sorted by address.
    pub async fn list_connections(&self) -> Vec<ConnectionStatus> {
        let entries = self.live_entries().await;

        let mut statuses: Vec<ConnectionStatus> = join_all(entries.iter().map(|entry| async move {
            ConnectionStatus {
                address: entry.address.clone(),
                is_connected: entry.is_connected().await,
            }
        }))
        .await;
        statuses.sort_by(|a, b| a.address.cmp(&b.address));
        statuses
    }

    /// Number of tracked addresses.
    pub async fn len(&self) -> usize {
        self.live_entries().await.len()
    }

    /// Returns `true` if nothing is tracked.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// The name recorded for `address`, if tracked.
    pub async fn last_known_name(&self, address: &str) -> Option<String> {
        match self.get(address).await {
            Some(entry) => entry.last_known_name().await,
            None => None,
        }
    }

    /// Connect to `address` and keep the connection.
    ///
    /// Returns the live state after the attempt. An address that is already
    /// connected is not reconnected; only its name is updated. A failed
    /// connect removes the entry before the error is returned, so the next
    /// attempt starts from a fresh session. Dropping the returned future
    /// mid-connect (a client hanging up, an outer timeout) removes it too.
    ///
    /// Concurrent calls for one address share a single connect attempt.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn connect_persistent(
        &self,
        address: &str,
        connect_timeout: Duration,
        name: Option<&str>,
    ) -> Result<bool> {
        loop {
            let entry = self.get_or_insert(address, connect_timeout).await;
            let _guard = entry.op_lock.lock().await;

            if !self.is_current(address, &entry).await {
                debug!("Entry for {} was replaced while waiting, retrying", address);
                continue;
            }

            if entry.is_connected().await {
                debug!("{} already connected", address);
                entry.set_name(name).await;
                return Ok(true);
            }

            info!("Connecting to {}", address);
            let pending = PendingConnect::new(&self.connections, &entry);
            if let Err(e) = entry.session.connect().await {
                warn!("Connect to {} failed: {}", address, e);
                self.remove_if_current(address, &entry).await;
                pending.disarm();
                return Err(e);
            }
            pending.disarm();

            entry.set_name(name).await;
            let live = entry.is_connected().await;
            if live {
                info!("Connected to {}", address);
            } else {
                warn!("Connect to {} returned but the link is down", address);
            }
            return Ok(live);
        }
    }

    /// Disconnect `address` and stop tracking it.
    ///
    /// Returns whether it was connected. Disconnect failures are logged and
    /// swallowed; the entry is removed either way.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn disconnect(&self, address: &str) -> bool {
        loop {
            let Some(entry) = self.get(address).await else {
                debug!("No tracked connection for {}", address);
                return false;
            };
            let _guard = entry.op_lock.lock().await;

            if !self.is_current(address, &entry).await {
                continue;
            }

            let was_connected = entry.is_connected().await;
            if let Err(e) = entry.session.disconnect().await {
                warn!("Disconnect from {} failed: {}", address, e);
            }
            self.remove_if_current(address, &entry).await;

            info!("Disconnected {} (was connected: {})", address, was_connected);
            return was_connected;
        }
    }

    /// Disconnect every tracked address in parallel.
    ///
    /// Returns each address with whether it was connected.
    pub async fn disconnect_all(&self) -> HashMap<String, bool> {
        let addresses = self.list_addresses().await;
        info!("Disconnecting {} tracked device(s)", addresses.len());

        let results = join_all(addresses.into_iter().map(|address| async move {
            let was_connected = self.disconnect(&address).await;
            (address, was_connected)
        }))
        .await;

        results.into_iter().collect()
    }

    /// Fail unless `address` is tracked and live.
    pub async fn require_connected(&self, address: &str) -> Result<()> {
        let entry = self
            .get(address)
            .await
            .ok_or_else(|| Error::not_tracked(address))?;
        if entry.is_connected().await {
            Ok(())
        } else {
            Err(Error::not_connected(address))
        }
    }

    /// Read a characteristic through the tracked session for `address`.
    ///
    /// Holds the address's lock for the duration of the read, so it never
    /// overlaps a connect or disconnect of the same device.
    pub async fn read_characteristic(&self, address: &str, uuid: Uuid) -> Result<Vec<u8>> {
        loop {
            let entry = self
                .get(address)
                .await
                .ok_or_else(|| Error::not_tracked(address))?;
            let _guard = entry.op_lock.lock().await;

            if !self.is_current(address, &entry).await {
                continue;
            }

            return entry.session.read_characteristic(uuid).await;
        }
    }
}
