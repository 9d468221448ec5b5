//! Trait abstractions for the radio stack.
//!
//! [`RadioAdapter`] and [`RadioSession`] are the seam between the lifecycle
//! core and the Bluetooth implementation. [`crate::device::BtleAdapter`]
//! drives real hardware through btleplug; [`crate::mock::MockAdapter`] is an
//! in-memory radio for tests and simulation.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::scan::DiscoveredDevice;

/// A radio that can scan and hand out per-device sessions.
///
/// # Example
///
/// ```ignore
/// use blelink_core::{RadioAdapter, Result};
///
/// async fn count_nearby(adapter: &dyn RadioAdapter) -> Result<usize> {
///     let devices = adapter.scan(std::time::Duration::from_secs(5)).await?;
///     Ok(devices.len())
/// }
/// ```
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Scan for `duration` and report every peripheral seen.
    ///
    /// The result may contain duplicates; discovery dedupes it.
    async fn scan(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>>;

    /// Create a not-yet-connected session for `address`.
    ///
    /// No radio I/O happens until [`RadioSession::connect`] is called.
    fn open_session(&self, address: &str, connect_timeout: Duration) -> Box<dyn RadioSession>;
}

/// An exclusively-owned connection handle for one peripheral.
#[async_trait]
pub trait RadioSession: Send + Sync {
    /// The address this session targets.
    fn address(&self) -> &str;

    /// Establish the link, bounded by the session's connect timeout.
    async fn connect(&self) -> Result<()>;

    /// Tear the link down.
    async fn disconnect(&self) -> Result<()>;

    /// Query the stack's live connection state.
    async fn is_connected(&self) -> Result<bool>;

    /// Read the raw value of a characteristic.
    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>>;
}
