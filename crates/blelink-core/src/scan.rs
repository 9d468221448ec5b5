//! Device discovery and name matching.
//!
//! This module runs bounded-time scans through a [`RadioAdapter`], filters
//! the results by advertised name and ranks candidates by signal strength.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::traits::RadioAdapter;
use crate::util::normalize_name;

/// A peripheral seen during one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// The advertised local name, if any.
    pub name: Option<String>,
    /// Stable device identifier (MAC address, or peripheral UUID on macOS).
    pub address: String,
    /// RSSI signal strength in dBm.
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    /// Create a discovered device record.
    pub fn new(address: impl Into<String>, name: Option<&str>, rssi: Option<i16>) -> Self {
        Self {
            name: name.map(str::to_string),
            address: address.into(),
            rssi,
        }
    }

    /// Whether the advertised name matches `target` (trimmed, case-insensitive).
    ///
    /// Devices without a name never match a non-empty target.
    pub fn name_matches(&self, target: &str) -> bool {
        normalize_name(self.name.as_deref().unwrap_or_default()) == normalize_name(target)
    }
}

/// Result of a name lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameMatch {
    /// At least one device advertised the name.
    Found {
        /// The name as the caller supplied it.
        name: String,
        /// Matching devices in scan order.
        devices: Vec<DiscoveredDevice>,
    },
    /// The scan completed but nothing advertised the name.
    NotFound {
        /// The name as the caller supplied it.
        name: String,
    },
}

impl NameMatch {
    /// Addresses of the matching devices, in scan order.
    pub fn addresses(&self) -> Vec<String> {
        match self {
            Self::Found { devices, .. } => devices.iter().map(|d| d.address.clone()).collect(),
            Self::NotFound { .. } => Vec::new(),
        }
    }

    /// Returns `true` if nothing matched.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Scan for `timeout` and return each address once.
///
/// The first record seen for an address wins; records with an empty address
/// are dropped.
#[tracing::instrument(level = "debug", skip(adapter))]
pub async fn scan(adapter: &dyn RadioAdapter, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
    let raw = adapter.scan(timeout).await?;
    let total = raw.len();
    let devices = dedupe_by_address(raw);

    info!(
        "Scan complete. Found {} device(s) ({} raw records)",
        devices.len(),
        total
    );
    Ok(devices)
}

/// Scan and collect every device whose name matches `target`.
///
/// An empty match set is reported as [`NameMatch::NotFound`] rather than an
/// empty list.
#[tracing::instrument(level = "debug", skip(adapter))]
pub async fn find_by_name(
    adapter: &dyn RadioAdapter,
    target: &str,
    timeout: Duration,
) -> Result<NameMatch> {
    let devices = scan(adapter, timeout).await?;
    let matches: Vec<DiscoveredDevice> = devices
        .into_iter()
        .filter(|d| d.name_matches(target))
        .collect();

    if matches.is_empty() {
        debug!("No device advertised name {:?}", target);
        return Ok(NameMatch::NotFound {
            name: target.to_string(),
        });
    }

    debug!("{} device(s) advertised name {:?}", matches.len(), target);
    Ok(NameMatch::Found {
        name: target.to_string(),
        devices: matches,
    })
}

/// Order candidates strongest signal first.
///
/// Devices with unknown RSSI go last. The sort is stable, so ties and
/// unknown-strength devices keep their scan order.
pub fn rank_by_signal(devices: &mut [DiscoveredDevice]) {
    devices.sort_by_key(|d| (d.rssi.is_none(), Reverse(d.rssi)));
}

fn dedupe_by_address(devices: Vec<DiscoveredDevice>) -> Vec<DiscoveredDevice> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|d| !d.address.trim().is_empty())
        .filter(|d| seen.insert(d.address.clone()))
        .collect()
}
