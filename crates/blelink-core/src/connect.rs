//! Name-based persistent connects with failover.
//!
//! [`PersistentConnector`] scans for every device advertising a name, ranks
//! them by signal strength, and tries each in turn until one connects. Each
//! failed candidate is recorded as data, so a caller learns which addresses
//! were tried and why each one failed without reading server logs.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConnectionFailureReason, Error, Result};
use crate::registry::ConnectionRegistry;
use crate::scan::{NameMatch, find_by_name, rank_by_signal};

/// Outcome of [`PersistentConnector::connect_by_name`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectOutcome {
    /// A candidate connected and is now tracked.
    Connected {
        /// The name as the caller supplied it.
        name: String,
        /// The address that connected.
        address: String,
        /// Signal strength the device advertised during the scan.
        rssi: Option<i16>,
    },
    /// No device advertised the name.
    NotFound {
        /// The name as the caller supplied it.
        name: String,
    },
    /// Devices matched but none could be connected.
    Failed {
        /// The name as the caller supplied it.
        name: String,
        /// Every address tried, strongest signal first.
        attempted_addresses: Vec<String>,
        /// One `"address: Kind: message"` entry per failed candidate.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        errors: Option<Vec<String>>,
    },
}

impl ConnectOutcome {
    /// Returns `true` for [`ConnectOutcome::Connected`].
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Drives connect attempts across ranked candidates.
#[derive(Debug, Clone)]
pub struct PersistentConnector {
    registry: Arc<ConnectionRegistry>,
}

impl PersistentConnector {
    /// Create a connector that registers connections in `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// The registry connections are tracked in.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Scan for `name` and keep a connection to the first candidate that
    /// connects, trying the strongest signal first.
    ///
    /// Per-candidate failures never abort the sequence; they are collected
    /// into [`ConnectOutcome::Failed`]. Only a failing scan returns `Err`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn connect_by_name(
        &self,
        name: &str,
        scan_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<ConnectOutcome> {
        let mut candidates = match find_by_name(self.registry.adapter().as_ref(), name, scan_timeout).await? {
            NameMatch::Found { devices, .. } => devices,
            NameMatch::NotFound { name } => {
                info!("No device named {:?}", name);
                return Ok(ConnectOutcome::NotFound { name });
            }
        };
        rank_by_signal(&mut candidates);
        debug!("Trying {} candidate(s) for {:?}", candidates.len(), name);

        let mut attempted_addresses = Vec::with_capacity(candidates.len());
        let mut errors = Vec::new();

        for candidate in candidates {
            let address = candidate.address;
            attempted_addresses.push(address.clone());

            match self
                .registry
                .connect_persistent(&address, connect_timeout, Some(name))
                .await
            {
                Ok(true) => {
                    info!("Connected to {:?} at {}", name, address);
                    return Ok(ConnectOutcome::Connected {
                        name: name.to_string(),
                        address,
                        rssi: candidate.rssi,
                    });
                }
                Ok(false) => {
                    warn!("{} accepted the connect but is not connected", address);
                    let e = Error::connection_failed(
                        Some(address.clone()),
                        ConnectionFailureReason::NotLive,
                    );
                    errors.push(candidate_error(&address, &e));
                }
                Err(e) => {
                    warn!("Candidate {} failed: {}", address, e);
                    errors.push(candidate_error(&address, &e));
                }
            }
        }

        Ok(ConnectOutcome::Failed {
            name: name.to_string(),
            attempted_addresses,
            errors: (!errors.is_empty()).then_some(errors),
        })
    }

    /// Connect straight to `address`, with no scan and no failover.
    ///
    /// Returns the live state after the attempt; a failed connect is an error.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn connect_by_address(&self, address: &str, connect_timeout: Duration) -> Result<bool> {
        self.registry
            .connect_persistent(address, connect_timeout, None)
            .await
    }
}

/// `"<address>: <label>: <message>"`, as reported per failed candidate.
fn candidate_error(address: &str, e: &Error) -> String {
    format!("{}: {}: {}", address, e.label(), e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::mock::MockAdapter;
    use crate::scan::DiscoveredDevice;

    const SCAN: Duration = Duration::from_secs(5);
    const CONNECT: Duration = Duration::from_secs(10);

    fn setup() -> (Arc<MockAdapter>, PersistentConnector) {
        let adapter = Arc::new(MockAdapter::new());
        let registry = Arc::new(ConnectionRegistry::new(adapter.clone()));
        (adapter, PersistentConnector::new(registry))
    }

    fn advertise(adapter: &MockAdapter, address: &str, name: &str, rssi: Option<i16>) {
        adapter.advertise(DiscoveredDevice::new(address, Some(name), rssi));
    }

    #[tokio::test]
    async fn test_connects_to_strongest_candidate() {
        let (adapter, connector) = setup();
        advertise(&adapter, "WEAK", "Sensor", Some(-80));
        advertise(&adapter, "STRONG", "sensor", Some(-40));

        let outcome = connector.connect_by_name("Sensor", SCAN, CONNECT).await.unwrap();

        assert_eq!(
            outcome,
            ConnectOutcome::Connected {
                name: "Sensor".into(),
                address: "STRONG".into(),
                rssi: Some(-40)
            }
        );
        assert_eq!(adapter.peripheral("WEAK").connect_attempts(), 0);
        assert_eq!(
            connector.registry().last_known_name("STRONG").await.as_deref(),
            Some("Sensor")
        );
    }

    #[tokio::test]
    async fn test_not_found_when_nothing_matches() {
        let (adapter, connector) = setup();
        advertise(&adapter, "AA", "Other", Some(-40));

        let outcome = connector.connect_by_name("Sensor", SCAN, CONNECT).await.unwrap();

        assert_eq!(
            outcome,
            ConnectOutcome::NotFound {
                name: "Sensor".into()
            }
        );
        assert_eq!(adapter.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_attempt_order_follows_signal_strength() {
        let (adapter, connector) = setup();
        advertise(&adapter, "A-40", "Sensor", Some(-40));
        advertise(&adapter, "B-70", "Sensor", Some(-70));
        advertise(&adapter, "C-none", "Sensor", None);
        advertise(&adapter, "D-55", "Sensor", Some(-55));
        for address in ["A-40", "B-70", "C-none", "D-55"] {
            adapter.peripheral(address).set_connect_failure(true);
        }

        let outcome = connector.connect_by_name("Sensor", SCAN, CONNECT).await.unwrap();

        let ConnectOutcome::Failed {
            attempted_addresses,
            errors,
            ..
        } = outcome
        else {
            panic!("expected failure outcome, got {outcome:?}");
        };
        assert_eq!(attempted_addresses, vec!["A-40", "D-55", "B-70", "C-none"]);
        let errors = errors.unwrap();
        assert_eq!(errors.len(), 4);
        assert!(errors[0].starts_with("A-40: ConnectionFailed: "));
    }

    #[tokio::test]
    async fn test_stops_after_first_success() {
        let (adapter, connector) = setup();
        advertise(&adapter, "FIRST", "Sensor", Some(-40));
        advertise(&adapter, "SECOND", "Sensor", Some(-50));
        advertise(&adapter, "THIRD", "Sensor", Some(-60));
        adapter.peripheral("FIRST").set_connect_failure(true);

        let outcome = connector.connect_by_name("Sensor", SCAN, CONNECT).await.unwrap();

        assert!(outcome.is_connected());
        assert_eq!(adapter.peripheral("FIRST").connect_attempts(), 1);
        assert_eq!(adapter.peripheral("SECOND").connect_attempts(), 1);
        assert_eq!(adapter.peripheral("THIRD").connect_attempts(), 0);
        assert_eq!(connector.registry().list_addresses().await, vec!["SECOND"]);
    }

    #[tokio::test]
    async fn test_half_open_candidate_is_recorded_and_skipped() {
        let (adapter, connector) = setup();
        advertise(&adapter, "HALF", "Sensor", Some(-40));
        advertise(&adapter, "GOOD", "Sensor", Some(-60));
        adapter.peripheral("HALF").set_half_open(true);

        let outcome = connector.connect_by_name("Sensor", SCAN, CONNECT).await.unwrap();

        assert_eq!(
            outcome,
            ConnectOutcome::Connected {
                name: "Sensor".into(),
                address: "GOOD".into(),
                rssi: Some(-60)
            }
        );
    }

    #[tokio::test]
    async fn test_failure_lists_half_open_error() {
        let (adapter, connector) = setup();
        advertise(&adapter, "HALF", "Sensor", Some(-40));
        adapter.peripheral("HALF").set_half_open(true);

        let outcome = connector.connect_by_name("Sensor", SCAN, CONNECT).await.unwrap();

        assert_eq!(
            outcome,
            ConnectOutcome::Failed {
                name: "Sensor".into(),
                attempted_addresses: vec!["HALF".into()],
                errors: Some(vec![
                    "HALF: ConnectionFailed: Connection failed: connect returned but device is not connected"
                        .into()
                ]),
            }
        );
    }

    #[tokio::test]
    async fn test_failed_candidates_leave_registry_clean() {
        let (adapter, connector) = setup();
        advertise(&adapter, "AA", "Sensor", Some(-40));
        advertise(&adapter, "BB", "Sensor", Some(-50));
        adapter.peripheral("AA").set_connect_failure(true);
        adapter.peripheral("BB").set_connect_failure(true);

        let outcome = connector.connect_by_name("Sensor", SCAN, CONNECT).await.unwrap();

        assert!(!outcome.is_connected());
        assert!(connector.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_scan_failure_is_an_error() {
        let (adapter, connector) = setup();
        adapter.set_scan_failure(true);

        let err = connector
            .connect_by_name("Sensor", SCAN, CONNECT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectFailure);
    }

    #[tokio::test]
    async fn test_connect_by_address() {
        let (adapter, connector) = setup();

        assert!(connector.connect_by_address("AA", CONNECT).await.unwrap());
        assert_eq!(adapter.scan_count(), 0);

        adapter.peripheral("BB").set_connect_failure(true);
        let err = connector.connect_by_address("BB", CONNECT).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectFailure);
        assert_eq!(adapter.peripheral("BB").connect_attempts(), 1);
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = ConnectOutcome::Failed {
            name: "Sensor".into(),
            attempted_addresses: vec!["AA".into()],
            errors: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["attempted_addresses"][0], "AA");
        assert!(json.get("errors").is_none());

        let json = serde_json::to_value(ConnectOutcome::NotFound { name: "x".into() }).unwrap();
        assert_eq!(json["status"], "not_found");
    }
}
