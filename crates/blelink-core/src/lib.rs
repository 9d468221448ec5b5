//! Persistent BLE connections and live sample streaming.
//!
//! This crate turns BLE peripherals into addressable, persistently-connected
//! resources and streams time-series samples from them.
//!
//! # Features
//!
//! - **Discovery**: bounded-time scans, exact name matching, signal ranking
//! - **Connection registry**: at most one in-flight connect/disconnect per
//!   address, idempotent connects, no leaked entries on failure
//! - **Failover connects**: try every device advertising a name, strongest
//!   signal first, recording why each candidate failed
//! - **Streaming**: poll a characteristic, merge overlapping 64-sample
//!   windows and emit only what is new
//! - **Mock radio**: failure and latency injection for tests and simulation
//!
//! # Architecture
//!
//! The radio stack sits behind [`RadioAdapter`] / [`RadioSession`].
//! [`device::BtleAdapter`] drives real hardware through btleplug and
//! [`mock::MockAdapter`] is an in-memory stand-in. Everything above that seam
//! ([`ConnectionRegistry`], [`PersistentConnector`], [`SampleStream`]) is
//! hardware-agnostic.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use blelink_core::{ConnectionRegistry, OverlapMerge, PersistentConnector, SampleStream, StreamOptions};
//! use blelink_core::device::BtleAdapter;
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(ConnectionRegistry::new(Arc::new(BtleAdapter::new().await?)));
//!     let connector = PersistentConnector::new(registry.clone());
//!
//!     let outcome = connector
//!         .connect_by_name("Sensor", Duration::from_secs(5), Duration::from_secs(10))
//!         .await?;
//!     println!("{outcome:?}");
//!
//!     let characteristic = blelink_types::parse_characteristic("2a19")?;
//!     let options = StreamOptions::new("AA:BB:CC:DD:EE:FF", characteristic);
//!     let mut stream = SampleStream::start(registry.clone(), Arc::new(OverlapMerge), options);
//!     while let Some(batch) = stream.next().await {
//!         println!("{:?}", batch?.new_samples);
//!     }
//!
//!     registry.disconnect_all().await;
//!     Ok(())
//! }
//! ```

pub mod connect;
pub mod device;
pub mod error;
pub mod merge;
pub mod mock;
pub mod registry;
pub mod scan;
pub mod streaming;
pub mod traits;
pub mod util;

pub use blelink_types::{SAMPLE_PAYLOAD_LEN, SAMPLES_PER_WINDOW, SampleWindow, parse_characteristic};

pub use connect::{ConnectOutcome, PersistentConnector};
pub use error::{ConnectionFailureReason, DeviceNotFoundReason, Error, ErrorKind, Result};
pub use merge::{OverlapMerge, WindowMerge};
pub use registry::{ConnectionRegistry, ConnectionStatus, ManagedConnection};
pub use scan::{DiscoveredDevice, NameMatch, find_by_name, rank_by_signal, scan};
pub use streaming::{
    AggregationState, MIN_POLL_INTERVAL, SampleBatch, SampleReading, SampleStream, StreamOptions,
    read_window,
};
pub use traits::{RadioAdapter, RadioSession};
