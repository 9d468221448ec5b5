//! Application state shared across handlers.
//!
//! One [`ConnectionRegistry`] is built at startup and shared by every
//! handler and WebSocket session. It is torn down with
//! [`AppState::shutdown`] once the server stops accepting requests, which
//! disconnects every tracked device.

use std::sync::Arc;

use blelink_core::{ConnectionRegistry, OverlapMerge, PersistentConnector, RadioAdapter, WindowMerge};
use tokio::sync::RwLock;
use tracing::info;

use crate::config::Config;

/// Shared application state.
pub struct AppState {
    /// Persistent connections, keyed by address.
    pub registry: Arc<ConnectionRegistry>,
    /// Name-based connect orchestration over `registry`.
    pub connector: PersistentConnector,
    /// Merge strategy for every streaming session.
    pub merge: Arc<dyn WindowMerge>,
    /// Configuration (RwLock for runtime updates).
    pub config: RwLock<Config>,
}

impl AppState {
    /// Create state around `adapter` with the default [`OverlapMerge`].
    pub fn new(adapter: Arc<dyn RadioAdapter>, config: Config) -> Arc<Self> {
        Self::with_merge(adapter, Arc::new(OverlapMerge), config)
    }

    /// Create state with a custom merge strategy.
    pub fn with_merge(
        adapter: Arc<dyn RadioAdapter>,
        merge: Arc<dyn WindowMerge>,
        config: Config,
    ) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(adapter));
        Arc::new(Self {
            connector: PersistentConnector::new(Arc::clone(&registry)),
            registry,
            merge,
            config: RwLock::new(config),
        })
    }

    /// Disconnect every tracked device.
    pub async fn shutdown(&self) {
        let results = self.registry.disconnect_all().await;
        let released = results.values().filter(|was_connected| **was_connected).count();
        info!(
            "Released {} connection(s), {} were live",
            results.len(),
            released
        );
    }
}
