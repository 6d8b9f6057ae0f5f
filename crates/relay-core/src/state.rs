//! Shared proxy state (ambient, spec §2.13/§4.16).
//!
//! Ties the store, hot-reloadable settings snapshot, health cache, forwarder,
//! admission semaphore, active-request registry and token-stats worker
//! together behind one handle the router hands to each request. Grounded in
//! the teacher's `AppState` (`gproxy-core/src/state/mod.rs`): settings are an
//! `ArcSwap` snapshot so config reload never blocks request-path readers.

use std::sync::Arc;

use arc_swap::ArcSwap;
use relay_common::Settings;
use relay_store::Store;
use tokio::sync::Semaphore;

use crate::cost_gate::{CostEstimator, ZeroCostEstimator};
use crate::forwarder::Forward;
use crate::health::HealthCache;
use crate::registry::ActiveRequestRegistry;
use crate::token_stats::TokenStatsHandle;

pub struct ProxyState {
    pub store: Arc<dyn Store>,
    pub settings: ArcSwap<Settings>,
    pub health: Arc<HealthCache>,
    pub forwarder: Arc<dyn Forward>,
    pub admission: Arc<Semaphore>,
    pub registry: Arc<ActiveRequestRegistry>,
    pub token_stats: TokenStatsHandle,
    pub cost_estimator: Arc<dyn CostEstimator>,
}

impl ProxyState {
    pub fn new(
        store: Arc<dyn Store>,
        settings: Settings,
        forwarder: Arc<dyn Forward>,
        token_stats: TokenStatsHandle,
    ) -> Self {
        let admission = Arc::new(Semaphore::new(settings.max_concurrency));
        Self {
            store,
            settings: ArcSwap::from_pointee(settings),
            health: Arc::new(HealthCache::new()),
            forwarder,
            admission,
            registry: Arc::new(ActiveRequestRegistry::new()),
            token_stats,
            cost_estimator: Arc::new(ZeroCostEstimator),
        }
    }

    pub fn with_cost_estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.cost_estimator = estimator;
        self
    }

    pub fn current_settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    /// Apply an admin-produced settings patch. Narrow entry point mirroring
    /// the teacher's `apply_*` methods — this crate doesn't implement the
    /// admin HTTP surface that would call it.
    pub fn apply_settings(&self, new_settings: Settings) {
        self.settings.store(Arc::new(new_settings));
    }
}
