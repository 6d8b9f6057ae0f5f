//! Health cache (spec §4.6).
//!
//! Background refresher feeding the candidate selector's effective-priority
//! formula. Readers never block: the map is an `ArcSwap` snapshot, swapped
//! wholesale by the single refresher task — the same copy-on-write shape the
//! teacher uses for its config/provider snapshots
//! (`gproxy-core/src/state/mod.rs`), applied here to health aggregates
//! instead of config.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use relay_store::{ChannelId, HealthStats, Store};

pub struct HealthCache {
    snapshot: ArcSwap<HashMap<ChannelId, HealthStats>>,
}

impl Default for HealthCache {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthCache {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Unknown channel → `HealthStats::UNKNOWN` (successRate=1.0, sampleCount=0).
    pub fn get(&self, channel_id: ChannelId) -> HealthStats {
        self.snapshot
            .load()
            .get(&channel_id)
            .copied()
            .unwrap_or(HealthStats::UNKNOWN)
    }

    async fn refresh_once(&self, store: &dyn Store, window: Duration) {
        let channels = store.list_channels().await;
        let mut map = HashMap::with_capacity(channels.len());
        for channel in channels {
            map.insert(channel.id, store.health_stats(channel.id, window).await);
        }
        self.snapshot.store(Arc::new(map));
    }

    /// Spawn the periodic refresher. Returns its `JoinHandle` so callers can
    /// await it during graceful shutdown.
    pub fn spawn_refresher(
        self: Arc<Self>,
        store: Arc<dyn Store>,
        window: Duration,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.refresh_once(store.as_ref(), window).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::InMemoryStore;

    #[test]
    fn unknown_channel_defaults_to_full_confidence() {
        let cache = HealthCache::new();
        let stats = cache.get(99);
        assert_eq!(stats, HealthStats::UNKNOWN);
    }

    #[tokio::test]
    async fn refresh_populates_snapshot_from_store() {
        let store = InMemoryStore::new();
        store.record_outcome(1, true).await;
        store.record_outcome(1, true).await;
        store.record_outcome(1, false).await;
        store.insert_channel(relay_store::Channel {
            id: 1,
            name: "ch".into(),
            base_url: "https://example.test".into(),
            channel_type: relay_store::ChannelType::OpenAI,
            priority: 0,
            enabled: true,
            models: vec![],
            daily_cost_limit_usd: 0.0,
        });
        let cache = HealthCache::new();
        cache.refresh_once(&store, Duration::from_secs(3600)).await;
        let stats = cache.get(1);
        assert_eq!(stats.sample_count, 3);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }
}
