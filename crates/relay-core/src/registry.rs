//! Active-request registry (spec §4.12).
//!
//! A concurrent map the admin surface reads; registered on admission,
//! unregistered on completion. Grounded in the teacher's `EventHub` +
//! `AppState` snapshot style (`gproxy-provider-core/src/events/hub.rs`,
//! `gproxy-core/src/state/mod.rs`) but backed by a plain `DashMap`-less
//! `std::sync::Mutex<HashMap>` since entries here are mutated far more often
//! than they're bulk-read.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use relay_store::ChannelId;

#[derive(Debug, Clone)]
pub struct ActiveRequest {
    pub start_time: Instant,
    pub model: String,
    pub client_ip: String,
    pub streaming: bool,
    pub channel_id: Option<ChannelId>,
    pub key_index: Option<u32>,
    pub bytes_received: u64,
    pub client_first_byte_time: Option<Instant>,
}

#[derive(Default)]
pub struct ActiveRequestRegistry {
    inner: Mutex<HashMap<String, ActiveRequest>>,
}

impl ActiveRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, request_id: String, entry: ActiveRequest) {
        self.inner.lock().unwrap().insert(request_id, entry);
    }

    pub fn unregister(&self, request_id: &str) {
        self.inner.lock().unwrap().remove(request_id);
    }

    pub fn set_channel(&self, request_id: &str, channel_id: ChannelId) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(request_id) {
            entry.channel_id = Some(channel_id);
        }
    }

    pub fn set_key_index(&self, request_id: &str, key_index: u32) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(request_id) {
            entry.key_index = Some(key_index);
        }
    }

    pub fn get(&self, request_id: &str) -> Option<ActiveRequest> {
        self.inner.lock().unwrap().get(request_id).cloned()
    }

    pub fn record_first_byte(&self, request_id: &str) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(request_id) {
            entry.client_first_byte_time.get_or_insert_with(Instant::now);
        }
    }

    pub fn add_bytes(&self, request_id: &str, n: u64) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(request_id) {
            entry.bytes_received += n;
        }
    }

    pub fn snapshot(&self) -> Vec<(String, ActiveRequest)> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ActiveRequest {
        ActiveRequest {
            start_time: Instant::now(),
            model: "gpt-4".to_string(),
            client_ip: "127.0.0.1".to_string(),
            streaming: false,
            channel_id: None,
            key_index: None,
            bytes_received: 0,
            client_first_byte_time: None,
        }
    }

    #[test]
    fn register_then_unregister_roundtrips() {
        let registry = ActiveRequestRegistry::new();
        registry.register("req-1".to_string(), sample());
        assert_eq!(registry.len(), 1);
        registry.unregister("req-1");
        assert!(registry.is_empty());
    }

    #[test]
    fn set_channel_updates_existing_entry_only() {
        let registry = ActiveRequestRegistry::new();
        registry.register("req-1".to_string(), sample());
        registry.set_channel("req-1", 7);
        registry.set_channel("missing", 9);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot[0].1.channel_id, Some(7));
    }

    #[test]
    fn get_reflects_key_index_after_set() {
        let registry = ActiveRequestRegistry::new();
        registry.register("req-1".to_string(), sample());
        registry.set_key_index("req-1", 2);
        assert_eq!(registry.get("req-1").unwrap().key_index, Some(2));
        assert!(registry.get("missing").is_none());
    }
}
