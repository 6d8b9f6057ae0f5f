use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::types::{
    ApiKey, AuthToken, AuthTokenId, Channel, ChannelId, CooldownState, HealthStats, LogEntry,
    TokenStatsUpdate,
};

/// Persistence boundary the proxy path reads/writes through.
///
/// The admin CRUD surface and the durable relational/KV backend live outside
/// this workspace; this trait is the interface the core crate is grounded
/// against. [`InMemoryStore`] is the only implementation shipped here.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_channels(&self) -> Vec<Channel>;
    async fn list_keys(&self, channel_id: ChannelId) -> Vec<ApiKey>;

    async fn channel_cooldown(&self, channel_id: ChannelId) -> Option<CooldownState>;
    async fn set_channel_cooldown(&self, channel_id: ChannelId, state: CooldownState);
    async fn clear_channel_cooldown(&self, channel_id: ChannelId);

    async fn key_cooldown(&self, channel_id: ChannelId, key_index: u32) -> Option<CooldownState>;
    async fn set_key_cooldown(&self, channel_id: ChannelId, key_index: u32, state: CooldownState);
    async fn clear_key_cooldown(&self, channel_id: ChannelId, key_index: u32);

    /// Fetch-and-increment a per-channel round-robin counter. Reset on channel removal.
    async fn next_round_robin(&self, channel_id: ChannelId) -> u64;
    async fn reset_round_robin(&self, channel_id: ChannelId);

    async fn health_stats(&self, channel_id: ChannelId, window: Duration) -> HealthStats;
    async fn record_outcome(&self, channel_id: ChannelId, success: bool);

    async fn today_cost_usd(&self, channel_id: ChannelId) -> f64;
    async fn add_cost(&self, channel_id: ChannelId, usd: f64);

    async fn record_token_stats(&self, update: TokenStatsUpdate);
    async fn record_log(&self, entry: LogEntry);

    async fn lookup_auth_token(&self, hash: &str) -> Option<AuthToken>;
    async fn add_token_usage(&self, token_id: AuthTokenId, micro_usd: u64);
}

#[derive(Default)]
struct Inner {
    channels: HashMap<ChannelId, Channel>,
    keys: HashMap<ChannelId, Vec<ApiKey>>,
    channel_cooldowns: HashMap<ChannelId, CooldownState>,
    key_cooldowns: HashMap<(ChannelId, u32), CooldownState>,
    round_robin: HashMap<ChannelId, u64>,
    outcomes: HashMap<ChannelId, VecDeque<(Instant, bool)>>,
    daily_cost: HashMap<ChannelId, f64>,
    token_stats: Vec<TokenStatsUpdate>,
    logs: Vec<LogEntry>,
    auth_tokens: HashMap<String, AuthToken>,
}

/// Simple in-memory store used for local/dev runs and all tests.
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn insert_channel(&self, channel: Channel) {
        let mut guard = self.inner.lock().unwrap();
        guard.channels.insert(channel.id, channel);
    }

    pub fn insert_key(&self, key: ApiKey) {
        let mut guard = self.inner.lock().unwrap();
        guard.keys.entry(key.channel_id).or_default().push(key);
    }

    pub fn remove_channel(&self, channel_id: ChannelId) {
        let mut guard = self.inner.lock().unwrap();
        guard.channels.remove(&channel_id);
        guard.keys.remove(&channel_id);
        guard.channel_cooldowns.remove(&channel_id);
        guard.key_cooldowns.retain(|(id, _), _| *id != channel_id);
        guard.round_robin.remove(&channel_id);
    }

    pub fn insert_auth_token(&self, token: AuthToken) {
        let mut guard = self.inner.lock().unwrap();
        guard.auth_tokens.insert(token.hash.clone(), token);
    }

    pub fn token_stats_snapshot(&self) -> Vec<TokenStatsUpdate> {
        self.inner.lock().unwrap().token_stats.clone()
    }

    pub fn logs_snapshot(&self) -> Vec<LogEntry> {
        self.inner.lock().unwrap().logs.clone()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn list_channels(&self) -> Vec<Channel> {
        self.inner.lock().unwrap().channels.values().cloned().collect()
    }

    async fn list_keys(&self, channel_id: ChannelId) -> Vec<ApiKey> {
        self.inner
            .lock()
            .unwrap()
            .keys
            .get(&channel_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn channel_cooldown(&self, channel_id: ChannelId) -> Option<CooldownState> {
        self.inner.lock().unwrap().channel_cooldowns.get(&channel_id).copied()
    }

    async fn set_channel_cooldown(&self, channel_id: ChannelId, state: CooldownState) {
        self.inner
            .lock()
            .unwrap()
            .channel_cooldowns
            .insert(channel_id, state);
    }

    async fn clear_channel_cooldown(&self, channel_id: ChannelId) {
        self.inner.lock().unwrap().channel_cooldowns.remove(&channel_id);
    }

    async fn key_cooldown(&self, channel_id: ChannelId, key_index: u32) -> Option<CooldownState> {
        self.inner
            .lock()
            .unwrap()
            .key_cooldowns
            .get(&(channel_id, key_index))
            .copied()
    }

    async fn set_key_cooldown(&self, channel_id: ChannelId, key_index: u32, state: CooldownState) {
        self.inner
            .lock()
            .unwrap()
            .key_cooldowns
            .insert((channel_id, key_index), state);
    }

    async fn clear_key_cooldown(&self, channel_id: ChannelId, key_index: u32) {
        self.inner
            .lock()
            .unwrap()
            .key_cooldowns
            .remove(&(channel_id, key_index));
    }

    async fn next_round_robin(&self, channel_id: ChannelId) -> u64 {
        let mut guard = self.inner.lock().unwrap();
        let counter = guard.round_robin.entry(channel_id).or_insert(0);
        let value = *counter;
        *counter = counter.wrapping_add(1);
        value
    }

    async fn reset_round_robin(&self, channel_id: ChannelId) {
        self.inner.lock().unwrap().round_robin.remove(&channel_id);
    }

    async fn health_stats(&self, channel_id: ChannelId, window: Duration) -> HealthStats {
        let guard = self.inner.lock().unwrap();
        let Some(deque) = guard.outcomes.get(&channel_id) else {
            return HealthStats::UNKNOWN;
        };
        let now = Instant::now();
        let mut successes = 0u64;
        let mut total = 0u64;
        for (at, success) in deque.iter().rev() {
            if now.saturating_duration_since(*at) > window {
                break;
            }
            total += 1;
            if *success {
                successes += 1;
            }
        }
        if total == 0 {
            return HealthStats::UNKNOWN;
        }
        HealthStats {
            success_rate: successes as f64 / total as f64,
            sample_count: total,
        }
    }

    async fn record_outcome(&self, channel_id: ChannelId, success: bool) {
        let mut guard = self.inner.lock().unwrap();
        let deque = guard.outcomes.entry(channel_id).or_default();
        deque.push_back((Instant::now(), success));
        while deque.len() > 10_000 {
            deque.pop_front();
        }
    }

    async fn today_cost_usd(&self, channel_id: ChannelId) -> f64 {
        *self.inner.lock().unwrap().daily_cost.get(&channel_id).unwrap_or(&0.0)
    }

    async fn add_cost(&self, channel_id: ChannelId, usd: f64) {
        let mut guard = self.inner.lock().unwrap();
        *guard.daily_cost.entry(channel_id).or_insert(0.0) += usd;
    }

    async fn record_token_stats(&self, update: TokenStatsUpdate) {
        self.inner.lock().unwrap().token_stats.push(update);
    }

    async fn record_log(&self, entry: LogEntry) {
        self.inner.lock().unwrap().logs.push(entry);
    }

    async fn lookup_auth_token(&self, hash: &str) -> Option<AuthToken> {
        self.inner.lock().unwrap().auth_tokens.get(hash).cloned()
    }

    async fn add_token_usage(&self, token_id: AuthTokenId, micro_usd: u64) {
        let mut guard = self.inner.lock().unwrap();
        for token in guard.auth_tokens.values_mut() {
            if token.id == token_id {
                token.used_micro_usd += micro_usd;
                break;
            }
        }
    }
}
