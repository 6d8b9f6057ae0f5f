use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub type ChannelId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    Anthropic,
    OpenAI,
    Gemini,
    Codex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub model: String,
    pub redirect_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStrategy {
    Sequential,
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    pub base_url: String,
    pub channel_type: ChannelType,
    pub priority: i32,
    pub enabled: bool,
    pub models: Vec<ModelEntry>,
    /// 0 means unlimited.
    pub daily_cost_limit_usd: f64,
}

impl Channel {
    pub fn model_entry(&self, model: &str) -> Option<&ModelEntry> {
        self.models.iter().find(|m| m.model == model)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub channel_id: ChannelId,
    pub key_index: u32,
    pub secret: String,
    pub strategy: KeyStrategy,
}

/// Non-zero cooldown record. Absence (`None` in `Store` lookups) means "not cooled".
#[derive(Debug, Clone, Copy)]
pub struct CooldownState {
    pub until: Instant,
    pub consecutive_failures: u32,
}

impl CooldownState {
    pub fn is_active(&self, now: Instant) -> bool {
        self.until > now
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthStats {
    pub success_rate: f64,
    pub sample_count: u64,
}

impl HealthStats {
    pub const UNKNOWN: HealthStats = HealthStats {
        success_rate: 1.0,
        sample_count: 0,
    };
}

pub type AuthTokenId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthToken {
    pub id: AuthTokenId,
    /// SHA-256 hex digest of the bearer string; plaintext is never stored.
    pub hash: String,
    /// Case-insensitive match against the requested model; `None` = any model.
    pub model_allowlist: Option<Vec<String>>,
    /// 0 means unlimited.
    pub limit_micro_usd: u64,
    pub used_micro_usd: u64,
}

impl AuthToken {
    pub fn allows_model(&self, model: &str) -> bool {
        match &self.model_allowlist {
            None => true,
            Some(list) => list.iter().any(|m| m.eq_ignore_ascii_case(model)),
        }
    }

    pub fn has_budget_for(&self, additional_micro_usd: u64) -> bool {
        self.limit_micro_usd == 0 || self.used_micro_usd + additional_micro_usd <= self.limit_micro_usd
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenStatsUpdate {
    pub token_id: AuthTokenId,
    pub channel_id: ChannelId,
    pub key_index: u32,
    pub model: String,
    pub success: bool,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_micro_usd: u64,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub trace_id: String,
    pub model: String,
    pub channel_id: Option<ChannelId>,
    pub key_index: Option<u32>,
    pub status: u16,
    pub elapsed_ms: u64,
    pub is_stream: bool,
    pub is_client_canceled: bool,
}
