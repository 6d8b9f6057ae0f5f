pub mod store;
pub mod types;

pub use store::{InMemoryStore, Store};
pub use types::{
    ApiKey, AuthToken, AuthTokenId, Channel, ChannelId, ChannelType, CooldownState, HealthStats,
    KeyStrategy, LogEntry, ModelEntry, TokenStatsUpdate,
};
