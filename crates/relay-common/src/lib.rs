//! Ambient configuration types shared by the relay binary and core crate.
//!
//! Mirrors the teacher's merge precedence: CLI > ENV > stored settings row,
//! then the merged result is held as a single hot-reloadable snapshot.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config field: {0}")]
    MissingField(&'static str),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Process-level configuration: bind address and bearer-token admin access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// SHA-256 hash of the admin bearer token (plaintext never stored).
    pub admin_key_hash: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8788,
            admin_key_hash: String::new(),
        }
    }
}

/// The hot-reloadable settings table of spec §6.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub cooldown_fallback_enabled: bool,
    pub strip_date_suffix_enabled: bool,
    pub fuzzy_match_enabled: bool,
    /// Weight applied to `(1 - success_rate)` in the effective-priority formula.
    pub health_penalty_weight: f64,
    /// Sample count at which confidence saturates to 1.0.
    pub health_min_confident_sample: u32,
    pub health_window_minutes: u32,
    pub health_update_interval_seconds: u64,
    pub log_retention_days: u32,
    pub log_buffer_size: usize,
    pub token_stats_buffer_size: usize,
    pub max_body_bytes: usize,
    pub first_byte_timeout: Duration,
    pub max_concurrency: usize,
    pub max_key_retries: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cooldown_fallback_enabled: true,
            strip_date_suffix_enabled: true,
            fuzzy_match_enabled: true,
            health_penalty_weight: 10.0,
            health_min_confident_sample: 20,
            health_window_minutes: 60,
            health_update_interval_seconds: 30,
            log_retention_days: 30,
            log_buffer_size: 1024,
            token_stats_buffer_size: 1024,
            max_body_bytes: 2 * 1024 * 1024,
            first_byte_timeout: Duration::from_secs(120),
            max_concurrency: 256,
            max_key_retries: 8,
        }
    }
}

/// Optional overlay used to merge CLI/ENV values on top of stored settings.
#[derive(Debug, Clone, Default)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key_hash: Option<String>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_key_hash.is_some() {
            self.admin_key_hash = other.admin_key_hash;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, ConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8788),
            admin_key_hash: self
                .admin_key_hash
                .ok_or(ConfigError::MissingField("admin_key_hash"))?,
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
        }
    }
}

pub fn parse_duration_env(raw: &str, field: &'static str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let (num, unit) = raw.split_at(
        raw.find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(raw.len()),
    );
    let value: f64 = num
        .parse()
        .map_err(|_| ConfigError::InvalidValue { field, value: raw.to_string() })?;
    let seconds = match unit {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => {
            return Err(ConfigError::InvalidValue {
                field,
                value: raw.to_string(),
            });
        }
    };
    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_seconds() {
        assert_eq!(
            parse_duration_env("30", "x").unwrap(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn parses_suffixed_duration() {
        assert_eq!(
            parse_duration_env("120s", "x").unwrap(),
            Duration::from_secs(120)
        );
        assert_eq!(
            parse_duration_env("2m", "x").unwrap(),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration_env("abc", "x").is_err());
    }
}
