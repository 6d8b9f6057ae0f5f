//! Process bootstrap: parse CLI/env, build the in-memory store, forwarder,
//! and background workers, and assemble [`relay_core::ProxyState`]. Grounded
//! in the teacher's `bootstrap()` / `Bootstrap` shape
//! (`gproxy-core/src/bootstrap/mod.rs`), collapsed from a DB-backed
//! multi-step merge (DB row + CLI + ENV) to CLI/ENV-over-defaults, matching
//! this workspace's `InMemoryStore`-only persistence decision (see DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use relay_common::{GlobalConfig, GlobalConfigPatch, Settings};
use relay_core::forwarder::UpstreamForwarder;
use relay_core::orchestrator::hash_bearer;
use relay_core::state::ProxyState;
use relay_store::{InMemoryStore, Store};
use tokio::task::JoinHandle;

use crate::cli::CliArgs;

const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Bootstrap {
    pub global: GlobalConfig,
    pub state: Arc<ProxyState>,
    pub health_join: JoinHandle<()>,
    pub token_stats_join: JoinHandle<()>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    bootstrap(CliArgs::parse()).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let admin_key_hash = match args.admin_key.as_deref() {
        Some(key) => hash_bearer(key),
        None => {
            let generated = uuid::Uuid::new_v4().to_string();
            eprintln!("generated admin key: {generated}");
            hash_bearer(&generated)
        }
    };

    let patch = GlobalConfigPatch {
        host: args.host.clone(),
        port: args.port,
        admin_key_hash: Some(admin_key_hash),
    };
    let global = patch.into_config().context("finalize global config")?;

    let mut settings = Settings::default();
    if let Some(max_body_bytes) = args.max_body_bytes {
        settings.max_body_bytes = max_body_bytes;
    }
    if let Some(raw) = args.first_byte_timeout.as_deref() {
        settings.first_byte_timeout =
            relay_common::parse_duration_env(raw, "CCLOAD_FIRST_BYTE_TIMEOUT").context("parse CCLOAD_FIRST_BYTE_TIMEOUT")?;
    }

    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let (token_stats, token_stats_join) = relay_core::token_stats::spawn(store.clone(), settings.token_stats_buffer_size);
    let forwarder = Arc::new(UpstreamForwarder::new(STREAM_IDLE_TIMEOUT).context("build upstream client")?);

    let window = Duration::from_secs(u64::from(settings.health_window_minutes) * 60);
    let refresh_interval = Duration::from_secs(settings.health_update_interval_seconds);

    let state = Arc::new(ProxyState::new(store.clone(), settings, forwarder, token_stats));
    let health_join = state.health.clone().spawn_refresher(store, window, refresh_interval);

    Ok(Bootstrap {
        global,
        state,
        health_join,
        token_stats_join,
    })
}
