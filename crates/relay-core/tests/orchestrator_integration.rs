//! End-to-end orchestrator scenarios against `InMemoryStore`, placed as a
//! `tests/` integration suite rather than a `#[cfg(test)]` module since these
//! exercise cross-module behavior (model redirect, budget gate) rather than
//! one unit, mirroring the teacher's own split between in-module unit tests
//! and `gproxy-provider-core/tests/credential_pool.rs`-style integration
//! tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use relay_core::classify::ErrorSignal;
use relay_core::forwarder::{Forward, ForwardBody, ForwardRequest, ForwardResult};
use relay_core::orchestrator::{handle, hash_bearer, IncomingRequest};
use relay_core::state::ProxyState;
use relay_store::{ApiKey, AuthToken, Channel, ChannelType, InMemoryStore, KeyStrategy, ModelEntry, Store};

struct ScriptedForwarder {
    responses: Vec<Result<(u16, Vec<u8>), ErrorSignal>>,
    calls: AtomicUsize,
    seen_bodies: Mutex<Vec<Bytes>>,
}

impl ScriptedForwarder {
    fn new(responses: Vec<Result<(u16, Vec<u8>), ErrorSignal>>) -> Self {
        Self {
            responses,
            calls: AtomicUsize::new(0),
            seen_bodies: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Forward for ScriptedForwarder {
    async fn forward(
        &self,
        _channel: &Channel,
        _key_secret: &str,
        req: ForwardRequest,
        _default_first_byte_timeout: Duration,
    ) -> Result<ForwardResult, ErrorSignal> {
        self.seen_bodies.lock().unwrap().push(req.body.clone());
        let idx = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.responses[idx.min(self.responses.len() - 1)] {
            Ok((status, body)) => Ok(ForwardResult {
                status: *status,
                headers: vec![],
                body: ForwardBody::Buffered(Bytes::from(body.clone())),
            }),
            Err(signal) => Err(*signal),
        }
    }
}

fn channel_with_redirect(id: i64, model: &str, redirect: Option<&str>) -> Channel {
    Channel {
        id,
        name: format!("ch{id}"),
        base_url: "https://example.test".into(),
        channel_type: ChannelType::OpenAI,
        priority: 0,
        enabled: true,
        models: vec![ModelEntry {
            model: model.to_string(),
            redirect_model: redirect.map(str::to_string),
        }],
        daily_cost_limit_usd: 0.0,
    }
}

fn request(model: &str) -> IncomingRequest {
    IncomingRequest {
        trace_id: "t-1".to_string(),
        client_ip: "127.0.0.1".to_string(),
        bearer_token: Some("test-token".to_string()),
        model: model.to_string(),
        channel_type: None,
        method: wreq::Method::POST,
        path_and_query: "/v1/chat/completions".to_string(),
        headers: vec![],
        body: Bytes::from_static(br#"{"model":"gpt-4-legacy","messages":[]}"#),
        want_stream: false,
        timeout_override: None,
    }
}

async fn state_with(forwarder: Arc<ScriptedForwarder>, token: AuthToken) -> (ProxyState, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    store.insert_auth_token(token);
    let (handle, _join) = relay_core::token_stats::spawn(store.clone(), 8);
    let state = ProxyState::new(store.clone(), relay_common::Settings::default(), forwarder, handle);
    (state, store)
}

fn default_token() -> AuthToken {
    AuthToken {
        id: 1,
        hash: hash_bearer("test-token"),
        model_allowlist: None,
        limit_micro_usd: 0,
        used_micro_usd: 0,
    }
}

#[tokio::test]
async fn model_redirect_rewrites_body_before_forwarding() {
    let forwarder = Arc::new(ScriptedForwarder::new(vec![Ok((200, b"{}".to_vec()))]));
    let (state, store) = state_with(forwarder.clone(), default_token()).await;
    store.insert_channel(channel_with_redirect(1, "gpt-4-legacy", Some("gpt-4-turbo")));
    store.insert_key(ApiKey {
        channel_id: 1,
        key_index: 0,
        secret: "sk-good".to_string(),
        strategy: KeyStrategy::Sequential,
    });

    let resp = handle(&state, request("gpt-4-legacy")).await.unwrap();
    assert_eq!(resp.status, 200);

    let seen = forwarder.seen_bodies.lock().unwrap();
    let sent: serde_json::Value = serde_json::from_slice(&seen[0]).unwrap();
    assert_eq!(sent["model"], "gpt-4-turbo");
}

#[tokio::test]
async fn budget_exceeded_returns_429() {
    let forwarder = Arc::new(ScriptedForwarder::new(vec![Ok((200, b"{}".to_vec()))]));
    let mut token = default_token();
    token.limit_micro_usd = 100;
    token.used_micro_usd = 200;
    let (state, store) = state_with(forwarder, token).await;
    store.insert_channel(channel_with_redirect(1, "gpt-4", None));
    store.insert_key(ApiKey {
        channel_id: 1,
        key_index: 0,
        secret: "sk-good".to_string(),
        strategy: KeyStrategy::Sequential,
    });

    let err = handle(&state, request("gpt-4")).await.unwrap_err();
    assert_eq!(err.status.as_u16(), 429);
}

#[tokio::test]
async fn cooldown_fallback_disabled_yields_503_when_only_channel_is_cooling() {
    let forwarder = Arc::new(ScriptedForwarder::new(vec![Ok((401, b"{}".to_vec()))]));
    let (state, store) = state_with(forwarder.clone(), default_token()).await;
    store.insert_channel(channel_with_redirect(1, "gpt-4", None));
    store.insert_key(ApiKey {
        channel_id: 1,
        key_index: 0,
        secret: "sk-bad".to_string(),
        strategy: KeyStrategy::Sequential,
    });

    // First call puts the sole channel into cooldown via its sole key's 401.
    let _ = handle(&state, request("gpt-4")).await;
    assert!(store.channel_cooldown(1).await.is_some());

    let mut settings = relay_common::Settings::default();
    settings.cooldown_fallback_enabled = false;
    state.apply_settings(settings);

    let err = handle(&state, request("gpt-4")).await.unwrap_err();
    assert_eq!(err.status.as_u16(), 503);
}
