//! Request orchestrator (spec §4.8): the top-level request lifecycle.
//!
//! Ties candidate selection, key selection, forwarding, classification and
//! cooldown handling into the outer/inner retry loop. Grounded in the
//! teacher's `ProxyEngine::handle` dispatch shape
//! (`gproxy-core/src/proxy_engine/mod.rs`), rewritten around this system's
//! channel/key retry semantics instead of the teacher's single-credential
//! provider dispatch.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use bytes::Bytes;
use relay_store::{AuthToken, Channel, ChannelId, ChannelType, LogEntry, Store, TokenStatsUpdate};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::candidate;
use crate::classify::{self, ErrorSignal};
use crate::cooldown;
use crate::cost_gate::{self, GateError};
use crate::error::ProxyError;
use crate::forwarder::{ForwardBody, ForwardRequest, ForwardResult};
use crate::key_selector::{self, SelectError};
use crate::registry::ActiveRequest;
use crate::sse::{self, UsageTokens};
use crate::state::ProxyState;

pub struct IncomingRequest {
    pub trace_id: String,
    pub client_ip: String,
    /// Raw bearer string (without the `Bearer ` prefix), if one was sent.
    pub bearer_token: Option<String>,
    pub model: String,
    pub channel_type: Option<ChannelType>,
    pub method: wreq::Method,
    pub path_and_query: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub want_stream: bool,
    pub timeout_override: Option<Duration>,
}

pub enum OrchestratorBody {
    Buffered(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

pub struct OrchestratorResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: OrchestratorBody,
}

/// Bound applied to the detached log write, mirroring `cooldown::STATE_FIXUP_TIMEOUT`.
const LOG_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

fn build_log_entry(
    req: &IncomingRequest,
    request_start: Instant,
    channel_id: Option<ChannelId>,
    key_index: Option<u32>,
    status: u16,
    is_client_canceled: bool,
) -> LogEntry {
    LogEntry {
        trace_id: req.trace_id.clone(),
        model: req.model.clone(),
        channel_id,
        key_index,
        status,
        elapsed_ms: request_start.elapsed().as_millis() as u64,
        is_stream: req.want_stream,
        is_client_canceled,
    }
}

/// Write the log entry with a context detached from the request, bounded to
/// [`LOG_WRITE_TIMEOUT`] — same rationale as `cooldown`'s state-fixup writes.
async fn emit_log(state: &ProxyState, entry: LogEntry) {
    let _ = tokio::time::timeout(LOG_WRITE_TIMEOUT, state.store.record_log(entry)).await;
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

pub fn hash_bearer(token: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(token.as_bytes());
    hex_encode(&digest)
}

fn apply_model_redirect(body: &Bytes, actual_model: &str) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
        return body.clone();
    };
    let Some(obj) = value.as_object_mut() else {
        return body.clone();
    };
    obj.insert("model".to_string(), Value::String(actual_model.to_string()));
    match serde_json::to_vec(&value) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => body.clone(),
    }
}

enum ChannelOutcome {
    Success {
        key_index: u32,
        result: ForwardResult,
        sse_usage: UsageTokens,
    },
    ReturnClient(ProxyError),
    AllKeysUnavailable,
    RetryChannel(u16),
}

async fn try_channel_with_keys(
    state: &ProxyState,
    channel: &Channel,
    req: &IncomingRequest,
    max_key_retries: usize,
    default_first_byte_timeout: Duration,
) -> ChannelOutcome {
    let keys = state.store.list_keys(channel.id).await;
    let key_count = keys.len().max(1);
    let mut excluded = HashSet::new();

    let actual_model = channel
        .model_entry(&req.model)
        .and_then(|m| m.redirect_model.clone())
        .unwrap_or_else(|| req.model.clone());
    let body = if actual_model != req.model {
        apply_model_redirect(&req.body, &actual_model)
    } else {
        req.body.clone()
    };

    for _ in 0..max_key_retries.max(1) {
        let selected = match key_selector::select(state.store.as_ref(), channel.id, &keys, &excluded).await {
            Ok(s) => s,
            Err(SelectError::NoKeys) | Err(SelectError::AllCooledOrTried) => {
                return ChannelOutcome::AllKeysUnavailable;
            }
        };

        let fwd_req = ForwardRequest {
            method: req.method.clone(),
            path_and_query: req.path_and_query.clone(),
            headers: req.headers.clone(),
            body: body.clone(),
            want_stream: req.want_stream,
            timeout_override: req.timeout_override,
        };

        let outcome = state
            .forwarder
            .forward(channel, &selected.secret, fwd_req, default_first_byte_timeout)
            .await;

        let (classification, result, sse_usage) = match outcome {
            Err(signal) => (classify::classify(Some(signal), None, key_count), None, UsageTokens::default()),
            Ok(result) => {
                let status = result.status;
                // Non-streaming bodies carry usage inline; streaming bodies
                // are metered by the caller once the SSE pump finishes, so
                // usage here is only populated for the buffered case.
                let usage = match &result.body {
                    ForwardBody::Buffered(bytes) => sse::extract_usage_from_json(bytes),
                    ForwardBody::Stream(_) => UsageTokens::default(),
                };
                (classify::classify(None, Some(status), key_count), Some(result), usage)
            }
        };

        state.store.record_outcome(channel.id, classification.level.is_none()).await;

        if classification.level.is_none() {
            let result = result.expect("success classification always carries a result");
            return ChannelOutcome::Success {
                key_index: selected.key_index,
                result,
                sse_usage,
            };
        }

        let retry_after = result
            .as_ref()
            .and_then(|r| r.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("retry-after")))
            .and_then(|(_, v)| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        let status = classification.client_status;
        let action = cooldown::handle_error(
            state.store.as_ref(),
            channel.id,
            Some(selected.key_index),
            status,
            &classification,
            retry_after,
        )
        .await;

        match action {
            cooldown::Action::ReturnClient => {
                let body = result.map(|r| match r.body {
                    ForwardBody::Buffered(b) => b,
                    ForwardBody::Stream(_) => Bytes::new(),
                });
                return ChannelOutcome::ReturnClient(ProxyError::new(
                    http::StatusCode::from_u16(status).unwrap_or(http::StatusCode::BAD_GATEWAY),
                    body.unwrap_or_default(),
                ));
            }
            cooldown::Action::RetryKey => {
                excluded.insert(selected.key_index);
                continue;
            }
            cooldown::Action::RetryChannel => {
                return ChannelOutcome::RetryChannel(status);
            }
        }
    }

    ChannelOutcome::AllKeysUnavailable
}

/// Resolve and validate the caller's auth token. `None` bearer or unknown
/// hash is surfaced as a 401 by the caller.
async fn resolve_auth_token(state: &ProxyState, req: &IncomingRequest) -> Option<AuthToken> {
    let bearer = req.bearer_token.as_ref()?;
    let hash = hash_bearer(bearer);
    state.store.lookup_auth_token(&hash).await
}

pub async fn handle(state: &ProxyState, req: IncomingRequest) -> Result<OrchestratorResponse, ProxyError> {
    let _permit = state
        .admission
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ProxyError::service_unavailable("admission semaphore closed"))?;

    state.registry.register(
        req.trace_id.clone(),
        ActiveRequest {
            start_time: std::time::Instant::now(),
            model: req.model.clone(),
            client_ip: req.client_ip.clone(),
            streaming: req.want_stream,
            channel_id: None,
            bytes_received: 0,
            client_first_byte_time: None,
        },
    );
    let result = handle_admitted(state, req).await;
    result
}

async fn handle_admitted(state: &ProxyState, req: IncomingRequest) -> Result<OrchestratorResponse, ProxyError> {
    let trace_id = req.trace_id.clone();
    let outcome = handle_inner(state, &req).await;
    state.registry.unregister(&trace_id);
    outcome
}

/// Zeroed failure update for branches where no token was ever consumed.
fn failed_usage_update(token_id: relay_store::AuthTokenId, channel_id: ChannelId, model: String) -> TokenStatsUpdate {
    TokenStatsUpdate {
        token_id,
        channel_id,
        key_index: 0,
        model,
        success: false,
        input_tokens: 0,
        output_tokens: 0,
        cache_read_tokens: 0,
        cache_creation_tokens: 0,
        cost_micro_usd: 0,
    }
}

async fn handle_inner(state: &ProxyState, req: &IncomingRequest) -> Result<OrchestratorResponse, ProxyError> {
    let request_start = Instant::now();

    let token = match resolve_auth_token(state, req).await {
        Some(token) => token,
        None => {
            emit_log(state, build_log_entry(req, request_start, None, None, 401, false)).await;
            return Err(ProxyError::new(http::StatusCode::UNAUTHORIZED, Bytes::from_static(br#"{"error":"invalid api key"}"#)));
        }
    };

    match cost_gate::check(&token, &req.model, 0) {
        Ok(()) => {}
        Err(GateError::ModelNotAllowed) => {
            emit_log(state, build_log_entry(req, request_start, None, None, 403, false)).await;
            return Err(ProxyError::forbidden(Bytes::from_static(br#"{"error":"model not allowed"}"#)));
        }
        Err(GateError::BudgetExceeded) => {
            emit_log(state, build_log_entry(req, request_start, None, None, 429, false)).await;
            return Err(ProxyError::cost_limit_exceeded());
        }
    }

    let settings = state.current_settings();
    let candidates = candidate::select(
        state.store.as_ref(),
        &state.health,
        &settings,
        &req.model,
        req.channel_type,
    )
    .await;

    if candidates.is_empty() {
        emit_log(state, build_log_entry(req, request_start, None, None, 503, false)).await;
        return Err(ProxyError::service_unavailable(Bytes::from_static(b"no available upstream")));
    }

    let mut last_status: Option<u16> = None;
    let mut last_channel_id: Option<ChannelId> = None;

    for candidate in &candidates {
        let channel = &candidate.channel;
        last_channel_id = Some(channel.id);
        state.registry.set_channel(&req.trace_id, channel.id);

        match try_channel_with_keys(state, channel, req, settings.max_key_retries, settings.first_byte_timeout).await {
            ChannelOutcome::Success {
                key_index,
                result,
                sse_usage,
            } => {
                cooldown::clear(state.store.as_ref(), channel.id, Some(key_index)).await;
                state.registry.set_key_index(&req.trace_id, key_index);

                let status = result.status;
                let is_stream = matches!(result.body, ForwardBody::Stream(_));

                let (body, usage) = match result.body {
                    ForwardBody::Buffered(bytes) => {
                        let usage = sse::extract_usage_from_json(&bytes);
                        (OrchestratorBody::Buffered(bytes), usage)
                    }
                    ForwardBody::Stream(upstream_rx) => {
                        let (client_tx, client_rx) = mpsc::channel(16);
                        let token_clone = token.clone();
                        let store = state.store.clone();
                        let token_stats = state.token_stats.clone();
                        let model_for_cost = req.model.clone();
                        let cost_estimator = state.cost_estimator.clone();
                        let channel_id = channel.id;
                        let trace_id = req.trace_id.clone();
                        let want_stream = req.want_stream;
                        tokio::spawn(async move {
                            let outcome = sse::pump(upstream_rx, client_tx).await;
                            let usage = outcome.usage;
                            let cost = cost_estimator.estimate_micro_usd(&model_for_cost, &usage);
                            if cost > 0 {
                                store.add_token_usage(token_clone.id, cost).await;
                                store.add_cost(channel_id, cost as f64 / 1_000_000.0).await;
                            }
                            if outcome.error_event.is_some() && !outcome.client_disconnected {
                                tracing::warn!(event = "sse_error_event", channel_id, "mid-stream vendor error event observed on a 200 response");
                            }
                            token_stats
                                .enqueue_success(TokenStatsUpdate {
                                    token_id: token_clone.id,
                                    channel_id,
                                    key_index,
                                    model: model_for_cost.clone(),
                                    success: true,
                                    input_tokens: usage.input_tokens,
                                    output_tokens: usage.output_tokens,
                                    cache_read_tokens: usage.cache_read_tokens,
                                    cache_creation_tokens: usage.cache_creation_tokens,
                                    cost_micro_usd: cost,
                                })
                                .await;
                            let entry = LogEntry {
                                trace_id,
                                model: model_for_cost,
                                channel_id: Some(channel_id),
                                key_index: Some(key_index),
                                status,
                                elapsed_ms: request_start.elapsed().as_millis() as u64,
                                is_stream: want_stream,
                                is_client_canceled: outcome.client_disconnected,
                            };
                            let _ = tokio::time::timeout(LOG_WRITE_TIMEOUT, store.record_log(entry)).await;
                        });
                        (OrchestratorBody::Stream(client_rx), sse_usage)
                    }
                };

                let cost = state.cost_estimator.estimate_micro_usd(&req.model, &usage);
                if cost > 0 {
                    cost_gate::record_usage(state.store.as_ref(), token.id, cost).await;
                    state.store.add_cost(channel.id, cost as f64 / 1_000_000.0).await;
                }

                if !is_stream {
                    state
                        .token_stats
                        .enqueue_success(TokenStatsUpdate {
                            token_id: token.id,
                            channel_id: channel.id,
                            key_index,
                            model: req.model.clone(),
                            success: true,
                            input_tokens: usage.input_tokens,
                            output_tokens: usage.output_tokens,
                            cache_read_tokens: usage.cache_read_tokens,
                            cache_creation_tokens: usage.cache_creation_tokens,
                            cost_micro_usd: cost,
                        })
                        .await;
                    emit_log(state, build_log_entry(req, request_start, Some(channel.id), Some(key_index), status, false)).await;
                }

                return Ok(OrchestratorResponse {
                    status: result.status,
                    headers: result.headers,
                    body,
                });
            }
            ChannelOutcome::ReturnClient(err) => {
                let is_client_canceled = err.status.as_u16() == 499;
                state
                    .token_stats
                    .enqueue_failure(failed_usage_update(token.id, channel.id, req.model.clone()))
                    .await;
                emit_log(
                    state,
                    build_log_entry(req, request_start, Some(channel.id), None, err.status.as_u16(), is_client_canceled),
                )
                .await;
                return Err(err);
            }
            ChannelOutcome::AllKeysUnavailable => {
                let classification = classify::classify(None, Some(503), 1);
                cooldown::handle_error(state.store.as_ref(), channel.id, None, 503, &classification, None).await;
                last_status = Some(503);
                continue;
            }
            ChannelOutcome::RetryChannel(status) => {
                last_status = Some(status);
                continue;
            }
        }
    }

    let final_status = last_status.unwrap_or(503);
    // Upstream 499 never reaches the client; an exhausted retry loop maps it
    // to 502 the same way a single attempt's classifier would.
    let client_status = if final_status == 499 { 502 } else { final_status };

    state
        .token_stats
        .enqueue_failure(failed_usage_update(token.id, last_channel_id.unwrap_or_default(), req.model.clone()))
        .await;
    emit_log(state, build_log_entry(req, request_start, last_channel_id, None, client_status, false)).await;

    Err(ProxyError::new(
        http::StatusCode::from_u16(client_status).unwrap_or(http::StatusCode::SERVICE_UNAVAILABLE),
        Bytes::from_static(b"all upstream channels exhausted"),
    ))
}
