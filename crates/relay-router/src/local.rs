//! Endpoints served without going through the forwarder (spec §6 "Local
//! endpoints"). Grounded in the teacher's aggregate model-listing handlers
//! (`gproxy-router/src/proxy.rs` `models_list_v1_aggregate` /
//! `gemini_models_list_aggregate`), collapsed from a multi-provider union to
//! a union over this system's own enabled channels, plus a local token
//! counter using the same `tiktoken-rs` dependency the teacher's custom
//! provider uses for its count-tokens passthrough
//! (`gproxy-provider-impl/src/providers/custom/mod.rs`'s
//! `count_text_tiktoken`).

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_core::ProxyState;
use relay_store::ChannelType;
use serde_json::Value;
use tiktoken_rs::{get_bpe_from_model, o200k_base};

pub async fn models_list_v1(State(state): State<Arc<ProxyState>>) -> Response {
    let channels = state.store.list_channels().await;
    let mut models = BTreeSet::new();
    for channel in channels.iter().filter(|c| c.enabled && c.channel_type == ChannelType::OpenAI) {
        for entry in &channel.models {
            models.insert(entry.model.clone());
        }
    }
    let data: Vec<Value> = models
        .into_iter()
        .map(|id| {
            serde_json::json!({
                "id": id,
                "object": "model",
                "owned_by": "relay",
            })
        })
        .collect();
    (StatusCode::OK, Json(serde_json::json!({ "object": "list", "data": data }))).into_response()
}

pub async fn models_list_v1beta(State(state): State<Arc<ProxyState>>) -> Response {
    let channels = state.store.list_channels().await;
    let mut models = BTreeSet::new();
    for channel in channels.iter().filter(|c| c.enabled && c.channel_type == ChannelType::Gemini) {
        for entry in &channel.models {
            models.insert(entry.model.clone());
        }
    }
    let data: Vec<Value> = models
        .into_iter()
        .map(|id| serde_json::json!({ "name": format!("models/{id}") }))
        .collect();
    (StatusCode::OK, Json(serde_json::json!({ "models": data, "nextPageToken": Value::Null }))).into_response()
}

pub async fn count_tokens(body: axum::body::Bytes) -> Response {
    let Ok(value) = serde_json::from_slice::<Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "malformed body").into_response();
    };
    let model = value.get("model").and_then(Value::as_str).unwrap_or("claude-3-5-sonnet-20241022");
    let text = extract_message_text(&value);

    let Ok(bpe) = get_bpe_from_model(model).or_else(|_| o200k_base()) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "tokenizer unavailable").into_response();
    };
    let input_tokens = bpe.encode_ordinary(&text).len();

    (StatusCode::OK, Json(serde_json::json!({ "input_tokens": input_tokens }))).into_response()
}

/// Flattens every string leaf under `messages`/`system` into one blob for a
/// best-effort count; exact per-vendor content-block schemas aren't modeled
/// here since this counter is advisory, not billed.
fn extract_message_text(value: &Value) -> String {
    let mut out = String::new();
    if let Some(system) = value.get("system") {
        collect_strings(system, &mut out);
    }
    if let Some(messages) = value.get("messages").and_then(Value::as_array) {
        for message in messages {
            collect_strings(message, &mut out);
        }
    }
    out
}

fn collect_strings(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push_str(s);
            out.push(' ');
        }
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}
