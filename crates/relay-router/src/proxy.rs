use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::StreamExt;
use relay_core::orchestrator::{IncomingRequest, OrchestratorBody};
use relay_core::{ProxyError, ProxyState};
use relay_store::ChannelType;
use tokio_stream::wrappers::ReceiverStream;

use crate::local;

pub fn proxy_router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/v1/completions", post(openai_completions))
        .route("/v1/embeddings", post(openai_embeddings))
        .route("/v1/responses", post(codex_responses))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1beta/models/{model_action}", post(gemini_generate))
        .route("/v1/models", get(local::models_list_v1))
        .route("/v1beta/models", get(local::models_list_v1beta))
        .route("/v1/messages/count_tokens", post(local::count_tokens))
        .with_state(state)
}

async fn openai_chat_completions(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    dispatch(&state, ChannelType::OpenAI, "/v1/chat/completions".to_string(), headers, query, body).await
}

async fn openai_completions(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    dispatch(&state, ChannelType::OpenAI, "/v1/completions".to_string(), headers, query, body).await
}

async fn openai_embeddings(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    dispatch(&state, ChannelType::OpenAI, "/v1/embeddings".to_string(), headers, query, body).await
}

async fn codex_responses(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    dispatch(&state, ChannelType::Codex, "/v1/responses".to_string(), headers, query, body).await
}

async fn anthropic_messages(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    dispatch(&state, ChannelType::Anthropic, "/v1/messages".to_string(), headers, query, body).await
}

/// `{model}:(generateContent|streamGenerateContent)` — the model and streaming
/// mode both live in the path segment rather than the body (spec §6).
async fn gemini_generate(
    State(state): State<Arc<ProxyState>>,
    Path(model_action): Path<String>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return (StatusCode::BAD_REQUEST, "malformed model:action path").into_response();
    };
    if !matches!(action, "generateContent" | "streamGenerateContent") {
        return (StatusCode::NOT_FOUND, "unsupported gemini action").into_response();
    }
    let want_stream = action == "streamGenerateContent";

    let settings = state.current_settings();
    if body.len() > settings.max_body_bytes {
        return ProxyError::payload_too_large(Bytes::from_static(b"body too large")).into_response_body();
    }

    let path_and_query = match &query {
        Some(q) => format!("/v1beta/models/{model_action}?{q}"),
        None => format!("/v1beta/models/{model_action}"),
    };

    let req = IncomingRequest {
        trace_id: uuid::Uuid::new_v4().to_string(),
        client_ip: "unknown".to_string(),
        bearer_token: extract_bearer(&headers),
        model: model.to_string(),
        channel_type: Some(ChannelType::Gemini),
        method: wreq::Method::POST,
        path_and_query,
        headers: headers_to_vec(&headers),
        body,
        want_stream,
        timeout_override: extract_timeout_override(&headers, query.as_deref()),
    };

    run(&state, req).await
}

async fn dispatch(
    state: &ProxyState,
    channel_type: ChannelType,
    path: String,
    headers: HeaderMap,
    query: Option<String>,
    body: Bytes,
) -> Response {
    let settings = state.current_settings();
    if body.len() > settings.max_body_bytes {
        return ProxyError::payload_too_large(Bytes::from_static(b"body too large")).into_response_body();
    }

    let Some(model) = extract_model(&body) else {
        return (StatusCode::BAD_REQUEST, "missing model").into_response();
    };
    let want_stream = extract_stream_flag(&body);
    let path_and_query = match &query {
        Some(q) => format!("{path}?{q}"),
        None => path,
    };

    let req = IncomingRequest {
        trace_id: uuid::Uuid::new_v4().to_string(),
        client_ip: "unknown".to_string(),
        bearer_token: extract_bearer(&headers),
        model,
        channel_type: Some(channel_type),
        method: wreq::Method::POST,
        path_and_query,
        headers: headers_to_vec(&headers),
        body,
        want_stream,
        timeout_override: extract_timeout_override(&headers, query.as_deref()),
    };

    run(state, req).await
}

async fn run(state: &ProxyState, req: IncomingRequest) -> Response {
    match relay_core::handle(state, req).await {
        Ok(resp) => orchestrator_response_to_axum(resp),
        Err(err) => err.into_response_body(),
    }
}

fn orchestrator_response_to_axum(resp: relay_core::OrchestratorResponse) -> Response {
    let mut builder = Response::builder().status(resp.status);
    if let Some(h) = builder.headers_mut() {
        for (name, value) in &resp.headers {
            if let (Ok(name), Ok(value)) = (
                axum::http::HeaderName::from_bytes(name.as_bytes()),
                axum::http::HeaderValue::from_str(value),
            ) {
                h.append(name, value);
            }
        }
    }
    let body = match resp.body {
        OrchestratorBody::Buffered(bytes) => Body::from(bytes),
        OrchestratorBody::Stream(rx) => {
            let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            Body::from_stream(stream)
        }
    };
    builder.body(body).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "response build failed").into_response()
    })
}

/// Small extension so a [`ProxyError`] (lives in `relay-core`, has no axum
/// dependency) can become a `Response` here at the router boundary.
trait ProxyErrorExt {
    fn into_response_body(self) -> Response;
}

impl ProxyErrorExt for ProxyError {
    fn into_response_body(self) -> Response {
        Response::builder()
            .status(self.status)
            .body(Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

fn extract_model(body: &Bytes) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("model")?.as_str().map(str::to_string)
}

fn extract_stream_flag(body: &Bytes) -> bool {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("stream").and_then(|s| s.as_bool()))
        .unwrap_or(false)
}

fn extract_timeout_override(headers: &HeaderMap, query: Option<&str>) -> Option<Duration> {
    if let Some(ms) = header_or_query_u64(headers, query, "x-timeout-ms", "timeout_ms") {
        return Some(Duration::from_millis(ms));
    }
    if let Some(s) = header_or_query_u64(headers, query, "x-timeout-s", "timeout_s") {
        return Some(Duration::from_secs(s));
    }
    None
}

fn header_or_query_u64(headers: &HeaderMap, query: Option<&str>, header_name: &str, query_key: &str) -> Option<u64> {
    if let Some(v) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
        if let Ok(n) = v.trim().parse() {
            return Some(n);
        }
    }
    let q = query?;
    let params: std::collections::HashMap<String, String> = serde_urlencoded::from_str(q).ok()?;
    params.get(query_key)?.parse().ok()
}

fn headers_to_vec(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}
