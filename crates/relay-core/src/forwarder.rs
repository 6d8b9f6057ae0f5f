//! Upstream forwarder (spec §4.7).
//!
//! Builds the outbound request, injects channel-type auth, runs it under a
//! first-byte watchdog, and hands back either a buffered body or a streaming
//! one. Grounded in the teacher's `WreqUpstreamClient`
//! (`gproxy-core/src/upstream_client/mod.rs`): same client-cache shape, same
//! `tokio::sync::mpsc` body pump with per-chunk idle timeout, same
//! transport-error classification heuristics. The teacher's per-proxy client
//! cache is dropped — outbound proxying isn't part of this system — leaving
//! a single shared client (see DESIGN.md).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use relay_store::{Channel, ChannelType};
use tokio::sync::mpsc;

use crate::classify::ErrorSignal;

#[derive(Clone)]
pub struct ForwardRequest {
    pub method: wreq::Method,
    /// Path plus optional raw query string, already joined with `?`.
    pub path_and_query: String,
    /// Client headers minus hop-by-hop/auth headers the orchestrator strips.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub want_stream: bool,
    /// Per-request override of the first-byte watchdog (query/header).
    pub timeout_override: Option<Duration>,
}

pub enum ForwardBody {
    Buffered(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

pub struct ForwardResult {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ForwardBody,
}

const HOP_BY_HOP_REQUEST_HEADERS: &[&str] = &["authorization", "x-api-key", "accept-encoding"];
const HOP_BY_HOP_RESPONSE_HEADERS: &[&str] = &["connection", "content-length", "transfer-encoding"];

/// Seam the orchestrator retries against; lets tests substitute a fake
/// forwarder instead of performing real HTTP calls.
#[async_trait]
pub trait Forward: Send + Sync {
    async fn forward(
        &self,
        channel: &Channel,
        key_secret: &str,
        req: ForwardRequest,
        default_first_byte_timeout: Duration,
    ) -> Result<ForwardResult, ErrorSignal>;
}

pub struct UpstreamForwarder {
    clients: Mutex<HashMap<(), wreq::Client>>,
    stream_idle_timeout: Duration,
}

impl UpstreamForwarder {
    pub fn new(stream_idle_timeout: Duration) -> Result<Self, wreq::Error> {
        let client = build_client()?;
        let mut clients = HashMap::new();
        clients.insert((), client);
        Ok(Self {
            clients: Mutex::new(clients),
            stream_idle_timeout,
        })
    }

    fn client(&self) -> wreq::Client {
        self.clients.lock().unwrap().get(&()).cloned().expect("client initialized in new()")
    }
}

#[async_trait]
impl Forward for UpstreamForwarder {
    async fn forward(
        &self,
        channel: &Channel,
        key_secret: &str,
        req: ForwardRequest,
        default_first_byte_timeout: Duration,
    ) -> Result<ForwardResult, ErrorSignal> {
        let url = format!(
            "{}{}",
            channel.base_url.trim_end_matches('/'),
            req.path_and_query
        );

        let client = self.client();
        let mut builder = client.request(req.method, &url);
        for (name, value) in &req.headers {
            if HOP_BY_HOP_REQUEST_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        builder = inject_auth(builder, channel.channel_type, key_secret);
        builder = builder.body(req.body);

        let timeout = req.timeout_override.unwrap_or(default_first_byte_timeout);
        let sent = tokio::time::timeout(timeout, builder.send()).await;
        let resp = match sent {
            Err(_) => return Err(ErrorSignal::FirstByteTimeout),
            Ok(Err(e)) => return Err(classify_wreq_error(&e)),
            Ok(Ok(resp)) => resp,
        };

        let status = resp.status().as_u16();
        let headers = filter_response_headers(resp.headers());
        let is_success = (200..300).contains(&status);

        if !is_success || !req.want_stream {
            let body = resp.bytes().await.map_err(|e| classify_wreq_error(&e))?;
            return Ok(ForwardResult {
                status,
                headers,
                body: ForwardBody::Buffered(body),
            });
        }

        let (tx, rx) = mpsc::channel::<Bytes>(16);
        let idle = self.stream_idle_timeout;
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle, stream.next()).await;
                let item = match next {
                    Ok(item) => item,
                    Err(_) => break,
                };
                let Some(item) = item else { break };
                let Ok(chunk) = item else { break };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });

        Ok(ForwardResult {
            status,
            headers,
            body: ForwardBody::Stream(rx),
        })
    }
}

fn build_client() -> Result<wreq::Client, wreq::Error> {
    wreq::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
}

fn inject_auth(builder: wreq::RequestBuilder, channel_type: ChannelType, secret: &str) -> wreq::RequestBuilder {
    match channel_type {
        ChannelType::Gemini => builder.header("x-goog-api-key", secret),
        ChannelType::OpenAI => builder.header("Authorization", format!("Bearer {secret}")),
        ChannelType::Anthropic | ChannelType::Codex => builder
            .header("x-api-key", secret)
            .header("Authorization", format!("Bearer {secret}")),
    }
}

fn filter_response_headers(map: &wreq::header::HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in map {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP_RESPONSE_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        let Ok(value) = value.to_str() else { continue };
        if lower == "content-encoding" && value.eq_ignore_ascii_case("gzip") {
            // wreq already decoded gzip transparently; forwarding the header
            // would make the client try to decode an already-plain body.
            continue;
        }
        out.push((name.as_str().to_string(), value.to_string()));
    }
    out
}

fn classify_wreq_error(err: &wreq::Error) -> ErrorSignal {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        return ErrorSignal::NetTimeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") || message.contains("refused")
            || message.contains("unreachable") || message.contains("no route")
        {
            return ErrorSignal::DnsUnreachable;
        }
        return ErrorSignal::OtherNetwork;
    }
    if message.contains("reset") || message.contains("broken pipe") {
        return ErrorSignal::ConnectionReset;
    }
    ErrorSignal::OtherNetwork
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_injects_header_key_only() {
        // Auth injection is exercised indirectly through `forward` in the
        // orchestrator integration tests; this module only needs the header
        // filtering helpers to be independently testable.
        let mut map = wreq::header::HeaderMap::new();
        map.insert("content-encoding", "gzip".parse().unwrap());
        map.insert("x-request-id", "abc".parse().unwrap());
        map.insert("connection", "keep-alive".parse().unwrap());
        let filtered = filter_response_headers(&map);
        let names: Vec<&str> = filtered.iter().map(|(k, _)| k.as_str()).collect();
        assert!(!names.contains(&"content-encoding"));
        assert!(!names.contains(&"connection"));
        assert!(names.contains(&"x-request-id"));
    }

    #[test]
    fn br_content_encoding_passes_through() {
        let mut map = wreq::header::HeaderMap::new();
        map.insert("content-encoding", "br".parse().unwrap());
        let filtered = filter_response_headers(&map);
        assert_eq!(filtered[0], ("content-encoding".to_string(), "br".to_string()));
    }
}
