//! Streaming SSE parser (spec §4.10).
//!
//! Pumps upstream bytes to the client as they arrive while best-effort
//! parsing `data:` payloads for token usage, and watches for a vendor
//! `event: error` block. Runs as its own pump loop rather than inline in the
//! forwarder, mirroring the teacher's separation between `convert_response`'s
//! byte pump (`gproxy-core/src/upstream_client/mod.rs`) and the handler that
//! writes to the client.

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageTokens {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

impl UsageTokens {
    fn merge_max(&mut self, other: UsageTokens) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.max(other.cache_read_tokens);
        self.cache_creation_tokens = self.cache_creation_tokens.max(other.cache_creation_tokens);
    }
}

#[derive(Debug, Default)]
pub struct SseOutcome {
    pub usage: UsageTokens,
    /// Payload of a vendor `event: error` block, if one arrived (spec: a 200
    /// response can still carry a mid-stream error that should trigger a
    /// cooldown decision after the stream closes).
    pub error_event: Option<Bytes>,
    /// Client went away before the upstream stream ended; accumulated usage
    /// up to that point is still returned, not discarded.
    pub client_disconnected: bool,
}

const READ_BUFFER_HINT: usize = 4096;

/// Pump `upstream` bytes to `downstream`, extracting usage/error events along
/// the way. Stops either when `upstream` closes (stream complete) or when a
/// send to `downstream` fails (client disconnected).
pub async fn pump(mut upstream: mpsc::Receiver<Bytes>, downstream: mpsc::Sender<Bytes>) -> SseOutcome {
    let mut outcome = SseOutcome::default();
    let mut carry = String::with_capacity(READ_BUFFER_HINT);

    while let Some(chunk) = upstream.recv().await {
        if downstream.send(chunk.clone()).await.is_err() {
            outcome.client_disconnected = true;
            break;
        }
        carry.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(boundary) = carry.find("\n\n") {
            let event_block: String = carry.drain(..boundary + 2).collect();
            process_event(&event_block, &mut outcome);
        }
    }

    if !outcome.client_disconnected && !carry.trim().is_empty() {
        process_event(&carry, &mut outcome);
    }

    outcome
}

fn process_event(block: &str, outcome: &mut SseOutcome) {
    let mut event_name: Option<&str> = None;
    let mut data_lines = Vec::new();
    for line in block.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = Some(rest.trim());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim());
        }
    }
    if data_lines.is_empty() {
        return;
    }
    let payload = data_lines.join("\n");

    if event_name == Some("error") {
        outcome.error_event = Some(Bytes::from(payload.clone().into_bytes()));
    }

    if let Ok(value) = serde_json::from_str::<Value>(&payload) {
        if let Some(usage) = extract_usage(&value) {
            outcome.usage.merge_max(usage);
        }
    }
}

/// Same extraction `pump` uses per-event, exposed for buffered (non-streaming)
/// responses whose usage lives in a single JSON body rather than SSE frames.
pub fn extract_usage_from_json(bytes: &[u8]) -> UsageTokens {
    let Ok(value) = serde_json::from_slice::<Value>(bytes) else {
        return UsageTokens::default();
    };
    extract_usage(&value).unwrap_or_default()
}

fn extract_usage(value: &Value) -> Option<UsageTokens> {
    let usage = value.get("usage").or_else(|| value.get("message").and_then(|m| m.get("usage")))?;
    let get = |keys: &[&str]| -> u64 {
        keys.iter()
            .find_map(|k| usage.get(*k).and_then(Value::as_u64))
            .unwrap_or(0)
    };
    Some(UsageTokens {
        input_tokens: get(&["prompt_tokens", "input_tokens"]),
        output_tokens: get(&["completion_tokens", "output_tokens"]),
        cache_read_tokens: get(&["cache_read_input_tokens", "cached_tokens", "cache_read_tokens"]),
        cache_creation_tokens: get(&["cache_creation_input_tokens", "cache_creation_tokens"]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(chunks: Vec<&str>) -> (SseOutcome, Vec<u8>) {
        let (tx_up, rx_up) = mpsc::channel(16);
        let (tx_down, mut rx_down) = mpsc::channel(16);
        for c in chunks {
            tx_up.send(Bytes::from(c.to_string())).await.unwrap();
        }
        drop(tx_up);
        let outcome = pump(rx_up, tx_down).await;
        let mut received = Vec::new();
        while let Ok(chunk) = rx_down.try_recv() {
            received.extend_from_slice(&chunk);
        }
        (outcome, received)
    }

    #[tokio::test]
    async fn extracts_openai_style_usage() {
        let (outcome, _) = run(vec![
            "data: {\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":5}}\n\n",
        ])
        .await;
        assert_eq!(outcome.usage.input_tokens, 10);
        assert_eq!(outcome.usage.output_tokens, 5);
    }

    #[tokio::test]
    async fn extracts_anthropic_style_usage_from_message_delta() {
        let (outcome, _) = run(vec![
            "data: {\"message\":{\"usage\":{\"input_tokens\":3,\"output_tokens\":7,\"cache_read_input_tokens\":2}}}\n\n",
        ])
        .await;
        assert_eq!(outcome.usage.input_tokens, 3);
        assert_eq!(outcome.usage.output_tokens, 7);
        assert_eq!(outcome.usage.cache_read_tokens, 2);
    }

    #[tokio::test]
    async fn captures_error_event_without_failing_parse() {
        let (outcome, _) = run(vec!["event: error\ndata: {\"type\":\"overloaded_error\"}\n\n"]).await;
        assert!(outcome.error_event.is_some());
    }

    #[tokio::test]
    async fn malformed_data_is_ignored_not_fatal() {
        let (outcome, _) = run(vec!["data: not json at all\n\n"]).await;
        assert_eq!(outcome.usage, UsageTokens::default());
    }

    #[tokio::test]
    async fn forwards_bytes_unmodified_to_downstream() {
        let (_, received) = run(vec!["data: {\"usage\":{}}\n\n"]).await;
        assert_eq!(received, b"data: {\"usage\":{}}\n\n".to_vec());
    }

    #[tokio::test]
    async fn client_disconnect_preserves_already_accumulated_usage() {
        let (tx_up, rx_up) = mpsc::channel(16);
        let (tx_down, rx_down) = mpsc::channel(16);
        drop(rx_down); // simulate client gone
        tx_up
            .send(Bytes::from_static(
                b"data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1}}\n\n",
            ))
            .await
            .unwrap();
        let outcome = pump(rx_up, tx_down).await;
        assert!(outcome.client_disconnected);
    }
}
