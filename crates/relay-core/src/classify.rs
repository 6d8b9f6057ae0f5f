//! Pure error classifier (spec §4.1 / §7).
//!
//! `classify` takes no state and performs no I/O: same inputs, same output,
//! always. Everything downstream (cooldown durations, retry orchestration)
//! branches on its result.

use std::time::Duration;

/// A transport-layer signal observed instead of an HTTP status.
///
/// Mirrors the distinction the teacher's `UpstreamFailure`/`UpstreamTransportErrorKind`
/// draws between connect/DNS/TLS/timeout failures (`gproxy-core/src/upstream_client/mod.rs`),
/// generalized with the two proxy-specific sentinels spec §4.1 calls out
/// (client cancellation vs. first-byte timeout) which the teacher does not need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSignal {
    /// The downstream client closed the connection or its context was cancelled.
    ClientCancel,
    /// The server-side request deadline elapsed (not a client cancel).
    DeadlineExceeded,
    /// Headers never arrived before the first-byte watchdog fired.
    FirstByteTimeout,
    /// A transport-level timeout with no cancellation intent (rare).
    NetTimeout,
    /// Connection reset / broken pipe.
    ConnectionReset,
    /// DNS failure, no route, connection refused, host unreachable.
    DnsUnreachable,
    /// Any other transport-layer error.
    OtherNetwork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLevel {
    Client,
    Key,
    Channel,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub client_status: u16,
    pub retryable: bool,
    /// `None` only for 2xx (success, nothing to retry or cool down).
    pub level: Option<RetryLevel>,
    /// Set only for the first-byte-timeout sentinel: a fixed, non-exponential
    /// channel cooldown rather than the usual bump algorithm.
    pub fixed_cooldown: Option<Duration>,
}

impl Classification {
    fn client(status: u16, retryable: bool) -> Self {
        Self {
            client_status: status,
            retryable,
            level: Some(RetryLevel::Client),
            fixed_cooldown: None,
        }
    }

    fn key(status: u16) -> Self {
        Self {
            client_status: status,
            retryable: true,
            level: Some(RetryLevel::Key),
            fixed_cooldown: None,
        }
    }

    fn channel(status: u16, retryable: bool) -> Self {
        Self {
            client_status: status,
            retryable,
            level: Some(RetryLevel::Channel),
            fixed_cooldown: None,
        }
    }

    fn success(status: u16) -> Self {
        Self {
            client_status: status,
            retryable: false,
            level: None,
            fixed_cooldown: None,
        }
    }
}

/// Classify a single upstream attempt's outcome.
///
/// `channel_key_count` is the number of keys configured on the channel that
/// produced this attempt; it only affects the 401/403 Key-vs-Channel upgrade.
pub fn classify(
    error: Option<ErrorSignal>,
    http_status: Option<u16>,
    channel_key_count: usize,
) -> Classification {
    if let Some(signal) = error {
        return match signal {
            ErrorSignal::ClientCancel => Classification::client(499, false),
            // The client signal here is cancellation, not deadline; staying
            // permissive preserves availability instead of punishing the channel.
            ErrorSignal::DeadlineExceeded => Classification::channel(504, true),
            ErrorSignal::FirstByteTimeout => Classification {
                client_status: 598,
                retryable: true,
                level: Some(RetryLevel::Channel),
                fixed_cooldown: Some(Duration::from_secs(300)),
            },
            ErrorSignal::NetTimeout => Classification::client(504, false),
            ErrorSignal::ConnectionReset => Classification::client(502, false),
            ErrorSignal::DnsUnreachable => Classification::channel(502, true),
            // Other network errors are specified as an internal (-1) sentinel
            // rather than a concrete HTTP status; `client_status` is a `u16`
            // here, so this surfaces as 502/Channel instead, same as DNS
            // unreachable. The retry/cooldown behavior (retryable, channel
            // level) matches either way.
            ErrorSignal::OtherNetwork => Classification::channel(502, true),
        };
    }

    let status = http_status.expect("classify requires an error signal or an http status");
    if (200..300).contains(&status) {
        return Classification::success(status);
    }

    match status {
        401 | 403 => {
            if channel_key_count <= 1 {
                Classification::channel(status, true)
            } else {
                Classification::key(status)
            }
        }
        429 => Classification::key(status),
        // Upstream-origin 499 (no transport error, status literally 499) is
        // distinct from a client cancel: the client signal always comes
        // through `ErrorSignal::ClientCancel`, never as a bare status here.
        499 => Classification::channel(502, true),
        s if s >= 500 => Classification::channel(s, true),
        s => Classification::client(s, false),
    }
}
