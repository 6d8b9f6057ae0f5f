use bytes::Bytes;
use http::StatusCode;

/// Client-facing failure: a status code plus a body the client actually sees.
///
/// Kept separate from library/internal errors (store failures, config
/// errors) so propagate-to-client and log-and-degrade paths never mix.
#[derive(Debug, Clone)]
pub struct ProxyError {
    pub status: StatusCode,
    pub body: Bytes,
}

impl ProxyError {
    pub fn new(status: StatusCode, message: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn forbidden(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn payload_too_large(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn too_many_requests(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message)
    }

    pub fn client_closed(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::from_u16(499).unwrap(), message)
    }

    pub fn service_unavailable(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn gateway_timeout(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, message)
    }

    pub fn bad_gateway(message: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    pub fn cost_limit_exceeded() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            Bytes::from_static(br#"{"error":{"code":"cost_limit_exceeded"}}"#),
        )
    }
}

/// Internal failures surfaced from the store / config layer — never shown
/// to the client verbatim, only logged and mapped to a generic status.
#[derive(Debug, thiserror::Error)]
pub enum InternalError {
    #[error("store operation failed: {0}")]
    Store(String),
    #[error("config error: {0}")]
    Config(#[from] relay_common::ConfigError),
}
