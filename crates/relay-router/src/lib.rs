//! HTTP surface: axum routes for the forwarded proxy endpoints plus the
//! handful of endpoints served locally. Grounded in the teacher's
//! `gproxy-router/src/proxy.rs` route table and request-admission middleware
//! shape, generalized from its per-provider-prefix routing to this system's
//! single-tenant, channel-type-per-path routing.

mod local;
mod proxy;

pub use proxy::proxy_router;
