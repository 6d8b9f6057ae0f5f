//! CLI surface, grounded in the teacher's `CliArgs`
//! (`gproxy-core/src/bootstrap/mod.rs`): every field is optional and
//! resolvable from either a flag or an env var, clap applying CLI-over-env
//! precedence per field before the bootstrap layer merges in defaults.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "relay", version, about = "Multi-upstream LLM API reverse proxy")]
pub struct CliArgs {
    /// Bind host.
    #[arg(long, env = "RELAY_HOST")]
    pub host: Option<String>,

    /// Bind port.
    #[arg(long, env = "RELAY_PORT")]
    pub port: Option<u16>,

    /// Admin bearer key (plaintext); stored only as a hash. Generated and
    /// printed once if neither flag nor env is set — this binary has no
    /// admin HTTP surface yet, but the hash is carried so one can be added
    /// without a config-shape change.
    #[arg(long, env = "RELAY_ADMIN_KEY")]
    pub admin_key: Option<String>,

    /// Maximum request body size in bytes before a request is rejected with 413.
    #[arg(long, env = "CCLOAD_MAX_BODY_BYTES")]
    pub max_body_bytes: Option<usize>,

    /// First-byte watchdog duration (e.g. "120s", "2m").
    #[arg(long, env = "CCLOAD_FIRST_BYTE_TIMEOUT")]
    pub first_byte_timeout: Option<String>,
}
