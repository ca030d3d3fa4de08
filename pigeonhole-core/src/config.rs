//! Configuration for pigeonhole services
//!
//! Constants are overridable through `PIGEONHOLE_*` environment variables so
//! deployments can tune them without a config file.

use std::env;
use std::net::SocketAddr;

/// Parse an environment variable as a typed value with a default fallback
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Allocator and binding-lifecycle tunables.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Maximum number of attempts for transaction-guarded mutations
    /// (allocate, claim, release, binding writes).
    pub retry_max: u32,
    /// Seconds a soft-released dynamic-pool binding is kept before its keys
    /// expire and the address is reclaimed.
    pub released_binding_ttl_secs: i64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            retry_max: env_var_or_default("PIGEONHOLE_RETRY_MAX", 10),
            released_binding_ttl_secs: env_var_or_default(
                "PIGEONHOLE_RELEASED_BINDING_TTL_SECS",
                60 * 60 * 6,
            ),
        }
    }
}

/// Settings for the HTTP service front end.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for the REST listener
    pub bind_address: SocketAddr,
    /// Directory holding the redb database file
    pub data_dir: String,
    /// Per-request deadline in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: env_var_or_default(
                "PIGEONHOLE_BIND_ADDRESS",
                "127.0.0.1:7542"
                    .parse()
                    .unwrap_or(SocketAddr::from(([127, 0, 0, 1], 7542))),
            ),
            data_dir: env::var("PIGEONHOLE_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            request_timeout_ms: env_var_or_default("PIGEONHOLE_REQUEST_TIMEOUT_MS", 30_000),
        }
    }
}
