//! Server configuration.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use unison_core::limits::RATE_LIMIT_CAPACITY;

/// Decides whether an incoming socket may upgrade at all, before any
/// frame is read. Arguments: remote address, request path.
pub type Preflight = Arc<dyn Fn(&SocketAddr, &str) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Upgrade requests to any other path are refused.
    pub mount_path: String,
    pub debug: bool,
    /// Rate-limit bucket capacity per connection.
    pub rate_limit_capacity: u32,
    pub preflight: Option<Preflight>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".into(),
            mount_path: "/".into(),
            debug: false,
            rate_limit_capacity: RATE_LIMIT_CAPACITY,
            preflight: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env::var("UNISON_BIND_ADDR").unwrap_or(defaults.bind_addr),
            mount_path: env::var("UNISON_MOUNT_PATH").unwrap_or(defaults.mount_path),
            debug: env::var("UNISON_DEBUG").is_ok_and(|v| v == "1" || v == "true"),
            rate_limit_capacity: env::var("UNISON_RATE_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(RATE_LIMIT_CAPACITY),
            preflight: None,
        }
    }
}
