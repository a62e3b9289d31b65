#![forbid(unsafe_code)]

// Harness configuration, loaded from environment variables.

use crate::error::HarnessError;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 6262;

/// How long a message-latency sample waits for delivery before counting as failed.
pub const DEFAULT_WAIT_WINDOW: Duration = Duration::from_secs(5);
/// Fallback wake-up interval while waiting for delivery.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Pause between scenarios so the previous scenario's connections drain.
pub const DEFAULT_STABILIZE_PAUSE: Duration = Duration::from_secs(5);
pub const DEFAULT_PROVISION_CONCURRENCY: usize = 50;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Request/response endpoint root, e.g. `http://localhost:6262`
    pub base_url: String,
    /// Persistent-connection endpoint, e.g. `ws://localhost:6262/api/ws`
    pub ws_url: String,
    pub wait_window: Duration,
    pub poll_interval: Duration,
    pub stabilize_pause: Duration,
    /// Upper bound on concurrent credential exchanges
    pub provision_concurrency: usize,
    pub connect_timeout: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::for_server(&format!("http://{DEFAULT_HOST}:{DEFAULT_PORT}"))
    }
}

impl HarnessConfig {
    /// Config pointing at `base_url` with every tunable at its default.
    /// The persistent-connection URL is derived from it.
    pub fn for_server(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            ws_url: derive_ws_url(&base_url),
            base_url,
            wait_window: DEFAULT_WAIT_WINDOW,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stabilize_pause: DEFAULT_STABILIZE_PAUSE,
            provision_concurrency: DEFAULT_PROVISION_CONCURRENCY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Load from environment variables, falling back to defaults.
    ///
    /// `SERVER_HOST` / `SERVER_PORT` select the service; `CHATLOAD_*` variables
    /// tune the harness.
    pub fn from_env() -> Self {
        let host = std::env::var("SERVER_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port: u16 = env_parse("SERVER_PORT").unwrap_or(DEFAULT_PORT);

        let mut config = Self::for_server(&format!("http://{host}:{port}"));

        if let Some(ms) = env_parse::<u64>("CHATLOAD_WAIT_WINDOW_MS") {
            config.wait_window = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("CHATLOAD_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("CHATLOAD_STABILIZE_SECS") {
            config.stabilize_pause = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("CHATLOAD_PROVISION_CONCURRENCY") {
            if n == 0 {
                warn!("CHATLOAD_PROVISION_CONCURRENCY=0 would stall provisioning, using default {}", DEFAULT_PROVISION_CONCURRENCY);
            } else {
                config.provision_concurrency = n;
            }
        }
        if let Some(secs) = env_parse::<u64>("CHATLOAD_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(secs);
        }

        info!("Target service: {} (ws: {})", config.base_url, config.ws_url);
        config
    }

    /// Rejects settings that would make every operation fail trivially.
    ///
    /// Only plaintext `http://` / `ws://` targets are accepted: neither
    /// transport is built with a TLS stack.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.base_url.starts_with("https://") || self.ws_url.starts_with("wss://") {
            return Err(HarnessError::Config(format!(
                "TLS targets are not supported, use http:// and ws://: {}",
                self.base_url
            )));
        }
        if !self.base_url.starts_with("http://") {
            return Err(HarnessError::Config(format!("base URL must be http://: {}", self.base_url)));
        }
        if !self.ws_url.starts_with("ws://") {
            return Err(HarnessError::Config(format!("ws URL must be ws://: {}", self.ws_url)));
        }
        if self.wait_window.is_zero() {
            return Err(HarnessError::Config("wait window must be non-zero".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(HarnessError::Config("poll interval must be non-zero".into()));
        }
        if self.provision_concurrency == 0 {
            return Err(HarnessError::Config("provision concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// `http://host:port` -> `ws://host:port/api/ws`, `https` -> `wss`.
fn derive_ws_url(base_url: &str) -> String {
    let rest = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base_url}")
    };
    format!("{rest}/api/ws")
}
