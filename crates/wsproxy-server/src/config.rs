//! Runtime configuration for [`ProxyServer`](crate::server::ProxyServer).

use std::fmt;
use std::time::Duration;

use wsproxy_settings::{ProxyMode, ProxySettings};

/// Everything the listener and sessions need, resolved from settings.
#[derive(Clone)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` auto-assigns).
    pub port: u16,
    /// Pre-relay behavior and required parameters.
    pub mode: ProxyMode,
    /// Liveness sweep interval.
    pub ping_interval: Duration,
    /// Longest backend line accepted.
    pub max_line_bytes: usize,
    /// Per-session outbound client queue depth.
    pub outbound_queue: usize,
    /// Largest inbound WebSocket message accepted.
    pub max_message_bytes: usize,
    /// Verify backend TLS certificates.
    pub tls_verify: bool,
    /// Capabilities requested in protocol-aware mode.
    pub capabilities: Vec<String>,
    /// Shared secret passthrough clients must present, if any.
    pub secret: Option<String>,
}

impl ServerConfig {
    /// Resolve from loaded settings.
    pub fn from_settings(settings: &ProxySettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            mode: server.mode,
            ping_interval: Duration::from_millis(server.ping_interval_ms),
            max_line_bytes: server.max_line_bytes,
            outbound_queue: server.outbound_queue,
            max_message_bytes: server.max_message_bytes,
            tls_verify: settings.backend.tls_verify,
            capabilities: settings.backend.capabilities.clone(),
            secret: settings.auth.secret().map(str::to_string),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ProxySettings::default())
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("mode", &self.mode)
            .field("ping_interval", &self.ping_interval)
            .field("max_line_bytes", &self.max_line_bytes)
            .field("outbound_queue", &self.outbound_queue)
            .field("max_message_bytes", &self.max_message_bytes)
            .field("tls_verify", &self.tls_verify)
            .field("capabilities", &self.capabilities)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
