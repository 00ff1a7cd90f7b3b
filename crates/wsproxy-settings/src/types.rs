//! Settings types.
//!
//! JSON keys are camelCase; every section falls back to its defaults for
//! missing keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use wsproxy_core::logging::LogFormat;

use crate::errors::{Result, SettingsError};

/// Which pre-relay behavior and parameter set the listener applies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyMode {
    /// Relay lines opaquely after announcing `AUTHENTICATE` to the client.
    #[default]
    Passthrough,
    /// Register with the backend (CAP/PASS/NICK/USER) on the client's behalf.
    ProtocolAware,
}

impl ProxyMode {
    /// Stable lowercase name, used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::ProtocolAware => "protocol-aware",
        }
    }
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "passthrough" => Ok(Self::Passthrough),
            "protocol-aware" | "protocol_aware" | "irc" => Ok(Self::ProtocolAware),
            other => Err(format!(
                "unknown proxy mode '{other}' (expected passthrough or protocol-aware)"
            )),
        }
    }
}

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySettings {
    /// Listener and relay settings.
    pub server: ServerSettings,
    /// Outbound connection settings.
    pub backend: BackendSettings,
    /// Shared-secret settings.
    pub auth: AuthSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl ProxySettings {
    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.ping_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.pingIntervalMs must be greater than 0".into(),
            ));
        }
        if self.server.outbound_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "server.outboundQueue must be at least 1".into(),
            ));
        }
        if self.server.max_line_bytes == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxLineBytes must be at least 1".into(),
            ));
        }
        if let Some(cap) = self
            .backend
            .capabilities
            .iter()
            .find(|c| c.is_empty() || c.contains(char::is_whitespace))
        {
            return Err(SettingsError::InvalidValue(format!(
                "backend.capabilities entry '{cap}' must be a single non-empty token"
            )));
        }
        Ok(())
    }
}

/// Listener and relay settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listening port (`0` auto-assigns).
    pub port: u16,
    /// Proxy behavior for every accepted connection.
    pub mode: ProxyMode,
    /// Liveness probe interval in milliseconds.
    pub ping_interval_ms: u64,
    /// Longest backend line accepted before the session is torn down.
    pub max_line_bytes: usize,
    /// Outbound client message queue depth per session.
    pub outbound_queue: usize,
    /// Largest inbound WebSocket message accepted from a client.
    pub max_message_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6676,
            mode: ProxyMode::Passthrough,
            ping_interval_ms: 15_000,
            max_line_bytes: 64 * 1024,
            outbound_queue: 256,
            max_message_bytes: 1024 * 1024,
        }
    }
}

/// Outbound connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendSettings {
    /// Verify backend TLS certificates against the web PKI roots.
    ///
    /// Off by default: backends are chosen by the operator and commonly use
    /// self-signed certificates.
    pub tls_verify: bool,
    /// Capabilities requested with `CAP REQ` in protocol-aware mode, in order.
    pub capabilities: Vec<String>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            tls_verify: false,
            capabilities: vec!["server-time".to_string(), "znc.in/server-time-iso".to_string()],
        }
    }
}

/// Shared-secret settings.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Secret clients must present as `proxyPass`. Empty or absent disables
    /// the check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_pass: Option<String>,
}

impl AuthSettings {
    /// The configured secret, if one is in force.
    pub fn secret(&self) -> Option<&str> {
        self.proxy_pass.as_deref().filter(|s| !s.is_empty())
    }
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("proxy_pass", &self.secret().map(|_| "<redacted>"))
            .finish()
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}
