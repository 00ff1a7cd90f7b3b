//! Upgrade request parameters and their validation.
//!
//! Every check here runs before any backend socket is opened. A failure is
//! reported to the client as a single text frame carrying the error's
//! `Display` form.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;
use wsproxy_settings::ProxyMode;

/// Rejection reported to the client before the connection is closed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    /// A parameter required by the active mode is absent or empty.
    #[error("missing required param {0}")]
    Missing(&'static str),
    /// `port` is not a number in 1-65535.
    #[error("invalid param port")]
    InvalidPort,
    /// `proxyPass` does not match the configured secret.
    #[error("Bad password")]
    BadPassword,
}

impl ParamError {
    /// Metric label for this rejection.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Missing(_) => "missing_param",
            Self::InvalidPort => "invalid_port",
            Self::BadPassword => "bad_password",
        }
    }
}

/// Query string exactly as the client sent it.
#[derive(Clone, Default, Deserialize)]
pub struct RawParams {
    /// Backend host name or address.
    pub host: Option<String>,
    /// Backend port; `+` prefix requests TLS in passthrough mode.
    pub port: Option<String>,
    /// Nickname to register with (protocol-aware mode).
    pub nick: Option<String>,
    /// Backend server password (protocol-aware mode).
    pub pass: Option<String>,
    /// Shared secret for the proxy itself (passthrough mode).
    #[serde(rename = "proxyPass")]
    pub proxy_pass: Option<String>,
}

impl fmt::Debug for RawParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("nick", &self.nick)
            .field("pass", &self.pass.as_ref().map(|_| "<redacted>"))
            .field("proxy_pass", &self.proxy_pass.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Backend socket kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Plain TCP.
    Plain,
    /// TLS over TCP.
    Tls,
}

impl Transport {
    /// Lowercase name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Tls => "tls",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where to dial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendTarget {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Plain or TLS.
    pub transport: Transport,
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Identity the proxy registers with in protocol-aware mode.
#[derive(Clone, PartialEq, Eq)]
pub struct Registration {
    /// Nickname, also used as username and realname.
    pub nick: String,
    /// Optional server password.
    pub pass: Option<String>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("nick", &self.nick)
            .field("pass", &self.pass.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Validated parameters for one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionParameters {
    /// Backend to dial.
    pub target: BackendTarget,
    /// Present in protocol-aware mode only.
    pub registration: Option<Registration>,
}

impl RawParams {
    /// Validate against the active mode and the configured secret.
    ///
    /// Checks run in order `host`, `port`, `nick` (protocol-aware only), then
    /// the secret (passthrough only), so the first failure reported is
    /// deterministic.
    pub fn validate(
        self,
        mode: ProxyMode,
        secret: Option<&str>,
    ) -> Result<ConnectionParameters, ParamError> {
        let host = required(self.host, "host")?;
        let port = required(self.port, "port")?;
        let (port, transport) = parse_port(&port, mode)?;

        let registration = match mode {
            ProxyMode::Passthrough => {
                if let Some(secret) = secret {
                    if self.proxy_pass.as_deref() != Some(secret) {
                        return Err(ParamError::BadPassword);
                    }
                }
                None
            }
            ProxyMode::ProtocolAware => Some(Registration {
                nick: required(self.nick, "nick")?,
                pass: self.pass.filter(|p| !p.is_empty()),
            }),
        };

        Ok(ConnectionParameters {
            target: BackendTarget {
                host,
                port,
                transport,
            },
            registration,
        })
    }
}

fn required(value: Option<String>, name: &'static str) -> Result<String, ParamError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(ParamError::Missing(name))
}

/// Passthrough: `+` prefix selects TLS. Protocol-aware: always TLS, a `+`
/// prefix is tolerated.
fn parse_port(raw: &str, mode: ProxyMode) -> Result<(u16, Transport), ParamError> {
    let raw = raw.trim();
    let (digits, tls_flag) = match raw.strip_prefix('+') {
        Some(rest) => (rest, true),
        None => (raw, false),
    };
    let port = digits
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or(ParamError::InvalidPort)?;
    let transport = match mode {
        ProxyMode::Passthrough if !tls_flag => Transport::Plain,
        _ => Transport::Tls,
    };
    Ok((port, transport))
}
