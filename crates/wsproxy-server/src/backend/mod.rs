//! Outbound connections to the IRC backend.

pub mod handshake;
pub mod stream;
pub mod tls;

use std::sync::Arc;

use rustls::ClientConfig;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::listener::{BackendTarget, Transport};

pub use handshake::{AUTHENTICATE, PreRelay, registration_lines};
pub use stream::BackendStream;

/// Dials backends, wrapping the socket in TLS when the target asks for it.
#[derive(Clone)]
pub struct BackendConnector {
    tls: tokio_rustls::TlsConnector,
    verify: bool,
}

impl BackendConnector {
    /// Build a connector. `tls_verify` enables certificate verification
    /// against the web PKI roots.
    pub fn new(tls_verify: bool) -> Result<Self> {
        Ok(Self::from_config(tls::client_config(tls_verify)?, tls_verify))
    }

    /// Build a connector around an existing rustls client config.
    pub fn from_config(config: Arc<ClientConfig>, verify: bool) -> Self {
        Self {
            tls: tokio_rustls::TlsConnector::from(config),
            verify,
        }
    }

    /// Open a connection to `target`.
    pub async fn connect(&self, target: &BackendTarget) -> Result<BackendStream> {
        let addr = target.to_string();
        let tcp = TcpStream::connect((target.host.as_str(), target.port))
            .await
            .map_err(|source| BridgeError::Dial {
                target: addr.clone(),
                source,
            })?;
        let _ = tcp.set_nodelay(true);

        match target.transport {
            Transport::Plain => {
                debug!(backend = %addr, "backend connected");
                Ok(BackendStream::Plain(tcp))
            }
            Transport::Tls => {
                let name = tls::server_name(&target.host)?;
                let stream = self
                    .tls
                    .connect(name, tcp)
                    .await
                    .map_err(|source| BridgeError::TlsHandshake {
                        target: addr.clone(),
                        source,
                    })?;
                let stream = BackendStream::Tls(Box::new(stream));
                debug!(
                    backend = %addr,
                    version = stream.tls_version().unwrap_or("unknown"),
                    "backend connected over TLS"
                );
                Ok(stream)
            }
        }
    }
}

impl std::fmt::Debug for BackendConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnector")
            .field("verify", &self.verify)
            .finish_non_exhaustive()
    }
}
