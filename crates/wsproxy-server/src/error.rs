//! Bridge error types.

use thiserror::Error;

/// Errors that end a session after the client was accepted.
///
/// None of these are reported to the client; the session simply closes.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// TCP connect (including DNS resolution) failed.
    #[error("failed to connect to {target}: {source}")]
    Dial {
        /// `host:port` that was dialed.
        target: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The target host is not usable as a TLS server name.
    #[error("invalid TLS server name: {0}")]
    ServerName(String),
    /// TLS handshake with the backend failed.
    #[error("TLS handshake with {target} failed: {source}")]
    TlsHandshake {
        /// `host:port` that was dialed.
        target: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// TLS client configuration could not be built.
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
}

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;
