//! # wsproxy-server
//!
//! Bridges browser WebSocket clients to line-oriented TCP/TLS backends such
//! as IRC servers.
//!
//! - [`listener`]: upgrade query parameters and their validation
//! - [`backend`]: plain/TLS dialing and the pre-relay handshake
//! - [`frame`]: CR/LF line framing for both directions
//! - [`session`]: one bridged client/backend pair
//! - [`liveness`]: ping/pong supervision and eviction
//! - [`server`]: axum router, `/health`, `/metrics`

#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod health;
pub mod listener;
pub mod liveness;
pub mod metrics;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::ServerConfig;
pub use error::BridgeError;
pub use server::ProxyServer;
