//! # wsproxy-core
//!
//! Foundation pieces shared by the wsproxy crates:
//!
//! - **Session IDs**: [`ids::SessionId`], a time-ordered newtype used to tag
//!   every log line and tracked connection belonging to one bridged pair
//! - **Logging**: `tracing` subscriber setup and an in-memory capture layer for
//!   tests

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;

pub use ids::SessionId;
