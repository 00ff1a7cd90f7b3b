//! # wsproxy-settings
//!
//! Configuration for the wsproxy bridge, loaded from layered sources (in
//! priority order, lowest first):
//! 1. **Compiled defaults**: [`ProxySettings::default()`]
//! 2. **Settings file**: `~/.wsproxy/settings.json` or an explicit path,
//!    deep-merged over the defaults
//! 3. **Environment variables**: `PROXY_PASS` and `WSPROXY_*` overrides
//!
//! Command-line flags are applied on top by the binary.
//!
//! # Usage
//!
//! ```no_run
//! let settings = wsproxy_settings::load_settings().unwrap_or_default();
//! println!("listening on {}:{}", settings.server.host, settings.server.port);
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
