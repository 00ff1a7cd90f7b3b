//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`ProxySettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply environment variable overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;
use wsproxy_core::logging::LogFormat;

use crate::errors::Result;
use crate::types::{ProxyMode, ProxySettings};

/// Resolve the default settings file path (`~/.wsproxy/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".wsproxy").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ProxySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ProxySettings> {
    let mut settings = read_settings_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn read_settings_file(path: &Path) -> Result<ProxySettings> {
    let defaults = serde_json::to_value(ProxySettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply process environment overrides to loaded settings.
pub fn apply_env_overrides(settings: &mut ProxySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Recognized keys:
/// - `PROXY_PASS`: shared secret (empty string disables the check)
/// - `WSPROXY_HOST`, `WSPROXY_PORT`, `WSPROXY_MODE`
/// - `WSPROXY_PING_INTERVAL_MS` (1000..=600000)
/// - `WSPROXY_TLS_VERIFY` (boolean)
/// - `WSPROXY_CAPABILITIES` (comma-separated, empty entries dropped)
/// - `WSPROXY_LOG_LEVEL`, `WSPROXY_LOG_FORMAT`
///
/// Invalid values are logged and ignored.
pub fn apply_overrides<F>(settings: &mut ProxySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = env.raw("PROXY_PASS") {
        settings.auth.proxy_pass = Some(v);
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("WSPROXY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("WSPROXY_PORT", |s| parse_u16_range(s, 1, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = env.parsed("WSPROXY_MODE", |s| s.parse::<ProxyMode>().ok()) {
        settings.server.mode = v;
    }
    if let Some(v) = env.parsed("WSPROXY_PING_INTERVAL_MS", |s| {
        parse_u64_range(s, 1000, 600_000)
    }) {
        settings.server.ping_interval_ms = v;
    }

    // ── Backend ─────────────────────────────────────────────────────
    if let Some(v) = env.parsed("WSPROXY_TLS_VERIFY", parse_bool) {
        settings.backend.tls_verify = v;
    }
    if let Some(v) = env.raw("WSPROXY_CAPABILITIES") {
        settings.backend.capabilities = parse_list(&v);
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("WSPROXY_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.parsed("WSPROXY_LOG_FORMAT", |s| s.parse::<LogFormat>().ok()) {
        settings.logging.format = v;
    }
}

// ── Pure parsing functions ─────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Split a comma-separated list, trimming entries and dropping empty ones.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}
