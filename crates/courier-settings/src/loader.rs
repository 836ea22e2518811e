//! Settings loading with environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CourierSettings::default()`]
//! 2. If the settings file exists, parse it; absent keys keep their defaults
//! 3. Apply `COURIER_*` environment variable overrides (highest priority)
//! 4. Validate the result

use std::path::{Path, PathBuf};

use courier_core::security::env_vars;
use tracing::debug;

use crate::errors::Result;
use crate::types::CourierSettings;

/// Resolve the path to the settings file (`~/.courier/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".courier").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CourierSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CourierSettings> {
    let mut settings = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)?
    } else {
        debug!(?path, "settings file not found, using defaults");
        CourierSettings::default()
    };

    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut CourierSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable lookup.
///
/// Invalid or out-of-range values are logged and ignored, keeping the
/// file/default value.
pub fn apply_overrides_from<F>(settings: &mut CourierSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Transport ───────────────────────────────────────────────────
    if let Some(v) = env.string(env_vars::TRANSPORT_ENV) {
        match v.parse() {
            Ok(parsed) => settings.transport.env = parsed,
            Err(e) => tracing::warn!(key = env_vars::TRANSPORT_ENV, error = %e, "ignoring env var"),
        }
    }
    if let Some(v) = env.string(env_vars::STORAGE_PATH) {
        settings.transport.storage_path = Some(PathBuf::from(v));
    }

    // ── Supervisor ──────────────────────────────────────────────────
    if let Some(v) = env.u64("COURIER_BASE_DELAY_MS", 10, 600_000) {
        settings.supervisor.base_delay_ms = v;
    }
    if let Some(v) = env.u64("COURIER_MAX_RESTARTS", 1, 100) {
        settings.supervisor.max_restarts_per_window = v as u32;
    }
    if let Some(v) = env.u64("COURIER_CIRCUIT_BASE_DELAY_MS", 10, 3_600_000) {
        settings.supervisor.circuit_base_delay_ms = v;
    }
    if let Some(v) = env.u64("COURIER_SYNC_INTERVAL_SECS", 1, 86_400) {
        settings.supervisor.sync_interval_secs = v;
    }
    if let Some(v) = env.u64("COURIER_DEDUP_CAPACITY", 1, 1_000_000) {
        settings.supervisor.dedup_capacity = v as usize;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("COURIER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("COURIER_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Parse a string as a boolean (`true`/`1`/`yes`/`on`, `false`/`0`/`no`/`off`).
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, min, max, "invalid integer env var, ignoring");
        }
        result
    }
}
