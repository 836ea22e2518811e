//! Settings schema. Every struct is `#[serde(default)]`, so a partial file
//! only overrides the keys it mentions.

use std::collections::BTreeMap;
use std::path::PathBuf;

use courier_core::errors::DEFAULT_TRANSIENT_PATTERNS;
use courier_core::security::TransportEnv;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CourierSettings {
    pub transport: TransportSettings,
    pub supervisor: SupervisorSettings,
    pub logging: LoggingSettings,
}

impl CourierSettings {
    /// Reject combinations the supervisor cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.supervisor;
        if s.dedup_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "supervisor.dedup_capacity must be greater than 0".into(),
            ));
        }
        if s.max_restarts_per_window == 0 {
            return Err(SettingsError::InvalidValue(
                "supervisor.max_restarts_per_window must be greater than 0".into(),
            ));
        }
        if s.base_delay_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "supervisor.base_delay_ms must be greater than 0".into(),
            ));
        }
        if s.sync_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "supervisor.sync_interval_secs must be greater than 0".into(),
            ));
        }
        if s.circuit_max_delay_secs.saturating_mul(1000) < s.circuit_base_delay_ms {
            return Err(SettingsError::InvalidValue(
                "supervisor.circuit_max_delay_secs is below circuit_base_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Non-secret transport options.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransportSettings {
    pub env: TransportEnv,
    /// Directory for the transport's local database, if it keeps one.
    pub storage_path: Option<PathBuf>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            env: TransportEnv::Dev,
            storage_path: None,
        }
    }
}

/// Restart, resync and dedup tuning.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SupervisorSettings {
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
    pub max_restarts_per_window: u32,
    pub restart_window_secs: u64,
    pub circuit_base_delay_ms: u64,
    pub circuit_max_delay_secs: u64,
    pub recovery_grace_secs: u64,
    pub sync_interval_secs: u64,
    pub dedup_capacity: usize,
    pub shutdown_timeout_secs: u64,
    pub transient_error_patterns: Vec<String>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_jitter_ms: 1_000,
            max_restarts_per_window: 5,
            restart_window_secs: 3_600,
            circuit_base_delay_ms: 300_000,
            circuit_max_delay_secs: 3_600,
            recovery_grace_secs: 30,
            sync_interval_secs: 300,
            dedup_capacity: 500,
            shutdown_timeout_secs: 10,
            transient_error_patterns: DEFAULT_TRANSIENT_PATTERNS
                .iter()
                .map(|p| (*p).to_string())
                .collect(),
        }
    }
}

/// Log output options. `RUST_LOG` still wins over `level` when set.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    pub module_levels: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            module_levels: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_restart_policy() {
        let s = SupervisorSettings::default();
        assert_eq!(s.max_restarts_per_window, 5);
        assert_eq!(s.restart_window_secs, 3_600);
        assert_eq!(s.circuit_max_delay_secs, 3_600);
        assert_eq!(s.max_jitter_ms, 1_000);
        assert_eq!(s.sync_interval_secs, 300);
        assert_eq!(s.dedup_capacity, 500);
        assert!(!s.transient_error_patterns.is_empty());
    }

    #[test]
    fn defaults_validate() {
        assert!(CourierSettings::default().validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let json = r#"{"supervisor": {"dedup_capacity": 64}}"#;
        let settings: CourierSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.supervisor.dedup_capacity, 64);
        assert_eq!(settings.supervisor.base_delay_ms, 5_000);
        assert_eq!(settings.transport.env, TransportEnv::Dev);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut settings = CourierSettings::default();
        settings.supervisor.dedup_capacity = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("dedup_capacity"));
    }

    #[test]
    fn circuit_cap_below_base_rejected() {
        let mut settings = CourierSettings::default();
        settings.supervisor.circuit_max_delay_secs = 10;
        settings.supervisor.circuit_base_delay_ms = 60_000;
        assert!(settings.validate().is_err());
    }
}
