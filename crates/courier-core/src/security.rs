use std::fmt;
use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::SupervisorError;

/// Transport network the session connects to.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransportEnv {
    Local,
    #[default]
    Dev,
    Production,
}

impl fmt::Display for TransportEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Dev => f.write_str("dev"),
            Self::Production => f.write_str("production"),
        }
    }
}

impl std::str::FromStr for TransportEnv {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "dev" | "development" => Ok(Self::Dev),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown transport env: {other}")),
        }
    }
}

/// Environment variable names read at startup.
pub mod env_vars {
    pub const IDENTITY_KEY: &str = "COURIER_IDENTITY_KEY";
    pub const ENCRYPTION_KEY: &str = "COURIER_ENCRYPTION_KEY";
    pub const TRANSPORT_ENV: &str = "COURIER_ENV";
    pub const STORAGE_PATH: &str = "COURIER_STORAGE_PATH";
}

/// Unvalidated transport configuration as handed over by the orchestrator.
#[derive(Clone, Default)]
pub struct TransportConfig {
    pub identity_key: Option<SecretString>,
    pub encryption_key: Option<SecretString>,
    pub env: Option<TransportEnv>,
    pub storage_path: Option<PathBuf>,
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("identity_key", &self.identity_key.as_ref().map(|_| "[REDACTED]"))
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "[REDACTED]"))
            .field("env", &self.env)
            .field("storage_path", &self.storage_path)
            .finish()
    }
}

impl TransportConfig {
    /// Fill any unset field from the process environment.
    pub fn with_env_fallback(mut self) -> Self {
        if self.identity_key.is_none() {
            self.identity_key = read_secret(env_vars::IDENTITY_KEY);
        }
        if self.encryption_key.is_none() {
            self.encryption_key = read_secret(env_vars::ENCRYPTION_KEY);
        }
        if self.env.is_none() {
            self.env = std::env::var(env_vars::TRANSPORT_ENV)
                .ok()
                .and_then(|v| v.parse().ok());
        }
        if self.storage_path.is_none() {
            self.storage_path = std::env::var(env_vars::STORAGE_PATH)
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from);
        }
        self
    }

    /// Check required fields and produce the options passed to the transport.
    pub fn validate(&self) -> Result<SessionOptions, SupervisorError> {
        let identity_key = self
            .identity_key
            .clone()
            .ok_or_else(|| missing("identity key", env_vars::IDENTITY_KEY))?;
        let encryption_key = self
            .encryption_key
            .clone()
            .ok_or_else(|| missing("encryption key", env_vars::ENCRYPTION_KEY))?;
        let env = self
            .env
            .ok_or_else(|| missing("transport env", env_vars::TRANSPORT_ENV))?;

        Ok(SessionOptions {
            identity_key,
            encryption_key,
            env,
            storage_path: self.storage_path.clone(),
        })
    }
}

fn read_secret(var: &str) -> Option<SecretString> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}

fn missing(what: &str, var: &str) -> SupervisorError {
    SupervisorError::Configuration(format!("{what} is required (set {var})"))
}

/// Validated options for opening a transport session.
#[derive(Clone)]
pub struct SessionOptions {
    pub identity_key: SecretString,
    pub encryption_key: SecretString,
    pub env: TransportEnv,
    pub storage_path: Option<PathBuf>,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("env", &self.env)
            .field("storage_path", &self.storage_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn full_config() -> TransportConfig {
        TransportConfig {
            identity_key: Some(SecretString::from("0xidentity")),
            encryption_key: Some(SecretString::from("0xencryption")),
            env: Some(TransportEnv::Production),
            storage_path: None,
        }
    }

    #[test]
    fn validate_accepts_complete_config() {
        let opts = full_config().validate().unwrap();
        assert_eq!(opts.env, TransportEnv::Production);
        assert_eq!(opts.identity_key.expose_secret(), "0xidentity");
        assert!(opts.storage_path.is_none());
    }

    #[test]
    fn validate_reports_missing_identity() {
        let config = TransportConfig {
            identity_key: None,
            ..full_config()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SupervisorError::Configuration(_)));
        assert!(err.to_string().contains("COURIER_IDENTITY_KEY"));
    }

    #[test]
    fn validate_reports_missing_env() {
        let config = TransportConfig {
            env: None,
            ..full_config()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("transport env"));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let debug = format!("{:?}", full_config());
        assert!(!debug.contains("0xidentity"), "secret leaked: {debug}");
        assert!(debug.contains("REDACTED"));

        let opts = full_config().validate().unwrap();
        let debug = format!("{opts:?}");
        assert!(!debug.contains("0xencryption"), "secret leaked: {debug}");
    }

    #[test]
    fn transport_env_parsing() {
        assert_eq!("prod".parse::<TransportEnv>().unwrap(), TransportEnv::Production);
        assert_eq!(" DEV ".parse::<TransportEnv>().unwrap(), TransportEnv::Dev);
        assert!("mainnet".parse::<TransportEnv>().is_err());
    }

    #[test]
    fn transport_env_serde() {
        let json = serde_json::to_string(&TransportEnv::Local).unwrap();
        assert_eq!(json, r#""local""#);
        let parsed: TransportEnv = serde_json::from_str(r#""production""#).unwrap();
        assert_eq!(parsed, TransportEnv::Production);
    }
}
