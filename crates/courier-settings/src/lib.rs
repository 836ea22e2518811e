//! # courier-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`CourierSettings::default()`]
//! 2. **User file**: `~/.courier/settings.json`; missing keys keep their defaults
//! 3. **Environment variables**: `COURIER_*` overrides (highest priority)
//!
//! Credentials are never read from the file. They come from the environment
//! through [`courier_core::security::TransportConfig::with_env_fallback`].

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, load_settings, load_settings_from_path, settings_path};
pub use types::*;
