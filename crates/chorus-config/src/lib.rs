//! chorus configuration system.
//!
//! Provides TOML-based configuration with full validation. All config
//! sections use defaults so partial configs work out of the box.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use chorus_config::{load_config, config_to_json};
//!
//! let config = load_config().expect("failed to load config");
//! let json = config_to_json(&config);
//! println!("{json}");
//! ```

pub mod schema;
pub mod toml_loader;
pub mod validation;

pub use schema::{ChorusConfig, LogLevel, CONFIG_SCHEMA_VERSION};

use chorus_common::ConfigError;
use std::path::Path;

/// Load config from the platform default path and validate it.
///
/// Creates `config.toml` in the OS config directory when none exists.
pub fn load_config() -> Result<ChorusConfig, ConfigError> {
    let config = toml_loader::load_default()?;
    validation::validate(&config)?;
    Ok(config)
}

/// Load config from an explicit path and validate it.
pub fn load_config_from(path: &Path) -> Result<ChorusConfig, ConfigError> {
    let config = toml_loader::load_from_path(path)?;
    validation::validate(&config)?;
    Ok(config)
}

/// Serialize a config to a pretty-printed JSON string.
///
/// Secrets are skipped so the output is safe to log.
pub fn config_to_json(config: &ChorusConfig) -> String {
    let mut redacted = config.clone();
    if !redacted.supabase.api_key.is_empty() {
        redacted.supabase.api_key = "[REDACTED]".into();
    }
    if redacted.supabase.access_token.is_some() {
        redacted.supabase.access_token = Some("[REDACTED]".into());
    }
    serde_json::to_string_pretty(&redacted)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize config: {e}\"}}"))
}
