//! Full configuration validation.
//!
//! Validates numeric ranges and cross-field constraints. Each domain has
//! its own submodule; this orchestrator calls them all and collects errors
//! into a single `ConfigError`.

mod room;


use crate::schema::ChorusConfig;
use chorus_common::ConfigError;

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &ChorusConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    room::validate_negotiation(&mut errors, config);
    room::validate_speaking(&mut errors, config);
    room::validate_signaling(&mut errors, config);
    room::validate_supabase(&mut errors, config);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}
