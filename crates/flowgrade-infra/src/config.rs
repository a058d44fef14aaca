//! Engine configuration loader.
//!
//! Reads `flowgrade.toml` from a directory and deserializes it into
//! [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed, so an engine can always start.

use std::path::Path;

use flowgrade_core::eval::normalize::NormalizationRegistry;
use flowgrade_core::eval::profile::{ProfileError, ProfileRegistry};
use flowgrade_types::config::EngineConfig;

/// File name looked up by [`load_engine_config`].
pub const CONFIG_FILE: &str = "flowgrade.toml";

/// Load engine configuration from `{dir}/flowgrade.toml`.
///
/// - Missing file: returns [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_engine_config(dir: &Path) -> EngineConfig {
    let config_path = dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Build the profile registry for `config`: built-ins plus `[[profiles]]`,
/// every profile validated against the built-in formulas.
pub fn profile_registry(config: &EngineConfig) -> Result<ProfileRegistry, ProfileError> {
    let registry = ProfileRegistry::with_profiles(config.profiles.iter().cloned());
    registry.validate_all(
        &NormalizationRegistry::with_builtins(),
        config.evaluation.weight_tolerance,
    )?;
    tracing::debug!(profiles = ?registry.ids(), "Scoring profiles loaded");
    Ok(registry)
}
