// Path: crates/node/src/settings.rs
//! Configuration file loading.

use std::path::Path;

use meridian_types::config::PdConfig;
use meridian_types::{PdError, Result};

/// Loads the config file, or the defaults when no path is given. Every
/// field is optional in the file; omissions fall back to defaults.
pub fn load(path: Option<&Path>) -> Result<PdConfig> {
    let Some(path) = path else {
        return Ok(defaults());
    };
    let raw = std::fs::read_to_string(path)
        .map_err(|e| PdError::InvalidInput(format!("config file {path:?}: {e}")))?;
    toml::from_str(&raw).map_err(|e| PdError::InvalidInput(format!("config file {path:?}: {e}")))
}

fn defaults() -> PdConfig {
    PdConfig {
        name: "pd-1".to_string(),
        client_urls: vec!["http://127.0.0.1:2379".to_string()],
        ..Default::default()
    }
}

/// Startup validation of the assembled configuration.
pub fn validate(config: &PdConfig) -> Result<()> {
    if config.name.is_empty() {
        return Err(PdError::InvalidInput("replica name must not be empty".into()));
    }
    if config.client_urls.is_empty() {
        return Err(PdError::InvalidInput(
            "at least one client url is required".into(),
        ));
    }
    if config.election.leader_lease_secs == 0 {
        return Err(PdError::InvalidInput("leader lease must be positive".into()));
    }
    if config.tso.update_physical_interval_ms == 0 {
        return Err(PdError::InvalidInput(
            "tso update interval must be positive".into(),
        ));
    }
    Ok(())
}
