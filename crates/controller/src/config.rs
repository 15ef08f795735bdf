use std::path::Path;

use anyhow::{Context, Result};
use netwatch_protocol::ControllerConfig;

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
pub fn load_config(path: &Path) -> Result<ControllerConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(ControllerConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ControllerConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

/// Environment variables override the file: the DSN family, the token signing
/// secret, the PIN pepper, cache TTLs, and pool knobs.
pub fn apply_env_overrides(config: &mut ControllerConfig) {
    if let Ok(url) = std::env::var("DATABASE_URL")
        && !url.is_empty()
    {
        config.database.url = Some(url);
    }
    if let Ok(key) = std::env::var("KEY")
        && !key.is_empty()
    {
        config.auth.key = Some(key);
    }
    if let Ok(pepper) = std::env::var("PIN_PEPPER")
        && !pepper.is_empty()
    {
        config.auth.pin_pepper = Some(pepper);
    }
    if let Ok(v) = std::env::var("DB_MAX_CONNECTIONS")
        && let Ok(n) = v.parse()
    {
        config.database.max_connections = n;
    }
    if let Ok(v) = std::env::var("NETINFO_CACHE_SECS")
        && let Ok(n) = v.parse()
    {
        config.database.netinfo_cache_secs = n;
    }
    if let Ok(v) = std::env::var("SESSION_TTL_SECS")
        && let Ok(n) = v.parse()
    {
        config.auth.session_ttl_secs = n;
    }
}
