//! Settings loading.
//!
//! Loading flow:
//! 1. Start with compiled [`Settings::default()`]
//! 2. If a settings file exists, merge its values over defaults
//! 3. Apply `INSIGHT_*` environment variables (highest priority); `__`
//!    separates nested keys, e.g. `INSIGHT_CONTROLLER__MAX_ROUNDS=3`

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::Settings;

pub const ENV_PREFIX: &str = "INSIGHT_";

/// Resolve the path to the settings file (`~/.insight/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".insight").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<Settings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings> {
    if path.exists() {
        debug!(?path, "loading settings from file");
    } else {
        debug!(?path, "settings file not found, using defaults");
    }
    from_figment(figment_for(path))
}

/// The layered provider stack, exposed so callers can add layers.
pub fn figment_for(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(Settings::default()))
        .merge(Json::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

pub fn from_figment(figment: Figment) -> Result<Settings> {
    let settings: Settings = figment.extract()?;
    validate(&settings)?;
    Ok(settings)
}

/// Range checks the type system cannot express.
pub fn validate(settings: &Settings) -> Result<()> {
    let c = &settings.controller;
    if c.max_rounds == 0 {
        return Err(invalid("controller.max_rounds must be at least 1"));
    }
    if c.pool_size == 0 {
        return Err(invalid("controller.pool_size must be at least 1"));
    }
    if c.tool_timeout_secs == 0 || c.max_run_duration_secs == 0 {
        return Err(invalid("controller timeouts must be non-zero"));
    }
    let s = &settings.server;
    if s.thought_capacity == 0 || s.result_capacity == 0 {
        return Err(invalid("server channel capacities must be at least 1"));
    }
    if !(1..=10_000).contains(&s.poll_interval_ms) {
        return Err(invalid("server.poll_interval_ms must be within 1..=10000"));
    }
    if s.session_idle_secs == 0 || s.max_sessions == 0 {
        return Err(invalid("server session limits must be non-zero"));
    }
    if settings.search.page_size == 0 {
        return Err(invalid("search.page_size must be at least 1"));
    }
    Ok(())
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_string())
}
