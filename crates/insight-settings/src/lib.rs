//! # insight-settings
//!
//! Layered configuration: compiled defaults, then `~/.insight/settings.json`
//! (or an explicit path), then `INSIGHT_*` environment variables.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path, settings_path};
pub use types::*;
