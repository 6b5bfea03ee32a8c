mod warnings;

pub use warnings::{WarningLayer, WarningLog, WarningRecord};

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "insight_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout; human-readable output otherwise.
    pub json: bool,
    /// How many warn+ records to keep in memory for diagnostics.
    pub warning_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
            warning_capacity: 256,
        }
    }
}

/// Holds the live filter so levels can change at runtime.
pub struct TelemetryGuard {
    base_level: Level,
    level_filter: Arc<RwLock<Vec<(String, Level)>>>,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
    warnings: Arc<WarningLog>,
}

impl TelemetryGuard {
    /// Change the log level for a specific module at runtime.
    pub fn set_module_level(&self, module: &str, level: Level) {
        let directives = {
            let mut levels = self.level_filter.write();
            if let Some(entry) = levels.iter_mut().find(|(m, _)| m == module) {
                entry.1 = level;
            } else {
                levels.push((module.to_string(), level));
            }
            filter_directives(self.base_level, &levels)
        };
        if let Some(handle) = &self.reload {
            if let Err(e) = handle.modify(|filter| *filter = EnvFilter::new(&directives)) {
                tracing::warn!(error = %e, "failed to reload log filter");
            }
        }
    }

    /// Get current per-module log level overrides.
    pub fn module_levels(&self) -> Vec<(String, Level)> {
        self.level_filter.read().clone()
    }

    /// Recent warn+ records, newest last.
    pub fn warnings(&self) -> Arc<WarningLog> {
        self.warnings.clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup; a second call
/// keeps the first subscriber and returns a guard without a reload handle.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let level_filter = Arc::new(RwLock::new(config.module_levels.clone()));
    let warnings = WarningLog::new(config.warning_capacity);

    let filter_str = filter_directives(config.log_level, &config.module_levels);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    let json_layer = config.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
    });
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(json_layer)
        .with(text_layer)
        .with(WarningLayer::new(warnings.clone()))
        .try_init();

    let reload = match installed {
        Ok(()) => Some(handle),
        Err(e) => {
            eprintln!("insight-telemetry: subscriber already installed: {e}");
            None
        }
    };

    TelemetryGuard {
        base_level: config.log_level,
        level_filter,
        reload,
        warnings,
    }
}

/// Parse a level name such as `"debug"`; unknown names fall back to INFO.
pub fn parse_level(name: &str) -> Level {
    name.trim().parse().unwrap_or(Level::INFO)
}

fn filter_directives(level: Level, module_levels: &[(String, Level)]) -> String {
    let mut filter_str = level.to_string().to_lowercase();
    for (module, level) in module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_include_module_overrides() {
        let d = filter_directives(
            Level::INFO,
            &[
                ("insight_engine".into(), Level::DEBUG),
                ("hyper".into(), Level::WARN),
            ],
        );
        assert_eq!(d, "info,insight_engine=debug,hyper=warn");
    }

    #[test]
    fn parse_level_falls_back() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("loud"), Level::INFO);
    }

    #[test]
    fn default_config() {
        let c = TelemetryConfig::default();
        assert_eq!(c.log_level, Level::INFO);
        assert!(c.json);
        assert!(c.module_levels.is_empty());
    }

    #[test]
    fn module_levels_update_in_place() {
        let guard = TelemetryGuard {
            base_level: Level::INFO,
            level_filter: Arc::new(RwLock::new(vec![("insight_llm".into(), Level::INFO)])),
            reload: None,
            warnings: WarningLog::new(4),
        };
        guard.set_module_level("insight_llm", Level::TRACE);
        guard.set_module_level("insight_server", Level::DEBUG);
        let levels = guard.module_levels();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0], ("insight_llm".to_string(), Level::TRACE));
        assert_eq!(levels[1], ("insight_server".to_string(), Level::DEBUG));
    }
}
