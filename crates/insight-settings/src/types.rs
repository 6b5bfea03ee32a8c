//! Settings sections. Every field has a default so partial files work.

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub analytics: AnalyticsSettings,
    pub search: SearchSettings,
    pub reasoning: ReasoningSettings,
    pub controller: ControllerSettings,
    pub telemetry: TelemetrySettings,
}

/// HTTP boundary and per-request stream settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Per-request thought queue capacity; oldest entries drop when full.
    pub thought_capacity: usize,
    /// Result channel depth; producers wait when it is full.
    pub result_capacity: usize,
    /// Bounded wait on the result channel between thought drains.
    pub poll_interval_ms: u64,
    /// Sessions unused for this long are forgotten.
    pub session_idle_secs: u64,
    /// Most sessions held in memory; the least recently used is evicted.
    pub max_sessions: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5001,
            thought_capacity: 1024,
            result_capacity: 64,
            poll_interval_ms: 50,
            session_idle_secs: 24 * 60 * 60,
            max_sessions: 10_000,
        }
    }
}

impl ServerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

/// Semantic-layer analytics chat service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsSettings {
    pub endpoint: String,
    pub project: String,
    pub location: String,
    pub looker_instance_uri: String,
    pub lookml_model: String,
    pub explore: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub looker_client_id: Option<String>,
    #[serde(skip_serializing)]
    pub looker_client_secret: Option<SecretString>,
    pub system_instruction: String,
    pub timeout_secs: u64,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://geminidataanalytics.googleapis.com".to_string(),
            project: String::new(),
            location: "global".to_string(),
            looker_instance_uri: String::new(),
            lookml_model: "gaming".to_string(),
            explore: "events".to_string(),
            looker_client_id: None,
            looker_client_secret: None,
            system_instruction: "You are a specialized AI data analyst for a mobile gaming \
                company. Your primary function is to answer natural language questions from a \
                user by constructing and executing precise queries against a Looker instance."
                .to_string(),
            timeout_secs: 120,
        }
    }
}

/// Document search service.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub endpoint: String,
    pub page_size: u32,
    pub timeout_secs: u64,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            page_size: 5,
            timeout_secs: 30,
        }
    }
}

/// Reasoning model used by deep analysis.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningSettings {
    pub endpoint: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<SecretString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ReasoningSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-pro".to_string(),
            api_key: None,
            system_instruction: None,
            timeout_secs: 120,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub max_rounds: u32,
    pub pool_size: usize,
    pub tool_timeout_secs: u64,
    pub max_run_duration_secs: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            pool_size: 4,
            tool_timeout_secs: 120,
            max_run_duration_secs: 600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub log_level: String,
    /// `module=level` pairs, e.g. `["insight_engine=debug"]`.
    pub module_levels: Vec<String>,
    pub json: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetrySettings {
    /// Split `module=level` entries; malformed entries are skipped.
    pub fn module_level_pairs(&self) -> Vec<(String, String)> {
        self.module_levels
            .iter()
            .filter_map(|entry| {
                let (module, level) = entry.split_once('=')?;
                let (module, level) = (module.trim(), level.trim());
                (!module.is_empty() && !level.is_empty())
                    .then(|| (module.to_string(), level.to_string()))
            })
            .collect()
    }
}
