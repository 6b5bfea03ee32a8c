//! HTTP handlers for the chat boundary and diagnostics.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use insight_core::ids::{SessionId, UserId};
use insight_core::security::BearerToken;
use insight_core::session::{ensure_session, SessionGate};
use insight_core::tools::CallContext;
use insight_engine::{ChatEngine, ChatPath};
use insight_telemetry::{parse_level, TelemetryGuard};

pub const DEFAULT_USER_ID: &str = "web_user";
pub const DEFAULT_SESSION_ID: &str = "default_session";

/// Shared state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ChatEngine>,
    pub sessions: Arc<dyn SessionGate>,
    pub telemetry: Option<Arc<TelemetryGuard>>,
}

impl AppState {
    pub fn new(engine: Arc<ChatEngine>, sessions: Arc<dyn SessionGate>) -> Self {
        Self {
            engine,
            sessions,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryGuard>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub deep_analysis: bool,
}

impl ChatRequest {
    fn user_id(&self) -> UserId {
        UserId::from_raw(non_blank(&self.user_id).unwrap_or(DEFAULT_USER_ID))
    }

    fn session_id(&self) -> SessionId {
        SessionId::from_raw(non_blank(&self.session_id).unwrap_or(DEFAULT_SESSION_ID))
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let message: String = message.into();
    (status, Json(json!({ "error": message }))).into_response()
}

/// `POST /chat`: stream `THOUGHT:` / `DATA:` / `ERROR:` lines for one
/// question.
pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection, "rejected chat body");
            return error_response(StatusCode::BAD_REQUEST, "Invalid JSON body");
        }
    };
    let Some(message) = non_blank(&request.message).map(str::to_string) else {
        return error_response(StatusCode::BAD_REQUEST, "No message provided");
    };

    let user_id = request.user_id();
    let session_id = request.session_id();
    if let Err(e) = ensure_session(state.sessions.as_ref(), &session_id, &user_id).await {
        error!(session_id = %session_id, error = %e, "session lookup failed");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    let credential = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(BearerToken::from_header);
    let ctx = CallContext::new(session_id, user_id).with_credential(credential);
    let path = ChatPath::from_flag(request.deep_analysis);

    let lines = state
        .engine
        .stream(path, message, ctx)
        .map(|frame| Ok::<_, Infallible>(frame.to_line()));

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(lines),
    )
        .into_response()
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let recent_warnings = state
        .telemetry
        .as_ref()
        .map(|t| t.warnings().len())
        .unwrap_or(0);
    Json(json!({
        "status": "healthy",
        "recent_warnings": recent_warnings,
    }))
}

#[derive(Debug, Deserialize)]
pub struct WarningsQuery {
    #[serde(default = "default_warning_limit")]
    pub limit: usize,
    pub session_id: Option<String>,
}

fn default_warning_limit() -> usize {
    50
}

/// `GET /admin/warnings`: recent warn+ log records, optionally for one
/// session.
pub async fn warnings(State(state): State<AppState>, Query(query): Query<WarningsQuery>) -> Response {
    let Some(telemetry) = &state.telemetry else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "telemetry not initialised");
    };
    let log = telemetry.warnings();
    let records = match &query.session_id {
        Some(session_id) => log.for_session(session_id),
        None => log.recent(query.limit),
    };
    Json(json!({ "warnings": records })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct LogLevelRequest {
    pub module: String,
    pub level: String,
}

/// `PUT /admin/log-level`: change one module's level at runtime.
pub async fn set_log_level(State(state): State<AppState>, Json(req): Json<LogLevelRequest>) -> Response {
    let Some(telemetry) = &state.telemetry else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "telemetry not initialised");
    };
    if req.module.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "module is required");
    }
    let level = parse_level(&req.level);
    telemetry.set_module_level(req.module.trim(), level);
    let levels: Vec<_> = telemetry
        .module_levels()
        .into_iter()
        .map(|(module, level)| json!({ "module": module, "level": level.to_string().to_lowercase() }))
        .collect();
    Json(json!({ "module_levels": levels })).into_response()
}
