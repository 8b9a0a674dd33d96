/// API request handlers

use super::responses::*;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use hostlink_core::{BackendLocation, Runtime, RuntimeStats};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<Runtime>,
}

/// Handler for GET /api/policy
pub async fn get_policy(State(state): State<AppState>) -> Result<Json<PolicyResponse>, AppError> {
    debug!("API: GET /api/policy");

    let snapshot = state.runtime.registry().snapshot();
    let bindings = &state.runtime.config().identities;

    let mut identities = Vec::with_capacity(snapshot.identities.len());
    for (identity, entry) in &snapshot.identities {
        let outbound = entry
            .outbound
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::internal(e.to_string()))?;
        let inbound_from = entry
            .inbound_from
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::internal(e.to_string()))?;

        identities.push(IdentityPolicy {
            identity: identity.to_string(),
            outbound,
            inbound_from,
            resumable_classes: entry.resumable_classes.clone(),
            uids: bindings
                .iter()
                .filter(|b| b.identity == *identity)
                .map(|b| b.uid)
                .collect(),
        });
    }

    Ok(Json(PolicyResponse {
        version: snapshot.version,
        egress: snapshot.egress,
        identities,
    }))
}

/// Handler for GET /api/routes
pub async fn get_routes(State(state): State<AppState>) -> Json<RoutesResponse> {
    debug!("API: GET /api/routes");

    let table = state.runtime.routes().snapshot();
    let routes: Vec<RouteInfo> = table
        .routes
        .iter()
        .map(|(name, backend)| RouteInfo {
            server_name: name.clone(),
            owner: backend.owner.to_string(),
            backend: match &backend.location {
                BackendLocation::Local(path) => format!("local:{}", path.display()),
                BackendLocation::Remote(location) => format!("remote:{}", location),
            },
            proxy_header: backend.proxy_header,
        })
        .collect();

    let total = routes.len();
    Json(RoutesResponse {
        version: table.version,
        routes,
        total,
    })
}

/// Handler for GET /api/sessions
pub async fn get_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    debug!("API: GET /api/sessions");

    let tracker = state.runtime.tracker();
    let sessions = tracker.list().await;
    let total = sessions.len();

    Json(SessionsResponse {
        sessions,
        stats: tracker.stats().await,
        total,
    })
}

/// Handler for POST /api/sessions/:id/abort
pub async fn abort_session(
    State(state): State<AppState>,
    Path(session_id): Path<u64>,
) -> Result<Json<AbortResponse>, AppError> {
    debug!("API: POST /api/sessions/{}/abort", session_id);

    if !state.runtime.tracker().abort(session_id).await {
        return Err(AppError::not_found(format!(
            "no live relayed session {}",
            session_id
        )));
    }
    info!("Session {} aborted via API", session_id);
    Ok(Json(AbortResponse {
        session_id,
        aborted: true,
    }))
}

/// Handler for GET /api/handoffs
pub async fn get_handoffs(State(state): State<AppState>) -> Json<HandoffsResponse> {
    debug!("API: GET /api/handoffs");

    let pending = state.runtime.handoff().pending().await;
    let total = pending.len();
    Json(HandoffsResponse { pending, total })
}

/// Handler for GET /api/credentials
pub async fn get_credentials(State(state): State<AppState>) -> Json<CredentialsResponse> {
    debug!("API: GET /api/credentials");

    let issuer = state.runtime.issuer();
    Json(CredentialsResponse {
        issuer_key_id: issuer.key_id(),
        stats: issuer.stats().await,
        credentials: issuer.cached_credentials().await,
    })
}

/// Handler for GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<RuntimeStats> {
    debug!("API: GET /api/status");
    Json(state.runtime.stats().await)
}

/// Handler for POST /api/reload
pub async fn reload(State(state): State<AppState>) -> Result<Json<ReloadResponse>, AppError> {
    debug!("API: POST /api/reload");

    let report = state
        .runtime
        .reload()
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    info!(
        "Reloaded via API: policy v{}, routes v{}",
        report.policy_version, report.routes_version
    );

    Ok(Json(ReloadResponse {
        policy_version: report.policy_version,
        identities: report.identities,
        routes_version: report.routes_version,
        routes: report.routes,
        services: report.services,
    }))
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    debug!("API: GET /health");
    (StatusCode::OK, "OK")
}

/// Application error type
pub struct AppError {
    message: String,
    status_code: StatusCode,
}

impl AppError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::NOT_FOUND,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API Error: {}", self.message);

        let body = Json(ErrorResponse::new(
            self.message,
            self.status_code.as_u16(),
        ));

        (self.status_code, body).into_response()
    }
}
