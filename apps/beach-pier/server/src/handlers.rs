use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use beach_pier_core::{Message, MessageType};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::RelayError, state::RelayState};

/// Body of a relay POST. `type` and `src` come from the path and are
/// ignored if present.
#[derive(Debug, Deserialize)]
struct RelayBody {
    #[serde(default)]
    dst: Option<String>,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Serialize)]
struct RelayErrorBody {
    success: bool,
    reason: &'static str,
}

/// Error half of the HTTP relay endpoints.
#[derive(Debug)]
pub struct RelayHttpError {
    status: StatusCode,
    reason: &'static str,
}

impl RelayHttpError {
    fn new(status: StatusCode, reason: &'static str) -> Self {
        Self { status, reason }
    }

    fn unauthorized(reason: &'static str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, reason)
    }

    fn not_found(reason: &'static str) -> Self {
        Self::new(StatusCode::NOT_FOUND, reason)
    }

    fn bad_request(reason: &'static str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, reason)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for RelayHttpError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(RelayErrorBody {
                success: false,
                reason: self.reason,
            }),
        )
            .into_response()
    }
}

impl From<RelayError> for RelayHttpError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Routing(_) => Self::not_found("destination_not_found"),
            RelayError::Protocol(_) => Self::bad_request("invalid_message"),
            RelayError::Auth(_) => Self::unauthorized("unauthorized"),
            RelayError::Capacity(_) => Self::new(StatusCode::SERVICE_UNAVAILABLE, "capacity"),
            RelayError::Transport(_) => Self::new(StatusCode::BAD_GATEWAY, "transport"),
        }
    }
}

fn ensure_key(state: &RelayState, key: &str) -> Result<(), RelayHttpError> {
    if state.key_matches(key) {
        Ok(())
    } else {
        Err(RelayHttpError::unauthorized("invalid_key"))
    }
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /metrics - Prometheus exposition, when a recorder is installed.
pub async fn metrics_handler(State(state): State<RelayState>) -> Response {
    match state.render_metrics() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /:key/id - hands out a fresh client id.
pub async fn generate_id(
    State(state): State<RelayState>,
    Path(key): Path<String>,
) -> Result<String, RelayHttpError> {
    ensure_key(&state, &key)?;
    Ok(Uuid::new_v4().to_string())
}

/// GET /:key/peers - ids of every registered client, if discovery is on.
pub async fn list_peers(
    State(state): State<RelayState>,
    Path(key): Path<String>,
) -> Result<Json<Vec<String>>, RelayHttpError> {
    ensure_key(&state, &key)?;
    if !state.config.allow_discovery {
        return Err(RelayHttpError::unauthorized("discovery_disabled"));
    }
    Ok(Json(state.registry.list_ids()))
}

/// POST /:key/:id/:token/:kind - one-shot relay of a negotiation message on
/// behalf of a registered client.
pub async fn relay_message(
    State(state): State<RelayState>,
    Path((key, id, token, kind)): Path<(String, String, String, String)>,
    body: Bytes,
) -> Result<Json<Value>, RelayHttpError> {
    ensure_key(&state, &key)?;

    let kind = MessageType::from_relay_kind(&kind)
        .ok_or_else(|| RelayHttpError::bad_request("unsupported_message_type"))?;

    let source = state
        .registry
        .get_by_id(&id)
        .ok_or_else(|| RelayHttpError::not_found("source_not_found"))?;
    if !source.token_matches(&token) {
        warn!(client_id = %id, "relay request with invalid token");
        return Err(RelayHttpError::unauthorized("invalid_token"));
    }

    let body: RelayBody = serde_json::from_slice(&body).map_err(|err| {
        debug!(error = %err, "invalid relay body");
        RelayHttpError::bad_request("invalid_message")
    })?;
    let message = Message {
        kind,
        src: Some(id),
        dst: body.dst,
        payload: body.payload,
    };

    state.router.route(&message)?;
    Ok(Json(json!({ "status": "ok" })))
}
