use crate::auth::resolve_principal;
use crate::http::response::{bad_request, core_error_response, forbidden, unauthorized};
use crate::state::AppState;
use apix_core::CoreError;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::collections::HashMap;

/// `GET /sessions/{sessionId}` -- read-only session lookup, scoped to the
/// caller's own tenant (a session belonging to another org is reported as
/// not found rather than leaking its existence).
pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Path(session_id): Path<String>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };
    match state.connections.get(&session_id) {
        Some(session) if session.org_id == principal.org_id => Json(session).into_response(),
        _ => core_error_response(CoreError::NotFound(format!("session {session_id}"))),
    }
}

/// `GET /audit?from=...&to=...&maxEvents=...` -- timeline read over the
/// caller's tenant audit log (§4.10).
pub async fn audit_timeline(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };

    let from = match query.get("from").map(|v| v.parse::<chrono::DateTime<chrono::Utc>>()) {
        Some(Ok(t)) => t,
        Some(Err(_)) => return bad_request("from must be an RFC 3339 timestamp"),
        None => chrono::Utc::now() - chrono::Duration::days(1),
    };
    let to = match query.get("to").map(|v| v.parse::<chrono::DateTime<chrono::Utc>>()) {
        Some(Ok(t)) => t,
        Some(Err(_)) => return bad_request("to must be an RFC 3339 timestamp"),
        None => chrono::Utc::now(),
    };
    let max_events: usize = query.get("maxEvents").and_then(|v| v.parse().ok()).unwrap_or(100);

    match state.audit.query_timeline(&principal.org_id, from, to, max_events).await {
        Ok(records) => Json(serde_json::json!({ "records": records })).into_response(),
        Err(e) => core_error_response(CoreError::from(e)),
    }
}

/// `POST /dlq/{entryId}/ack` -- tombstone a dead-letter entry as handled.
pub async fn acknowledge_dlq_entry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Path(entry_id): Path<String>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };
    if !state.policy.allow(&principal, "acknowledge", "dlq_entry") {
        return forbidden("acknowledge", "dlq_entry");
    }
    match state.delivery.acknowledge_dlq_entry(&principal.org_id, &entry_id).await {
        Ok(()) => axum::http::StatusCode::NO_CONTENT.into_response(),
        Err(e) => core_error_response(e),
    }
}
