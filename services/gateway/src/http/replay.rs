use crate::auth::resolve_principal;
use crate::http::response::{core_error_response, forbidden, unauthorized};
use crate::rooms::user_room;
use crate::state::AppState;
use apix_core::CoreError;
use apix_protocol::http::{ReplayRequest as ReplayRequestDto, ReplayStatusResponse};
use apix_protocol::ServerFrame;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::collections::HashMap;
use uuid::Uuid;

/// `POST /events/replay` -- drives historic events for the caller's tenant
/// back to them over their own `user:{userId}` room, so a client already
/// connected to the Session Gateway receives replayed events as ordinary
/// `event` frames rather than over a side channel (§4.7).
///
/// The replay itself runs in a spawned task; this returns as soon as the
/// job is registered so the caller can start polling `GET .../replay/{id}`
/// without holding the request open for the whole backfill.
pub async fn start_replay(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<ReplayRequestDto>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };
    if !state.policy.allow(&principal, "replay", "event") {
        return forbidden("replay", "event");
    }
    let Some(user_id) = principal.user_id.clone() else {
        return core_error_response(CoreError::InvalidArgument("replay requires a user principal".into()));
    };

    let request = apix_core::ReplayRequest {
        t0: body.from,
        t1: body.to,
        event_types: body.event_types,
        max_events: body.max_events.map(|n| n as usize),
        replay_rate_events_per_sec: body.replay_rate_events_per_sec,
    };
    let retry_policy = apix_protocol::RetryPolicy::default();
    let rooms = state.rooms.clone();
    let room = user_room(&user_id);
    let replay_id = Uuid::new_v4().to_string();
    let spawned_id = replay_id.clone();

    tokio::spawn(async move {
        let result = state
            .replay
            .start_replay(
                &state.log,
                &state.retry,
                &state.delivery,
                &principal,
                spawned_id.clone(),
                request,
                &retry_policy,
                move |event| {
                    let rooms = rooms.clone();
                    let room = room.clone();
                    async move {
                        rooms.broadcast(&room, &ServerFrame::Event { event: Box::new(event) }, None);
                        Ok(())
                    }
                },
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(replay_id = %spawned_id, error = %e, "replay job failed to start");
        }
    });

    (axum::http::StatusCode::ACCEPTED, Json(serde_json::json!({ "replayId": replay_id }))).into_response()
}

pub async fn replay_status(State(state): State<AppState>, Path(replay_id): Path<String>) -> Response {
    match state.replay.get_status(&replay_id) {
        Ok(status) => Json(ReplayStatusResponse {
            replay_id,
            active: status.active,
            progress_pct: f64::from(status.progress_percent),
        })
        .into_response(),
        Err(e) => core_error_response(e),
    }
}

pub async fn stop_replay(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Path(replay_id): Path<String>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };
    if !state.policy.allow(&principal, "replay", "event") {
        return forbidden("replay", "event");
    }
    match state.replay.stop_replay(&replay_id) {
        Ok(()) => axum::http::StatusCode::NO_CONTENT.into_response(),
        Err(e) => core_error_response(e),
    }
}
