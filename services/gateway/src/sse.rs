use crate::auth::resolve_principal;
use crate::http::response::{bad_request, unauthorized};
use crate::rooms::channel_room;
use crate::state::AppState;
use apix_protocol::ServerFrame;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use uuid::Uuid;

const SSE_CHANNEL_CAPACITY: usize = 256;

/// Drops a session's room memberships when its `ReceiverStream` is dropped,
/// so a client that disconnects without a clean close doesn't leak a
/// forever-open room membership (the gateway has no other signal for an
/// SSE client going away).
struct RoomMembershipGuard {
    rooms: Arc<crate::rooms::RoomRegistry>,
    session_id: String,
}

impl Drop for RoomMembershipGuard {
    fn drop(&mut self) {
        self.rooms.leave_all(&self.session_id);
    }
}

/// `GET /api/v1/stream?orgId=...&channels=a,b,c` -- a read-only live feed
/// over the same room fan-out the Session Gateway uses, for clients that
/// only need to observe events and have no use for the WS frame protocol.
pub async fn stream_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(e) => return unauthorized(e.to_string()),
    };

    if let Some(requested_org) = query.get("orgId") {
        if requested_org != &principal.org_id {
            return unauthorized("orgId does not match the authenticated tenant");
        }
    }

    let channels: Vec<String> = query
        .get("channels")
        .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect())
        .unwrap_or_default();
    if channels.is_empty() {
        return bad_request("at least one channel is required");
    }
    for channel in &channels {
        if !apix_protocol::channel::is_valid_channel_name(channel) {
            return bad_request(format!("invalid channel name: {channel}"));
        }
    }

    let session_id = Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel::<ServerFrame>(SSE_CHANNEL_CAPACITY);
    for channel in &channels {
        state.rooms.join(&channel_room(&principal.org_id, channel), &session_id, principal.user_id.clone(), tx.clone());
    }
    drop(tx);

    let guard = RoomMembershipGuard { rooms: state.rooms.clone(), session_id };
    let stream = ReceiverStream::new(rx).map(move |frame| {
        let _keep_alive = &guard;
        let event_type = match &frame {
            ServerFrame::Event { .. } => "event",
            ServerFrame::Heartbeat { .. } => "heartbeat",
            other => event_type_fallback(other),
        };
        match serde_json::to_string(&frame) {
            Ok(json) => Ok::<Event, Infallible>(Event::default().event(event_type).data(json)),
            Err(_) => Ok(Event::default().event("error").data("{}")),
        }
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keepalive"))
        .into_response()
}

fn event_type_fallback(frame: &ServerFrame) -> &'static str {
    match frame {
        ServerFrame::Connected { .. } => "connected",
        ServerFrame::Subscribed { .. } => "subscribed",
        ServerFrame::Unsubscribed { .. } => "unsubscribed",
        ServerFrame::Published { .. } => "published",
        ServerFrame::Pong { .. } => "pong",
        ServerFrame::Error { .. } => "error",
        ServerFrame::Event { .. } | ServerFrame::Heartbeat { .. } => unreachable!(),
    }
}
