use crate::auth::resolve_principal;
use crate::rooms::{channel_room, org_room, role_room, user_room};
use crate::state::AppState;
use apix_core::{CoreError, LogEventInput, NewEvent};
use apix_protocol::{error_codes, ClientFrame, ClientType, Principal, Priority, ServerFrame};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

const MAX_SUBSCRIBE_CHANNELS: usize = 50;
const SESSION_CHANNEL_CAPACITY: usize = 256;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, headers, query))
}

fn client_type_from_query(query: &HashMap<String, String>) -> ClientType {
    match query.get("clientType").map(String::as_str) {
        Some("MOBILE") => ClientType::Mobile,
        Some("SDK") => ClientType::Sdk,
        Some("API") => ClientType::Api,
        Some("SERVICE") => ClientType::Service,
        Some("DESKTOP") => ClientType::Desktop,
        Some("CLI") => ClientType::Cli,
        Some("EXTENSION") => ClientType::Extension,
        _ => ClientType::Web,
    }
}

/// Try to recover a principal from a handshake frame carrying
/// `{"auth": {"token": "..."}}` -- credential source (c) in §4.3/§6, used
/// by clients that cannot set an `authorization` header pre-handshake.
fn principal_from_handshake_frame(state: &AppState, text: &str) -> Option<Principal> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let token = value.get("auth")?.get("token")?.as_str()?;
    state.policy.build_context(token).ok()
}

async fn send_error(socket: &mut WebSocket, code: &str, message: &str) {
    let frame = ServerFrame::error(code, message);
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState, headers: HeaderMap, query: HashMap<String, String>) {
    let principal = match resolve_principal(&state, &headers, &query) {
        Ok(p) => p,
        Err(_) => match socket.recv().await {
            Some(Ok(Message::Text(text))) => match principal_from_handshake_frame(&state, &text) {
                Some(p) => p,
                None => {
                    send_error(&mut socket, error_codes::AUTH_REQUIRED, "missing or invalid credentials").await;
                    let _ = socket.close().await;
                    return;
                }
            },
            _ => {
                send_error(&mut socket, error_codes::AUTH_REQUIRED, "missing or invalid credentials").await;
                let _ = socket.close().await;
                return;
            }
        },
    };

    let session_id = Uuid::new_v4().to_string();
    let client_type = client_type_from_query(&query);
    if let Err(e) = state.connections.register(&session_id, &principal, client_type) {
        send_error(&mut socket, e.code(), &e.to_string()).await;
        let _ = socket.close().await;
        return;
    }

    let (tx, mut rx) = mpsc::channel::<ServerFrame>(SESSION_CHANNEL_CAPACITY);
    state.rooms.join(&org_room(&principal.org_id), &session_id, principal.user_id.clone(), tx.clone());
    if let Some(user_id) = &principal.user_id {
        state.rooms.join(&user_room(user_id), &session_id, Some(user_id.clone()), tx.clone());
    }
    for role in &principal.roles {
        state.rooms.join(&role_room(&principal.org_id, role), &session_id, principal.user_id.clone(), tx.clone());
    }

    let connected = ServerFrame::Connected {
        session_id: session_id.clone(),
        org_id: principal.org_id.clone(),
        user_id: principal.user_id.clone(),
    };
    if let Ok(json) = serde_json::to_string(&connected) {
        if socket.send(Message::Text(json.into())).await.is_err() {
            cleanup(&state, &principal, &session_id).await;
            return;
        }
    }

    let mut heartbeat = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => handle_client_frame(&state, &principal, &session_id, &tx, &mut socket, frame).await,
                            Err(e) => send_error(&mut socket, error_codes::PROTOCOL_ERROR, &format!("malformed frame: {e}")).await,
                        }
                    }
                    Some(Ok(Message::Ping(data))) => { let _ = socket.send(Message::Pong(data)).await; }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            Some(frame) = rx.recv() => {
                if let Ok(json) = serde_json::to_string(&frame) {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                let frame = ServerFrame::Heartbeat { ts: Utc::now().timestamp_millis() };
                if let Ok(json) = serde_json::to_string(&frame) {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    cleanup(&state, &principal, &session_id).await;
}

async fn cleanup(state: &AppState, principal: &Principal, session_id: &str) {
    state.rooms.leave_all(session_id);
    state.connections.evict(session_id, "session ended");
    let _ = state
        .audit
        .log_event(
            principal,
            LogEventInput {
                action: "logout",
                resource_type: "session",
                resource_id: Some(session_id),
                old_values: None,
                new_values: None,
                success: true,
                ip_address: None,
                user_agent: None,
            },
        )
        .await;
}

async fn handle_client_frame(
    state: &AppState,
    principal: &Principal,
    session_id: &str,
    tx: &mpsc::Sender<ServerFrame>,
    socket: &mut WebSocket,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::Subscribe { channels, filters } => {
            handle_subscribe(state, principal, session_id, tx, socket, channels, filters).await;
        }
        ClientFrame::Unsubscribe { channels } => {
            handle_unsubscribe(state, principal, session_id, socket, channels).await;
        }
        ClientFrame::Publish { event_type, channel, payload, metadata } => {
            handle_publish(state, principal, session_id, socket, event_type, channel, payload, metadata).await;
        }
        ClientFrame::Ping { client_ts } => {
            handle_ping(state, session_id, socket, client_ts).await;
        }
        ClientFrame::Ack { message_id } => {
            tracing::debug!(session_id, message_id, "client acked message");
        }
    }
}

async fn handle_subscribe(
    state: &AppState,
    principal: &Principal,
    session_id: &str,
    tx: &mpsc::Sender<ServerFrame>,
    socket: &mut WebSocket,
    channels: Vec<String>,
    filters: Option<apix_protocol::EventFilter>,
) {
    if channels.is_empty() {
        let frame = ServerFrame::Subscribed { channels: Vec::new() };
        if let Ok(json) = serde_json::to_string(&frame) {
            let _ = socket.send(Message::Text(json.into())).await;
        }
        return;
    }
    if channels.len() > MAX_SUBSCRIBE_CHANNELS {
        send_error(socket, error_codes::INVALID_ARGUMENT, "cannot subscribe to more than 50 channels at once").await;
        return;
    }

    let mut accepted = Vec::with_capacity(channels.len());
    for channel in channels {
        if !apix_protocol::channel::is_valid_channel_name(&channel) {
            send_error(socket, error_codes::INVALID_ARGUMENT, &format!("invalid channel name: {channel}")).await;
            continue;
        }
        if !state.policy.allow(principal, "create", "subscription") {
            send_error(socket, error_codes::PERMISSION_DENIED, "not permitted to create subscriptions").await;
            continue;
        }
        match state.subscriptions.create(principal, &channel, filters.clone().unwrap_or_default()).await {
            Ok(_) | Err(CoreError::Conflict(_)) => {
                let _ = state.connections.add_channel(session_id, &channel);
                state.rooms.join(&channel_room(&principal.org_id, &channel), session_id, principal.user_id.clone(), tx.clone());
                accepted.push(channel);
            }
            Err(e) => {
                send_error(socket, e.code(), &e.to_string()).await;
            }
        }
    }

    let frame = ServerFrame::Subscribed { channels: accepted };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
}

async fn handle_unsubscribe(
    state: &AppState,
    principal: &Principal,
    session_id: &str,
    socket: &mut WebSocket,
    channels: Vec<String>,
) {
    if !state.policy.allow(principal, "delete", "subscription") {
        send_error(socket, error_codes::PERMISSION_DENIED, "not permitted to delete subscriptions").await;
        return;
    }
    let _ = state.subscriptions.hydrate_org(&principal.org_id).await;
    for channel in &channels {
        if let Some(user_id) = &principal.user_id {
            for sub in state.subscriptions.subscriptions_for_channel(&principal.org_id, channel) {
                if &sub.user_id == user_id {
                    let _ = state.subscriptions.delete(&principal.org_id, &sub.subscription_id).await;
                }
            }
        }
        state.rooms.leave(&channel_room(&principal.org_id, channel), session_id);
        let _ = state.connections.remove_channel(session_id, channel);
    }

    let frame = ServerFrame::Unsubscribed { channels };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_publish(
    state: &AppState,
    principal: &Principal,
    session_id: &str,
    socket: &mut WebSocket,
    event_type: String,
    channel: String,
    payload: serde_json::Value,
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
) {
    if let Some(meta) = &metadata {
        if let Some(claimed_org) = meta.get("organizationId").and_then(|v| v.as_str()) {
            if claimed_org != principal.org_id {
                send_error(socket, error_codes::CROSS_TENANT_DENIED, "organizationId in payload does not match session's tenant").await;
                return;
            }
        }
    }

    if !apix_protocol::channel::is_valid_channel_name(&channel) {
        send_error(socket, error_codes::INVALID_ARGUMENT, &format!("invalid channel name: {channel}")).await;
        return;
    }

    if !state.policy.allow(principal, "publish", "event") {
        send_error(socket, error_codes::PERMISSION_DENIED, "not permitted to publish events").await;
        return;
    }

    if let Err(e) = state.connections.check_rate(session_id, "ws_message") {
        send_error(socket, e.code(), &e.to_string()).await;
        return;
    }
    if let Err(e) = state
        .quota
        .check_ws_messages(&principal.org_id, u64::from(state.config.default_ws_messages_per_minute))
        .await
    {
        send_error(socket, e.code(), &e.to_string()).await;
        return;
    }

    let draft = NewEvent {
        org_id: principal.org_id.clone(),
        user_id: principal.user_id.clone(),
        session_id: Some(session_id.to_owned()),
        event_type,
        channel: channel.clone(),
        payload,
        priority: Priority::Normal,
        metadata: metadata.unwrap_or_default(),
        id: None,
        checksum: None,
        dedup: false,
    };

    match state.router.route(&state.log, &state.subscriptions, draft).await {
        Ok(deliveries) => {
            let mut message_id = None;
            for delivery in &deliveries {
                if delivery.channel == channel {
                    message_id = Some(delivery.event.id.clone());
                }
                let event_frame = ServerFrame::Event { event: Box::new(delivery.event.clone()) };
                state.rooms.broadcast(
                    &channel_room(&principal.org_id, &delivery.channel),
                    &event_frame,
                    Some(&delivery.recipient_user_ids),
                );
            }
            let frame = ServerFrame::Published {
                message_id: message_id.unwrap_or_default(),
                channel,
            };
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = socket.send(Message::Text(json.into())).await;
            }
            let _ = state
                .audit
                .log_event(
                    principal,
                    LogEventInput {
                        action: "publish",
                        resource_type: "event",
                        resource_id: None,
                        old_values: None,
                        new_values: None,
                        success: true,
                        ip_address: None,
                        user_agent: None,
                    },
                )
                .await;
        }
        Err(e) => {
            send_error(socket, e.code(), &e.to_string()).await;
        }
    }
}

async fn handle_ping(state: &AppState, session_id: &str, socket: &mut WebSocket, client_ts: i64) {
    if let Some(client_send_timestamp) = Utc.timestamp_millis_opt(client_ts).single() {
        let _ = state.connections.heartbeat(session_id, client_send_timestamp);
    }
    let frame = ServerFrame::Pong { ts: Utc::now().timestamp_millis() };
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
}
