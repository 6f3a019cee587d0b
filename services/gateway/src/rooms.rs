use apix_protocol::{Priority, ServerFrame};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Logical room keys the gateway joins a session into (§4.3): `org:{orgId}`,
/// `user:{userId}`, `role:{orgId}:{role}`, and `channel:{orgId}:{channel}`
/// per subscribed channel.
pub fn org_room(org_id: &str) -> String {
    format!("org:{org_id}")
}

pub fn user_room(user_id: &str) -> String {
    format!("user:{user_id}")
}

pub fn role_room(org_id: &str, role: &str) -> String {
    format!("role:{org_id}:{role}")
}

pub fn channel_room(org_id: &str, channel: &str) -> String {
    format!("channel:{org_id}:{channel}")
}

struct Member {
    user_id: Option<String>,
    sender: mpsc::Sender<ServerFrame>,
}

/// Tracks which sessions belong to which rooms, and broadcasts frames to
/// a room's members -- optionally restricted to a subset of user ids, so
/// per-subscription filter results computed by the Event Router (§4.4)
/// are honored without re-deriving them here.
///
/// The gateway never broadcasts to a client belonging to another tenant:
/// room keys are always namespaced by `orgId`, so cross-tenant leakage
/// would require constructing the wrong key, not a runtime check here.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<String, DashMap<String, Member>>,
    member_rooms: DashMap<String, Vec<String>>,
    dropped_messages: Arc<AtomicU64>,
}

/// Frames with no carried priority (pings, acks, control frames) are
/// treated as `Normal` for backpressure purposes -- droppable, not worth
/// a retry.
fn frame_priority(frame: &ServerFrame) -> Priority {
    match frame {
        ServerFrame::Event { event } => event.priority,
        _ => Priority::Normal,
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total frames dropped because a member's channel was full and the
    /// frame's priority did not warrant a blocking retry.
    pub fn dropped_message_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    pub fn join(&self, room: &str, session_id: &str, user_id: Option<String>, sender: mpsc::Sender<ServerFrame>) {
        self.rooms
            .entry(room.to_owned())
            .or_default()
            .insert(session_id.to_owned(), Member { user_id, sender });
        self.member_rooms
            .entry(session_id.to_owned())
            .or_default()
            .push(room.to_owned());
    }

    pub fn leave(&self, room: &str, session_id: &str) {
        if let Some(members) = self.rooms.get(room) {
            members.remove(session_id);
        }
        if let Some(mut rooms) = self.member_rooms.get_mut(session_id) {
            rooms.retain(|r| r != room);
        }
    }

    /// Remove a session from every room it joined, e.g. on disconnect.
    pub fn leave_all(&self, session_id: &str) {
        if let Some((_, rooms)) = self.member_rooms.remove(session_id) {
            for room in rooms {
                if let Some(members) = self.rooms.get(&room) {
                    members.remove(session_id);
                }
            }
        }
    }

    /// Send `frame` to every member of `room`. When `allowed_user_ids` is
    /// `Some`, only members whose `user_id` appears in it receive the
    /// frame -- this carries the Event Router's per-subscription filter
    /// result (§4.4) through to delivery.
    pub fn broadcast(&self, room: &str, frame: &ServerFrame, allowed_user_ids: Option<&[String]>) {
        let Some(members) = self.rooms.get(room) else {
            return;
        };
        let priority = frame_priority(frame);
        for member in members.iter() {
            if let Some(allowed) = allowed_user_ids {
                match &member.user_id {
                    Some(uid) if allowed.iter().any(|a| a == uid) => {}
                    _ => continue,
                }
            }
            match member.sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(frame)) if priority <= Priority::Normal => {
                    self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(room, session_id = member.key(), "room member's frame channel is full, dropping normal-priority frame");
                    drop(frame);
                }
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    // The channel was full, not closed: worth a bounded blocking
                    // retry off the hot path rather than dropping a frame the
                    // client needs (High/Critical/Urgent).
                    let sender = member.sender.clone();
                    let session_id = member.key().clone();
                    let room = room.to_owned();
                    let dropped = self.dropped_messages.clone();
                    tokio::spawn(async move {
                        let sent = tokio::time::timeout(std::time::Duration::from_millis(500), sender.send(frame))
                            .await
                            .map(|r| r.is_ok())
                            .unwrap_or(false);
                        if !sent {
                            dropped.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(room, session_id, "high-priority frame dropped after blocking retry timed out");
                        }
                    });
                }
            }
        }
    }
}
