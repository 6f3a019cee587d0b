use crate::event::Event;
use crate::subscription::EventFilter;
use serde::{Deserialize, Serialize};

/// Frames a client may send over the Session Gateway transport (§4.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        channels: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filters: Option<EventFilter>,
    },
    Unsubscribe {
        channels: Vec<String>,
    },
    Publish {
        event_type: String,
        channel: String,
        payload: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    },
    Ping {
        client_ts: i64,
    },
    Ack {
        message_id: String,
    },
}

/// Frames the gateway may send to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        session_id: String,
        org_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Subscribed {
        channels: Vec<String>,
    },
    Unsubscribed {
        channels: Vec<String>,
    },
    Published {
        message_id: String,
        channel: String,
    },
    Event {
        #[serde(flatten)]
        event: Box<Event>,
    },
    Pong {
        ts: i64,
    },
    Heartbeat {
        ts: i64,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerFrame {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_subscribe_round_trips_through_json() {
        let frame = ClientFrame::Subscribe {
            channels: vec!["chat".to_owned()],
            filters: None,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"subscribe\""));
        let parsed: ClientFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn server_frame_error_uses_tagged_shape() {
        let frame = ServerFrame::error("PROTOCOL_ERROR", "bad frame");
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("PROTOCOL_ERROR"));
    }
}
