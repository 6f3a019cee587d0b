use serde::{Deserialize, Serialize};

/// The kind of client terminating a session, as reported at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClientType {
    Web,
    Mobile,
    Sdk,
    Api,
    Service,
    Desktop,
    Cli,
    Extension,
}

/// Session lifecycle state.
///
/// `CONNECTED -> RECONNECTING -> {CONNECTED | FAILED | DISCONNECTED}`,
/// `CONNECTED -> SUSPENDED -> CONNECTED`, and any state can terminate into
/// `DISCONNECTED`, which is terminal for the session identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Connected,
    Reconnecting,
    Suspended,
    Disconnected,
    Failed,
}

/// Heartbeat-derived connection quality, a windowed average of the last
/// 8 heartbeats' latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionQuality {
    Excellent,
    Good,
    Poor,
    Critical,
}

impl SessionQuality {
    /// Classify a latency sample per the fixed thresholds in the spec:
    /// EXCELLENT < 150ms, GOOD < 500ms, POOR < 1500ms, CRITICAL >= 1500ms.
    pub fn from_latency_ms(latency_ms: u64) -> Self {
        if latency_ms < 150 {
            SessionQuality::Excellent
        } else if latency_ms < 500 {
            SessionQuality::Good
        } else if latency_ms < 1500 {
            SessionQuality::Poor
        } else {
            SessionQuality::Critical
        }
    }
}

/// A live bidirectional client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub org_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub client_type: ClientType,
    pub status: SessionStatus,
    pub quality: SessionQuality,
    pub latency_ms: u64,
    pub channels: Vec<String>,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub last_heartbeat_at: chrono::DateTime<chrono::Utc>,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<chrono::DateTime<chrono::Utc>>,
}
