use serde::{Deserialize, Serialize};

/// Event priority, ordered `LOW < NORMAL < HIGH < CRITICAL < URGENT`.
///
/// The derive order below is load-bearing: `PartialOrd`/`Ord` compare by
/// discriminant, which must match the spec's numeric order for
/// `minPriority` filter clauses (§4.4) and backpressure shedding (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
    Urgent,
}

/// Event processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

/// The central record routed, persisted, and delivered by the gateway.
///
/// `org_id` is immutable once set; any code path that forwards an `Event`
/// across a different `org_id` than the one it was appended under is a
/// fatal invariant violation (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub org_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub event_type: String,
    pub channel: String,
    pub payload: serde_json::Value,
    pub sequence_number: u64,
    pub checksum: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledgment: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// `true` iff `event_type` matches `[A-Za-z0-9_.-]+`.
pub fn is_valid_event_type(event_type: &str) -> bool {
    !event_type.is_empty()
        && event_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Checksum: SHA-256 over the canonical JSON of `payload` with object keys
/// sorted at every nesting level, so the result is stable under
/// key-reordering (§8 round-trip law).
pub fn compute_checksum(payload: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};
    let canonical = canonicalize(payload);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap(), canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_orders_numerically_as_spec_requires() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert!(Priority::High < Priority::Critical);
        assert!(Priority::Critical < Priority::Urgent);
    }

    #[test]
    fn checksum_is_stable_under_key_reordering() {
        let a = json!({"text": "hi", "count": 3});
        let b = json!({"count": 3, "text": "hi"});
        assert_eq!(compute_checksum(&a), compute_checksum(&b));
    }

    #[test]
    fn checksum_differs_for_different_payloads() {
        let a = json!({"text": "hi"});
        let b = json!({"text": "bye"});
        assert_ne!(compute_checksum(&a), compute_checksum(&b));
    }

    #[test]
    fn event_type_validation_matches_spec_pattern() {
        assert!(is_valid_event_type("agent_events"));
        assert!(is_valid_event_type("agent.status-v2"));
        assert!(!is_valid_event_type(""));
        assert!(!is_valid_event_type("agent events"));
        assert!(!is_valid_event_type("agent/events"));
    }
}
