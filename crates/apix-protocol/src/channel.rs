use serde::{Deserialize, Serialize};

/// A logical named stream within exactly one tenant.
///
/// Names must match `[A-Za-z0-9_-]+`; validated at creation, not re-checked
/// on every read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: String,
    pub org_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub permissions_blob: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subscribers: Option<u32>,
    pub is_active: bool,
}

/// `true` iff `name` is non-empty and matches `[A-Za-z0-9_-]+`.
pub fn is_valid_channel_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_validation_rejects_invalid_characters() {
        assert!(is_valid_channel_name("chat"));
        assert!(is_valid_channel_name("agent_status-1"));
        assert!(!is_valid_channel_name(""));
        assert!(!is_valid_channel_name("chat room"));
        assert!(!is_valid_channel_name("chat.room"));
    }
}
