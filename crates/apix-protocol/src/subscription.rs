use crate::event::{Event, Priority};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A structured predicate over event fields, evaluated by a fixed
/// interpreter -- never accept code literals from clients (§9).
///
/// All present clauses are ANDed together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_priority: Option<Priority>,
}

impl EventFilter {
    /// `true` iff `event` passes every clause present in this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }
        if let Some(metadata) = &self.metadata {
            for (key, expected) in metadata {
                match event.metadata.get(key) {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                }
            }
        }
        if let Some(min_priority) = self.min_priority {
            if event.priority < min_priority {
                return false;
            }
        }
        true
    }
}

/// A persistent per-(tenant, user, channel) subscription with an optional
/// filter predicate.
///
/// Duplicate `(org_id, user_id, channel)` is permitted only when filters
/// differ; the manager's real dedup key is
/// `(org_id, user_id, channel, filter_hash)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: String,
    pub org_id: String,
    pub user_id: String,
    pub channel: String,
    pub filters: EventFilter,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event(event_type: &str, priority: Priority) -> Event {
        Event {
            id: "e1".into(),
            org_id: "org1".into(),
            user_id: None,
            session_id: None,
            event_type: event_type.into(),
            channel: "chat".into(),
            payload: json!({}),
            sequence_number: 1,
            checksum: "abc".into(),
            created_at: chrono::Utc::now(),
            priority,
            status: Default::default(),
            acknowledgment: None,
            retry_count: 0,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = EventFilter::default();
        assert!(filter.matches(&sample_event("msg", Priority::Low)));
    }

    #[test]
    fn event_types_clause_restricts_match() {
        let filter = EventFilter {
            event_types: Some(vec!["msg".into()]),
            ..Default::default()
        };
        assert!(filter.matches(&sample_event("msg", Priority::Low)));
        assert!(!filter.matches(&sample_event("other", Priority::Low)));
    }

    #[test]
    fn min_priority_clause_is_inclusive_numeric_order() {
        let filter = EventFilter {
            min_priority: Some(Priority::High),
            ..Default::default()
        };
        assert!(!filter.matches(&sample_event("msg", Priority::Normal)));
        assert!(filter.matches(&sample_event("msg", Priority::High)));
        assert!(filter.matches(&sample_event("msg", Priority::Urgent)));
    }

    #[test]
    fn metadata_clause_requires_strict_equality() {
        let mut event = sample_event("msg", Priority::Low);
        event
            .metadata
            .insert("region".into(), json!("us-east"));

        let mut wanted = HashMap::new();
        wanted.insert("region".to_owned(), json!("us-east"));
        let filter = EventFilter {
            metadata: Some(wanted),
            ..Default::default()
        };
        assert!(filter.matches(&event));

        let mut wrong = HashMap::new();
        wrong.insert("region".to_owned(), json!("eu-west"));
        let filter = EventFilter {
            metadata: Some(wrong),
            ..Default::default()
        };
        assert!(!filter.matches(&event));
    }
}
