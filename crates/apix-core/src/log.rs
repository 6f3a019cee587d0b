use crate::error::{CoreError, CoreResult};
use apix_protocol::{compute_checksum, is_valid_event_type, Event, EventStatus, Priority};
use apix_storage::{KvStore, LogAdapter};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DEDUP_TTL: Duration = Duration::from_secs(24 * 3600);
const ORDER_TTL: Duration = Duration::from_secs(3600);

/// Fields the caller supplies to append a new event; the log assigns
/// `id`, `sequence_number`, `checksum` (if absent) and `created_at`.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub org_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub event_type: String,
    pub channel: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub id: Option<String>,
    pub checksum: Option<String>,
    pub dedup: bool,
}

/// The append-only per-tenant log with sequencing, dedup, and ranged
/// replay (§4.6). The canonical record owner -- in-memory copies held by
/// the Event Router, Session Gateway, and Replay Engine are read-only
/// snapshots of what this component returns.
pub struct DurableEventLog {
    log: Arc<dyn LogAdapter>,
    kv: Arc<dyn KvStore>,
}

fn seq_key(org_id: &str) -> String {
    format!("seq:{org_id}")
}

fn dedup_key(org_id: &str, event_type: &str, checksum: &str) -> String {
    format!("dedup:{org_id}:{event_type}:{checksum}")
}

fn order_key(org_id: &str, session_id: &str) -> String {
    format!("order:{org_id}:{session_id}")
}

fn stream_key(org_id: &str, channel: &str) -> String {
    format!("events:{org_id}:{channel}")
}

fn global_stream_key(org_id: &str) -> String {
    format!("events:{org_id}")
}

fn timeline_key(org_id: &str, channel: Option<&str>) -> String {
    match channel {
        Some(channel) => format!("timeline:{org_id}:{channel}"),
        None => format!("timeline:{org_id}"),
    }
}

fn pubsub_channel(org_id: &str, channel: &str) -> String {
    format!("apix:channels:{org_id}:{channel}")
}

fn event_key(org_id: &str, event_id: &str) -> String {
    format!("event:{org_id}:{event_id}")
}

impl DurableEventLog {
    pub fn new(log: Arc<dyn LogAdapter>, kv: Arc<dyn KvStore>) -> Self {
        DurableEventLog { log, kv }
    }

    pub async fn append(&self, draft: NewEvent) -> CoreResult<Event> {
        if !is_valid_event_type(&draft.event_type) {
            return Err(CoreError::InvalidArgument(format!(
                "invalid event type: {}",
                draft.event_type
            )));
        }

        let sequence_number = self.kv.incr(&seq_key(&draft.org_id), None).await? as u64;
        let checksum = draft
            .checksum
            .unwrap_or_else(|| compute_checksum(&draft.payload));

        if draft.dedup {
            let created = self
                .kv
                .set_nx(
                    &dedup_key(&draft.org_id, &draft.event_type, &checksum),
                    "1",
                    Some(DEDUP_TTL),
                )
                .await?;
            if !created {
                return Err(CoreError::DuplicateEvent(format!(
                    "event {} with checksum {checksum} already appended within the dedup window",
                    draft.event_type
                )));
            }
        }

        let event = Event {
            id: draft.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            org_id: draft.org_id.clone(),
            user_id: draft.user_id,
            session_id: draft.session_id,
            event_type: draft.event_type,
            channel: draft.channel.clone(),
            payload: draft.payload,
            sequence_number,
            checksum,
            created_at: Utc::now(),
            priority: draft.priority,
            status: EventStatus::Completed,
            acknowledgment: None,
            retry_count: 0,
            metadata: draft.metadata,
        };

        let serialized = serde_json::to_string(&event)
            .map_err(|e| CoreError::Fatal(format!("event failed to serialize: {e}")))?;
        let fields: [(&str, &str); 1] = [("event", serialized.as_str())];

        self.log.append(&stream_key(&event.org_id, &event.channel), &fields).await?;
        self.log.append(&global_stream_key(&event.org_id), &fields).await?;

        let score = event.created_at.timestamp_millis() as f64;
        self.kv
            .zadd(&timeline_key(&event.org_id, Some(&event.channel)), score, &serialized)
            .await?;
        self.kv
            .zadd(&timeline_key(&event.org_id, None), score, &serialized)
            .await?;

        self.log
            .publish(&pubsub_channel(&event.org_id, &event.channel), &serialized)
            .await?;

        self.kv.set(&event_key(&event.org_id, &event.id), &serialized, None).await?;

        Ok(event)
    }

    /// Direct lookup by event id, for callers (e.g. the deliver-by-id REST
    /// endpoint) that already know which event they want rather than
    /// scanning a time range.
    pub async fn get_by_id(&self, org_id: &str, event_id: &str) -> CoreResult<Event> {
        let raw = self
            .kv
            .get(&event_key(org_id, event_id))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("event {event_id}")))?;
        serde_json::from_str(&raw).map_err(|e| CoreError::Fatal(format!("stored event is malformed: {e}")))
    }

    /// `true` iff `sequence_number` is exactly one more than the last
    /// sequence observed for `(org_id, session_id)`. Out-of-order events
    /// are still accepted at the log level; the result is only reported
    /// upstream so callers may gate their own processing.
    pub async fn order_check(
        &self,
        org_id: &str,
        session_id: &str,
        sequence_number: u64,
    ) -> CoreResult<bool> {
        let key = order_key(org_id, session_id);
        let last: u64 = match self.kv.get(&key).await? {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        self.kv
            .set(&key, &sequence_number.to_string(), Some(ORDER_TTL))
            .await?;
        Ok(sequence_number == last + 1)
    }

    /// Events in non-decreasing `(created_at, sequence_number)` order,
    /// within `[t0, t1]`, scoped to `channel` if given, bounded by `max_n`.
    pub async fn range(
        &self,
        org_id: &str,
        channel: Option<&str>,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        max_n: usize,
    ) -> CoreResult<Vec<Event>> {
        if max_n == 0 {
            return Ok(Vec::new());
        }
        let key = timeline_key(org_id, channel);
        let raw = self
            .kv
            .zrangebyscore(&key, t0.timestamp_millis() as f64, t1.timestamp_millis() as f64, None)
            .await?;
        let mut events: Vec<Event> = raw
            .iter()
            .filter_map(|s| serde_json::from_str::<Event>(s).ok())
            .filter(|e| e.org_id == org_id)
            .collect();
        events.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.sequence_number.cmp(&b.sequence_number))
        });
        events.truncate(max_n);
        Ok(events)
    }

    pub async fn ensure_consumer_group(&self, org_id: &str, channel: &str, group: &str) -> CoreResult<()> {
        self.log.ensure_group(&stream_key(org_id, channel), group).await?;
        Ok(())
    }

    pub async fn consumer_read(
        &self,
        org_id: &str,
        channel: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> CoreResult<Vec<Event>> {
        let entries = self
            .log
            .read_group(&stream_key(org_id, channel), group, consumer, count, block)
            .await?;
        Ok(entries
            .iter()
            .filter_map(|e| e.fields.get("event"))
            .filter_map(|raw| serde_json::from_str::<Event>(raw).ok())
            .filter(|e| e.org_id == org_id)
            .collect())
    }

    pub async fn ack(&self, org_id: &str, channel: &str, group: &str, message_id: &str) -> CoreResult<()> {
        self.log.ack(&stream_key(org_id, channel), group, message_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apix_test_support::InMemoryStorage;
    use serde_json::json;

    fn draft(org: &str, channel: &str, dedup: bool) -> NewEvent {
        NewEvent {
            org_id: org.into(),
            user_id: Some("u1".into()),
            session_id: Some("s1".into()),
            event_type: "msg".into(),
            channel: channel.into(),
            payload: json!({"text": "hi"}),
            priority: Priority::Normal,
            metadata: serde_json::Map::new(),
            id: None,
            checksum: None,
            dedup,
        }
    }

    fn log_with_storage() -> DurableEventLog {
        let storage = Arc::new(InMemoryStorage::new());
        DurableEventLog::new(storage.clone(), storage)
    }

    #[tokio::test]
    async fn append_assigns_monotonically_increasing_sequence_numbers_per_tenant() {
        let log = log_with_storage();
        let e1 = log.append(draft("org1", "chat", false)).await.unwrap();
        let e2 = log.append(draft("org1", "chat", false)).await.unwrap();
        assert_eq!(e1.sequence_number, 1);
        assert_eq!(e2.sequence_number, 2);
    }

    #[tokio::test]
    async fn append_rejects_duplicate_within_dedup_window() {
        let log = log_with_storage();
        log.append(draft("org1", "chat", true)).await.unwrap();
        let err = log.append(draft("org1", "chat", true)).await.unwrap_err();
        assert!(matches!(err, CoreError::DuplicateEvent(_)));
    }

    #[tokio::test]
    async fn range_returns_just_appended_event_within_its_own_timestamp_window() {
        let log = log_with_storage();
        let event = log.append(draft("org1", "chat", false)).await.unwrap();
        let results = log
            .range("org1", Some("chat"), event.created_at, event.created_at, 10)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, event.id);
    }

    #[tokio::test]
    async fn range_never_crosses_tenants() {
        let log = log_with_storage();
        log.append(draft("org1", "chat", false)).await.unwrap();
        let t0 = Utc::now() - chrono::Duration::minutes(1);
        let t1 = Utc::now() + chrono::Duration::minutes(1);
        let results = log.range("org2", Some("chat"), t0, t1, 100).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn max_events_zero_returns_immediately_with_no_events() {
        let log = log_with_storage();
        log.append(draft("org1", "chat", false)).await.unwrap();
        let t0 = Utc::now() - chrono::Duration::minutes(1);
        let t1 = Utc::now() + chrono::Duration::minutes(1);
        let results = log.range("org1", Some("chat"), t0, t1, 0).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn get_by_id_returns_the_appended_event() {
        let log = log_with_storage();
        let event = log.append(draft("org1", "chat", false)).await.unwrap();
        let fetched = log.get_by_id("org1", &event.id).await.unwrap();
        assert_eq!(fetched.id, event.id);
    }

    #[tokio::test]
    async fn get_by_id_reports_not_found_for_an_unknown_id() {
        let log = log_with_storage();
        assert!(log.get_by_id("org1", "nonexistent").await.is_err());
    }

    #[tokio::test]
    async fn order_check_is_true_only_for_the_exact_next_sequence() {
        let log = log_with_storage();
        assert!(log.order_check("org1", "s1", 1).await.unwrap());
        assert!(log.order_check("org1", "s1", 2).await.unwrap());
        assert!(!log.order_check("org1", "s1", 4).await.unwrap());
    }

    #[tokio::test]
    async fn consumer_group_read_then_ack_delivers_appended_events() {
        let log = log_with_storage();
        log.append(draft("org1", "chat", false)).await.unwrap();
        log.ensure_consumer_group("org1", "chat", "workers").await.unwrap();
        let events = log
            .consumer_read("org1", "chat", "workers", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        log.ack("org1", "chat", "workers", &events[0].id).await.unwrap();
    }
}
