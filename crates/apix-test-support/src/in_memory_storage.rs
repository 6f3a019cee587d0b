use apix_storage::{KvStore, LogAdapter, RelationalStore, StorageError, StreamEntry};
use apix_protocol::{AuditRecord, DeliveryEndpoint, DeliveryReceipt, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// An in-process fake of the Log Service + KeyValue Service, standing in
/// for Redis in unit and fast integration tests. Not a general-purpose
/// Redis reimplementation -- just enough semantics (ordering, TTL,
/// consumer-group cursors, sorted sets, pub/sub fan-out) to exercise the
/// core's logic without a running Redis instance.
///
/// Also backs `RelationalStore` with plain `DashMap`s, so engines that
/// depend on both KV/Log and relational storage can be built from a
/// single `Arc<InMemoryStorage>` in tests, with no Postgres involved.
#[derive(Default)]
pub struct InMemoryStorage {
    streams: DashMap<String, Mutex<Vec<StreamEntry>>>,
    cursors: DashMap<(String, String), Mutex<usize>>,
    kv: DashMap<String, Mutex<(String, Option<Instant>)>>,
    zsets: DashMap<String, Mutex<Vec<(f64, String)>>>,
    sets: DashMap<String, Mutex<HashSet<String>>>,
    subscribers: DashMap<String, Mutex<Vec<mpsc::Sender<String>>>>,
    next_id: AtomicU64,
    endpoints: DashMap<(String, String), DeliveryEndpoint>,
    receipts: DashMap<(String, String), DeliveryReceipt>,
    subscriptions: DashMap<String, Subscription>,
    audit_records: DashMap<String, AuditRecord>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_stream_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{n:020}-0")
    }
}

#[async_trait]
impl LogAdapter for InMemoryStorage {
    async fn append(
        &self,
        stream_key: &str,
        fields: &[(&str, &str)],
    ) -> Result<String, StorageError> {
        let id = self.next_stream_id();
        let entry = StreamEntry {
            id: id.clone(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.streams
            .entry(stream_key.to_owned())
            .or_default()
            .lock()
            .unwrap()
            .push(entry);
        Ok(id)
    }

    async fn range(
        &self,
        stream_key: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let Some(entries) = self.streams.get(stream_key) else {
            return Ok(Vec::new());
        };
        let entries = entries.lock().unwrap();
        let start = if start == "-" { "" } else { start };
        let end = if end == "+" { "\u{10FFFF}" } else { end };
        Ok(entries
            .iter()
            .filter(|e| e.id.as_str() >= start && e.id.as_str() <= end)
            .take(if count == 0 { usize::MAX } else { count })
            .cloned()
            .collect())
    }

    async fn ensure_group(&self, stream_key: &str, group: &str) -> Result<(), StorageError> {
        self.cursors
            .entry((stream_key.to_owned(), group.to_owned()))
            .or_insert_with(|| Mutex::new(0));
        self.streams.entry(stream_key.to_owned()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream_key: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        _block: Duration,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let cursor_entry = self
            .cursors
            .entry((stream_key.to_owned(), group.to_owned()))
            .or_insert_with(|| Mutex::new(0));
        let mut cursor = cursor_entry.lock().unwrap();
        let Some(entries) = self.streams.get(stream_key) else {
            return Ok(Vec::new());
        };
        let entries = entries.lock().unwrap();
        let start = *cursor;
        let take = if count == 0 { usize::MAX } else { count };
        let batch: Vec<StreamEntry> = entries.iter().skip(start).take(take).cloned().collect();
        *cursor = start + batch.len();
        Ok(batch)
    }

    async fn ack(&self, _stream_key: &str, _group: &str, _id: &str) -> Result<(), StorageError> {
        // Cursor-based reads in this fake never redeliver, so ack is a no-op.
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StorageError> {
        if let Some(subs) = self.subscribers.get(channel) {
            let mut subs = subs.lock().unwrap();
            subs.retain(|tx| tx.try_send(payload.to_owned()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StorageError> {
        let (tx, rx) = mpsc::channel(256);
        self.subscribers
            .entry(channel.to_owned())
            .or_default()
            .lock()
            .unwrap()
            .push(tx);
        Ok(rx)
    }
}

fn is_expired(entry: &(String, Option<Instant>)) -> bool {
    matches!(entry.1, Some(at) if Instant::now() >= at)
}

#[async_trait]
impl KvStore for InMemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let Some(cell) = self.kv.get(key) else {
            return Ok(None);
        };
        let guard = cell.lock().unwrap();
        if is_expired(&guard) {
            drop(guard);
            self.kv.remove(key);
            return Ok(None);
        }
        Ok(Some(guard.0.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.kv
            .insert(key.to_owned(), Mutex::new((value.to_owned(), expires_at)));
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StorageError> {
        if let Some(existing) = self.kv.get(key) {
            if !is_expired(&existing.lock().unwrap()) {
                return Ok(false);
            }
        }
        self.set(key, value, ttl).await?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.kv.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StorageError> {
        let cell = self.kv.entry(key.to_owned()).or_insert_with(|| Mutex::new(("0".to_owned(), None)));
        let mut guard = cell.lock().unwrap();
        if is_expired(&guard) {
            *guard = ("0".to_owned(), None);
        }
        let current: i64 = guard.0.parse().unwrap_or(0);
        let next = current + 1;
        let expires_at = if next == 1 { ttl.map(|d| Instant::now() + d) } else { guard.1 };
        *guard = (next.to_string(), expires_at);
        Ok(next)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StorageError> {
        let cell = self.zsets.entry(key.to_owned()).or_default();
        let mut set = cell.lock().unwrap();
        set.retain(|(_, m)| m != member);
        set.push((score, member.to_owned()));
        set.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StorageError> {
        let Some(cell) = self.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let set = cell.lock().unwrap();
        let take = limit.unwrap_or(usize::MAX);
        Ok(set
            .iter()
            .filter(|(score, _)| *score >= min && *score <= max)
            .take(take)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StorageError> {
        self.sets
            .entry(key.to_owned())
            .or_default()
            .lock()
            .unwrap()
            .insert(member.to_owned());
        Ok(())
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StorageError> {
        Ok(self
            .sets
            .get(key)
            .map(|s| s.lock().unwrap().contains(member))
            .unwrap_or(false))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StorageError> {
        if let Some(set) = self.sets.get(key) {
            set.lock().unwrap().remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .sets
            .get(key)
            .map(|s| s.lock().unwrap().iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl RelationalStore for InMemoryStorage {
    async fn put_endpoint(&self, endpoint: &DeliveryEndpoint) -> Result<(), StorageError> {
        self.endpoints.insert(
            (endpoint.org_id.clone(), endpoint.endpoint_id.clone()),
            endpoint.clone(),
        );
        Ok(())
    }

    async fn get_endpoint(
        &self,
        org_id: &str,
        endpoint_id: &str,
    ) -> Result<Option<DeliveryEndpoint>, StorageError> {
        Ok(self
            .endpoints
            .get(&(org_id.to_owned(), endpoint_id.to_owned()))
            .map(|e| e.clone()))
    }

    async fn list_endpoints(&self, org_id: &str) -> Result<Vec<DeliveryEndpoint>, StorageError> {
        Ok(self
            .endpoints
            .iter()
            .filter(|e| e.key().0 == org_id)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn delete_endpoint(&self, org_id: &str, endpoint_id: &str) -> Result<(), StorageError> {
        self.endpoints
            .remove(&(org_id.to_owned(), endpoint_id.to_owned()));
        Ok(())
    }

    async fn put_receipt(&self, receipt: &DeliveryReceipt) -> Result<(), StorageError> {
        self.receipts.insert(
            (receipt.org_id.clone(), receipt.receipt_id.clone()),
            receipt.clone(),
        );
        Ok(())
    }

    async fn get_receipt(
        &self,
        org_id: &str,
        receipt_id: &str,
    ) -> Result<Option<DeliveryReceipt>, StorageError> {
        Ok(self
            .receipts
            .get(&(org_id.to_owned(), receipt_id.to_owned()))
            .map(|r| r.clone()))
    }

    async fn put_subscription(&self, subscription: &Subscription) -> Result<(), StorageError> {
        self.subscriptions
            .insert(subscription.subscription_id.clone(), subscription.clone());
        Ok(())
    }

    async fn deactivate_subscription(
        &self,
        org_id: &str,
        subscription_id: &str,
    ) -> Result<(), StorageError> {
        if let Some(mut sub) = self.subscriptions.get_mut(subscription_id) {
            if sub.org_id == org_id {
                sub.is_active = false;
            }
        }
        Ok(())
    }

    async fn list_subscriptions(&self, org_id: &str) -> Result<Vec<Subscription>, StorageError> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|s| s.org_id == org_id && s.is_active)
            .map(|s| s.value().clone())
            .collect())
    }

    async fn insert_audit_record(&self, record: &AuditRecord) -> Result<(), StorageError> {
        self.audit_records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn query_audit_records(
        &self,
        org_id: &str,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        max_n: usize,
    ) -> Result<Vec<AuditRecord>, StorageError> {
        let mut records: Vec<AuditRecord> = self
            .audit_records
            .iter()
            .filter(|r| r.org_id == org_id && r.timestamp >= t0 && r.timestamp <= t1)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.timestamp);
        records.truncate(max_n);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_preserves_order_and_range_returns_them_back() {
        let store = InMemoryStorage::new();
        store.append("events:org1", &[("a", "1")]).await.unwrap();
        store.append("events:org1", &[("a", "2")]).await.unwrap();
        let got = store.range("events:org1", "-", "+", 10).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].fields.get("a").unwrap(), "1");
        assert_eq!(got[1].fields.get("a").unwrap(), "2");
    }

    #[tokio::test]
    async fn consumer_group_read_does_not_redeliver_across_calls() {
        let store = InMemoryStorage::new();
        store.append("s", &[("a", "1")]).await.unwrap();
        store.ensure_group("s", "g").await.unwrap();
        let first = store.read_group("s", "g", "c1", 10, Duration::from_millis(0)).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = store.read_group("s", "g", "c1", 10, Duration::from_millis(0)).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn set_nx_only_succeeds_once() {
        let store = InMemoryStorage::new();
        assert!(store.set_nx("k", "v1", None).await.unwrap());
        assert!(!store.set_nx("k", "v2", None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("v1".to_owned()));
    }

    #[tokio::test]
    async fn incr_arms_ttl_only_on_first_increment() {
        let store = InMemoryStorage::new();
        let first = store.incr("counter", Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(first, 1);
        let second = store.incr("counter", Some(Duration::from_secs(60))).await.unwrap();
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn pubsub_delivers_published_payload_to_subscriber() {
        let store = InMemoryStorage::new();
        let mut rx = store.subscribe("chan").await.unwrap();
        store.publish("chan", "hello").await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg, "hello");
    }
}
