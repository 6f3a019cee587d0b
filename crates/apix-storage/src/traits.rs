use crate::error::StorageError;
use apix_protocol::{AuditRecord, DeliveryEndpoint, DeliveryReceipt, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// One entry read from a stream: an opaque, monotonically-ordered id
/// (e.g. Redis's `<ms>-<seq>`) plus its field map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// The append-only, consumer-group-capable log primitive the Durable
/// Event Log, Replay Engine, and Connection Manager build on (§4.6).
///
/// Implementations must preserve append order within a single stream key;
/// the caller is responsible for choosing stream keys that match the
/// per-tenant / per-channel key layout in spec.md §6.
#[async_trait]
pub trait LogAdapter: Send + Sync {
    async fn append(
        &self,
        stream_key: &str,
        fields: &[(&str, &str)],
    ) -> Result<String, StorageError>;

    /// Inclusive range read in ascending id order, bounded by `count`.
    async fn range(
        &self,
        stream_key: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError>;

    /// Create `group` on `stream_key` at the beginning of the stream if it
    /// does not already exist. Idempotent.
    async fn ensure_group(&self, stream_key: &str, group: &str) -> Result<(), StorageError>;

    /// Consumer-group read; blocks up to `block` before returning empty.
    async fn read_group(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StorageError>;

    async fn ack(&self, stream_key: &str, group: &str, id: &str) -> Result<(), StorageError>;

    /// Publish a real-time, best-effort notification. The durable log
    /// entry written via `append` remains the authoritative record (§5).
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StorageError>;

    /// Subscribe to a pub/sub channel; messages arrive on the returned
    /// receiver until it is dropped or the connection is lost.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, StorageError>;
}

/// The KeyValue Service primitive: TTL'd values, atomic counters, and
/// sorted sets for timeline indexes (§4.6, §4.10).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;

    /// Atomic "set if absent"; `true` iff this call created the key.
    /// Used for dedup and idempotency indexes, where only the first
    /// writer may proceed (§4.6 step 3, §4.8 EXACTLY_ONCE).
    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Atomically increments `key` and returns the new value. If this is
    /// the first increment (new value == 1) and `ttl` is set, the TTL is
    /// armed in the same round trip.
    async fn incr(&self, key: &str, ttl: Option<Duration>) -> Result<i64, StorageError>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StorageError>;

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StorageError>;

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StorageError>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StorageError>;

    async fn srem(&self, key: &str, member: &str) -> Result<(), StorageError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StorageError>;
}

/// The relational side the core still owns directly: endpoint registry,
/// receipts, the subscription table, and the audit timeline overflow store
/// (spec.md §0, "Persistence"). Backed by Postgres in production via
/// `postgres::PostgresStore`; an in-memory fake backs unit tests.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn put_endpoint(&self, endpoint: &DeliveryEndpoint) -> Result<(), StorageError>;
    async fn get_endpoint(
        &self,
        org_id: &str,
        endpoint_id: &str,
    ) -> Result<Option<DeliveryEndpoint>, StorageError>;
    async fn list_endpoints(&self, org_id: &str) -> Result<Vec<DeliveryEndpoint>, StorageError>;
    async fn delete_endpoint(&self, org_id: &str, endpoint_id: &str) -> Result<(), StorageError>;

    async fn put_receipt(&self, receipt: &DeliveryReceipt) -> Result<(), StorageError>;
    async fn get_receipt(
        &self,
        org_id: &str,
        receipt_id: &str,
    ) -> Result<Option<DeliveryReceipt>, StorageError>;

    async fn put_subscription(&self, subscription: &Subscription) -> Result<(), StorageError>;
    async fn deactivate_subscription(
        &self,
        org_id: &str,
        subscription_id: &str,
    ) -> Result<(), StorageError>;
    async fn list_subscriptions(&self, org_id: &str) -> Result<Vec<Subscription>, StorageError>;

    async fn insert_audit_record(&self, record: &AuditRecord) -> Result<(), StorageError>;
    async fn query_audit_records(
        &self,
        org_id: &str,
        t0: DateTime<Utc>,
        t1: DateTime<Utc>,
        max_n: usize,
    ) -> Result<Vec<AuditRecord>, StorageError>;
}
