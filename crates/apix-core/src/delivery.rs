use crate::error::{CoreError, CoreResult};
use crate::retry::RetryManager;
use apix_protocol::{
    DeliveryEndpoint, DeliveryMethod, DeliveryReceipt, DeliveryReceiptStatus, DeliverySemantics, Event,
    Principal,
};
use apix_storage::{KvStore, LogAdapter, RelationalStore};
use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const IDEMPOTENCY_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const CIRCUIT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

fn idempotency_key(org_id: &str, event_id: &str, endpoint_id: &str) -> String {
    format!("idempotency:{org_id}:{event_id}:{endpoint_id}")
}

fn dlq_stream_key(org_id: &str) -> String {
    format!("dlq:{org_id}")
}

fn dlq_acked_key(org_id: &str) -> String {
    format!("dlq:{org_id}:acked")
}

#[derive(serde::Serialize)]
struct DlqEntry<'a> {
    event: &'a Event,
    endpoint_id: &'a str,
    reason: &'static str,
    failed_at: chrono::DateTime<Utc>,
}

#[derive(serde::Serialize)]
struct DeliveryEnvelope<'a> {
    event: &'a Event,
    delivery: DeliveryMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

#[derive(serde::Serialize)]
struct DeliveryMeta {
    id: String,
    attempt: u32,
    timestamp: chrono::DateTime<Utc>,
}

/// Ships events to registered HTTP endpoints with the endpoint's chosen
/// delivery semantics (§4.8). Serializes per-`(eventId, endpointId)`
/// delivery via the idempotency guard; deliveries for distinct events may
/// run concurrently.
pub struct DeliveryEngine {
    kv: Arc<dyn KvStore>,
    log: Arc<dyn LogAdapter>,
    relational: Arc<dyn RelationalStore>,
    http: Client,
    /// In-flight serialization lock per (event_id, endpoint_id), so two
    /// concurrent `Deliver` calls for the same pair don't race each
    /// other's idempotency check.
    in_flight: DashMap<(String, String), ()>,
}

impl DeliveryEngine {
    pub fn new(kv: Arc<dyn KvStore>, log: Arc<dyn LogAdapter>, relational: Arc<dyn RelationalStore>) -> Self {
        DeliveryEngine {
            kv,
            log,
            relational,
            http: Client::new(),
            in_flight: DashMap::new(),
        }
    }

    pub async fn register_endpoint(&self, endpoint: DeliveryEndpoint) -> CoreResult<String> {
        self.relational.put_endpoint(&endpoint).await?;
        Ok(endpoint.endpoint_id)
    }

    pub async fn get_endpoint(&self, org_id: &str, endpoint_id: &str) -> CoreResult<DeliveryEndpoint> {
        self.relational
            .get_endpoint(org_id, endpoint_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("endpoint {endpoint_id}")))
    }

    /// List every endpoint registered for a tenant.
    pub async fn list_endpoints(&self, org_id: &str) -> CoreResult<Vec<DeliveryEndpoint>> {
        Ok(self.relational.list_endpoints(org_id).await?)
    }

    pub async fn update_endpoint(
        &self,
        org_id: &str,
        endpoint_id: &str,
        url: Option<String>,
        headers: Option<std::collections::HashMap<String, String>>,
        timeout_ms: Option<u64>,
        retry_policy: Option<apix_protocol::RetryPolicy>,
        active: Option<bool>,
    ) -> CoreResult<DeliveryEndpoint> {
        let mut endpoint = self.get_endpoint(org_id, endpoint_id).await?;
        if let Some(url) = url {
            endpoint.url = url;
        }
        if let Some(headers) = headers {
            endpoint.headers = headers;
        }
        if let Some(timeout_ms) = timeout_ms {
            endpoint.timeout_ms = timeout_ms;
        }
        if let Some(retry_policy) = retry_policy {
            endpoint.retry_policy = retry_policy;
        }
        if let Some(active) = active {
            endpoint.active = active;
        }
        self.relational.put_endpoint(&endpoint).await?;
        Ok(endpoint)
    }

    pub async fn delete_endpoint(&self, org_id: &str, endpoint_id: &str) -> CoreResult<()> {
        self.relational.delete_endpoint(org_id, endpoint_id).await?;
        Ok(())
    }

    /// Deliver `event` to `endpoint`, choosing the attempt loop by
    /// `endpoint.semantics`, and return the resulting receipt.
    pub async fn deliver(
        &self,
        _principal: &Principal,
        retry_manager: &RetryManager,
        event: &Event,
        endpoint: &DeliveryEndpoint,
    ) -> CoreResult<DeliveryReceipt> {
        let lock_key = (event.id.clone(), endpoint.endpoint_id.clone());
        self.in_flight.insert(lock_key.clone(), ());

        let result = match endpoint.semantics {
            DeliverySemantics::AtMostOnce => self.deliver_at_most_once(event, endpoint).await,
            DeliverySemantics::AtLeastOnce => {
                self.deliver_at_least_once(retry_manager, event, endpoint).await
            }
            DeliverySemantics::ExactlyOnce => {
                self.deliver_exactly_once(retry_manager, event, endpoint).await
            }
        };

        if let Ok(receipt) = &result {
            if receipt.status == DeliveryReceiptStatus::Failed && endpoint.dlq_enabled {
                self.append_to_dlq(event, &endpoint.endpoint_id, "max_retries_exceeded").await;
            }
        }

        self.in_flight.remove(&lock_key);
        result
    }

    /// Append an undeliverable event to its tenant's DLQ stream
    /// (`dlq:{orgId}`). Best-effort: a DLQ write failure does not
    /// override the already-persisted failure receipt. Takes a bare
    /// endpoint id rather than `&DeliveryEndpoint` so replay can route
    /// here without resolving a concrete endpoint first.
    pub(crate) async fn append_to_dlq(&self, event: &Event, endpoint_id: &str, reason: &'static str) {
        let entry = DlqEntry {
            event,
            endpoint_id,
            reason,
            failed_at: Utc::now(),
        };
        let payload = serde_json::to_string(&entry).unwrap_or_default();
        if let Err(err) = self
            .log
            .append(&dlq_stream_key(&event.org_id), &[("entry", payload.as_str())])
            .await
        {
            tracing::warn!(org_id = %event.org_id, error = %err, "failed to append to DLQ stream");
        }
    }

    /// Mark a DLQ entry as handled by tombstoning it in the companion
    /// `dlq:{orgId}:acked` set, rather than consumer-group acking the
    /// DLQ stream itself (administrative/manual consumption, not a
    /// cooperating-consumer pipeline).
    pub async fn acknowledge_dlq_entry(&self, org_id: &str, entry_id: &str) -> CoreResult<()> {
        self.kv.sadd(&dlq_acked_key(org_id), entry_id).await?;
        Ok(())
    }

    pub async fn is_dlq_entry_acked(&self, org_id: &str, entry_id: &str) -> CoreResult<bool> {
        Ok(self.kv.sismember(&dlq_acked_key(org_id), entry_id).await?)
    }

    async fn deliver_at_most_once(
        &self,
        event: &Event,
        endpoint: &DeliveryEndpoint,
    ) -> CoreResult<DeliveryReceipt> {
        let now = Utc::now();
        let attempt_result = self.attempt(event, endpoint, 1).await;
        let receipt = self.build_receipt(event, endpoint, 1, now, &attempt_result);
        self.persist_receipt(&receipt).await?;
        Ok(receipt)
    }

    async fn deliver_at_least_once(
        &self,
        retry_manager: &RetryManager,
        event: &Event,
        endpoint: &DeliveryEndpoint,
    ) -> CoreResult<DeliveryReceipt> {
        let first_attempt_at = Utc::now();
        let policy = endpoint.retry_policy;
        let attempts_made = AtomicU32::new(0);
        let circuit_id = format!("delivery:{}", endpoint.endpoint_id);

        let gated = retry_manager
            .execute_with_circuit_breaker(&circuit_id, CIRCUIT_FAILURE_THRESHOLD, CIRCUIT_OPEN_TIMEOUT, || {
                retry_manager.execute_with_retry(&policy, policy.max_attempts, |attempt| {
                    attempts_made.store(attempt, Ordering::SeqCst);
                    async move {
                        let outcome = self.attempt(event, endpoint, attempt).await;
                        if outcome.success {
                            Ok(outcome)
                        } else {
                            Err(outcome)
                        }
                    }
                })
            })
            .await;

        let outcome = match gated {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(outcome)) => outcome,
            Err(CoreError::CircuitOpen(_)) => AttemptOutcome {
                success: false,
                response_code: None,
                error: Some(format!("circuit {circuit_id} is open, delivery skipped")),
            },
            Err(e) => AttemptOutcome {
                success: false,
                response_code: None,
                error: Some(e.to_string()),
            },
        };
        let receipt = self.build_receipt(
            event,
            endpoint,
            attempts_made.load(Ordering::SeqCst).max(1),
            first_attempt_at,
            &outcome,
        );
        self.persist_receipt(&receipt).await?;
        Ok(receipt)
    }

    async fn deliver_exactly_once(
        &self,
        retry_manager: &RetryManager,
        event: &Event,
        endpoint: &DeliveryEndpoint,
    ) -> CoreResult<DeliveryReceipt> {
        let key = idempotency_key(&event.org_id, &event.id, &endpoint.endpoint_id);
        if let Some(existing) = self.kv.get(&key).await? {
            let receipt: DeliveryReceipt = serde_json::from_str(&existing)
                .map_err(|e| CoreError::Fatal(format!("stored idempotency receipt is malformed: {e}")))?;
            return Ok(receipt);
        }

        let receipt = self.deliver_at_least_once(retry_manager, event, endpoint).await?;
        if receipt.status == DeliveryReceiptStatus::Delivered {
            let serialized = serde_json::to_string(&receipt).unwrap_or_default();
            self.kv.set(&key, &serialized, Some(IDEMPOTENCY_TTL)).await?;
        }
        Ok(receipt)
    }

    pub async fn acknowledge(&self, org_id: &str, receipt_id: &str) -> CoreResult<DeliveryReceipt> {
        let mut receipt = self
            .relational
            .get_receipt(org_id, receipt_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("receipt {receipt_id}")))?;

        if receipt.status != DeliveryReceiptStatus::Delivered {
            return Err(CoreError::InvalidArgument(format!(
                "receipt {receipt_id} is not in DELIVERED status"
            )));
        }
        receipt.status = DeliveryReceiptStatus::Acknowledged;
        receipt.acknowledged_at = Some(Utc::now());
        self.relational.put_receipt(&receipt).await?;
        Ok(receipt)
    }

    async fn attempt(&self, event: &Event, endpoint: &DeliveryEndpoint, attempt: u32) -> AttemptOutcome {
        let envelope = DeliveryEnvelope {
            event,
            delivery: DeliveryMeta {
                id: Uuid::new_v4().to_string(),
                attempt,
                timestamp: Utc::now(),
            },
            signature: None,
        };

        let mut body = match serde_json::to_string(&envelope) {
            Ok(body) => body,
            Err(e) => {
                return AttemptOutcome {
                    success: false,
                    response_code: None,
                    error: Some(format!("payload failed to serialize: {e}")),
                }
            }
        };

        if let Some(secret) = &endpoint.signing_secret {
            if let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) {
                mac.update(body.as_bytes());
                let signature = hex::encode(mac.finalize().into_bytes());
                let mut signed: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
                signed["signature"] = serde_json::Value::String(signature);
                body = signed.to_string();
            }
        }

        let started = Instant::now();
        let mut request = match endpoint.method {
            DeliveryMethod::Post => self.http.post(&endpoint.url),
            DeliveryMethod::Put => self.http.put(&endpoint.url),
            DeliveryMethod::Patch => self.http.patch(&endpoint.url),
        };
        for (name, value) in &endpoint.headers {
            request = request.header(name, value);
        }
        request = request
            .timeout(Duration::from_millis(endpoint.timeout_ms))
            .header("content-type", "application/json")
            .body(body);

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                AttemptOutcome {
                    success: status.is_success(),
                    response_code: Some(status.as_u16()),
                    error: if status.is_success() {
                        None
                    } else {
                        Some(format!("endpoint responded {status}"))
                    },
                }
            }
            Err(e) => AttemptOutcome {
                success: false,
                response_code: None,
                error: Some(if e.is_timeout() {
                    format!("timed out after {}ms", started.elapsed().as_millis())
                } else {
                    e.to_string()
                }),
            },
        }
    }

    fn build_receipt(
        &self,
        event: &Event,
        endpoint: &DeliveryEndpoint,
        attempts: u32,
        first_attempt_at: chrono::DateTime<Utc>,
        outcome: &AttemptOutcome,
    ) -> DeliveryReceipt {
        DeliveryReceipt {
            receipt_id: Uuid::new_v4().to_string(),
            event_id: event.id.clone(),
            endpoint_id: endpoint.endpoint_id.clone(),
            org_id: event.org_id.clone(),
            status: if outcome.success {
                DeliveryReceiptStatus::Delivered
            } else {
                DeliveryReceiptStatus::Failed
            },
            attempts,
            first_attempt_at,
            last_attempt_at: Utc::now(),
            acknowledged_at: None,
            response_code: outcome.response_code,
            response_time_ms: None,
            error: outcome.error.clone(),
        }
    }

    async fn persist_receipt(&self, receipt: &DeliveryReceipt) -> CoreResult<()> {
        self.relational.put_receipt(receipt).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct AttemptOutcome {
    success: bool,
    response_code: Option<u16>,
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use apix_protocol::{EventStatus, Priority};
    use apix_storage::LogAdapter as _;
    use apix_test_support::{InMemoryStorage, MockWebhookServer};
    use reqwest::StatusCode;

    fn event() -> Event {
        Event {
            id: Uuid::new_v4().to_string(),
            org_id: "org1".into(),
            user_id: Some("u1".into()),
            session_id: None,
            event_type: "agent_events".into(),
            channel: "chat".into(),
            payload: serde_json::json!({"text": "hi"}),
            sequence_number: 1,
            checksum: "deadbeef".into(),
            created_at: Utc::now(),
            priority: Priority::Normal,
            status: EventStatus::Pending,
            acknowledgment: None,
            retry_count: 0,
            metadata: serde_json::Map::new(),
        }
    }

    fn endpoint(url: String, semantics: DeliverySemantics) -> DeliveryEndpoint {
        DeliveryEndpoint {
            endpoint_id: Uuid::new_v4().to_string(),
            org_id: "org1".into(),
            url,
            method: DeliveryMethod::Post,
            headers: Default::default(),
            timeout_ms: 2_000,
            retry_policy: apix_protocol::RetryPolicy {
                max_attempts: 3,
                backoff: apix_protocol::Backoff::Fixed,
                base_delay_ms: 1,
                max_delay_ms: 5,
                jitter: 0.0,
            },
            semantics,
            active: true,
            dlq_enabled: true,
            signing_secret: None,
        }
    }

    fn principal() -> Principal {
        Principal {
            org_id: "org1".into(),
            org_slug: "org1".into(),
            user_id: Some("u1".into()),
            roles: vec![],
            permissions: vec![],
        }
    }

    #[tokio::test]
    async fn at_most_once_makes_a_single_attempt_and_reports_failure_without_retrying() {
        let server = MockWebhookServer::start(vec![StatusCode::INTERNAL_SERVER_ERROR]).await;
        let storage = Arc::new(InMemoryStorage::new());
        let engine = DeliveryEngine::new(storage.clone(), storage.clone(), storage);
        let retry = RetryManager::new();
        let ep = endpoint(server.url(), DeliverySemantics::AtMostOnce);

        let receipt = engine.deliver(&principal(), &retry, &event(), &ep).await.unwrap();
        assert_eq!(receipt.status, DeliveryReceiptStatus::Failed);
        assert_eq!(receipt.attempts, 1);
        assert_eq!(server.delivery_count().await, 1);
    }

    #[tokio::test]
    async fn at_least_once_retries_until_success() {
        let server = MockWebhookServer::start(vec![
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::OK,
        ])
        .await;
        let storage = Arc::new(InMemoryStorage::new());
        let engine = DeliveryEngine::new(storage.clone(), storage.clone(), storage);
        let retry = RetryManager::new();
        let ep = endpoint(server.url(), DeliverySemantics::AtLeastOnce);

        let receipt = engine.deliver(&principal(), &retry, &event(), &ep).await.unwrap();
        assert_eq!(receipt.status, DeliveryReceiptStatus::Delivered);
        assert_eq!(receipt.attempts, 3);
        assert_eq!(server.delivery_count().await, 3);
    }

    #[tokio::test]
    async fn at_least_once_exhausts_retries_and_routes_to_dlq() {
        let server = MockWebhookServer::start(vec![StatusCode::INTERNAL_SERVER_ERROR]).await;
        let storage = Arc::new(InMemoryStorage::new());
        let engine = DeliveryEngine::new(storage.clone(), storage.clone(), storage.clone());
        let retry = RetryManager::new();
        let ep = endpoint(server.url(), DeliverySemantics::AtLeastOnce);
        let ev = event();

        let receipt = engine.deliver(&principal(), &retry, &ev, &ep).await.unwrap();
        assert_eq!(receipt.status, DeliveryReceiptStatus::Failed);

        let dlq = storage
            .range(&dlq_stream_key("org1"), "-", "+", 10)
            .await
            .unwrap();
        assert_eq!(dlq.len(), 1);
    }

    #[tokio::test]
    async fn exactly_once_skips_redelivery_once_idempotency_index_is_set() {
        let server = MockWebhookServer::start(vec![StatusCode::OK]).await;
        let storage = Arc::new(InMemoryStorage::new());
        let engine = DeliveryEngine::new(storage.clone(), storage.clone(), storage);
        let retry = RetryManager::new();
        let ep = endpoint(server.url(), DeliverySemantics::ExactlyOnce);
        let ev = event();

        let first = engine.deliver(&principal(), &retry, &ev, &ep).await.unwrap();
        let second = engine.deliver(&principal(), &retry, &ev, &ep).await.unwrap();

        assert_eq!(first.status, DeliveryReceiptStatus::Delivered);
        assert_eq!(second.receipt_id, first.receipt_id);
        assert_eq!(server.delivery_count().await, 1);
    }

    #[tokio::test]
    async fn signing_secret_adds_an_hmac_signature_to_the_payload() {
        let server = MockWebhookServer::start(vec![StatusCode::OK]).await;
        let storage = Arc::new(InMemoryStorage::new());
        let engine = DeliveryEngine::new(storage.clone(), storage.clone(), storage);
        let retry = RetryManager::new();
        let mut ep = endpoint(server.url(), DeliverySemantics::AtMostOnce);
        ep.signing_secret = Some("s3cret".into());

        engine.deliver(&principal(), &retry, &event(), &ep).await.unwrap();
        let received = server.received().await;
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert!(body.get("signature").is_some());
    }

    #[tokio::test]
    async fn list_endpoints_reflects_registration_and_deletion() {
        let storage = Arc::new(InMemoryStorage::new());
        let engine = DeliveryEngine::new(storage.clone(), storage.clone(), storage);
        let ep = endpoint("http://example.invalid".into(), DeliverySemantics::AtMostOnce);
        let id = engine.register_endpoint(ep).await.unwrap();

        let listed = engine.list_endpoints("org1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].endpoint_id, id);

        engine.delete_endpoint("org1", &id).await.unwrap();
        assert!(engine.list_endpoints("org1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_endpoint_patches_only_supplied_fields() {
        let storage = Arc::new(InMemoryStorage::new());
        let engine = DeliveryEngine::new(storage.clone(), storage.clone(), storage);
        let ep = endpoint("http://example.invalid".into(), DeliverySemantics::AtMostOnce);
        let original_timeout = ep.timeout_ms;
        let id = engine.register_endpoint(ep).await.unwrap();

        let updated = engine
            .update_endpoint("org1", &id, Some("http://new.invalid".into()), None, None, None, Some(false))
            .await
            .unwrap();
        assert_eq!(updated.url, "http://new.invalid");
        assert_eq!(updated.timeout_ms, original_timeout);
        assert!(!updated.active);
    }

    #[tokio::test]
    async fn acknowledge_transitions_a_delivered_receipt() {
        let server = MockWebhookServer::start(vec![StatusCode::OK]).await;
        let storage = Arc::new(InMemoryStorage::new());
        let engine = DeliveryEngine::new(storage.clone(), storage.clone(), storage);
        let retry = RetryManager::new();
        let ep = endpoint(server.url(), DeliverySemantics::AtMostOnce);

        let receipt = engine.deliver(&principal(), &retry, &event(), &ep).await.unwrap();
        let acked = engine.acknowledge("org1", &receipt.receipt_id).await.unwrap();
        assert_eq!(acked.status, DeliveryReceiptStatus::Acknowledged);
    }
}
