use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryMethod {
    Post,
    Put,
    Patch,
}

/// Delivery semantics selected per endpoint (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliverySemantics {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Backoff shape for a retry policy. `Adaptive` is only meaningful to the
/// generic Retry Manager (§4.9); an endpoint's own `retry_policy` normally
/// picks one of the other three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
    Adaptive,
}

/// Retry shape shared by webhook endpoints and the generic Retry Manager.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter as a fraction, e.g. 0.1 for +/-10%. Zero disables jitter.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter: 0.1,
        }
    }
}

/// A registered HTTP destination for webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEndpoint {
    pub endpoint_id: String,
    pub org_id: String,
    pub url: String,
    pub method: DeliveryMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub semantics: DeliverySemantics,
    pub active: bool,
    #[serde(default)]
    pub dlq_enabled: bool,
    /// Shared secret used to HMAC-sign outgoing request bodies, if present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryReceiptStatus {
    Pending,
    Delivered,
    Failed,
    Acknowledged,
}

/// The outcome record for one (event, endpoint) delivery. Immutable once
/// `status` reaches a terminal value (`Delivered`, `Failed`, `Acknowledged`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub receipt_id: String,
    pub event_id: String,
    pub endpoint_id: String,
    pub org_id: String,
    pub status: DeliveryReceiptStatus,
    pub attempts: u32,
    pub first_attempt_at: chrono::DateTime<chrono::Utc>,
    pub last_attempt_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryReceipt {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            DeliveryReceiptStatus::Delivered
                | DeliveryReceiptStatus::Failed
                | DeliveryReceiptStatus::Acknowledged
        )
    }
}
