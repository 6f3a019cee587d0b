use crate::delivery::{DeliveryMethod, DeliverySemantics, RetryPolicy};
use crate::subscription::EventFilter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Frozen HTTP error envelope used by every non-2xx REST response (§7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub error: String,
    pub message: String,
    pub status_code: u16,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub channel: String,
    #[serde(default)]
    pub filters: EventFilter,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionResponse {
    pub subscription_id: String,
    pub channel: String,
    pub filters: EventFilter,
}

/// Body for `POST /events/replay` (§4.7, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayRequest {
    pub from: chrono::DateTime<chrono::Utc>,
    pub to: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
    #[serde(default)]
    pub session_ids: Option<Vec<String>>,
    #[serde(default)]
    pub user_ids: Option<Vec<String>>,
    #[serde(default)]
    pub max_events: Option<u64>,
    #[serde(default)]
    pub replay_rate_events_per_sec: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayStatusResponse {
    pub replay_id: String,
    pub active: bool,
    pub progress_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEndpointRequest {
    pub url: String,
    pub method: DeliveryMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub semantics: DeliverySemantics,
    #[serde(default)]
    pub dlq_enabled: bool,
    #[serde(default)]
    pub signing_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateEndpointRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliverRequest {
    #[serde(default)]
    pub endpoint_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcknowledgeRequest {
    #[serde(default)]
    pub ack_data: Option<serde_json::Value>,
}
