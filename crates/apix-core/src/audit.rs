use apix_protocol::{AuditCategory, AuditRecord, AuditSeverity, Principal};
use apix_storage::{KvStore, RelationalStore};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const ANOMALY_THRESHOLD: usize = 10;

fn anomaly_window() -> ChronoDuration {
    ChronoDuration::minutes(5)
}

fn derive_severity(action: &str, success: bool) -> AuditSeverity {
    if !success {
        return AuditSeverity::High;
    }
    let action = action.to_ascii_lowercase();
    if action.contains("delete") || action.contains("purge") {
        AuditSeverity::Critical
    } else if action.contains("update") || action.contains("modify") || action.contains("grant") || action.contains("revoke") {
        AuditSeverity::High
    } else if action.contains("create") || action.contains("login") || action.contains("logout") {
        AuditSeverity::Medium
    } else {
        AuditSeverity::Low
    }
}

fn derive_category(action: &str, resource_type: &str) -> AuditCategory {
    let action = action.to_ascii_lowercase();
    let resource_type = resource_type.to_ascii_lowercase();
    if action.contains("login") || action.contains("logout") || action.contains("auth") {
        AuditCategory::Authentication
    } else if action.contains("grant") || action.contains("revoke") || action.contains("permission") {
        AuditCategory::Authorization
    } else if resource_type.contains("audit") || resource_type.contains("quota") {
        AuditCategory::Compliance
    } else if action.contains("create") || action.contains("update") || action.contains("delete") || action.contains("modify") {
        AuditCategory::DataModification
    } else if action.contains("read") || action.contains("list") || action.contains("get") {
        AuditCategory::DataAccess
    } else {
        AuditCategory::SystemAccess
    }
}

pub struct LogEventInput<'a> {
    pub action: &'a str,
    pub resource_type: &'a str,
    pub resource_id: Option<&'a str>,
    pub old_values: Option<serde_json::Value>,
    pub new_values: Option<serde_json::Value>,
    pub success: bool,
    pub ip_address: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

/// Writes immutable audit records keyed by tenant with a derived
/// severity/category, and detects anomalous bursts of high-severity
/// activity from one (org, user) pair (§4.10).
pub struct AuditRing {
    kv: Arc<dyn KvStore>,
    relational: Arc<dyn RelationalStore>,
    retention: Duration,
    /// (org_id, user_id) -> recent high/critical-severity event timestamps,
    /// for the anomaly detector. Bounded to the last `ANOMALY_WINDOW`.
    recent_high_severity: DashMap<(String, String), Vec<chrono::DateTime<Utc>>>,
}

impl AuditRing {
    pub fn new(kv: Arc<dyn KvStore>, relational: Arc<dyn RelationalStore>, retention: Duration) -> Self {
        AuditRing {
            kv,
            relational,
            retention,
            recent_high_severity: DashMap::new(),
        }
    }

    /// Record a mutating action and return the record written, plus
    /// `true` if this call tripped the anomaly detector
    /// (`SUSPICIOUS_ACTIVITY`: >= 10 HIGH/CRITICAL events from one
    /// `(org_id, user_id)` within 5 minutes).
    pub async fn log_event(
        &self,
        principal: &Principal,
        input: LogEventInput<'_>,
    ) -> Result<(AuditRecord, bool), apix_storage::StorageError> {
        let severity = derive_severity(input.action, input.success);
        let category = derive_category(input.action, input.resource_type);
        let record = AuditRecord {
            id: Uuid::new_v4().to_string(),
            org_id: principal.org_id.clone(),
            user_id: principal.user_id.clone(),
            action: input.action.to_owned(),
            resource_type: input.resource_type.to_owned(),
            resource_id: input.resource_id.map(str::to_owned),
            success: input.success,
            severity,
            category,
            old_values: input.old_values,
            new_values: input.new_values,
            timestamp: Utc::now(),
            ip_address: input.ip_address.map(str::to_owned),
            user_agent: input.user_agent.map(str::to_owned),
        };

        let serialized = serde_json::to_string(&record).unwrap_or_default();
        self.kv
            .set(
                &format!("audit:{}:{}", record.org_id, record.id),
                &serialized,
                Some(self.retention),
            )
            .await?;
        self.kv
            .zadd(
                &format!("audit:{}:timeline", record.org_id),
                record.timestamp.timestamp_millis() as f64,
                &serialized,
            )
            .await?;
        // Durable overflow store: the KV timeline is bounded by `retention`,
        // the relational table is not (spec.md §0 audit timeline overflow).
        self.relational.insert_audit_record(&record).await?;

        let mut anomaly = false;
        if let Some(user_id) = &record.user_id {
            if matches!(severity, AuditSeverity::High | AuditSeverity::Critical) || !input.success {
                let key = (record.org_id.clone(), user_id.clone());
                let mut recent = self.recent_high_severity.entry(key).or_default();
                let cutoff = record.timestamp - anomaly_window();
                recent.retain(|t| *t >= cutoff);
                recent.push(record.timestamp);
                anomaly = recent.len() >= ANOMALY_THRESHOLD;
            }
        }

        Ok((record, anomaly))
    }

    /// Read `audit:{orgId}:timeline` in chronological order within
    /// `[t0, t1]`, bounded by `max_n` -- the read side of the monitoring
    /// surface (§6 "read-only monitoring/audit endpoints").
    pub async fn query_timeline(
        &self,
        org_id: &str,
        t0: chrono::DateTime<Utc>,
        t1: chrono::DateTime<Utc>,
        max_n: usize,
    ) -> Result<Vec<AuditRecord>, apix_storage::StorageError> {
        let raw = self
            .kv
            .zrangebyscore(
                &format!("audit:{org_id}:timeline"),
                t0.timestamp_millis() as f64,
                t1.timestamp_millis() as f64,
                if max_n == 0 { None } else { Some(max_n) },
            )
            .await?;
        let from_kv = raw
            .iter()
            .filter_map(|s| serde_json::from_str::<AuditRecord>(s).ok())
            .filter(|record| record.org_id == org_id);

        let overflow_n = if max_n == 0 { usize::MAX } else { max_n };
        let from_relational = self.relational.query_audit_records(org_id, t0, t1, overflow_n).await?;

        let mut merged: Vec<AuditRecord> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for record in from_kv.chain(from_relational) {
            if seen.insert(record.id.clone()) {
                merged.push(record);
            }
        }
        merged.sort_by_key(|r| r.timestamp);
        if max_n != 0 {
            merged.truncate(max_n);
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apix_test_support::InMemoryStorage;

    fn principal() -> Principal {
        Principal {
            org_id: "org1".into(),
            org_slug: "acme".into(),
            user_id: Some("u1".into()),
            roles: vec![],
            permissions: vec![],
        }
    }

    fn input(action: &str, success: bool) -> LogEventInput<'_> {
        LogEventInput {
            action,
            resource_type: "subscription",
            resource_id: Some("sub-1"),
            old_values: None,
            new_values: None,
            success,
            ip_address: None,
            user_agent: None,
        }
    }

    #[tokio::test]
    async fn delete_actions_are_critical_severity() {
        let ring = AuditRing::new(Arc::new(InMemoryStorage::new()), Arc::new(InMemoryStorage::new()), Duration::from_secs(86400));
        let (record, _) = ring.log_event(&principal(), input("delete", true)).await.unwrap();
        assert_eq!(record.severity, AuditSeverity::Critical);
    }

    #[tokio::test]
    async fn failures_are_always_high_severity_regardless_of_action() {
        let ring = AuditRing::new(Arc::new(InMemoryStorage::new()), Arc::new(InMemoryStorage::new()), Duration::from_secs(86400));
        let (record, _) = ring.log_event(&principal(), input("list", false)).await.unwrap();
        assert_eq!(record.severity, AuditSeverity::High);
    }

    #[tokio::test]
    async fn query_timeline_returns_only_the_requesting_tenants_records() {
        let ring = AuditRing::new(Arc::new(InMemoryStorage::new()), Arc::new(InMemoryStorage::new()), Duration::from_secs(86400));
        ring.log_event(&principal(), input("create", true)).await.unwrap();
        let mut other = principal();
        other.org_id = "org2".into();
        ring.log_event(&other, input("create", true)).await.unwrap();

        let t0 = Utc::now() - ChronoDuration::minutes(1);
        let t1 = Utc::now() + ChronoDuration::minutes(1);
        let records = ring.query_timeline("org1", t0, t1, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].org_id, "org1");
    }

    #[tokio::test]
    async fn anomaly_detector_fires_after_ten_high_severity_events_in_window() {
        let ring = AuditRing::new(Arc::new(InMemoryStorage::new()), Arc::new(InMemoryStorage::new()), Duration::from_secs(86400));
        let mut last_anomaly = false;
        for _ in 0..10 {
            let (_, anomaly) = ring.log_event(&principal(), input("delete", true)).await.unwrap();
            last_anomaly = anomaly;
        }
        assert!(last_anomaly);
    }

    #[tokio::test]
    async fn low_severity_events_never_trip_the_anomaly_detector() {
        let ring = AuditRing::new(Arc::new(InMemoryStorage::new()), Arc::new(InMemoryStorage::new()), Duration::from_secs(86400));
        for _ in 0..20 {
            let (_, anomaly) = ring.log_event(&principal(), input("view", true)).await.unwrap();
            assert!(!anomaly);
        }
    }
}
