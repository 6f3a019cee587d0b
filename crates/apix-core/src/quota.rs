use crate::error::{CoreError, CoreResult};
use apix_storage::KvStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Per-tenant and per-session counters (API calls/hour, messages/minute,
/// resource counts) backed by the KeyValue Service's atomic `incr` (§4
/// component table, "Rate & Quota"; key layout in spec.md §6).
pub struct QuotaManager {
    kv: Arc<dyn KvStore>,
}

impl QuotaManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        QuotaManager { kv }
    }

    /// Increment `quota:{org_id}:api_calls:{hourEpoch}` and enforce `limit`.
    pub async fn check_api_calls(&self, org_id: &str, limit: u64) -> CoreResult<()> {
        let hour_epoch = Utc::now().timestamp() / 3600;
        let key = format!("quota:{org_id}:api_calls:{hour_epoch}");
        let count = self.kv.incr(&key, Some(Duration::from_secs(3600))).await?;
        if count as u64 > limit {
            return Err(CoreError::QuotaExceeded(format!(
                "org {org_id} exceeded {limit} API calls/hour"
            )));
        }
        Ok(())
    }

    /// Increment `quota:{org_id}:ws_messages:{minuteEpoch}` and enforce `limit`.
    pub async fn check_ws_messages(&self, org_id: &str, limit: u64) -> CoreResult<()> {
        let minute_epoch = Utc::now().timestamp() / 60;
        let key = format!("quota:{org_id}:ws_messages:{minute_epoch}");
        let count = self.kv.incr(&key, Some(Duration::from_secs(60))).await?;
        if count as u64 > limit {
            return Err(CoreError::QuotaExceeded(format!(
                "org {org_id} exceeded {limit} WS messages/minute"
            )));
        }
        Ok(())
    }

    /// Track a non-time-windowed resource count (e.g. active endpoints,
    /// active subscriptions) against `limit`.
    pub async fn check_resource_count(&self, org_id: &str, resource: &str, limit: u64) -> CoreResult<u64> {
        let key = format!("quota:{org_id}:usage:{resource}");
        let count = self.kv.incr(&key, None).await? as u64;
        if count > limit {
            return Err(CoreError::QuotaExceeded(format!(
                "org {org_id} exceeded {limit} for resource {resource}"
            )));
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apix_test_support::InMemoryStorage;

    #[tokio::test]
    async fn check_api_calls_rejects_once_hourly_limit_exceeded() {
        let mgr = QuotaManager::new(Arc::new(InMemoryStorage::new()));
        assert!(mgr.check_api_calls("org1", 2).await.is_ok());
        assert!(mgr.check_api_calls("org1", 2).await.is_ok());
        assert!(mgr.check_api_calls("org1", 2).await.is_err());
    }

    #[tokio::test]
    async fn quotas_are_isolated_per_tenant() {
        let mgr = QuotaManager::new(Arc::new(InMemoryStorage::new()));
        assert!(mgr.check_api_calls("org1", 1).await.is_ok());
        assert!(mgr.check_api_calls("org2", 1).await.is_ok());
    }

    #[tokio::test]
    async fn resource_count_quota_enforces_a_hard_cap() {
        let mgr = QuotaManager::new(Arc::new(InMemoryStorage::new()));
        assert!(mgr.check_resource_count("org1", "endpoints", 1).await.is_ok());
        assert!(mgr.check_resource_count("org1", "endpoints", 1).await.is_err());
    }
}
