use crate::error::{CoreError, CoreResult};
use apix_protocol::{Event, EventFilter, Principal, Subscription};
use apix_storage::RelationalStore;
use dashmap::{DashMap, DashSet};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// Persists per-user channel subscriptions with filter predicates and
/// maintains a channel -> subscribers index (§4.5).
///
/// Dedup key is `(org_id, user_id, channel, filter_hash)`: the same user
/// may hold multiple subscriptions to one channel only when their filters
/// differ. Deletion is soft -- reads always filter on `is_active`.
///
/// `by_id`/`channel_index` are the hot synchronous read path; `relational`
/// is the durable write-through target (spec.md §0 subscription table).
/// An org's rows are lazily hydrated into the in-memory index on first
/// touch via `hydrate_org`, rather than loading every tenant at boot.
pub struct SubscriptionManager {
    by_id: DashMap<String, Subscription>,
    /// (org_id, channel) -> subscription ids, for fast fan-out lookup.
    channel_index: DashMap<(String, String), Vec<String>>,
    relational: Arc<dyn RelationalStore>,
    hydrated_orgs: DashSet<String>,
}

fn filter_hash(filter: &EventFilter) -> String {
    let canonical = serde_json::to_string(filter).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

impl SubscriptionManager {
    pub fn new(relational: Arc<dyn RelationalStore>) -> Self {
        SubscriptionManager {
            by_id: DashMap::new(),
            channel_index: DashMap::new(),
            relational,
            hydrated_orgs: DashSet::new(),
        }
    }

    /// Load an org's active subscriptions from the relational store into
    /// the in-memory index, once. Safe to call repeatedly; a no-op after
    /// the first successful hydration for that org.
    pub async fn hydrate_org(&self, org_id: &str) -> CoreResult<()> {
        if self.hydrated_orgs.contains(org_id) {
            return Ok(());
        }
        let rows = self.relational.list_subscriptions(org_id).await?;
        for sub in rows {
            self.channel_index
                .entry((sub.org_id.clone(), sub.channel.clone()))
                .or_default()
                .push(sub.subscription_id.clone());
            self.by_id.insert(sub.subscription_id.clone(), sub);
        }
        self.hydrated_orgs.insert(org_id.to_owned());
        Ok(())
    }

    pub async fn create(
        &self,
        principal: &Principal,
        channel: &str,
        filters: EventFilter,
    ) -> CoreResult<Subscription> {
        self.hydrate_org(&principal.org_id).await?;
        let user_id = principal
            .user_id
            .clone()
            .ok_or_else(|| CoreError::InvalidArgument("subscriptions require a user principal".into()))?;

        let hash = filter_hash(&filters);
        let dedup_exists = self.by_id.iter().any(|entry| {
            let sub = entry.value();
            sub.is_active
                && sub.org_id == principal.org_id
                && sub.user_id == user_id
                && sub.channel == channel
                && filter_hash(&sub.filters) == hash
        });
        if dedup_exists {
            return Err(CoreError::Conflict(format!(
                "subscription for user {user_id} on channel {channel} with identical filters already exists"
            )));
        }

        let subscription = Subscription {
            subscription_id: Uuid::new_v4().to_string(),
            org_id: principal.org_id.clone(),
            user_id,
            channel: channel.to_owned(),
            filters,
            is_active: true,
        };
        self.relational.put_subscription(&subscription).await?;
        self.by_id
            .insert(subscription.subscription_id.clone(), subscription.clone());
        self.channel_index
            .entry((subscription.org_id.clone(), subscription.channel.clone()))
            .or_default()
            .push(subscription.subscription_id.clone());
        Ok(subscription)
    }

    pub fn list_for_user(&self, org_id: &str, user_id: &str) -> Vec<Subscription> {
        self.by_id
            .iter()
            .map(|e| e.value().clone())
            .filter(|s| s.is_active && s.org_id == org_id && s.user_id == user_id)
            .collect()
    }

    pub fn list_for_org(&self, org_id: &str) -> Vec<Subscription> {
        self.by_id
            .iter()
            .map(|e| e.value().clone())
            .filter(|s| s.is_active && s.org_id == org_id)
            .collect()
    }

    pub fn validate(&self, org_id: &str, user_id: &str, channel: &str) -> bool {
        self.by_id.iter().any(|e| {
            let sub = e.value();
            sub.is_active && sub.org_id == org_id && sub.user_id == user_id && sub.channel == channel
        })
    }

    /// All active subscriber user ids for `(org_id, channel)`.
    pub fn subscribers(&self, org_id: &str, channel: &str) -> Vec<String> {
        let Some(ids) = self.channel_index.get(&(org_id.to_owned(), channel.to_owned())) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.by_id.get(id))
            .filter(|s| s.is_active)
            .map(|s| s.user_id.clone())
            .collect()
    }

    /// Subscriptions (not just user ids) active for `(org_id, channel)`,
    /// used by the Event Router to apply per-subscription filters.
    pub fn subscriptions_for_channel(&self, org_id: &str, channel: &str) -> Vec<Subscription> {
        let Some(ids) = self.channel_index.get(&(org_id.to_owned(), channel.to_owned())) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.by_id.get(id))
            .filter(|s| s.is_active)
            .map(|s| s.clone())
            .collect()
    }

    pub async fn update_filters(
        &self,
        org_id: &str,
        subscription_id: &str,
        filters: EventFilter,
    ) -> CoreResult<Subscription> {
        self.hydrate_org(org_id).await?;
        let updated = {
            let mut entry = self
                .by_id
                .get_mut(subscription_id)
                .ok_or_else(|| CoreError::NotFound(format!("subscription {subscription_id}")))?;
            if entry.org_id != org_id {
                return Err(CoreError::PermissionDenied {
                    action: "update".into(),
                    resource: format!("subscription:{subscription_id}"),
                });
            }
            entry.filters = filters;
            entry.clone()
        };
        self.relational.put_subscription(&updated).await?;
        Ok(updated)
    }

    pub async fn delete(&self, org_id: &str, subscription_id: &str) -> CoreResult<()> {
        self.hydrate_org(org_id).await?;
        {
            let mut entry = self
                .by_id
                .get_mut(subscription_id)
                .ok_or_else(|| CoreError::NotFound(format!("subscription {subscription_id}")))?;
            if entry.org_id != org_id {
                return Err(CoreError::PermissionDenied {
                    action: "delete".into(),
                    resource: format!("subscription:{subscription_id}"),
                });
            }
            entry.is_active = false;
        }
        self.relational.deactivate_subscription(org_id, subscription_id).await?;
        Ok(())
    }

    pub fn apply_filters(&self, subscription: &Subscription, event: &Event) -> bool {
        subscription.filters.matches(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apix_test_support::InMemoryStorage;
    use serde_json::json;

    fn manager() -> SubscriptionManager {
        SubscriptionManager::new(Arc::new(InMemoryStorage::new()))
    }

    fn principal(org: &str, user: &str) -> Principal {
        Principal {
            org_id: org.into(),
            org_slug: org.into(),
            user_id: Some(user.into()),
            roles: vec![],
            permissions: vec![],
        }
    }

    fn sample_event(org: &str, channel: &str) -> Event {
        Event {
            id: "e1".into(),
            org_id: org.into(),
            user_id: None,
            session_id: None,
            event_type: "msg".into(),
            channel: channel.into(),
            payload: json!({}),
            sequence_number: 1,
            checksum: "abc".into(),
            created_at: chrono::Utc::now(),
            priority: Default::default(),
            status: Default::default(),
            acknowledgment: None,
            retry_count: 0,
            metadata: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn create_then_list_roundtrips_and_delete_removes_it() {
        let mgr = manager();
        let sub = mgr
            .create(&principal("org1", "u1"), "chat", EventFilter::default())
            .await
            .unwrap();
        assert!(mgr.list_for_user("org1", "u1").iter().any(|s| s.subscription_id == sub.subscription_id));

        mgr.delete("org1", &sub.subscription_id).await.unwrap();
        assert!(!mgr.list_for_user("org1", "u1").iter().any(|s| s.subscription_id == sub.subscription_id));
    }

    #[tokio::test]
    async fn duplicate_channel_with_identical_filters_is_rejected() {
        let mgr = manager();
        mgr.create(&principal("org1", "u1"), "chat", EventFilter::default()).await.unwrap();
        let err = mgr
            .create(&principal("org1", "u1"), "chat", EventFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn duplicate_channel_with_different_filters_is_allowed() {
        let mgr = manager();
        mgr.create(&principal("org1", "u1"), "chat", EventFilter::default()).await.unwrap();
        let distinct_filter = EventFilter {
            event_types: Some(vec!["msg".into()]),
            ..Default::default()
        };
        assert!(mgr.create(&principal("org1", "u1"), "chat", distinct_filter).await.is_ok());
    }

    #[tokio::test]
    async fn subscribers_only_returns_active_subscriptions_in_the_requested_tenant() {
        let mgr = manager();
        mgr.create(&principal("org1", "u1"), "chat", EventFilter::default()).await.unwrap();
        mgr.create(&principal("org2", "u2"), "chat", EventFilter::default()).await.unwrap();
        assert_eq!(mgr.subscribers("org1", "chat"), vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn cross_tenant_delete_is_denied() {
        let mgr = manager();
        let sub = mgr.create(&principal("org1", "u1"), "chat", EventFilter::default()).await.unwrap();
        let err = mgr.delete("org2", &sub.subscription_id).await.unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn apply_filters_matches_the_protocol_level_predicate() {
        let mgr = manager();
        let sub = mgr
            .create(&principal("org1", "u1"), "chat", EventFilter::default())
            .await
            .unwrap();
        assert!(mgr.apply_filters(&sub, &sample_event("org1", "chat")));
    }
}
