use crate::error::CoreResult;
use crate::log::{DurableEventLog, NewEvent};
use crate::subscriptions::SubscriptionManager;
use apix_protocol::Event;
use dashmap::DashMap;

const WILDCARD_EVENT_TYPE: &str = "*";

/// One channel this event fanned out to, plus the subscribers whose
/// filters accepted it. The Session Gateway uses this to address the
/// `channel:{orgId}:{channel}` room and apply per-user delivery.
#[derive(Debug, Clone)]
pub struct ChannelDelivery {
    pub channel: String,
    pub event: Event,
    pub recipient_user_ids: Vec<String>,
}

/// Resolves `event.eventType` to a channel set, applies per-subscription
/// filters, and appends a per-channel copy to the Durable Event Log
/// (§4.4). The dynamic route table is copy-on-write in spirit: readers
/// never block writers, courtesy of `dashmap`.
#[derive(Default)]
pub struct EventRouter {
    /// event_type -> additional channels it fans out to, beyond the
    /// channel the publisher named explicitly.
    routes: DashMap<String, Vec<String>>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&self, event_type: &str, channels: Vec<String>) {
        self.routes.insert(event_type.to_owned(), channels);
    }

    pub fn remove_route(&self, event_type: &str) {
        self.routes.remove(event_type);
    }

    fn resolve_channels(&self, event_type: &str, explicit_channel: &str) -> Vec<String> {
        let mut channels = vec![explicit_channel.to_owned()];
        if let Some(extra) = self.routes.get(event_type) {
            for c in extra.iter() {
                if !channels.contains(c) {
                    channels.push(c.clone());
                }
            }
        }
        if let Some(wildcard) = self.routes.get(WILDCARD_EVENT_TYPE) {
            for c in wildcard.iter() {
                if !channels.contains(c) {
                    channels.push(c.clone());
                }
            }
        }
        channels
    }

    /// Append a per-channel copy of `draft` for every channel this event
    /// type routes to, and resolve the subscribers each copy reaches.
    ///
    /// Dedup (when `draft.dedup` is set) is only enforced on the first,
    /// explicitly-named channel -- the dedup key has no channel component,
    /// so re-checking it for every fanned-out copy of the same publish
    /// would reject all but the first channel.
    pub async fn route(
        &self,
        log: &DurableEventLog,
        subscriptions: &SubscriptionManager,
        draft: NewEvent,
    ) -> CoreResult<Vec<ChannelDelivery>> {
        subscriptions.hydrate_org(&draft.org_id).await?;
        let explicit_channel = draft.channel.clone();
        let channels = self.resolve_channels(&draft.event_type, &explicit_channel);

        let mut deliveries = Vec::with_capacity(channels.len());
        for channel in channels {
            let mut channel_draft = draft.clone();
            channel_draft.channel = channel.clone();
            channel_draft.dedup = draft.dedup && channel == explicit_channel;

            let event = log.append(channel_draft).await?;
            let recipient_user_ids = subscriptions
                .subscriptions_for_channel(&event.org_id, &channel)
                .into_iter()
                .filter(|sub| subscriptions.apply_filters(sub, &event))
                .map(|sub| sub.user_id)
                .collect();

            deliveries.push(ChannelDelivery {
                channel,
                event,
                recipient_user_ids,
            });
        }
        Ok(deliveries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apix_protocol::{EventFilter, Principal, Priority};
    use apix_test_support::InMemoryStorage;
    use std::sync::Arc;

    fn manager(relational: Arc<InMemoryStorage>) -> SubscriptionManager {
        SubscriptionManager::new(relational)
    }

    fn draft(channel: &str) -> NewEvent {
        NewEvent {
            org_id: "org1".into(),
            user_id: Some("publisher".into()),
            session_id: Some("s1".into()),
            event_type: "agent_events".into(),
            channel: channel.into(),
            payload: serde_json::json!({"text": "hi"}),
            priority: Priority::Normal,
            metadata: serde_json::Map::new(),
            id: None,
            checksum: None,
            dedup: false,
        }
    }

    fn principal(user: &str) -> Principal {
        Principal {
            org_id: "org1".into(),
            org_slug: "org1".into(),
            user_id: Some(user.into()),
            roles: vec![],
            permissions: vec![],
        }
    }

    #[tokio::test]
    async fn route_delivers_to_the_explicit_channel_when_no_extra_route_exists() {
        let storage = Arc::new(InMemoryStorage::new());
        let log = DurableEventLog::new(storage.clone(), storage.clone());
        let subs = manager(storage);
        subs.create(&principal("u1"), "agent_status", EventFilter::default()).await.unwrap();

        let router = EventRouter::new();
        let deliveries = router.route(&log, &subs, draft("agent_status")).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].recipient_user_ids, vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn route_fans_out_to_additional_mapped_channels() {
        let storage = Arc::new(InMemoryStorage::new());
        let log = DurableEventLog::new(storage.clone(), storage.clone());
        let subs = manager(storage);
        subs.create(&principal("u1"), "agent_status", EventFilter::default()).await.unwrap();
        subs.create(&principal("u2"), "agent_actions", EventFilter::default()).await.unwrap();

        let router = EventRouter::new();
        router.add_route("agent_events", vec!["agent_actions".into()]);

        let deliveries = router.route(&log, &subs, draft("agent_status")).await.unwrap();
        let channels: Vec<&str> = deliveries.iter().map(|d| d.channel.as_str()).collect();
        assert!(channels.contains(&"agent_status"));
        assert!(channels.contains(&"agent_actions"));
    }

    #[tokio::test]
    async fn unfiltered_subscribers_in_other_channels_do_not_receive_the_event() {
        let storage = Arc::new(InMemoryStorage::new());
        let log = DurableEventLog::new(storage.clone(), storage.clone());
        let subs = manager(storage);
        subs.create(&principal("u1"), "other_channel", EventFilter::default()).await.unwrap();

        let router = EventRouter::new();
        let deliveries = router.route(&log, &subs, draft("agent_status")).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].recipient_user_ids.is_empty());
    }
}
