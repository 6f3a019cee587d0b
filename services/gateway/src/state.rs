use crate::config::Config;
use crate::rooms::RoomRegistry;
use apix_core::{
    AuditRing, ConnectionManager, DeliveryEngine, DurableEventLog, EventRouter, PolicyEngine,
    QuotaManager, ReplayEngine, RetryManager, SubscriptionManager,
};
use apix_storage::{KvStore, LogAdapter, RelationalStore};
use std::sync::Arc;
use std::time::Duration;

/// Everything a request handler needs, wired once at boot. Each field owns
/// its own internal concurrency (`DashMap`s, atomics) -- `AppState` itself
/// is just the handle bundle, cheap to `Clone` per the teacher's
/// `#[derive(Clone)] pub struct AppState` convention.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub policy: Arc<PolicyEngine>,
    pub connections: Arc<ConnectionManager>,
    pub router: Arc<EventRouter>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub log: Arc<DurableEventLog>,
    pub replay: Arc<ReplayEngine>,
    pub delivery: Arc<DeliveryEngine>,
    pub retry: Arc<RetryManager>,
    pub audit: Arc<AuditRing>,
    pub quota: Arc<QuotaManager>,
    pub rooms: Arc<RoomRegistry>,
}

impl AppState {
    pub fn new(
        config: Config,
        log_adapter: Arc<dyn LogAdapter>,
        kv: Arc<dyn KvStore>,
        relational: Arc<dyn RelationalStore>,
    ) -> Self {
        let retention = Duration::from_secs(config.audit_retention_days * 86_400);
        AppState {
            policy: Arc::new(PolicyEngine::new(&config.jwt_signing_secret)),
            connections: Arc::new(ConnectionManager::new(
                config.max_sessions_per_tenant,
                config.default_ws_messages_per_minute,
            )),
            router: Arc::new(EventRouter::new()),
            subscriptions: Arc::new(SubscriptionManager::new(relational.clone())),
            log: Arc::new(DurableEventLog::new(log_adapter.clone(), kv.clone())),
            replay: Arc::new(ReplayEngine::new()),
            delivery: Arc::new(DeliveryEngine::new(kv.clone(), log_adapter, relational.clone())),
            retry: Arc::new(RetryManager::new()),
            audit: Arc::new(AuditRing::new(kv.clone(), relational, retention)),
            quota: Arc::new(QuotaManager::new(kv)),
            rooms: Arc::new(RoomRegistry::new()),
            config: Arc::new(config),
        }
    }
}
