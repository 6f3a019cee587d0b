use crate::delivery::DeliveryEngine;
use crate::error::{CoreError, CoreResult};
use crate::log::DurableEventLog;
use crate::retry::RetryManager;
use apix_protocol::{Event, Principal, RetryPolicy};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const CIRCUIT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub t0: DateTime<Utc>,
    pub t1: DateTime<Utc>,
    pub event_types: Option<Vec<String>>,
    pub max_events: Option<usize>,
    pub replay_rate_events_per_sec: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct ReplayStatus {
    pub active: bool,
    pub progress_percent: u8,
}

struct ReplayJob {
    active: Arc<AtomicBool>,
    delivered: Arc<AtomicUsize>,
    total: usize,
}

/// Drives a user-supplied delivery callback over historic events,
/// fetched from the Durable Event Log (the single source of truth --
/// there is no separate live-buffer merge path) (§4.7).
#[derive(Default)]
pub struct ReplayEngine {
    jobs: DashMap<String, ReplayJob>,
}

impl ReplayEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a replay to completion, invoking `deliver` for each event in
    /// `(created_at, sequence_number)` order, retrying failed deliveries
    /// via `retry_manager` gated by a per-`(org, channel)` circuit breaker,
    /// and pacing per `replay_rate_events_per_sec`. Retry exhaustion routes
    /// the event to `delivery`'s DLQ rather than only logging it.
    ///
    /// Takes an explicit `replay_id` (the caller generates it) so the REST
    /// handler can return it before this future completes -- the caller is
    /// expected to `tokio::spawn` this rather than `.await` it inline.
    pub async fn start_replay<F, Fut>(
        &self,
        log: &DurableEventLog,
        retry_manager: &RetryManager,
        delivery: &DeliveryEngine,
        principal: &Principal,
        replay_id: String,
        request: ReplayRequest,
        retry_policy: &RetryPolicy,
        mut deliver: F,
    ) -> CoreResult<String>
    where
        F: FnMut(Event) -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        let max_events = request.max_events.unwrap_or(usize::MAX);

        if max_events == 0 {
            self.jobs.insert(
                replay_id.clone(),
                ReplayJob {
                    active: Arc::new(AtomicBool::new(false)),
                    delivered: Arc::new(AtomicUsize::new(0)),
                    total: 0,
                },
            );
            return Ok(replay_id);
        }

        let mut events = log
            .range(&principal.org_id, None, request.t0, request.t1, max_events)
            .await?;
        if let Some(types) = &request.event_types {
            events.retain(|e| types.contains(&e.event_type));
        }
        events.truncate(max_events);

        let active = Arc::new(AtomicBool::new(true));
        let delivered = Arc::new(AtomicUsize::new(0));
        self.jobs.insert(
            replay_id.clone(),
            ReplayJob {
                active: active.clone(),
                delivered: delivered.clone(),
                total: events.len(),
            },
        );

        let interval = request
            .replay_rate_events_per_sec
            .filter(|rate| *rate > 0.0)
            .map(|rate| Duration::from_secs_f64(1.0 / rate));

        for event in events {
            if !active.load(Ordering::SeqCst) {
                break;
            }

            let circuit_id = format!("replay:{}:{}", event.org_id, event.channel);
            let policy = retry_policy.clone();
            let gated = retry_manager
                .execute_with_circuit_breaker(&circuit_id, CIRCUIT_FAILURE_THRESHOLD, CIRCUIT_OPEN_TIMEOUT, || {
                    let mut attempt = |_attempt: u32| {
                        let event = event.clone();
                        deliver(event)
                    };
                    retry_manager.execute_with_retry(&policy, policy.max_attempts, &mut attempt)
                })
                .await;

            let failed = match gated {
                Ok(Ok(())) => false,
                Ok(Err(_)) => true,
                Err(CoreError::CircuitOpen(_)) => true,
                Err(_) => true,
            };
            if failed {
                tracing::warn!(circuit = %circuit_id, event_id = %event.id, "replay delivery exhausted retries, routing to DLQ");
                delivery.append_to_dlq(&event, &circuit_id, "replay_retries_exhausted").await;
            }

            delivered.fetch_add(1, Ordering::SeqCst);

            if let Some(interval) = interval {
                tokio::time::sleep(interval).await;
            }
        }

        active.store(false, Ordering::SeqCst);
        Ok(replay_id)
    }

    /// Flip the job's `active` flag; the in-flight loop exits at its next
    /// iteration boundary.
    pub fn stop_replay(&self, replay_id: &str) -> CoreResult<()> {
        let job = self
            .jobs
            .get(replay_id)
            .ok_or_else(|| CoreError::NotFound(format!("replay {replay_id}")))?;
        job.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn get_status(&self, replay_id: &str) -> CoreResult<ReplayStatus> {
        let job = self
            .jobs
            .get(replay_id)
            .ok_or_else(|| CoreError::NotFound(format!("replay {replay_id}")))?;
        let progress_percent = if job.total == 0 {
            100
        } else {
            ((job.delivered.load(Ordering::SeqCst) as f64 / job.total as f64) * 100.0) as u8
        };
        Ok(ReplayStatus {
            active: job.active.load(Ordering::SeqCst),
            progress_percent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::NewEvent;
    use apix_protocol::Priority;
    use apix_test_support::InMemoryStorage;
    use std::sync::Mutex;

    fn principal() -> Principal {
        Principal {
            org_id: "org1".into(),
            org_slug: "org1".into(),
            user_id: Some("u1".into()),
            roles: vec![],
            permissions: vec![],
        }
    }

    async fn seed(log: &DurableEventLog, event_type: &str, channel: &str) {
        log.append(NewEvent {
            org_id: "org1".into(),
            user_id: None,
            session_id: None,
            event_type: event_type.into(),
            channel: channel.into(),
            payload: serde_json::json!({}),
            priority: Priority::Normal,
            metadata: serde_json::Map::new(),
            id: None,
            checksum: None,
            dedup: false,
        })
        .await
        .unwrap();
    }

    fn delivery_engine(storage: Arc<InMemoryStorage>) -> DeliveryEngine {
        DeliveryEngine::new(storage.clone(), storage.clone(), storage)
    }

    #[tokio::test]
    async fn max_events_zero_completes_immediately_at_full_progress() {
        let storage = Arc::new(InMemoryStorage::new());
        let log = DurableEventLog::new(storage.clone(), storage.clone());
        let delivery = delivery_engine(storage);
        let engine = ReplayEngine::new();
        let retry = RetryManager::new();
        let request = ReplayRequest {
            t0: Utc::now() - chrono::Duration::hours(1),
            t1: Utc::now() + chrono::Duration::hours(1),
            event_types: None,
            max_events: Some(0),
            replay_rate_events_per_sec: None,
        };
        let replay_id = engine
            .start_replay(
                &log,
                &retry,
                &delivery,
                &principal(),
                "replay-1".to_owned(),
                request,
                &RetryPolicy::default(),
                |_e| async { Ok(()) },
            )
            .await
            .unwrap();
        let status = engine.get_status(&replay_id).unwrap();
        assert_eq!(status.progress_percent, 100);
        assert!(!status.active);
    }

    #[tokio::test]
    async fn replay_filters_by_event_type_and_delivers_in_order() {
        let storage = Arc::new(InMemoryStorage::new());
        let log = DurableEventLog::new(storage.clone(), storage.clone());
        let delivery = delivery_engine(storage);
        seed(&log, "agent_events", "chat").await;
        seed(&log, "other_events", "chat").await;

        let engine = ReplayEngine::new();
        let retry = RetryManager::new();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let delivered_clone = delivered.clone();

        let request = ReplayRequest {
            t0: Utc::now() - chrono::Duration::hours(1),
            t1: Utc::now() + chrono::Duration::hours(1),
            event_types: Some(vec!["agent_events".into()]),
            max_events: Some(50),
            replay_rate_events_per_sec: None,
        };
        engine
            .start_replay(
                &log,
                &retry,
                &delivery,
                &principal(),
                "replay-2".to_owned(),
                request,
                &RetryPolicy::default(),
                move |e| {
                    let delivered_clone = delivered_clone.clone();
                    async move {
                        delivered_clone.lock().unwrap().push(e.event_type.clone());
                        Ok(())
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(*delivered.lock().unwrap(), vec!["agent_events".to_string()]);
    }

    #[tokio::test]
    async fn retry_exhaustion_routes_the_event_to_the_dlq() {
        let storage = Arc::new(InMemoryStorage::new());
        let log = DurableEventLog::new(storage.clone(), storage.clone());
        let delivery = delivery_engine(storage.clone());
        seed(&log, "agent_events", "chat").await;

        let engine = ReplayEngine::new();
        let retry = RetryManager::new();
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: apix_protocol::Backoff::Fixed,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter: 0.0,
        };

        engine
            .start_replay(
                &log,
                &retry,
                &delivery,
                &principal(),
                "replay-3".to_owned(),
                ReplayRequest {
                    t0: Utc::now() - chrono::Duration::hours(1),
                    t1: Utc::now() + chrono::Duration::hours(1),
                    event_types: None,
                    max_events: Some(10),
                    replay_rate_events_per_sec: None,
                },
                &policy,
                |_e| async { Err("delivery failed".to_owned()) },
            )
            .await
            .unwrap();

        let dlq = storage.range("dlq:org1", "-", "+", 10).await.unwrap();
        assert_eq!(dlq.len(), 1);
    }
}
