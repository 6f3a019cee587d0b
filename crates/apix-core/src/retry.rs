use crate::error::{CoreError, CoreResult};
use apix_protocol::{Backoff, CircuitBreakerState, CircuitState, RetryPolicy};
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Delay for `attempt` (1-indexed) under `policy`, before jitter (§4.9).
fn base_delay(policy: &RetryPolicy, attempt: u32, recent_error_rate: f64, active_retries: u32) -> Duration {
    let base = policy.base_delay_ms as f64;
    let max = policy.max_delay_ms as f64;
    let raw = match policy.backoff {
        Backoff::Fixed => base,
        Backoff::Linear => (base * attempt as f64).min(max),
        Backoff::Exponential => (base * 2f64.powi(attempt as i32 - 1)).min(max),
        Backoff::Adaptive => {
            let load_factor = (1.0 + active_retries as f64 * 0.1).min(3.0);
            (base * 1.5f64.powi(attempt as i32 - 1) * (1.0 + recent_error_rate) * load_factor).min(max)
        }
    };
    Duration::from_millis(raw.max(100.0) as u64)
}

/// Apply multiplicative +/- jitter, floored at 100ms.
fn with_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay.max(Duration::from_millis(100));
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    let millis = (delay.as_millis() as f64 * factor).max(100.0) as u64;
    Duration::from_millis(millis)
}

/// Generic in-process retry primitive backing the Delivery Engine, Replay
/// Engine, and any caller that needs a transient failure absorbed (§4.9).
#[derive(Default)]
pub struct RetryManager {
    scheduled: DashMap<String, Arc<AtomicBool>>,
    circuits: DashMap<String, Mutex<CircuitBreakerState>>,
}

impl RetryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` up to `max_attempts` times, sleeping between attempts per
    /// `policy`. Returns the first success, or the last error once
    /// attempts are exhausted.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        policy: &RetryPolicy,
        max_attempts: u32,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut recent: Vec<bool> = Vec::with_capacity(3);
        let active_retries = AtomicU32::new(0);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    recent.push(false);
                    if recent.len() > 3 {
                        recent.remove(0);
                    }
                    if attempt >= max_attempts {
                        return Err(err);
                    }
                    let error_rate = recent.iter().filter(|ok| !**ok).count() as f64 / recent.len() as f64;
                    let delay = base_delay(policy, attempt, error_rate, active_retries.load(Ordering::SeqCst));
                    let delay = with_jitter(delay, policy.jitter);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Fire-and-forget variant; cancellable by `operation_id`.
    pub fn schedule<F, Fut>(&self, operation_id: &str, policy: RetryPolicy, max_attempts: u32, op: F)
    where
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ()>> + Send,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.scheduled.insert(operation_id.to_owned(), cancelled.clone());
        tokio::spawn(async move {
            let mut attempt = 0u32;
            while attempt < max_attempts && !cancelled.load(Ordering::SeqCst) {
                attempt += 1;
                if op(attempt).await.is_ok() {
                    return;
                }
                let delay = with_jitter(base_delay(&policy, attempt, 0.0, 0), policy.jitter);
                tokio::time::sleep(delay).await;
            }
        });
    }

    /// `true` iff an operation with this id was scheduled and has now been
    /// marked cancelled (idempotent; a cancelled retry's next check sees
    /// the flag and does not fire).
    pub fn cancel(&self, operation_id: &str) -> bool {
        if let Some(flag) = self.scheduled.get(operation_id) {
            flag.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    fn circuit_entry(
        &self,
        circuit_id: &str,
    ) -> dashmap::mapref::one::RefMut<'_, String, Mutex<CircuitBreakerState>> {
        self.circuits
            .entry(circuit_id.to_owned())
            .or_insert_with(|| Mutex::new(CircuitBreakerState::closed(circuit_id)))
    }

    pub async fn circuit_state(&self, circuit_id: &str) -> CircuitBreakerState {
        self.circuit_entry(circuit_id).lock().await.clone()
    }

    /// Run `op` gated by the named circuit (§4.9). `threshold` consecutive
    /// failures trip the circuit OPEN for `timeout`; after that, exactly
    /// one HALF_OPEN probe is permitted.
    pub async fn execute_with_circuit_breaker<F, Fut, T, E>(
        &self,
        circuit_id: &str,
        threshold: u32,
        timeout: Duration,
        op: F,
    ) -> CoreResult<Result<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let entry = self.circuit_entry(circuit_id);
            let mut state = entry.lock().await;
            let now = Utc::now();
            if state.state == CircuitState::Open {
                match state.next_attempt_at {
                    Some(next_attempt_at) if now >= next_attempt_at => {
                        state.state = CircuitState::HalfOpen;
                    }
                    _ => return Err(CoreError::CircuitOpen(circuit_id.to_owned())),
                }
            }
        }

        let result = op().await;

        {
            let entry = self.circuit_entry(circuit_id);
            let mut state = entry.lock().await;
            match &result {
                Ok(_) => {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.last_failure_at = None;
                    state.next_attempt_at = None;
                }
                Err(_) => {
                    state.failure_count += 1;
                    state.last_failure_at = Some(Utc::now());
                    if state.state == CircuitState::HalfOpen || state.failure_count >= threshold {
                        state.state = CircuitState::Open;
                        state.next_attempt_at =
                            Some(Utc::now() + chrono::Duration::from_std(timeout).unwrap());
                    }
                }
            }
        }
        Ok(result)
    }
}
