use crate::error::{CoreError, CoreResult};
use apix_protocol::{ClientType, Principal, Session, SessionQuality, SessionStatus};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const QUALITY_WINDOW: usize = 8;
const DEFAULT_MAX_SESSIONS_PER_TENANT: usize = 10_000;
const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 100;

/// Exponential reconnect policy: base 1s, max 30s, max 10 attempts (§4.2).
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.base_delay_ms.saturating_mul(1u64 << attempt.min(20));
        Duration::from_millis(raw.min(self.max_delay_ms))
    }
}

struct SessionEntry {
    session: Session,
    latency_window: VecDeque<u64>,
    rate_counter: AtomicU32,
    rate_window_started_at: std::sync::Mutex<chrono::DateTime<Utc>>,
}

/// Owns the live session registry and its quality signal (§4.2). Bound to
/// a single manager instance per process; never exposed as ambient state.
pub struct ConnectionManager {
    sessions: DashMap<String, SessionEntry>,
    tenant_session_counts: DashMap<String, usize>,
    max_sessions_per_tenant: usize,
    rate_limit_per_minute: u32,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS_PER_TENANT, DEFAULT_RATE_LIMIT_PER_MINUTE)
    }
}

impl ConnectionManager {
    pub fn new(max_sessions_per_tenant: usize, rate_limit_per_minute: u32) -> Self {
        ConnectionManager {
            sessions: DashMap::new(),
            tenant_session_counts: DashMap::new(),
            max_sessions_per_tenant,
            rate_limit_per_minute,
        }
    }

    pub fn register(
        &self,
        session_id: &str,
        principal: &Principal,
        client_type: ClientType,
    ) -> CoreResult<Session> {
        let mut count = self
            .tenant_session_counts
            .entry(principal.org_id.clone())
            .or_insert(0);
        if *count >= self.max_sessions_per_tenant {
            return Err(CoreError::QuotaExceeded(format!(
                "org {} has reached its max concurrent session quota",
                principal.org_id
            )));
        }
        *count += 1;

        let now = Utc::now();
        let session = Session {
            session_id: session_id.to_owned(),
            org_id: principal.org_id.clone(),
            user_id: principal.user_id.clone(),
            client_type,
            status: SessionStatus::Connected,
            quality: SessionQuality::Excellent,
            latency_ms: 0,
            channels: Vec::new(),
            connected_at: now,
            last_heartbeat_at: now,
            reconnect_attempts: 0,
            disconnected_at: None,
        };
        self.sessions.insert(
            session_id.to_owned(),
            SessionEntry {
                session: session.clone(),
                latency_window: VecDeque::with_capacity(QUALITY_WINDOW),
                rate_counter: AtomicU32::new(0),
                rate_window_started_at: std::sync::Mutex::new(now),
            },
        );
        Ok(session)
    }

    /// Compute latency as `now - client_send_timestamp`, clamped to 0 if
    /// the client's clock is ahead of the server's (§8 boundary behavior).
    pub fn heartbeat(
        &self,
        session_id: &str,
        client_send_timestamp: chrono::DateTime<Utc>,
    ) -> CoreResult<(u64, SessionQuality)> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))?;

        let now = Utc::now();
        let latency_ms = (now - client_send_timestamp).num_milliseconds().max(0) as u64;

        if entry.latency_window.len() == QUALITY_WINDOW {
            entry.latency_window.pop_front();
        }
        entry.latency_window.push_back(latency_ms);
        let avg = entry.latency_window.iter().sum::<u64>() / entry.latency_window.len() as u64;
        let quality = SessionQuality::from_latency_ms(avg);

        entry.session.latency_ms = avg;
        entry.session.quality = quality;
        entry.session.last_heartbeat_at = now;
        if entry.session.status == SessionStatus::Reconnecting {
            entry.session.status = SessionStatus::Connected;
        }
        Ok((avg, quality))
    }

    pub fn update_status(&self, session_id: &str, status: SessionStatus) -> CoreResult<()> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))?;
        entry.session.status = status;
        if status == SessionStatus::Disconnected {
            entry.session.disconnected_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Increment `reconnect_attempts` and report the delay to wait before
    /// the next attempt. Returns `None` once the policy is exhausted,
    /// after transitioning status to `FAILED`.
    pub fn schedule_reconnect(
        &self,
        session_id: &str,
        policy: &ReconnectPolicy,
    ) -> CoreResult<Option<Duration>> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))?;
        entry.session.status = SessionStatus::Reconnecting;
        entry.session.reconnect_attempts += 1;
        if entry.session.reconnect_attempts > policy.max_attempts {
            entry.session.status = SessionStatus::Failed;
            return Ok(None);
        }
        Ok(Some(policy.delay_for_attempt(entry.session.reconnect_attempts)))
    }

    pub fn evict(&self, session_id: &str, _reason: &str) {
        if let Some((_, entry)) = self.sessions.remove(session_id) {
            if let Some(mut count) = self.tenant_session_counts.get_mut(&entry.session.org_id) {
                *count = count.saturating_sub(1);
            }
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.get(session_id).map(|e| e.session.clone())
    }

    pub fn add_channel(&self, session_id: &str, channel: &str) -> CoreResult<()> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))?;
        if !entry.session.channels.iter().any(|c| c == channel) {
            entry.session.channels.push(channel.to_owned());
        }
        Ok(())
    }

    pub fn remove_channel(&self, session_id: &str, channel: &str) -> CoreResult<()> {
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))?;
        entry.session.channels.retain(|c| c != channel);
        Ok(())
    }

    /// Mark every session whose last heartbeat is `>= 3 * heartbeat_interval`
    /// old as `Reconnecting` (§4.2). Intended to be driven by a periodic
    /// timer tick; returns the ids transitioned so the caller can log or
    /// act on them.
    pub fn sweep_stale_sessions(&self, heartbeat_interval: Duration) -> Vec<String> {
        let threshold = chrono::Duration::from_std(heartbeat_interval * 3)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let now = Utc::now();
        let mut stale = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            if entry.session.status == SessionStatus::Disconnected || entry.session.status == SessionStatus::Failed {
                continue;
            }
            if now - entry.session.last_heartbeat_at >= threshold && entry.session.status != SessionStatus::Reconnecting {
                entry.session.status = SessionStatus::Reconnecting;
                stale.push(entry.key().clone());
            }
        }
        stale
    }

    pub fn check_rate(&self, session_id: &str, _kind: &str) -> CoreResult<()> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))?;

        let now = Utc::now();
        let mut window_started_at = entry.rate_window_started_at.lock().unwrap();
        if (now - *window_started_at) >= chrono::Duration::minutes(1) {
            *window_started_at = now;
            entry.rate_counter.store(0, Ordering::SeqCst);
        }
        let count = entry.rate_counter.fetch_add(1, Ordering::SeqCst) + 1;
        if count > self.rate_limit_per_minute {
            return Err(CoreError::QuotaExceeded(format!(
                "session {session_id} exceeded {} messages/minute",
                self.rate_limit_per_minute
            )));
        }
        Ok(())
    }
}
