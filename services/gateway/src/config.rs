use std::env;
use std::time::Duration;

/// Boot-time configuration, read once from the environment (spec §6 "Environment
/// variables"). A missing required variable is a `Fatal` error and aborts boot
/// with exit code 64, matching the teacher's `DATABASE_URL`-or-`expect` convention.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub redis_url: String,
    pub database_url: String,
    pub jwt_signing_secret: String,
    pub log_level: String,
    pub heartbeat_interval: Duration,
    pub default_api_calls_per_hour: u64,
    pub default_ws_messages_per_minute: u32,
    pub max_event_rate_per_session: u32,
    pub audit_retention_days: u64,
    pub replay_max_rate_events_per_sec: f64,
    pub max_sessions_per_tenant: usize,
}

#[derive(Debug, thiserror::Error)]
#[error("config error: {0}")]
pub struct ConfigError(String);

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let redis_url = env::var("REDIS_URL").map_err(|_| ConfigError("REDIS_URL must be set".into()))?;
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ConfigError("DATABASE_URL must be set".into()))?;
        let jwt_signing_secret = env::var("JWT_SIGNING_SECRET")
            .map_err(|_| ConfigError("JWT_SIGNING_SECRET must be set".into()))?;

        Ok(Config {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned()),
            redis_url,
            database_url,
            jwt_signing_secret,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned()),
            heartbeat_interval: Duration::from_millis(parse_env_or("HEARTBEAT_INTERVAL_MS", 30_000)?),
            default_api_calls_per_hour: parse_env_or("DEFAULT_API_CALLS_PER_HOUR", 10_000)?,
            default_ws_messages_per_minute: parse_env_or("DEFAULT_WS_MESSAGES_PER_MINUTE", 100)?,
            max_event_rate_per_session: parse_env_or("MAX_EVENT_RATE_PER_SESSION", 100)?,
            audit_retention_days: parse_env_or("RETENTION_DAYS", 90)?,
            replay_max_rate_events_per_sec: parse_env_or("REPLAY_MAX_PACING_RATE", 1000.0)?,
            max_sessions_per_tenant: parse_env_or("MAX_SESSIONS_PER_TENANT", 10_000usize)?,
        })
    }
}

fn parse_env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError(format!("{name} is not a valid value"))),
        Err(_) => Ok(default),
    }
}
