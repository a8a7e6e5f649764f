use std::env;
use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

/// A missing key falls back to `default`; a present-but-malformed value fails
/// fast with `Validation` rather than silently substituting the default
/// (§9 Open Question 3).
fn profiled_env_parsed<T>(profile: &str, key: &str, default: T) -> Result<T, BrokerError>
where
    T: FromStr,
    T::Err: Display,
{
    match profiled_env_opt(profile, key) {
        Some(v) => v.parse().map_err(|e| BrokerError::Validation(format!("invalid value for {}: {:?} ({})", key, v, e))),
        None => Ok(default),
    }
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> Result<u16, BrokerError> {
    profiled_env_parsed(profile, key, default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> Result<u32, BrokerError> {
    profiled_env_parsed(profile, key, default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> Result<u64, BrokerError> {
    profiled_env_parsed(profile, key, default)
}

fn profiled_env_f64(profile: &str, key: &str, default: f64) -> Result<f64, BrokerError> {
    profiled_env_parsed(profile, key, default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> Result<bool, BrokerError> {
    match profiled_env_opt(profile, key) {
        Some(v) => match v.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(BrokerError::Validation(format!("invalid value for {}: {:?} (expected true/false/1/0)", key, other))),
        },
        None => Ok(default),
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub postgres: PostgresConfig,
    pub events: EventBusConfig,
    pub buffer: BufferConfig,
    pub reaper: ReaperConfig,
    pub detectors: DetectorConfig,
    pub actors: ActorConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `BROKER_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    ///
    /// Fails fast with `Validation` if any present key fails to parse as its
    /// expected type, rather than silently falling back to the default.
    pub fn from_env() -> Result<Self, BrokerError> {
        let profile = env_or("BROKER_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Result<Self, BrokerError> {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Ok(Self {
            profile: p.to_string(),
            postgres: PostgresConfig::from_env_profiled(p)?,
            events: EventBusConfig::from_env_profiled(p)?,
            buffer: BufferConfig::from_env_profiled(p)?,
            reaper: ReaperConfig::from_env_profiled(p)?,
            detectors: DetectorConfig::from_env_profiled(p)?,
            actors: ActorConfig::from_env_profiled(p)?,
        })
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  postgres:  host={}, db={}, max_connections={}", self.postgres.host, self.postgres.database, self.postgres.max_connections);
        tracing::info!("  events:    channel={}", self.events.channel_name);
        tracing::info!("  buffer:    enabled={}, max_size={}, max_wait_ms={}", self.buffer.enabled, self.buffer.max_size, self.buffer.max_wait_ms);
        tracing::info!("  reaper:    interval_ms={}", self.reaper.interval_ms);
    }

    /// Return a redacted view safe for API responses (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "postgres": {
                "host": self.postgres.host,
                "port": self.postgres.port,
                "database": self.postgres.database,
                "configured": self.postgres.is_configured(),
            },
            "events": { "channel_name": self.events.channel_name },
            "buffer": {
                "enabled": self.buffer.enabled,
                "max_size": self.buffer.max_size,
                "max_wait_ms": self.buffer.max_wait_ms,
            },
            "reaper": { "interval_ms": self.reaper.interval_ms, "jitter_ms": self.reaper.jitter_ms },
            "detectors": self.detectors,
        })
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Result<Self, BrokerError> {
        Ok(Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432)?,
            database: profiled_env_or(p, "PG_DATABASE", "duramq"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10)?,
        })
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

// ── Event bus (LISTEN/NOTIFY, §6/§4.6) ──────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// NOTIFY/LISTEN channel name (§6 default "queue_events").
    pub channel_name: String,
    /// Bounded per-subscriber queue depth before oldest-drop kicks in (§4.6).
    pub subscriber_queue_depth: usize,
}

impl EventBusConfig {
    fn from_env_profiled(p: &str) -> Result<Self, BrokerError> {
        Ok(Self {
            channel_name: profiled_env_or(p, "EVENTS_CHANNEL", "queue_events"),
            subscriber_queue_depth: profiled_env_u32(p, "EVENTS_SUBSCRIBER_QUEUE_DEPTH", 256)? as usize,
        })
    }
}

// ── Enqueue buffer (C5) ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub max_wait_ms: u64,
}

impl BufferConfig {
    fn from_env_profiled(p: &str) -> Result<Self, BrokerError> {
        Ok(Self {
            enabled: profiled_env_bool(p, "BUFFER_ENABLED", false)?,
            max_size: profiled_env_u32(p, "BUFFER_MAX_SIZE", 100)? as usize,
            max_wait_ms: profiled_env_u64(p, "BUFFER_MAX_WAIT_MS", 50)?,
        })
    }
}

// ── Reaper ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Default: <= ack_timeout/3 per queue, but the task itself runs on a
    /// single fixed interval across all queues.
    pub interval_ms: u64,
    /// Random jitter added to each tick so multiple instances don't collide.
    pub jitter_ms: u64,
}

impl ReaperConfig {
    fn from_env_profiled(p: &str) -> Result<Self, BrokerError> {
        Ok(Self {
            interval_ms: profiled_env_u64(p, "REAPER_INTERVAL_MS", 5_000)?,
            jitter_ms: profiled_env_u64(p, "REAPER_JITTER_MS", 500)?,
        })
    }
}

// ── Detector thresholds (§4.5) ────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    // Defaults mirror §4.5's table; `Default` lets tests build a
    // `DetectorContext` without wiring full config.
    pub flash_threshold_ms: i64,
    pub large_payload_threshold_bytes: u64,
    pub long_processing_threshold_ms: i64,
    pub near_dlq_threshold: u32,
    pub zombie_multiplier: f64,
    pub burst_count: u32,
    pub burst_seconds: i64,
    pub bulk_threshold: u64,
}

impl Default for DetectorConfig {
    /// The documented §4.5 defaults, independent of the environment — lets
    /// tests build a `DetectorContext` without wiring full config and
    /// without `Default` itself being fallible.
    fn default() -> Self {
        Self {
            flash_threshold_ms: 50,
            large_payload_threshold_bytes: 256 * 1024,
            long_processing_threshold_ms: 30_000,
            near_dlq_threshold: 1,
            zombie_multiplier: 3.0,
            burst_count: 50,
            burst_seconds: 10,
            bulk_threshold: 50,
        }
    }
}

impl DetectorConfig {
    fn from_env_profiled(p: &str) -> Result<Self, BrokerError> {
        let d = Self::default();
        Ok(Self {
            flash_threshold_ms: profiled_env_u64(p, "DETECT_FLASH_THRESHOLD_MS", d.flash_threshold_ms as u64)? as i64,
            large_payload_threshold_bytes: profiled_env_u64(p, "DETECT_LARGE_PAYLOAD_BYTES", d.large_payload_threshold_bytes)?,
            long_processing_threshold_ms: profiled_env_u64(p, "DETECT_LONG_PROCESSING_MS", d.long_processing_threshold_ms as u64)? as i64,
            near_dlq_threshold: profiled_env_u32(p, "DETECT_NEAR_DLQ_THRESHOLD", d.near_dlq_threshold)?,
            zombie_multiplier: profiled_env_f64(p, "DETECT_ZOMBIE_MULTIPLIER", d.zombie_multiplier)?,
            burst_count: profiled_env_u32(p, "DETECT_BURST_COUNT", d.burst_count)?,
            burst_seconds: profiled_env_u64(p, "DETECT_BURST_SECONDS", d.burst_seconds as u64)? as i64,
            bulk_threshold: profiled_env_u64(p, "DETECT_BULK_THRESHOLD", d.bulk_threshold)?,
        })
    }
}

// ── Actor names (§6 triggered_by) ─────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorConfig {
    /// triggered_by value for system-initiated operations (e.g. the reaper).
    pub relay_actor: String,
    /// triggered_by value for admin-dashboard-initiated operations.
    pub manual_actor: String,
}

impl ActorConfig {
    fn from_env_profiled(p: &str) -> Result<Self, BrokerError> {
        Ok(Self {
            relay_actor: profiled_env_or(p, "ACTOR_RELAY_NAME", "relay"),
            manual_actor: profiled_env_or(p, "ACTOR_MANUAL_NAME", "manual"),
        })
    }
}
