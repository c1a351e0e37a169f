//! Service configuration
//!
//! Loaded once from the environment (after `.env`) and installed globally.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use tracing::warn;

/// Where submissions and outcomes are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => anyhow::bail!("Unknown store backend: {}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub store_backend: StoreBackend,
    pub redis_url: String,
    pub challenges_path: String,
    /// Size ceiling for submitted code in bytes (default: 64KB)
    pub max_code_bytes: usize,
    /// Session deadline for languages without their own (default: 30s)
    pub default_deadline: Duration,
    /// Intermediate events buffered per session before dropping (default: 256)
    pub outbound_capacity: usize,
    /// How long POST /submissions waits for a synchronous result; zero disables
    pub fast_path_wait: Duration,
    /// How long a finished run waits for pending feedback (default: 5s)
    pub feedback_grace: Duration,
    /// How long a finished session keeps its stream for a late consumer (default: 60s)
    pub stream_retention: Duration,
    /// Minimum pass percentage for partial credit (default: 50)
    pub partial_credit_percent: u32,
    pub ai_service_url: Option<String>,
    pub ai_timeout: Duration,
    /// Retention of submission records in redis (default: 24h)
    pub result_ttl_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            store_backend: StoreBackend::Redis,
            redis_url: "redis://localhost:6379".into(),
            challenges_path: "./files/challenges.toml".into(),
            max_code_bytes: 64 * 1024,
            default_deadline: Duration::from_secs(30),
            outbound_capacity: 256,
            fast_path_wait: Duration::ZERO,
            feedback_grace: Duration::from_millis(5000),
            stream_retention: Duration::from_secs(60),
            partial_credit_percent: 50,
            ai_service_url: None,
            ai_timeout: Duration::from_secs(20),
            result_ttl_secs: 86_400,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup, falling back to defaults for missing keys
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let parse = |key: &str| -> Option<String> { lookup(key).filter(|v| !v.trim().is_empty()) };

        Ok(Self {
            bind_addr: parse_or(parse("BIND_ADDR"), "BIND_ADDR", defaults.bind_addr)?,
            store_backend: parse_or(
                parse("STORE_BACKEND"),
                "STORE_BACKEND",
                defaults.store_backend,
            )?,
            redis_url: parse("REDIS_URL").unwrap_or(defaults.redis_url),
            challenges_path: parse("CHALLENGES_PATH").unwrap_or(defaults.challenges_path),
            max_code_bytes: parse_or(
                parse("MAX_CODE_BYTES"),
                "MAX_CODE_BYTES",
                defaults.max_code_bytes,
            )?,
            default_deadline: Duration::from_secs(parse_or(
                parse("DEFAULT_DEADLINE_SECS"),
                "DEFAULT_DEADLINE_SECS",
                defaults.default_deadline.as_secs(),
            )?),
            outbound_capacity: parse_or(
                parse("OUTBOUND_CAPACITY"),
                "OUTBOUND_CAPACITY",
                defaults.outbound_capacity,
            )?
            .max(1),
            fast_path_wait: Duration::from_millis(parse_or(
                parse("FAST_PATH_WAIT_MS"),
                "FAST_PATH_WAIT_MS",
                0,
            )?),
            feedback_grace: Duration::from_millis(parse_or(
                parse("FEEDBACK_GRACE_MS"),
                "FEEDBACK_GRACE_MS",
                defaults.feedback_grace.as_millis() as u64,
            )?),
            stream_retention: Duration::from_secs(parse_or(
                parse("STREAM_RETENTION_SECS"),
                "STREAM_RETENTION_SECS",
                defaults.stream_retention.as_secs(),
            )?),
            partial_credit_percent: parse_or(
                parse("PARTIAL_CREDIT_PERCENT"),
                "PARTIAL_CREDIT_PERCENT",
                defaults.partial_credit_percent,
            )?,
            ai_service_url: parse("AI_SERVICE_URL"),
            ai_timeout: Duration::from_secs(parse_or(
                parse("AI_TIMEOUT_SECS"),
                "AI_TIMEOUT_SECS",
                defaults.ai_timeout.as_secs(),
            )?),
            result_ttl_secs: parse_or(
                parse("RESULT_TTL_SECS"),
                "RESULT_TTL_SECS",
                defaults.result_ttl_secs,
            )?,
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {}", key, raw)),
        None => Ok(default),
    }
}

/// Global service configuration
static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();

pub fn init_config(config: AppConfig) -> anyhow::Result<&'static AppConfig> {
    APP_CONFIG
        .set(config)
        .map_err(|_| anyhow::anyhow!("Configuration already initialized"))?;
    Ok(get_config())
}

/// Get the service configuration
pub fn get_config() -> &'static AppConfig {
    APP_CONFIG.get().unwrap_or_else(|| {
        static DEFAULT: OnceLock<AppConfig> = OnceLock::new();

        warn!("Configuration not initialized, using defaults");
        DEFAULT.get_or_init(AppConfig::default)
    })
}
