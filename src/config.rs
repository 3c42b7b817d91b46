//! Application Configuration
//! Mission: Load static tunables from the environment once at startup

use anyhow::{bail, Context, Result};
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

const MIN_SECRET_BYTES: usize = 32;
pub const BCRYPT_MIN_COST: u32 = 4;
pub const BCRYPT_MAX_COST: u32 = 31;

/// Which implementation backs a component that can live in Redis or in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Redis,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Memory => "memory",
            StorageBackend::Redis => "redis",
        }
    }
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "inprocess" | "in-process" => Ok(StorageBackend::Memory),
            "redis" | "shared" => Ok(StorageBackend::Redis),
            other => bail!("unknown storage backend: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub access_hours: i64,
    pub refresh_hours: i64,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub max_login_attempts: u32,
    pub lockout_duration: Duration,
    pub attempt_retention: Duration,
    pub bcrypt_cost: u32,
    pub password_min_length: usize,
    pub registration_enabled: bool,
    pub default_admin: Option<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    /// Reserved; neither windowing algorithm consumes it.
    pub burst: u32,
    pub backend: StorageBackend,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub recovery_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_addr: String,
    pub database_path: String,
    pub jwt: JwtConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub revocation_backend: StorageBackend,
    pub redis: RedisConfig,
    /// Peers whose `X-Forwarded-For` header is believed.
    pub trusted_proxies: Vec<IpAddr>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_login_attempts: 5,
            lockout_duration: Duration::from_secs(15 * 60),
            attempt_retention: Duration::from_secs(720 * 3600),
            bcrypt_cost: bcrypt::DEFAULT_COST,
            password_min_length: 8,
            registration_enabled: true,
            default_admin: None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 60,
            burst: 10,
            backend: StorageBackend::Memory,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            recovery_delay: Duration::from_secs(10),
        }
    }
}

impl AppConfig {
    /// Read configuration from process environment (call `dotenv` first).
    pub fn from_env() -> Result<Self> {
        let secret = env::var("JWT_SECRET").context("JWT_SECRET must be set")?;

        let default_admin = match (
            env::var("DEFAULT_ADMIN_USERNAME").ok(),
            env::var("DEFAULT_ADMIN_PASSWORD").ok(),
        ) {
            (Some(u), Some(p)) if !u.trim().is_empty() && !p.is_empty() => {
                Some((u.trim().to_string(), p))
            }
            _ => None,
        };

        let config = Self {
            server_addr: env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./diet_assistant.db".to_string()),
            jwt: JwtConfig {
                secret,
                access_hours: parse_var("JWT_ACCESS_HOURS", 24)?,
                refresh_hours: parse_var("JWT_REFRESH_HOURS", 168)?,
            },
            security: SecurityConfig {
                max_login_attempts: parse_var("MAX_LOGIN_ATTEMPTS", 5)?,
                lockout_duration: Duration::from_secs(parse_var::<u64>("LOCKOUT_MINUTES", 15)? * 60),
                attempt_retention: Duration::from_secs(
                    parse_var::<u64>("LOGIN_ATTEMPT_RETENTION_HOURS", 720)? * 3600,
                ),
                bcrypt_cost: parse_var("BCRYPT_COST", bcrypt::DEFAULT_COST)?,
                password_min_length: parse_var("PASSWORD_MIN_LENGTH", 8)?,
                registration_enabled: flag_var("REGISTRATION_ENABLED", true),
                default_admin,
            },
            rate_limit: RateLimitConfig {
                enabled: flag_var("RATE_LIMIT_ENABLED", true),
                requests_per_minute: parse_var("RATE_LIMIT_RPM", 60)?,
                burst: parse_var("RATE_LIMIT_BURST", 10)?,
                backend: parse_var("RATE_LIMIT_BACKEND", StorageBackend::Memory)?,
            },
            revocation_backend: parse_var("REVOCATION_BACKEND", StorageBackend::Memory)?,
            redis: RedisConfig {
                url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
                recovery_delay: Duration::from_secs(parse_var("REDIS_RECOVERY_DELAY_SECS", 10)?),
            },
            trusted_proxies: parse_ip_list(&env::var("TRUSTED_PROXIES").unwrap_or_default())?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.jwt.secret.len() < MIN_SECRET_BYTES {
            bail!("JWT_SECRET must be at least {MIN_SECRET_BYTES} bytes");
        }
        if self.jwt.access_hours <= 0 || self.jwt.refresh_hours <= 0 {
            bail!("token lifetimes must be positive");
        }
        if self.jwt.refresh_hours < self.jwt.access_hours {
            bail!("refresh token lifetime must not be shorter than access token lifetime");
        }
        if self.security.max_login_attempts == 0 {
            bail!("MAX_LOGIN_ATTEMPTS must be at least 1");
        }
        if self.security.lockout_duration.is_zero() {
            bail!("LOCKOUT_MINUTES must be at least 1");
        }
        if !(BCRYPT_MIN_COST..=BCRYPT_MAX_COST).contains(&self.security.bcrypt_cost) {
            bail!("BCRYPT_COST out of range");
        }
        if self.rate_limit.enabled && self.rate_limit.requests_per_minute == 0 {
            bail!("RATE_LIMIT_RPM must be at least 1 when rate limiting is enabled");
        }
        Ok(())
    }

    pub fn needs_redis(&self) -> bool {
        self.revocation_backend == StorageBackend::Redis
            || (self.rate_limit.enabled && self.rate_limit.backend == StorageBackend::Redis)
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {name}: {e}")),
        _ => Ok(default),
    }
}

fn parse_ip_list(raw: &str) -> Result<Vec<IpAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<IpAddr>()
                .with_context(|| format!("invalid address in TRUSTED_PROXIES: {entry}"))
        })
        .collect()
}

fn flag_var(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| parse_flag(&v).unwrap_or(default))
        .unwrap_or(default)
}

fn parse_flag(raw: &str) -> Option<bool> {
    let raw = raw.trim();
    if ["1", "true", "on", "yes"].iter().any(|t| raw.eq_ignore_ascii_case(t)) {
        Some(true)
    } else if ["0", "false", "off", "no"].iter().any(|t| raw.eq_ignore_ascii_case(t)) {
        Some(false)
    } else {
        None
    }
}
