//! Adaptive Rate Limiter
//! Mission: Cap requests per key, shared across instances when Redis is up

pub mod memory;
pub mod shared;

pub use memory::MemoryRateLimiter;
pub use shared::SharedRateLimiter;

use std::time::Duration;

/// Length of one rate window; limits are configured per minute.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Limiter chosen once at startup.
pub enum RateLimiter {
    Shared(SharedRateLimiter),
    InProcess(MemoryRateLimiter),
}

impl RateLimiter {
    pub async fn allow(&self, key: &str) -> bool {
        match self {
            RateLimiter::Shared(limiter) => limiter.allow(key).await,
            RateLimiter::InProcess(limiter) => limiter.allow(key),
        }
    }

    /// Periodic cleanup of idle in-process keys.
    pub fn cleanup(&self) -> usize {
        match self {
            RateLimiter::Shared(limiter) => limiter.fallback().cleanup(),
            RateLimiter::InProcess(limiter) => limiter.cleanup(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            RateLimiter::Shared(_) => "redis",
            RateLimiter::InProcess(_) => "memory",
        }
    }

    pub fn using_fallback(&self) -> bool {
        match self {
            RateLimiter::Shared(limiter) => limiter.using_fallback(),
            RateLimiter::InProcess(_) => false,
        }
    }

    pub fn shutdown(&self) {
        if let RateLimiter::Shared(limiter) = self {
            limiter.shutdown();
        }
    }
}
