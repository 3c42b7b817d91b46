//! Rate limiting middleware.
//!
//! Keys by `user:<id>` when an earlier layer authenticated the caller,
//! otherwise by `ip:<address>`. Requests that fail authentication are
//! charged to their address by `authenticate` itself.

use crate::app::AppState;
use crate::auth::{error::AccessError, models::AuthUser};
use crate::middleware::client_ip::ClientIp;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const SLOW_CHECK: Duration = Duration::from_millis(100);

pub fn limiter_key(user: Option<&AuthUser>, ip: &str) -> String {
    match user {
        Some(user) => format!("user:{}", user.user_id),
        None => format!("ip:{ip}"),
    }
}

/// Rate limiting middleware function.
pub async fn rate_limit(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    request: Request,
    next: Next,
) -> Response {
    let key = limiter_key(request.extensions().get::<AuthUser>(), &ip);
    let path = request.uri().path().to_string();

    match enforce(&state, &key, &path).await {
        Ok(()) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}

/// Charge one request to `key`. Passes when rate limiting is disabled.
pub async fn enforce(state: &AppState, key: &str, path: &str) -> Result<(), AccessError> {
    let Some(limiter) = state.limiter.as_ref() else {
        return Ok(());
    };

    let start = Instant::now();
    let allowed = limiter.allow(key).await;
    let elapsed = start.elapsed();

    if elapsed > SLOW_CHECK {
        warn!(
            key = %key,
            backend = limiter.backend_name(),
            latency_ms = elapsed.as_millis(),
            "Slow rate limit check"
        );
    }

    if allowed {
        Ok(())
    } else {
        info!(key = %key, path = %path, "Rate limit exceeded");
        Err(AccessError::RateLimited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_selection() {
        let user = AuthUser {
            user_id: 42,
            username: "alice".to_string(),
        };
        assert_eq!(limiter_key(Some(&user), "10.0.0.1"), "user:42");
        assert_eq!(limiter_key(None, "10.0.0.1"), "ip:10.0.0.1");
    }
}
