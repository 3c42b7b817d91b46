//! Authentication Middleware
//! Mission: Protect API endpoints with bearer-token validation

use crate::app::AppState;
use crate::auth::{error::AccessError, models::AuthUser};
use crate::middleware::{
    client_ip::ClientIp,
    rate_limit::{enforce, limiter_key},
};
use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use tracing::warn;

/// Token from `Authorization: Bearer <token>`, if well-formed.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Validates the bearer token and places the caller in request extensions.
///
/// A rejected request is still charged to the caller's address, so failed
/// authentication cannot bypass the rate limiter.
pub async fn authenticate(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    mut req: Request,
    next: Next,
) -> Result<Response, AccessError> {
    let token = bearer_token(req.headers()).map(str::to_string);
    let verified = match token {
        Some(token) => state.access.validate(&token).await,
        None => Err(AccessError::MissingToken),
    };

    let claims = match verified {
        Ok(claims) => claims,
        Err(err) => {
            let path = req.uri().path().to_string();
            enforce(&state, &limiter_key(None, &ip), &path).await?;
            return Err(err);
        }
    };

    req.extensions_mut().insert(AuthUser {
        user_id: claims.user_id,
        username: claims.username,
    });

    Ok(next.run(req).await)
}

/// Admin gate; must run after `authenticate`. Reads the live role.
pub async fn require_admin(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AccessError> {
    let user = req
        .extensions()
        .get::<AuthUser>()
        .cloned()
        .ok_or(AccessError::MissingToken)?;

    if !state.access.is_admin(user.user_id).await? {
        warn!(user_id = user.user_id, "Admin route denied");
        return Err(AccessError::Forbidden);
    }

    Ok(next.run(req).await)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AccessError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or(AccessError::MissingToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcg=="));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[tokio::test]
    async fn test_auth_user_extractor_requires_middleware() {
        let (mut parts, _) = axum::http::Request::new(()).into_parts();
        let missing = AuthUser::from_request_parts(&mut parts, &()).await;
        assert!(matches!(missing, Err(AccessError::MissingToken)));

        parts.extensions.insert(AuthUser {
            user_id: 3,
            username: "test".to_string(),
        });
        let found = AuthUser::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(found.user_id, 3);
    }
}
