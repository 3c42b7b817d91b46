//! JWT Token Issuer
//! Mission: Mint and validate self-contained access/refresh token pairs

use crate::auth::error::TokenError;
use crate::auth::models::{Claims, TokenPair};
use crate::clock::Clock;
use anyhow::{Context, Result};
use chrono::Duration;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Token issuer for HS256-signed session tokens
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    pub fn new(secret: &str, access_hours: i64, refresh_hours: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            access_ttl: Duration::hours(access_hours),
            refresh_ttl: Duration::hours(refresh_hours),
            clock,
        }
    }

    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl.num_seconds()
    }

    /// Issue an access + refresh pair carrying the same password-version snapshot.
    pub fn issue_pair(
        &self,
        user_id: i64,
        username: &str,
        password_version: i64,
    ) -> Result<TokenPair> {
        let access_token = self.sign(user_id, username, password_version, self.access_ttl)?;
        let refresh_token = self.sign(user_id, username, password_version, self.refresh_ttl)?;

        debug!(
            "Issued token pair for user {} ({}), access expires in {}s",
            username,
            user_id,
            self.access_ttl_secs()
        );

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.access_ttl_secs(),
        })
    }

    /// Verify signature and time bounds. Knows nothing about revocation or
    /// the user's current password version.
    pub fn validate(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Time bounds are checked against the injected clock below.
        validation.validate_exp = false;
        validation.validate_nbf = false;

        let claims = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|_| TokenError::Invalid)?
            .claims;

        let now = self.clock.now().timestamp();
        if now >= claims.exp {
            return Err(TokenError::Expired);
        }
        if now < claims.nbf || now < claims.iat {
            return Err(TokenError::Invalid);
        }

        Ok(claims)
    }

    /// Mint a new access token from a refresh token, keeping the embedded
    /// password version rather than re-reading it from storage.
    pub fn refresh_access(&self, refresh_token: &str) -> Result<String, TokenError> {
        let claims = self.validate(refresh_token)?;
        self.sign(
            claims.user_id,
            &claims.username,
            claims.password_version,
            self.access_ttl,
        )
        .map_err(|_| TokenError::Invalid)
    }

    fn sign(
        &self,
        user_id: i64,
        username: &str,
        password_version: i64,
        ttl: Duration,
    ) -> Result<String> {
        let now = self.clock.now();
        let exp = now.checked_add_signed(ttl).context("Invalid timestamp")?;

        let claims = Claims {
            user_id,
            username: username.to_string(),
            password_version,
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: exp.timestamp(),
            jti: Uuid::new_v4().simple().to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("Failed to generate JWT")
    }
}
