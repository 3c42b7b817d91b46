//! Access Service
//! Mission: The one entry point for login, session validation, refresh, logout,
//! password change and registration

use crate::auth::error::AccessError;
use crate::auth::jwt::TokenIssuer;
use crate::auth::login_attempts::LoginAttemptLedger;
use crate::auth::models::{Claims, LoginAttempt, NewUser, TokenPair, User, UserRole};
use crate::auth::revocation::RevocationStore;
use crate::auth::user_store::{CredentialStore, SystemSettings, UsernameTaken};
use crate::clock::Clock;
use crate::config::SecurityConfig;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const USERNAME_MIN_LEN: usize = 3;
const USERNAME_MAX_LEN: usize = 50;

/// Tunables the service enforces.
#[derive(Debug, Clone)]
pub struct AccessPolicy {
    pub max_login_attempts: u32,
    pub lockout_duration: Duration,
    pub bcrypt_cost: u32,
    pub password_min_length: usize,
    pub registration_default: bool,
}

impl AccessPolicy {
    pub fn from_config(security: &SecurityConfig) -> Self {
        Self {
            max_login_attempts: security.max_login_attempts,
            lockout_duration: security.lockout_duration,
            bcrypt_cost: security.bcrypt_cost,
            password_min_length: security.password_min_length,
            registration_default: security.registration_enabled,
        }
    }
}

/// Tokens plus the account they were issued for.
#[derive(Debug, Clone)]
pub struct Session {
    pub tokens: TokenPair,
    pub user: User,
}

pub struct AccessService {
    users: Arc<dyn CredentialStore>,
    attempts: Arc<dyn LoginAttemptLedger>,
    revocations: Arc<RevocationStore>,
    issuer: Arc<TokenIssuer>,
    settings: Arc<SystemSettings>,
    clock: Arc<dyn Clock>,
    policy: AccessPolicy,
}

impl AccessService {
    pub fn new(
        users: Arc<dyn CredentialStore>,
        attempts: Arc<dyn LoginAttemptLedger>,
        revocations: Arc<RevocationStore>,
        issuer: Arc<TokenIssuer>,
        settings: Arc<SystemSettings>,
        clock: Arc<dyn Clock>,
        policy: AccessPolicy,
    ) -> Self {
        Self {
            users,
            attempts,
            revocations,
            issuer,
            settings,
            clock,
            policy,
        }
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// Lockout check, credential check, attempt bookkeeping, token issuance.
    ///
    /// The attempt is recorded only once its outcome is known; a caller
    /// that drops this future before then leaves no trace in the ledger.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        origin: &str,
    ) -> Result<Session, AccessError> {
        let username = username.trim();
        let failures = self
            .attempts
            .recent_failures(username, self.policy.lockout_duration)
            .await?;

        if failures >= self.policy.max_login_attempts {
            // Rejected attempts extend the lockout window
            self.record_attempt(username, origin, false).await;
            warn!(
                username,
                ip = origin,
                failures,
                "🔒 Login rejected, account locked"
            );
            return Err(AccessError::AccountLocked);
        }

        let Some(user) = self.users.get_user_by_username(username).await? else {
            self.record_attempt(username, origin, false).await;
            warn!(username, ip = origin, "❌ Failed login attempt: unknown user");
            return Err(AccessError::InvalidCredentials);
        };

        if !verify_password(password, &user.password_hash).await? {
            self.record_attempt(username, origin, false).await;
            warn!(username, ip = origin, "❌ Failed login attempt: bad password");
            return Err(AccessError::InvalidCredentials);
        }

        self.record_attempt(username, origin, true).await;
        let tokens = self
            .issuer
            .issue_pair(user.id, &user.username, user.password_version)?;

        info!(
            "✅ Login successful: {} ({})",
            user.username,
            user.role.as_str()
        );
        Ok(Session { tokens, user })
    }

    /// Full session check: signature and expiry, revocation, live password version.
    pub async fn validate(&self, token: &str) -> Result<Claims, AccessError> {
        let claims = self.issuer.validate(token)?;

        if self.revocations.is_revoked(token).await {
            debug!(user_id = claims.user_id, "Rejected revoked token");
            return Err(AccessError::Invalid);
        }

        let user = self
            .users
            .get_user_by_id(claims.user_id)
            .await?
            .ok_or(AccessError::Invalid)?;

        if user.password_version != claims.password_version {
            debug!(user_id = claims.user_id, "Rejected token from before password change");
            return Err(AccessError::PasswordChanged);
        }

        Ok(claims)
    }

    /// Mint a new access token. The refresh token goes through the same
    /// checks as an access token so a password change ends refresh flows too.
    pub async fn refresh(&self, refresh_token: &str) -> Result<String, AccessError> {
        self.validate(refresh_token).await?;
        let access = self.issuer.refresh_access(refresh_token)?;
        Ok(access)
    }

    /// Revoke `token` for the rest of its own lifetime. Never fails.
    pub async fn logout(&self, token: &str) {
        let claims = match self.issuer.validate(token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!("Logout with unusable token ({}), nothing to revoke", e);
                return;
            }
        };

        let remaining = claims.exp - self.clock.now().timestamp();
        if remaining <= 0 {
            return;
        }

        self.revocations
            .add(token, Duration::from_secs(remaining as u64))
            .await;
        info!(user_id = claims.user_id, "👋 Token revoked on logout");
    }

    /// Verify the old password, store the new hash and bump the password
    /// version, which invalidates every token issued before this call.
    pub async fn change_password(
        &self,
        user_id: i64,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), AccessError> {
        let user = self
            .users
            .get_user_by_id(user_id)
            .await?
            .ok_or(AccessError::UserNotFound)?;

        if !verify_password(old_password, &user.password_hash).await? {
            warn!(user_id, "Password change rejected: old password mismatch");
            return Err(AccessError::InvalidPassword);
        }

        self.check_password_policy(new_password)?;

        let hash = hash_password(new_password, self.policy.bcrypt_cost).await?;
        let version = self.clock.now().timestamp_millis();
        if !self.users.update_password(user_id, &hash, version).await? {
            return Err(AccessError::UserNotFound);
        }

        info!(user_id, "🔑 Password changed, outstanding sessions invalidated");
        Ok(())
    }

    /// Self-service sign-up, gated by the registration setting.
    pub async fn register(
        &self,
        username: &str,
        password: &str,
        email: Option<String>,
    ) -> Result<User, AccessError> {
        if !self.registration_enabled()? {
            return Err(AccessError::RegistrationDisabled);
        }
        self.create_account(username, password, email, None).await
    }

    /// Create an account without consulting the registration flag.
    /// `role: None` makes the very first account an admin.
    pub async fn create_account(
        &self,
        username: &str,
        password: &str,
        email: Option<String>,
        role: Option<UserRole>,
    ) -> Result<User, AccessError> {
        let username = username.trim();
        validate_username(username)?;
        let email = normalize_email(email)?;
        self.check_password_policy(password)?;

        if self.users.username_exists(username).await? {
            return Err(AccessError::UsernameExists);
        }

        let password_hash = hash_password(password, self.policy.bcrypt_cost).await?;
        let new_user = NewUser {
            username: username.to_string(),
            password_hash,
            password_version: self.clock.now().timestamp_millis(),
            email,
            role,
        };

        match self.users.create_user(new_user).await {
            Ok(user) => Ok(user),
            Err(e) if e.downcast_ref::<UsernameTaken>().is_some() => {
                Err(AccessError::UsernameExists)
            }
            Err(e) => Err(AccessError::Internal(e)),
        }
    }

    pub async fn current_user(&self, user_id: i64) -> Result<User, AccessError> {
        self.users
            .get_user_by_id(user_id)
            .await?
            .ok_or(AccessError::UserNotFound)
    }

    /// Role check against the live record, not a token snapshot.
    pub async fn is_admin(&self, user_id: i64) -> Result<bool, AccessError> {
        Ok(self
            .users
            .get_user_by_id(user_id)
            .await?
            .map(|u| u.role == UserRole::Admin)
            .unwrap_or(false))
    }

    pub fn registration_enabled(&self) -> Result<bool, AccessError> {
        Ok(self
            .settings
            .registration_enabled(self.policy.registration_default)?)
    }

    pub fn set_registration_enabled(&self, enabled: bool) -> Result<(), AccessError> {
        self.settings.set_registration_enabled(enabled)?;
        Ok(())
    }

    pub async fn user_count(&self) -> Result<i64, AccessError> {
        Ok(self.users.count_users().await?)
    }

    fn check_password_policy(&self, password: &str) -> Result<(), AccessError> {
        if password.chars().count() < self.policy.password_min_length {
            return Err(AccessError::WeakPassword(self.policy.password_min_length));
        }
        Ok(())
    }

    async fn record_attempt(&self, username: &str, origin: &str, success: bool) {
        let attempt = LoginAttempt {
            username: username.to_string(),
            ip_address: origin.to_string(),
            success,
            attempted_at: self.clock.now(),
        };
        if let Err(e) = self.attempts.record(&attempt).await {
            warn!(username, "Failed to record login attempt: {:#}", e);
        }
    }
}

fn validate_username(username: &str) -> Result<(), AccessError> {
    let len = username.chars().count();
    if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len) {
        return Err(AccessError::InvalidInput(format!(
            "username must be {USERNAME_MIN_LEN}-{USERNAME_MAX_LEN} characters"
        )));
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AccessError::InvalidInput(
            "username must contain only letters and digits".to_string(),
        ));
    }
    Ok(())
}

fn normalize_email(email: Option<String>) -> Result<Option<String>, AccessError> {
    match email.map(|e| e.trim().to_string()) {
        None => Ok(None),
        Some(e) if e.is_empty() => Ok(None),
        Some(e) => {
            let valid = e
                .split_once('@')
                .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
                .unwrap_or(false);
            if valid {
                Ok(Some(e))
            } else {
                Err(AccessError::InvalidInput("invalid email address".to_string()))
            }
        }
    }
}

/// bcrypt is CPU-bound; keep it off the async workers.
pub async fn hash_password(password: &str, cost: u32) -> anyhow::Result<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .context("Password hashing task failed")?
        .context("Failed to hash password")
}

pub async fn verify_password(password: &str, hash: &str) -> anyhow::Result<bool> {
    let password = password.to_string();
    let hash = hash.to_string();
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .context("Password verification task failed")?
        .context("Failed to verify password")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::login_attempts::SqliteLoginAttemptLedger;
    use crate::auth::revocation::MemoryRevocationStore;
    use crate::auth::user_store::SqliteUserStore;
    use crate::clock::ManualClock;
    use crate::db::Database;
    use anyhow::anyhow;
    use async_trait::async_trait;

    const SECRET: &str = "test-secret-key-that-is-at-least-32-bytes";

    struct Fixture {
        service: AccessService,
        clock: ManualClock,
    }

    fn policy() -> AccessPolicy {
        AccessPolicy {
            max_login_attempts: 5,
            lockout_duration: Duration::from_secs(15 * 60),
            bcrypt_cost: crate::config::BCRYPT_MIN_COST,
            password_min_length: 8,
            registration_default: true,
        }
    }

    fn fixture_with_ledger(attempts: Option<Arc<dyn LoginAttemptLedger>>) -> Fixture {
        let clock = ManualClock::starting_now();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let db = Database::open_in_memory().unwrap();

        let attempts: Arc<dyn LoginAttemptLedger> = match attempts {
            Some(attempts) => attempts,
            None => Arc::new(SqliteLoginAttemptLedger::new(db.clone(), shared_clock.clone())),
        };

        let service = AccessService::new(
            Arc::new(SqliteUserStore::new(db.clone(), shared_clock.clone())),
            attempts,
            Arc::new(RevocationStore::InProcess(MemoryRevocationStore::new(
                shared_clock.clone(),
            ))),
            Arc::new(TokenIssuer::new(SECRET, 24, 168, shared_clock.clone())),
            Arc::new(SystemSettings::new(db, shared_clock.clone())),
            shared_clock,
            policy(),
        );
        Fixture { service, clock }
    }

    fn fixture() -> Fixture {
        fixture_with_ledger(None)
    }

    #[tokio::test]
    async fn test_lockout_scenario() {
        let f = fixture();
        f.service
            .register("alice", "correct-horse", None)
            .await
            .unwrap();

        for _ in 0..5 {
            let err = f.service.login("alice", "wrong-pass", "10.0.0.1").await;
            assert!(matches!(err, Err(AccessError::InvalidCredentials)));
            f.clock.advance(chrono::Duration::seconds(24));
        }

        // Correct password, still locked
        let err = f.service.login("alice", "correct-horse", "10.0.0.1").await;
        assert!(matches!(err, Err(AccessError::AccountLocked)));

        f.clock.advance(chrono::Duration::minutes(16));
        let session = f
            .service
            .login("alice", "correct-horse", "10.0.0.1")
            .await
            .unwrap();
        let claims = f.service.validate(&session.tokens.access_token).await.unwrap();
        assert_eq!(claims.username, "alice");
    }

    #[tokio::test]
    async fn test_locked_attempts_extend_lockout() {
        let f = fixture();
        f.service.register("bob12", "password1", None).await.unwrap();

        for _ in 0..5 {
            let _ = f.service.login("bob12", "nope-nope", "1.1.1.1").await;
        }
        // Keep trying every 2 minutes; each rejection is a fresh failure, so
        // the lockout outlives the original failures' 15 minute window.
        for _ in 0..12 {
            f.clock.advance(chrono::Duration::minutes(2));
            let err = f.service.login("bob12", "password1", "1.1.1.1").await;
            assert!(matches!(err, Err(AccessError::AccountLocked)));
        }
    }

    #[tokio::test]
    async fn test_login_trims_username() {
        let f = fixture();
        f.service
            .register("  carol  ", "correct-horse", None)
            .await
            .unwrap();

        let session = f
            .service
            .login(" carol ", "correct-horse", "10.0.0.1")
            .await
            .unwrap();
        assert_eq!(session.user.username, "carol");

        // Padded and bare names share one lockout count
        for _ in 0..5 {
            let _ = f.service.login("carol\t", "wrong-pass", "10.0.0.1").await;
        }
        let err = f.service.login("carol", "correct-horse", "10.0.0.1").await;
        assert!(matches!(err, Err(AccessError::AccountLocked)));
    }

    #[tokio::test]
    async fn test_unknown_user_is_invalid_credentials() {
        let f = fixture();
        let err = f.service.login("ghost", "whatever1", "1.1.1.1").await;
        assert!(matches!(err, Err(AccessError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_password_change_invalidates_sessions() {
        let f = fixture();
        let user = f.service.register("carol", "first-pass", None).await.unwrap();
        let session = f.service.login("carol", "first-pass", "ip").await.unwrap();

        f.service
            .change_password(user.id, "first-pass", "second-pass")
            .await
            .unwrap();

        let access = f.service.validate(&session.tokens.access_token).await;
        assert!(matches!(access, Err(AccessError::PasswordChanged)));
        let refresh = f.service.refresh(&session.tokens.refresh_token).await;
        assert!(matches!(refresh, Err(AccessError::PasswordChanged)));

        let fresh = f.service.login("carol", "second-pass", "ip").await.unwrap();
        assert!(f.service.validate(&fresh.tokens.access_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_two_changes_in_same_instant_both_invalidate() {
        let f = fixture();
        let user = f.service.register("dave1", "pass-one-1", None).await.unwrap();

        f.service
            .change_password(user.id, "pass-one-1", "pass-two-2")
            .await
            .unwrap();
        let session = f.service.login("dave1", "pass-two-2", "ip").await.unwrap();

        // Clock has not moved; version must still advance
        f.service
            .change_password(user.id, "pass-two-2", "pass-three")
            .await
            .unwrap();
        let result = f.service.validate(&session.tokens.access_token).await;
        assert!(matches!(result, Err(AccessError::PasswordChanged)));
    }

    #[tokio::test]
    async fn test_change_password_errors() {
        let f = fixture();
        let user = f.service.register("erin1", "pass-word-1", None).await.unwrap();

        let wrong = f
            .service
            .change_password(user.id, "not-it-at-all", "new-password")
            .await;
        assert!(matches!(wrong, Err(AccessError::InvalidPassword)));

        let missing = f.service.change_password(999, "x", "new-password").await;
        assert!(matches!(missing, Err(AccessError::UserNotFound)));

        let weak = f.service.change_password(user.id, "pass-word-1", "short").await;
        assert!(matches!(weak, Err(AccessError::WeakPassword(8))));
    }

    #[tokio::test]
    async fn test_logout_revokes_and_is_idempotent() {
        let f = fixture();
        f.service.register("frank", "pass-word-1", None).await.unwrap();
        let session = f.service.login("frank", "pass-word-1", "ip").await.unwrap();
        let token = session.tokens.access_token;

        f.service.logout(&token).await;
        f.service.logout(&token).await;
        f.service.logout("garbage").await;

        let result = f.service.validate(&token).await;
        assert!(matches!(result, Err(AccessError::Invalid)));

        // Refresh token was not logged out
        assert!(f.service.refresh(&session.tokens.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_logout_with_expired_token_is_silent() {
        let f = fixture();
        f.service.register("grace", "pass-word-1", None).await.unwrap();
        let session = f.service.login("grace", "pass-word-1", "ip").await.unwrap();

        f.clock.advance(chrono::Duration::hours(25));
        f.service.logout(&session.tokens.access_token).await;
        let result = f.service.validate(&session.tokens.access_token).await;
        assert!(matches!(result, Err(AccessError::Expired)));
    }

    #[tokio::test]
    async fn test_refresh_issues_usable_access_token() {
        let f = fixture();
        f.service.register("heidi", "pass-word-1", None).await.unwrap();
        let session = f.service.login("heidi", "pass-word-1", "ip").await.unwrap();

        f.clock.advance(chrono::Duration::hours(30));
        assert!(matches!(
            f.service.validate(&session.tokens.access_token).await,
            Err(AccessError::Expired)
        ));

        let access = f.service.refresh(&session.tokens.refresh_token).await.unwrap();
        let claims = f.service.validate(&access).await.unwrap();
        assert_eq!(claims.username, "heidi");
    }

    #[tokio::test]
    async fn test_register_rules() {
        let f = fixture();
        let first = f.service.register("admin1", "pass-word-1", None).await.unwrap();
        assert_eq!(first.role, UserRole::Admin);
        assert!(f.service.is_admin(first.id).await.unwrap());

        let second = f
            .service
            .register("user2", "pass-word-1", Some("u2@example.com".to_string()))
            .await
            .unwrap();
        assert_eq!(second.role, UserRole::User);
        assert!(!f.service.is_admin(second.id).await.unwrap());

        let dup = f.service.register("ADMIN1", "pass-word-1", None).await;
        assert!(matches!(dup, Err(AccessError::UsernameExists)));

        let short = f.service.register("ab", "pass-word-1", None).await;
        assert!(matches!(short, Err(AccessError::InvalidInput(_))));

        let symbols = f.service.register("bad name!", "pass-word-1", None).await;
        assert!(matches!(symbols, Err(AccessError::InvalidInput(_))));

        let weak = f.service.register("user3", "short", None).await;
        assert!(matches!(weak, Err(AccessError::WeakPassword(_))));

        let email = f
            .service
            .register("user4", "pass-word-1", Some("not-an-email".to_string()))
            .await;
        assert!(matches!(email, Err(AccessError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_registration_toggle() {
        let f = fixture();
        f.service.set_registration_enabled(false).unwrap();
        let err = f.service.register("ivan1", "pass-word-1", None).await;
        assert!(matches!(err, Err(AccessError::RegistrationDisabled)));

        // Operator path ignores the flag
        f.service
            .create_account("ivan1", "pass-word-1", None, Some(UserRole::User))
            .await
            .unwrap();

        f.service.set_registration_enabled(true).unwrap();
        assert!(f.service.register("judy1", "pass-word-1", None).await.is_ok());
    }

    struct BrokenLedger;

    #[async_trait]
    impl LoginAttemptLedger for BrokenLedger {
        async fn record(&self, _attempt: &LoginAttempt) -> anyhow::Result<()> {
            Err(anyhow!("disk full"))
        }

        async fn recent_failures(&self, _username: &str, _window: Duration) -> anyhow::Result<u32> {
            Ok(0)
        }

        async fn purge_older_than(&self, _age: Duration) -> anyhow::Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_recording_failure_does_not_fail_login() {
        let f = fixture_with_ledger(Some(Arc::new(BrokenLedger)));
        f.service.register("kate1", "pass-word-1", None).await.unwrap();
        assert!(f.service.login("kate1", "pass-word-1", "ip").await.is_ok());
        assert!(matches!(
            f.service.login("kate1", "bad-password", "ip").await,
            Err(AccessError::InvalidCredentials)
        ));
    }
}
