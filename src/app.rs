//! Application Assembly
//! Mission: Build every access-control component from config, own their
//! background tasks, and expose the HTTP router

use crate::auth::{
    api, authenticate, require_admin,
    models::UserRole,
    revocation::{MemoryRevocationStore, SharedRevocationStore},
    AccessPolicy, AccessService, LoginAttemptLedger, RevocationStore, SqliteLoginAttemptLedger,
    SqliteUserStore, SystemSettings, TokenIssuer,
};
use crate::clock::Clock;
use crate::config::{AppConfig, StorageBackend};
use crate::db::Database;
use crate::limiter::{self, MemoryRateLimiter, RateLimiter, SharedRateLimiter};
use crate::middleware::{client_ip::TrustedProxies, rate_limit, request_logging};
use crate::shared_store::{RedisStore, SharedStore};
use crate::tasks::PeriodicTask;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

const SWEEP_PERIOD: Duration = Duration::from_secs(5 * 60);
const RETENTION_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub access: Arc<AccessService>,
    /// `None` when rate limiting is disabled.
    pub limiter: Option<Arc<RateLimiter>>,
    pub revocations: Arc<RevocationStore>,
    pub trusted_proxies: TrustedProxies,
}

/// Every component, explicitly constructed, plus the tasks that maintain them.
pub struct AccessContext {
    pub state: AppState,
    tasks: Vec<PeriodicTask>,
}

impl AccessContext {
    /// Build from config, connecting to Redis when a component needs it.
    pub async fn build(config: &AppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let shared: Option<Arc<dyn SharedStore>> = if config.needs_redis() {
            Some(Arc::new(RedisStore::new(&config.redis.url)?))
        } else {
            None
        };
        Self::build_with_store(config, clock, shared).await
    }

    /// Build with an explicit shared backend (any `SharedStore`).
    pub async fn build_with_store(
        config: &AppConfig,
        clock: Arc<dyn Clock>,
        shared: Option<Arc<dyn SharedStore>>,
    ) -> Result<Self> {
        let db = Database::open(&config.database_path)?;

        let revocations = Arc::new(match (config.revocation_backend, shared.clone()) {
            (StorageBackend::Redis, Some(store)) => {
                RevocationStore::Shared(SharedRevocationStore::new(store, clock.clone()))
            }
            _ => RevocationStore::InProcess(MemoryRevocationStore::new(clock.clone())),
        });

        let limiter = if config.rate_limit.enabled {
            let limit = config.rate_limit.requests_per_minute;
            let limiter = match (config.rate_limit.backend, shared) {
                (StorageBackend::Redis, Some(store)) => {
                    let shared = SharedRateLimiter::new(
                        store,
                        limit,
                        limiter::WINDOW,
                        config.redis.recovery_delay,
                        clock.clone(),
                    );
                    shared.connect().await;
                    RateLimiter::Shared(shared)
                }
                _ => RateLimiter::InProcess(MemoryRateLimiter::new(
                    limit,
                    limiter::WINDOW,
                    clock.clone(),
                )),
            };
            Some(Arc::new(limiter))
        } else {
            None
        };

        let attempts: Arc<dyn LoginAttemptLedger> =
            Arc::new(SqliteLoginAttemptLedger::new(db.clone(), clock.clone()));
        let access = Arc::new(build_service(
            config,
            db,
            attempts.clone(),
            revocations.clone(),
            clock,
        ));

        bootstrap_admin(&access, config).await?;

        let mut tasks = vec![
            {
                let revocations = revocations.clone();
                PeriodicTask::spawn("revocation-sweep", SWEEP_PERIOD, move || {
                    let revocations = revocations.clone();
                    async move {
                        revocations.sweep();
                    }
                })
            },
            {
                let retention = config.security.attempt_retention;
                PeriodicTask::spawn("login-attempt-retention", RETENTION_PERIOD, move || {
                    let attempts = attempts.clone();
                    async move {
                        if let Err(e) = attempts.purge_older_than(retention).await {
                            warn!("Login attempt retention sweep failed: {:#}", e);
                        }
                    }
                })
            },
        ];

        if let Some(limiter) = limiter.clone() {
            tasks.push(PeriodicTask::spawn(
                "rate-limit-cleanup",
                SWEEP_PERIOD,
                move || {
                    let limiter = limiter.clone();
                    async move {
                        limiter.cleanup();
                    }
                },
            ));
        }

        info!(
            revocation = revocations.backend_name(),
            rate_limit = limiter.as_ref().map(|l| l.backend_name()).unwrap_or("disabled"),
            "🛡️ Access control ready"
        );

        Ok(Self {
            state: AppState {
                access,
                limiter,
                revocations,
                trusted_proxies: TrustedProxies::new(config.trusted_proxies.iter().copied()),
            },
            tasks,
        })
    }

    pub fn router(&self) -> Router {
        router(self.state.clone())
    }

    /// Stop background tasks and any in-flight recovery probe.
    pub async fn shutdown(self) {
        if let Some(limiter) = &self.state.limiter {
            limiter.shutdown();
        }
        for task in self.tasks {
            task.shutdown().await;
        }
    }
}

/// Access service over the SQLite credential store.
pub fn build_service(
    config: &AppConfig,
    db: Database,
    attempts: Arc<dyn LoginAttemptLedger>,
    revocations: Arc<RevocationStore>,
    clock: Arc<dyn Clock>,
) -> AccessService {
    AccessService::new(
        Arc::new(SqliteUserStore::new(db.clone(), clock.clone())),
        attempts,
        revocations,
        Arc::new(TokenIssuer::new(
            &config.jwt.secret,
            config.jwt.access_hours,
            config.jwt.refresh_hours,
            clock.clone(),
        )),
        Arc::new(SystemSettings::new(db, clock.clone())),
        clock,
        AccessPolicy::from_config(&config.security),
    )
}

async fn bootstrap_admin(access: &AccessService, config: &AppConfig) -> Result<()> {
    let Some((username, password)) = &config.security.default_admin else {
        return Ok(());
    };
    if access.user_count().await? > 0 {
        return Ok(());
    }

    access
        .create_account(username, password, None, Some(UserRole::Admin))
        .await
        .context("Failed to create default admin")?;
    info!("👤 Default admin '{}' created", username);
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/api/auth/register", post(api::register))
        .route("/api/auth/login", post(api::login))
        .route("/api/auth/refresh", post(api::refresh))
        .route("/api/auth/logout", post(api::logout))
        .route_layer(from_fn_with_state(state.clone(), rate_limit));

    // Layers run outermost-last: authenticate, then rate limit by user.
    let protected_routes = Router::new()
        .route("/api/auth/password", put(api::change_password))
        .route("/api/auth/me", get(api::me))
        .route_layer(from_fn_with_state(state.clone(), rate_limit))
        .route_layer(from_fn_with_state(state.clone(), authenticate));

    let admin_routes = Router::new()
        .route(
            "/api/admin/settings/registration",
            put(api::set_registration),
        )
        .route_layer(from_fn_with_state(state.clone(), require_admin))
        .route_layer(from_fn_with_state(state.clone(), rate_limit))
        .route_layer(from_fn_with_state(state.clone(), authenticate));

    Router::new()
        .route("/health", get(health_check))
        .merge(public_routes)
        .merge(protected_routes)
        .merge(admin_routes)
        .layer(from_fn(request_logging))
        .layer(Extension(state.trusted_proxies.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let rate_limit = match &state.limiter {
        Some(limiter) => json!({
            "enabled": true,
            "backend": limiter.backend_name(),
            "fallback_active": limiter.using_fallback(),
        }),
        None => json!({ "enabled": false }),
    };

    Json(json!({
        "status": "ok",
        "rate_limit": rate_limit,
        "revocation": { "backend": state.revocations.backend_name() },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{JwtConfig, RateLimitConfig, RedisConfig, SecurityConfig};
    use crate::shared_store::testing::FakeSharedStore;

    fn config() -> AppConfig {
        AppConfig {
            server_addr: "127.0.0.1:0".to_string(),
            database_path: ":memory:".to_string(),
            jwt: JwtConfig {
                secret: "s".repeat(32),
                access_hours: 1,
                refresh_hours: 24,
            },
            security: SecurityConfig {
                bcrypt_cost: crate::config::BCRYPT_MIN_COST,
                ..SecurityConfig::default()
            },
            rate_limit: RateLimitConfig::default(),
            revocation_backend: StorageBackend::Memory,
            redis: RedisConfig::default(),
            trusted_proxies: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_default_admin_bootstrap() {
        let mut config = config();
        config.security.default_admin = Some(("root1".to_string(), "pass-word-1".to_string()));

        let ctx = AccessContext::build(&config, Arc::new(ManualClock::starting_now()))
            .await
            .unwrap();
        let session = ctx
            .state
            .access
            .login("root1", "pass-word-1", "127.0.0.1")
            .await
            .unwrap();
        assert_eq!(session.user.role, UserRole::Admin);
        ctx.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_redis_backends_selected_and_degrade() {
        let mut config = config();
        config.rate_limit.backend = StorageBackend::Redis;
        config.revocation_backend = StorageBackend::Redis;

        let fake = Arc::new(FakeSharedStore::healthy());
        fake.set_healthy(false);
        let ctx = AccessContext::build_with_store(
            &config,
            Arc::new(ManualClock::starting_now()),
            Some(fake.clone() as Arc<dyn SharedStore>),
        )
        .await
        .unwrap();

        let limiter = ctx.state.limiter.clone().unwrap();
        assert_eq!(limiter.backend_name(), "redis");
        assert!(limiter.using_fallback());
        assert_eq!(ctx.state.revocations.backend_name(), "redis");
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn test_rate_limit_disabled() {
        let mut config = config();
        config.rate_limit.enabled = false;
        let ctx = AccessContext::build(&config, Arc::new(ManualClock::starting_now()))
            .await
            .unwrap();
        assert!(ctx.state.limiter.is_none());
        ctx.shutdown().await;
    }
}
