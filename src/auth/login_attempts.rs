//! Login Attempt Ledger
//! Mission: Append-only record of login attempts, queried for lockout decisions

use crate::auth::models::LoginAttempt;
use crate::clock::Clock;
use crate::db::Database;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::params;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[async_trait]
pub trait LoginAttemptLedger: Send + Sync {
    /// Append one attempt. Callers treat failures as non-fatal.
    async fn record(&self, attempt: &LoginAttempt) -> Result<()>;

    /// Failed attempts for `username` within the trailing `window`.
    async fn recent_failures(&self, username: &str, window: Duration) -> Result<u32>;

    /// Retention sweep; returns the number of rows removed.
    async fn purge_older_than(&self, age: Duration) -> Result<usize>;
}

pub struct SqliteLoginAttemptLedger {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl SqliteLoginAttemptLedger {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    fn cutoff_millis(&self, age: Duration) -> i64 {
        self.clock.now().timestamp_millis() - age.as_millis() as i64
    }
}

#[async_trait]
impl LoginAttemptLedger for SqliteLoginAttemptLedger {
    async fn record(&self, attempt: &LoginAttempt) -> Result<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO login_attempts (username, ip_address, success, attempted_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                attempt.username,
                attempt.ip_address,
                attempt.success,
                attempt.attempted_at.timestamp_millis(),
            ],
        )
        .context("Failed to record login attempt")?;
        Ok(())
    }

    async fn recent_failures(&self, username: &str, window: Duration) -> Result<u32> {
        let since = self.cutoff_millis(window);
        let conn = self.db.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM login_attempts
                 WHERE username = ?1 AND success = 0 AND attempted_at > ?2",
                params![username, since],
                |row| row.get(0),
            )
            .context("Failed to count login failures")?;
        Ok(count.max(0) as u32)
    }

    async fn purge_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = self.cutoff_millis(age);
        let conn = self.db.lock();
        let removed = conn
            .execute(
                "DELETE FROM login_attempts WHERE attempted_at < ?1",
                params![cutoff],
            )
            .context("Failed to purge login attempts")?;

        if removed > 0 {
            info!("🧹 Purged {} expired login attempts", removed);
        }
        Ok(removed)
    }
}
