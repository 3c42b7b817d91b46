//! User Storage
//! Mission: Credential store over SQLite: lookups, creation and password-version bumps

use crate::auth::models::{NewUser, User, UserRole};
use crate::clock::Clock;
use crate::db::Database;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Returned (inside `anyhow::Error`) when a username is already taken.
#[derive(Debug, Error)]
#[error("username already exists: {0}")]
pub struct UsernameTaken(pub String);

/// The credential store consumed by the access service.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>>;

    async fn get_user_by_id(&self, user_id: i64) -> Result<Option<User>>;

    /// Replace the hash and move the password version forward. The stored
    /// version is never lowered: it becomes `max(current + 1, version)`.
    /// Returns false when no such user exists.
    async fn update_password(&self, user_id: i64, password_hash: &str, version: i64)
        -> Result<bool>;

    async fn create_user(&self, new_user: NewUser) -> Result<User>;

    /// Case-insensitive existence check.
    async fn username_exists(&self, username: &str) -> Result<bool>;

    async fn count_users(&self) -> Result<i64>;
}

/// User storage with SQLite backend
pub struct SqliteUserStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

const USER_COLUMNS: &str =
    "id, username, password_hash, password_version, role, email, created_at, updated_at";

impl SqliteUserStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
        let role_str: String = row.get(4)?;
        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            password_hash: row.get(2)?,
            password_version: row.get(3)?,
            role: UserRole::parse(&role_str).unwrap_or(UserRole::User),
            email: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

#[async_trait]
impl CredentialStore for SqliteUserStore {
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.db.lock();
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
            params![username],
            Self::row_to_user,
        )
        .optional()
        .context("Failed to load user by username")
    }

    async fn get_user_by_id(&self, user_id: i64) -> Result<Option<User>> {
        let conn = self.db.lock();
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![user_id],
            Self::row_to_user,
        )
        .optional()
        .context("Failed to load user by id")
    }

    async fn update_password(
        &self,
        user_id: i64,
        password_hash: &str,
        version: i64,
    ) -> Result<bool> {
        let now = self.clock.now().to_rfc3339();
        let conn = self.db.lock();
        // Single statement: hash and version change together or not at all.
        let rows = conn
            .execute(
                "UPDATE users
                 SET password_hash = ?1,
                     password_version = MAX(password_version + 1, ?2),
                     updated_at = ?3
                 WHERE id = ?4",
                params![password_hash, version, now, user_id],
            )
            .context("Failed to update password")?;

        if rows > 0 {
            info!("🔑 Password updated for user {}", user_id);
        }
        Ok(rows > 0)
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User> {
        let now = self.clock.now().to_rfc3339();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        // First-user admin check and insert share one transaction.
        let role = match new_user.role {
            Some(role) => role,
            None => {
                let count: i64 = tx.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
                if count == 0 {
                    UserRole::Admin
                } else {
                    UserRole::User
                }
            }
        };

        let inserted = tx.execute(
            "INSERT INTO users (username, password_hash, password_version, role, email, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                new_user.username,
                new_user.password_hash,
                new_user.password_version,
                role.as_str(),
                new_user.email,
                now,
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(UsernameTaken(new_user.username).into());
            }
            Err(e) => return Err(e).context("Failed to insert user"),
        }

        let user = User {
            id: tx.last_insert_rowid(),
            username: new_user.username,
            password_hash: new_user.password_hash,
            password_version: new_user.password_version,
            role,
            email: new_user.email,
            created_at: now.clone(),
            updated_at: now,
        };
        tx.commit().context("Failed to commit new user")?;

        info!("✅ Created user: {} ({})", user.username, user.role.as_str());
        Ok(user)
    }

    async fn username_exists(&self, username: &str) -> Result<bool> {
        let conn = self.db.lock();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE username = ?1 COLLATE NOCASE",
                params![username],
                |row| row.get(0),
            )
            .context("Failed to check username")?;
        Ok(count > 0)
    }

    async fn count_users(&self) -> Result<i64> {
        let conn = self.db.lock();
        conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .context("Failed to count users")
    }
}

/// Runtime-adjustable system settings persisted next to the users.
pub struct SystemSettings {
    db: Database,
    clock: Arc<dyn Clock>,
}

const REGISTRATION_KEY: &str = "registration_enabled";

impl SystemSettings {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Stored flag, or `default` when it has never been set.
    pub fn registration_enabled(&self, default: bool) -> Result<bool> {
        let conn = self.db.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT setting_value FROM system_settings WHERE setting_key = ?1",
                params![REGISTRATION_KEY],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read registration setting")?;

        Ok(value.map(|v| v == "true").unwrap_or(default))
    }

    pub fn set_registration_enabled(&self, enabled: bool) -> Result<()> {
        let now = self.clock.now().to_rfc3339();
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO system_settings (setting_key, setting_value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(setting_key) DO UPDATE SET setting_value = ?2, updated_at = ?3",
            params![REGISTRATION_KEY, enabled.to_string(), now],
        )
        .context("Failed to update registration setting")?;

        info!("Registration enabled set to {}", enabled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use tempfile::NamedTempFile;

    fn create_test_store() -> SqliteUserStore {
        let db = Database::open_in_memory().unwrap();
        SqliteUserStore::new(db, Arc::new(ManualClock::starting_now()))
    }

    fn new_user(username: &str, role: Option<UserRole>) -> NewUser {
        NewUser {
            username: username.to_string(),
            password_hash: "hash".to_string(),
            password_version: 100,
            email: None,
            role,
        }
    }

    #[tokio::test]
    async fn test_first_user_becomes_admin() {
        let store = create_test_store();

        let first = store.create_user(new_user("first", None)).await.unwrap();
        let second = store.create_user(new_user("second", None)).await.unwrap();

        assert_eq!(first.role, UserRole::Admin);
        assert_eq!(second.role, UserRole::User);
        assert_eq!(store.count_users().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_explicit_role_wins() {
        let store = create_test_store();
        let user = store
            .create_user(new_user("plain", Some(UserRole::User)))
            .await
            .unwrap();
        assert_eq!(user.role, UserRole::User);
    }

    #[tokio::test]
    async fn test_create_and_retrieve_user() {
        let store = create_test_store();
        let created = store.create_user(new_user("alice", None)).await.unwrap();

        let by_name = store.get_user_by_username("alice").await.unwrap().unwrap();
        assert_eq!(by_name.id, created.id);
        assert_eq!(by_name.password_version, 100);

        let by_id = store.get_user_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(by_id.username, "alice");

        assert!(store.get_user_by_id(created.id + 1).await.unwrap().is_none());
        assert!(store.get_user_by_username("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_usernames_are_case_insensitive() {
        let store = create_test_store();
        store.create_user(new_user("Alice", None)).await.unwrap();

        assert!(store.username_exists("alice").await.unwrap());
        assert!(store.username_exists("ALICE").await.unwrap());

        let err = store.create_user(new_user("aLiCe", None)).await.unwrap_err();
        assert!(err.downcast_ref::<UsernameTaken>().is_some());
    }

    #[tokio::test]
    async fn test_password_version_never_decreases() {
        let store = create_test_store();
        let user = store.create_user(new_user("alice", None)).await.unwrap();

        assert!(store.update_password(user.id, "h2", 500).await.unwrap());
        let v1 = store.get_user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(v1.password_version, 500);
        assert_eq!(v1.password_hash, "h2");

        // Same or older timestamp still moves the version forward
        assert!(store.update_password(user.id, "h3", 500).await.unwrap());
        let v2 = store.get_user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(v2.password_version, 501);

        assert!(store.update_password(user.id, "h4", 10).await.unwrap());
        let v3 = store.get_user_by_id(user.id).await.unwrap().unwrap();
        assert_eq!(v3.password_version, 502);
    }

    #[tokio::test]
    async fn test_update_password_missing_user() {
        let store = create_test_store();
        assert!(!store.update_password(99, "h", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_users_persist_across_reopen() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_str().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());

        {
            let store = SqliteUserStore::new(Database::open(path).unwrap(), clock.clone());
            store.create_user(new_user("persisted", None)).await.unwrap();
        }

        let store = SqliteUserStore::new(Database::open(path).unwrap(), clock);
        assert!(store.get_user_by_username("persisted").await.unwrap().is_some());
    }

    #[test]
    fn test_registration_setting_defaults_and_persists() {
        let db = Database::open_in_memory().unwrap();
        let settings = SystemSettings::new(db, Arc::new(ManualClock::starting_now()));

        assert!(settings.registration_enabled(true).unwrap());
        assert!(!settings.registration_enabled(false).unwrap());

        settings.set_registration_enabled(false).unwrap();
        assert!(!settings.registration_enabled(true).unwrap());

        settings.set_registration_enabled(true).unwrap();
        assert!(settings.registration_enabled(false).unwrap());
    }
}
