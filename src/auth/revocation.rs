//! Token Revocation Store
//! Mission: Denylist of logged-out tokens, kept until each token would have expired anyway
//!
//! Entries are keyed by the SHA-256 of the token so raw bearer credentials
//! never sit in memory maps or in Redis.

use crate::clock::Clock;
use crate::shared_store::SharedStore;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

const KEY_PREFIX: &str = "token:blacklist:";
const BACKEND_TIMEOUT: Duration = Duration::from_millis(500);

pub fn token_fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// In-process store: fingerprint -> absolute expiry.
pub struct MemoryRevocationStore {
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryRevocationStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn add(&self, token: &str, ttl: Duration) {
        self.add_fingerprint(token_fingerprint(token), ttl);
    }

    fn add_fingerprint(&self, fingerprint: String, ttl: Duration) {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let expires_at = self.clock.now() + ttl;
        let mut entries = self.entries.write();
        // Never shorten an existing entry.
        let slot = entries.entry(fingerprint).or_insert(expires_at);
        if expires_at > *slot {
            *slot = expires_at;
        }
    }

    pub fn is_revoked(&self, token: &str) -> bool {
        self.contains_fingerprint(&token_fingerprint(token))
    }

    fn contains_fingerprint(&self, fingerprint: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .read()
            .get(fingerprint)
            .map(|expires_at| now < *expires_at)
            .unwrap_or(false)
    }

    /// Drop expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, expires_at| now < *expires_at);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Swept {} expired revocation entries", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared store with an in-process fallback for backend outages.
///
/// Writes that fail against the shared backend land in the fallback, and
/// reads consult the fallback first, so a revocation is never lost while
/// the backend is down on this instance.
pub struct SharedRevocationStore {
    store: Arc<dyn SharedStore>,
    fallback: MemoryRevocationStore,
}

impl SharedRevocationStore {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            fallback: MemoryRevocationStore::new(clock),
        }
    }

    pub async fn add(&self, token: &str, ttl: Duration) {
        let fingerprint = token_fingerprint(token);
        let key = format!("{KEY_PREFIX}{fingerprint}");
        let failure = match timeout(BACKEND_TIMEOUT, self.store.set_with_ttl(&key, ttl)).await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => "timed out".to_string(),
        };
        warn!(
            backend = "redis",
            "Revocation write failed, keeping entry in-process: {}", failure
        );
        self.fallback.add_fingerprint(fingerprint, ttl);
    }

    pub async fn is_revoked(&self, token: &str) -> bool {
        let fingerprint = token_fingerprint(token);
        if self.fallback.contains_fingerprint(&fingerprint) {
            return true;
        }

        let key = format!("{KEY_PREFIX}{fingerprint}");
        let failure = match timeout(BACKEND_TIMEOUT, self.store.exists(&key)).await {
            Ok(Ok(found)) => return found,
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => "timed out".to_string(),
        };
        warn!(
            backend = "redis",
            "Revocation lookup failed, answering from in-process entries: {}", failure
        );
        false
    }
}

/// Revocation store chosen once at startup.
pub enum RevocationStore {
    Shared(SharedRevocationStore),
    InProcess(MemoryRevocationStore),
}

impl RevocationStore {
    pub async fn add(&self, token: &str, ttl: Duration) {
        match self {
            RevocationStore::Shared(store) => store.add(token, ttl).await,
            RevocationStore::InProcess(store) => store.add(token, ttl),
        }
    }

    pub async fn is_revoked(&self, token: &str) -> bool {
        match self {
            RevocationStore::Shared(store) => store.is_revoked(token).await,
            RevocationStore::InProcess(store) => store.is_revoked(token),
        }
    }

    /// Eager expiry of in-process entries. The shared backend expires its
    /// own keys; only its fallback entries are swept here.
    pub fn sweep(&self) -> usize {
        match self {
            RevocationStore::Shared(store) => store.fallback.sweep(),
            RevocationStore::InProcess(store) => store.sweep(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            RevocationStore::Shared(_) => "redis",
            RevocationStore::InProcess(_) => "memory",
        }
    }
}
