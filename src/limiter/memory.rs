//! In-process fixed-window limiter.
//!
//! Also the fallback target of the shared limiter while Redis is unreachable.

use crate::clock::Clock;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct WindowEntry {
    count: u32,
    reset_at: DateTime<Utc>,
}

pub struct MemoryRateLimiter {
    // Map lock guards the key set; each entry has its own lock for the count.
    entries: RwLock<HashMap<String, Arc<Mutex<WindowEntry>>>>,
    limit: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryRateLimiter {
    pub fn new(limit: u32, window: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            limit,
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::minutes(1)),
            clock,
        }
    }

    fn entry_for(&self, key: &str) -> Arc<Mutex<WindowEntry>> {
        if let Some(entry) = self.entries.read().get(key) {
            return entry.clone();
        }

        let mut entries = self.entries.write();
        entries
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(WindowEntry {
                    count: 0,
                    reset_at: self.clock.now() + self.window,
                }))
            })
            .clone()
    }

    pub fn allow(&self, key: &str) -> bool {
        let entry = self.entry_for(key);
        let now = self.clock.now();
        let mut entry = entry.lock();

        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + self.window;
        }

        if entry.count < self.limit {
            entry.count += 1;
            true
        } else {
            false
        }
    }

    /// Remove entries whose window has already elapsed.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.lock().reset_at);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Rate limiter cleanup removed {} idle keys", removed);
        }
        removed
    }

    pub fn tracked_keys(&self) -> usize {
        self.entries.read().len()
    }
}
