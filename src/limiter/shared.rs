//! Shared sliding-window limiter with automatic failover.
//!
//! Every server instance counts against the same Redis sorted set per key.
//! When a check against Redis fails, the limiter answers from an in-process
//! fixed window and keeps doing so until a single background probe sees the
//! backend healthy again.

use super::memory::MemoryRateLimiter;
use crate::clock::Clock;
use crate::shared_store::SharedStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const CHECK_TIMEOUT: Duration = Duration::from_millis(500);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const KEY_PREFIX: &str = "ratelimit:";

struct Inner {
    store: Arc<dyn SharedStore>,
    fallback: MemoryRateLimiter,
    limit: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
    using_fallback: AtomicBool,
    probe_in_flight: AtomicBool,
    recovery_delay: Duration,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct SharedRateLimiter {
    inner: Arc<Inner>,
}

impl SharedRateLimiter {
    pub fn new(
        store: Arc<dyn SharedStore>,
        limit: u32,
        window: Duration,
        recovery_delay: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                fallback: MemoryRateLimiter::new(limit, window, clock.clone()),
                limit,
                window,
                clock,
                using_fallback: AtomicBool::new(false),
                probe_in_flight: AtomicBool::new(false),
                recovery_delay,
                shutdown_tx,
            }),
        }
    }

    /// Startup connectivity check. On failure the limiter starts degraded
    /// and begins probing for recovery.
    pub async fn connect(&self) {
        match timeout(PROBE_TIMEOUT, self.inner.store.ping()).await {
            Ok(Ok(())) => info!(backend = "redis", "Rate limiter connected to shared backend"),
            Ok(Err(e)) => self.engage_fallback(&format!("{e:#}")),
            Err(_) => self.engage_fallback("startup ping timed out"),
        }
    }

    pub async fn allow(&self, key: &str) -> bool {
        if self.inner.using_fallback.load(Ordering::Acquire) {
            return self.inner.fallback.allow(key);
        }

        let redis_key = format!("{KEY_PREFIX}{key}");
        let now_ms = self.inner.clock.now().timestamp_millis();
        let window_ms = self.inner.window.as_millis() as i64;

        let result = timeout(
            CHECK_TIMEOUT,
            self.inner
                .store
                .sliding_window_hit(&redis_key, now_ms, window_ms, self.inner.limit),
        )
        .await;

        match result {
            Ok(Ok(admitted)) => admitted,
            Ok(Err(e)) => {
                self.engage_fallback(&format!("{e:#}"));
                self.inner.fallback.allow(key)
            }
            Err(_) => {
                self.engage_fallback("rate check timed out");
                self.inner.fallback.allow(key)
            }
        }
    }

    pub fn using_fallback(&self) -> bool {
        self.inner.using_fallback.load(Ordering::Acquire)
    }

    pub fn fallback(&self) -> &MemoryRateLimiter {
        &self.inner.fallback
    }

    /// Stop any in-flight recovery probe.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }

    fn engage_fallback(&self, reason: &str) {
        if !self.inner.using_fallback.swap(true, Ordering::AcqRel) {
            warn!(
                backend = "redis",
                reason, "⚠️ Shared rate limiter unavailable, falling back to in-process limiter"
            );
        }
        self.spawn_probe();
    }

    fn spawn_probe(&self) {
        // Single-flight: concurrent failures share one probe.
        if self
            .inner
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let inner = self.inner.clone();
        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(inner.recovery_delay) => {}
                }

                match timeout(PROBE_TIMEOUT, inner.store.ping()).await {
                    Ok(Ok(())) => {
                        inner.mark_recovered();
                        info!(backend = "redis", "✅ Shared rate limiter recovered");
                        return;
                    }
                    Ok(Err(e)) => debug!(backend = "redis", "Recovery probe failed: {:#}", e),
                    Err(_) => debug!(backend = "redis", "Recovery probe timed out"),
                }
            }
            inner.probe_in_flight.store(false, Ordering::Release);
        });
    }
}

impl Inner {
    /// The probe slot is released before routing returns to the backend, so a
    /// failure that lands in between can always start a new probe.
    fn mark_recovered(&self) {
        self.probe_in_flight.store(false, Ordering::Release);
        self.using_fallback.store(false, Ordering::Release);
    }
}
