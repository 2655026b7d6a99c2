//! Time-bounded read cache for provider listings.
//!
//! Concurrent readers share a fresh entry. When it has expired the first
//! writer refetches while later writers wait and reuse its result.

use std::future::Future;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ProviderError;

/// Cached payload with its capture time.
#[derive(Clone, Debug)]
pub struct CacheEntry<T> {
    value: T,
    captured_at: Instant,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.captured_at.elapsed() < ttl
    }
}

/// Single-slot cache whose entry expires `ttl` after it was fetched.
#[derive(Debug)]
pub struct TtlCache<T> {
    ttl: Duration,
    entry: RwLock<Option<CacheEntry<T>>>,
}

impl<T: Clone> TtlCache<T> {
    /// Creates an empty cache.
    #[must_use]
    pub const fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::const_new(None),
        }
    }

    /// Returns the configured time to live.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value when fresh, otherwise stores and returns the
    /// result of `fetch`.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `fetch`; failed fetches are not
    /// cached.
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<T, ProviderError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        {
            let guard = self.entry.read().await;
            if let Some(entry) = guard.as_ref().filter(|entry| entry.is_fresh(self.ttl)) {
                return Ok(entry.value.clone());
            }
        }

        let mut guard = self.entry.write().await;
        // Another writer may have refreshed the entry while we queued.
        if let Some(entry) = guard.as_ref().filter(|entry| entry.is_fresh(self.ttl)) {
            return Ok(entry.value.clone());
        }

        debug!(ttl = ?self.ttl, "cache miss");
        let value = fetch().await?;
        *guard = Some(CacheEntry {
            value: value.clone(),
            captured_at: Instant::now(),
        });
        Ok(value)
    }

    /// Drops the cached entry so the next read refetches.
    pub async fn invalidate(&self) {
        *self.entry.write().await = None;
    }
}
