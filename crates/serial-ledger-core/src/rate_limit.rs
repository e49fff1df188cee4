//! Fixed-window request limiter keyed by client identity.
//!
//! A window opens at an identity's first request and lasts one hour. Once
//! the window is older than that the counter restarts from scratch, so two
//! adjacent windows can admit up to twice the nominal budget back to back.
//! Records live in an injected [`RateLimitStore`] and may be lost on restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use time::{Duration, OffsetDateTime};

use crate::now_utc;

pub const RATE_LIMIT_WINDOW: Duration = Duration::HOUR;
pub const DEFAULT_MAX_REQUESTS_PER_WINDOW: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRecord {
    pub client_identity: String,
    pub count: u32,
    pub window_start: OffsetDateTime,
}

/// Keyed storage for per-identity counters.
///
/// Implementations only need last-writer-wins semantics.
pub trait RateLimitStore: Send + Sync {
    fn load(&self, client_identity: &str) -> Option<RateLimitRecord>;
    fn save(&self, record: RateLimitRecord);

    /// Drops records whose window started before `cutoff`.
    fn purge_expired(&self, _cutoff: OffsetDateTime) {}
}

#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    records: Mutex<HashMap<String, RateLimitRecord>>,
}

impl InMemoryRateLimitStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RateLimitStore for InMemoryRateLimitStore {
    fn load(&self, client_identity: &str) -> Option<RateLimitRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_identity)
            .cloned()
    }

    fn save(&self, record: RateLimitRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(record.client_identity.clone(), record);
    }

    fn purge_expired(&self, cutoff: OffsetDateTime) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, record| record.window_start >= cutoff);
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    window: Duration,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            window: RATE_LIMIT_WINDOW,
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryRateLimitStore::new()))
    }

    /// Admits or refuses one request for `client_identity`.
    pub fn allow(&self, client_identity: &str, max_per_window: u32) -> bool {
        self.allow_at(client_identity, max_per_window, now_utc())
    }

    /// Same as [`RateLimiter::allow`] with an explicit clock reading.
    pub fn allow_at(&self, client_identity: &str, max_per_window: u32, now: OffsetDateTime) -> bool {
        self.store.purge_expired(now - self.window);

        let fresh = RateLimitRecord {
            client_identity: client_identity.to_string(),
            count: 1,
            window_start: now,
        };

        let Some(mut record) = self.store.load(client_identity) else {
            self.store.save(fresh);
            return true;
        };

        if now - record.window_start > self.window {
            self.store.save(fresh);
            return true;
        }

        if record.count >= max_per_window {
            return false;
        }

        record.count += 1;
        self.store.save(record);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> OffsetDateTime {
        match crate::parse_rfc3339_utc("2026-03-01T09:00:00Z") {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture timestamp: {err}"),
        }
    }

    #[test]
    fn admits_budget_then_refuses() {
        let limiter = RateLimiter::in_memory();
        let now = start();

        for _ in 0..5 {
            assert!(limiter.allow_at("203.0.113.1", 5, now));
        }
        assert!(!limiter.allow_at("203.0.113.1", 5, now));
        assert!(!limiter.allow_at("203.0.113.1", 5, now + Duration::minutes(59)));
    }

    #[test]
    fn refusal_does_not_increment_counter() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let limiter = RateLimiter::new(store.clone());
        let now = start();

        assert!(limiter.allow_at("203.0.113.1", 1, now));
        assert!(!limiter.allow_at("203.0.113.1", 1, now));
        assert!(!limiter.allow_at("203.0.113.1", 1, now));

        let record = store.load("203.0.113.1");
        assert_eq!(record.map(|item| item.count), Some(1));
    }

    #[test]
    fn window_resets_only_after_full_hour() {
        let limiter = RateLimiter::in_memory();
        let now = start();

        assert!(limiter.allow_at("203.0.113.2", 2, now));
        assert!(limiter.allow_at("203.0.113.2", 2, now));
        assert!(!limiter.allow_at("203.0.113.2", 2, now + Duration::HOUR));
        assert!(limiter.allow_at("203.0.113.2", 2, now + Duration::HOUR + Duration::SECOND));
        assert!(limiter.allow_at("203.0.113.2", 2, now + Duration::HOUR + Duration::SECOND));
        assert!(!limiter.allow_at("203.0.113.2", 2, now + Duration::HOUR + Duration::SECOND));
    }

    #[test]
    fn identities_are_counted_separately() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let limiter = RateLimiter::new(store.clone());
        let now = start();

        assert!(limiter.allow_at("203.0.113.3", 1, now));
        assert!(!limiter.allow_at("203.0.113.3", 1, now));
        assert!(limiter.allow_at("203.0.113.4", 1, now));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn expired_windows_are_evicted() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let limiter = RateLimiter::new(store.clone());
        let now = start();

        for index in 0..4 {
            assert!(limiter.allow_at(&format!("203.0.113.{index}"), 5, now));
        }
        assert_eq!(store.len(), 4);

        assert!(limiter.allow_at("203.0.113.9", 5, now + Duration::HOUR));
        assert_eq!(store.len(), 5, "records at the window edge are still live");

        assert!(limiter.allow_at("203.0.113.9", 5, now + Duration::HOUR + Duration::SECOND));
        assert_eq!(store.len(), 1);
        assert_eq!(store.load("203.0.113.0"), None);
    }

    #[test]
    fn boundary_burst_admits_two_budgets() {
        let limiter = RateLimiter::in_memory();
        let now = start();
        let mut admitted = 0;

        for _ in 0..4 {
            if limiter.allow_at("203.0.113.5", 3, now + Duration::minutes(59)) {
                admitted += 1;
            }
        }
        // Window opened at the first call above, so jump past its end.
        for _ in 0..4 {
            if limiter.allow_at("203.0.113.5", 3, now + Duration::minutes(120)) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 6);
    }
}
