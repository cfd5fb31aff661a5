//! TTL-cached policy set.
//!
//! The store is the only writer of the cached snapshot. Readers load the
//! snapshot through an atomic pointer and never observe a partial entry.
//! Misses serialize on an async refresh lock so at most one fetch is in
//! flight; waiters re-check the cache once they hold the lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::PdpResult;
use crate::error::PdpError;
use crate::policy::source::PolicySource;
use crate::resilience::{BreakerError, CircuitBreaker, CircuitState};
use crate::types::Policy;

/// Message returned while the policy source circuit is open.
pub const CIRCUIT_OPEN_MESSAGE: &str =
    "Cannot load policies: policy source is unavailable (circuit breaker open).";

// =============================================================================
// Cache Entry
// =============================================================================

struct CacheEntry {
    policies: Arc<Vec<Policy>>,
    /// `None` when `now + ttl` is not representable; such an entry never expires.
    expires_at: Option<Instant>,
    last_refresh: OffsetDateTime,
    version: u64,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.expires_at.is_none_or(|deadline| Instant::now() < deadline)
    }
}

// =============================================================================
// Policy Store
// =============================================================================

/// Retrieves the policy set through a circuit breaker and caches it.
pub struct PolicyStore {
    source: Arc<dyn PolicySource>,
    breaker: CircuitBreaker,
    ttl: Duration,
    snapshot: ArcSwapOption<CacheEntry>,
    refresh_lock: Mutex<()>,
    version: AtomicU64,
    /// Bumped by `invalidate`; a fetch that straddles an invalidation is
    /// returned to its caller but not published. Held across the generation
    /// check and the snapshot write, so publishing and invalidating are
    /// mutually exclusive.
    generation: parking_lot::Mutex<u64>,
}

impl PolicyStore {
    /// Creates a store with an empty cache.
    #[must_use]
    pub fn new(source: Arc<dyn PolicySource>, breaker: CircuitBreaker, ttl: Duration) -> Self {
        Self {
            source,
            breaker,
            ttl,
            snapshot: ArcSwapOption::empty(),
            refresh_lock: Mutex::new(()),
            version: AtomicU64::new(0),
            generation: parking_lot::Mutex::new(0),
        }
    }

    /// Returns the policy set, fetching it on a cache miss.
    ///
    /// # Errors
    ///
    /// Returns `PdpError::PolicyLoad` if the source is unreachable, answers
    /// with malformed data, or the circuit is open.
    pub async fn get_policies(&self) -> PdpResult<Arc<Vec<Policy>>> {
        if let Some(policies) = self.cached() {
            return Ok(policies);
        }

        let _guard = self.refresh_lock.lock().await;
        if let Some(policies) = self.cached() {
            tracing::debug!("Policy set refreshed by a concurrent caller");
            return Ok(policies);
        }

        self.fetch_and_publish().await
    }

    /// Fetches the policy set regardless of TTL.
    ///
    /// # Errors
    ///
    /// Same as [`get_policies`](Self::get_policies). A failed refresh leaves
    /// the current snapshot in place.
    pub async fn refresh(&self) -> PdpResult<Arc<Vec<Policy>>> {
        let _guard = self.refresh_lock.lock().await;
        self.fetch_and_publish().await
    }

    /// Drops the cached snapshot so the next read fetches again.
    pub fn invalidate(&self) {
        let previous = {
            let mut generation = self.generation.lock();
            *generation += 1;
            self.snapshot.swap(None)
        };
        tracing::info!(
            version = previous.as_ref().map(|entry| entry.version),
            "Policy cache invalidated"
        );
    }

    /// Current cache statistics.
    #[must_use]
    pub fn stats(&self) -> PolicyStoreStats {
        let snapshot = self.snapshot.load_full();
        PolicyStoreStats {
            policy_count: snapshot.as_ref().map_or(0, |entry| entry.policies.len()),
            version: self.version.load(Ordering::SeqCst),
            cached: snapshot.as_ref().is_some_and(|entry| entry.is_fresh()),
            last_refresh: snapshot.as_ref().map(|entry| entry.last_refresh),
            ttl: self.ttl,
            breaker_state: self.breaker.state(),
            breaker_state_age: self.breaker.since_last_transition(),
        }
    }

    fn cached(&self) -> Option<Arc<Vec<Policy>>> {
        let snapshot = self.snapshot.load();
        (*snapshot)
            .as_ref()
            .filter(|entry| entry.is_fresh())
            .map(|entry| Arc::clone(&entry.policies))
    }

    async fn fetch_and_publish(&self) -> PdpResult<Arc<Vec<Policy>>> {
        let generation = *self.generation.lock();

        let records = self
            .breaker
            .execute(|| self.source.fetch_policies())
            .await
            .map_err(|e| {
                let err = load_error(&e);
                tracing::warn!(breaker = %self.breaker.key(), error = %e, "Policy refresh failed");
                err
            })?;

        let policies = records
            .iter()
            .map(Policy::from_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                tracing::warn!(error = %e, "Policy source returned an invalid record");
                PdpError::policy_load(format!(
                    "Failed to load policies: invalid policy record: {e}"
                ))
            })?;
        let policies = Arc::new(policies);

        let version = {
            let current = self.generation.lock();
            if *current != generation {
                tracing::debug!("Cache invalidated during refresh, result not cached");
                return Ok(policies);
            }

            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            self.snapshot.store(Some(Arc::new(CacheEntry {
                policies: Arc::clone(&policies),
                expires_at: Instant::now().checked_add(self.ttl),
                last_refresh: OffsetDateTime::now_utc(),
                version,
            })));
            version
        };

        tracing::info!(
            policies = policies.len(),
            version,
            ttl = ?self.ttl,
            "Policy cache refreshed"
        );

        Ok(policies)
    }
}

fn load_error<E: std::fmt::Display>(err: &BreakerError<E>) -> PdpError {
    match err {
        BreakerError::CircuitOpen { .. } => PdpError::policy_load(CIRCUIT_OPEN_MESSAGE),
        BreakerError::Timeout(limit) => PdpError::policy_load(format!(
            "Failed to load policies: policy source timed out after {limit:?}"
        )),
        BreakerError::Failed(e) => PdpError::policy_load(format!("Failed to load policies: {e}")),
    }
}

// =============================================================================
// Store Statistics
// =============================================================================

/// Statistics about the policy store.
#[derive(Debug, Clone)]
pub struct PolicyStoreStats {
    /// Number of policies in the current snapshot.
    pub policy_count: usize,

    /// Incremented on each successful refresh.
    pub version: u64,

    /// Whether a fresh snapshot is cached.
    pub cached: bool,

    pub last_refresh: Option<OffsetDateTime>,

    pub ttl: Duration,

    /// State of the policy source circuit breaker.
    pub breaker_state: CircuitState,

    /// Time spent in the current breaker state.
    pub breaker_state_age: Duration,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::policy::source::SourceError;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicUsize;

    // -------------------------------------------------------------------------
    // Mock Source
    // -------------------------------------------------------------------------

    struct MockSource {
        response: parking_lot::Mutex<Result<Vec<Value>, SourceError>>,
        delay: Option<Duration>,
        call_count: AtomicUsize,
    }

    impl MockSource {
        fn with_records(records: Vec<Value>) -> Self {
            Self {
                response: parking_lot::Mutex::new(Ok(records)),
                delay: None,
                call_count: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                response: parking_lot::Mutex::new(Err(SourceError::Network(
                    "connection refused".to_string(),
                ))),
                delay: None,
                call_count: AtomicUsize::new(0),
            }
        }

        fn set_response(&self, response: Result<Vec<Value>, SourceError>) {
            *self.response.lock() = response;
        }

        fn calls(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PolicySource for MockSource {
        async fn fetch_policies(&self) -> Result<Vec<Value>, SourceError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.response.lock().clone()
        }
    }

    fn record(name: &str) -> Value {
        json!({"id": name, "policyName": name, "policyDefinition": "package authz"})
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "policy-source",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(30),
                call_timeout: None,
            },
        )
    }

    fn store(source: Arc<MockSource>, ttl: Duration) -> PolicyStore {
        PolicyStore::new(source, breaker(5), ttl)
    }

    #[tokio::test]
    async fn test_second_read_within_ttl_uses_cache() {
        let source = Arc::new(MockSource::with_records(vec![record("document")]));
        let store = store(source.clone(), Duration::from_secs(60));

        let first = store.get_policies().await.unwrap();
        let second = store.get_policies().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.calls(), 1);
        assert_eq!(first[0].policy_name, "document");
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let source = Arc::new(MockSource::with_records(vec![record("document")]));
        let store = store(source.clone(), Duration::from_millis(30));

        store.get_policies().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.get_policies().await.unwrap();

        assert_eq!(source.calls(), 2);
        assert_eq!(store.stats().version, 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_fetch() {
        let source = Arc::new(MockSource::with_records(vec![record("document")]));
        let store = store(source.clone(), Duration::from_secs(60));

        store.get_policies().await.unwrap();
        store.invalidate();
        assert!(!store.stats().cached);

        source.set_response(Ok(vec![record("document"), record("default")]));
        let policies = store.get_policies().await.unwrap();

        assert_eq!(source.calls(), 2);
        assert_eq!(policies.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let source = Arc::new(MockSource {
            delay: Some(Duration::from_millis(50)),
            ..MockSource::with_records(vec![record("document")])
        });
        let store = Arc::new(store(source.clone(), Duration::from_secs(60)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get_policies().await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().len(), 1);
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_source_failure_is_policy_load() {
        let source = Arc::new(MockSource::failing());
        let store = store(source, Duration::from_secs(60));

        let err = store.get_policies().await.unwrap_err();
        assert!(matches!(err, PdpError::PolicyLoad { .. }));
        assert!(err.message().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_snapshot() {
        let source = Arc::new(MockSource::with_records(vec![record("document")]));
        let store = store(source.clone(), Duration::from_secs(60));

        store.get_policies().await.unwrap();
        source.set_response(Err(SourceError::Http(500)));

        assert!(store.refresh().await.is_err());
        let policies = store.get_policies().await.unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_record_fails_whole_load() {
        let source = Arc::new(MockSource::with_records(vec![
            record("document"),
            json!({"id": "2", "policyName": "broken"}),
        ]));
        let store = store(source, Duration::from_secs(60));

        let err = store.get_policies().await.unwrap_err();
        assert!(matches!(err, PdpError::PolicyLoad { .. }));
        assert!(!store.stats().cached);
    }

    #[tokio::test]
    async fn test_open_circuit_maps_to_policy_load() {
        let source = Arc::new(MockSource::failing());
        let store = PolicyStore::new(source.clone(), breaker(2), Duration::from_secs(60));

        store.get_policies().await.unwrap_err();
        store.get_policies().await.unwrap_err();
        assert_eq!(store.stats().breaker_state, CircuitState::Open);

        let err = store.get_policies().await.unwrap_err();
        assert_eq!(err, PdpError::policy_load(CIRCUIT_OPEN_MESSAGE));
        assert_eq!(source.calls(), 2);
    }

    /// Holds its first fetch open until released.
    struct GatedSource {
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
        call_count: AtomicUsize,
    }

    impl GatedSource {
        fn new() -> Self {
            Self {
                started: tokio::sync::Notify::new(),
                release: tokio::sync::Notify::new(),
                call_count: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PolicySource for GatedSource {
        async fn fetch_policies(&self) -> Result<Vec<Value>, SourceError> {
            if self.call_count.fetch_add(1, Ordering::SeqCst) == 0 {
                self.started.notify_one();
                self.release.notified().await;
            }
            Ok(vec![record("document")])
        }
    }

    #[tokio::test]
    async fn test_fetch_straddling_invalidate_is_not_cached() {
        let source = Arc::new(GatedSource::new());
        let store = Arc::new(PolicyStore::new(
            source.clone(),
            breaker(5),
            Duration::from_secs(60),
        ));

        let pending = {
            let store = store.clone();
            tokio::spawn(async move { store.get_policies().await })
        };
        source.started.notified().await;
        store.invalidate();
        source.release.notify_one();

        // The caller still gets the fetched set
        assert_eq!(pending.await.unwrap().unwrap().len(), 1);
        let stats = store.stats();
        assert!(!stats.cached);
        assert_eq!(stats.version, 0);

        store.get_policies().await.unwrap();
        assert_eq!(source.call_count.load(Ordering::SeqCst), 2);
        assert!(store.stats().cached);
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_never_expires() {
        let source = Arc::new(MockSource::with_records(vec![record("document")]));
        let store = store(source.clone(), Duration::MAX);

        store.get_policies().await.unwrap();
        store.get_policies().await.unwrap();

        assert_eq!(source.calls(), 1);
        assert!(store.stats().cached);
    }

    #[tokio::test]
    async fn test_stats() {
        let source = Arc::new(MockSource::with_records(vec![
            record("document"),
            record("main"),
        ]));
        let store = store(source, Duration::from_secs(60));

        let stats = store.stats();
        assert_eq!(stats.policy_count, 0);
        assert_eq!(stats.version, 0);
        assert!(stats.last_refresh.is_none());

        store.get_policies().await.unwrap();
        let stats = store.stats();
        assert_eq!(stats.policy_count, 2);
        assert_eq!(stats.version, 1);
        assert!(stats.cached);
        assert!(stats.last_refresh.is_some());
        assert_eq!(stats.breaker_state, CircuitState::Closed);
        assert!(stats.breaker_state_age < Duration::from_secs(60));
    }
}
