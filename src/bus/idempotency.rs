//! Idempotency cache: the defense that turns at-least-once delivery into
//! effectively-once handling. Keyed by `(group, event_id)`.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdempotencyError {
    #[error("(group={group}, event_id={event_id}) already recorded with a different result digest")]
    DigestConflict { group: String, event_id: String },
}

/// A durable KV keyed by `(group, event_id)`. Writes only ever come from the
/// bus's consumer loop; entries must outlive `max_attempts * visibility_timeout
/// * backoff_ceiling` for any in-flight redelivery window, which is why `ttl`
/// is a cache-wide floor rather than a per-entry override.
#[async_trait]
pub trait IdempotencyCache: Send + Sync {
    /// Returns the recorded result digest, if this `(group, event_id)` has
    /// already been handled.
    async fn check(&self, group: &str, event_id: &str) -> Option<String>;

    /// Atomic compare-and-set on first sight. Recording the same digest
    /// twice is a no-op; recording a different digest for an already-seen
    /// key is a [`IdempotencyError::DigestConflict`] — the cache never lets
    /// a later write silently overwrite an earlier result.
    async fn record(&self, group: &str, event_id: &str, digest: &str) -> Result<(), IdempotencyError>;

    /// Atomically claims `(group, event_id)` for in-flight handling: `true`
    /// if this call is the first to see the key (the caller must go on to
    /// invoke the handler and then `record` the outcome), `false` if another
    /// delivery already holds or has completed it. This is the primitive
    /// that makes "two concurrent deliveries of the same `event_id` result
    /// in at most one handler invocation" hold even when a worker pool has
    /// concurrency > 1 — `check` alone only protects against sequential
    /// redelivery, since two overlapping callers could both observe a miss.
    async fn try_claim(&self, group: &str, event_id: &str) -> bool;

    /// Releases a claim taken by `try_claim` without recording a result,
    /// used when a handler invocation aborts (e.g. stays pending for
    /// retry) and a future redelivery must be allowed to claim it again.
    async fn release_claim(&self, group: &str, event_id: &str);
}

/// In-process reference implementation, backed by [`DashMap`] so concurrent
/// deliveries of the same `event_id` race on one shard lock rather than a
/// process-wide mutex.
pub struct MemoryIdempotencyCache {
    entries: DashMap<(String, String), (String, Instant)>,
    in_flight: DashMap<(String, String), ()>,
    ttl: Duration,
}

impl MemoryIdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            in_flight: DashMap::new(),
            ttl,
        }
    }

    /// Default TTL: 7 days.
    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(7 * 24 * 60 * 60))
    }

    /// Drops entries older than `ttl`. Callers run this periodically; it is
    /// never invoked implicitly by `check`/`record` so that a slow sweep
    /// can never race a concurrent write.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, (_, inserted_at)| now.saturating_duration_since(*inserted_at) < self.ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryIdempotencyCache {
    fn default() -> Self {
        Self::with_default_ttl()
    }
}

#[async_trait]
impl IdempotencyCache for MemoryIdempotencyCache {
    async fn check(&self, group: &str, event_id: &str) -> Option<String> {
        self.entries
            .get(&(group.to_string(), event_id.to_string()))
            .map(|entry| entry.value().0.clone())
    }

    async fn record(&self, group: &str, event_id: &str, digest: &str) -> Result<(), IdempotencyError> {
        let key = (group.to_string(), event_id.to_string());
        let result = match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if existing.get().0 == digest {
                    Ok(())
                } else {
                    Err(IdempotencyError::DigestConflict {
                        group: group.to_string(),
                        event_id: event_id.to_string(),
                    })
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert((digest.to_string(), Instant::now()));
                Ok(())
            }
        };
        self.in_flight.remove(&key);
        result
    }

    /// `true` only for the caller that inserts the claim; any concurrent or
    /// subsequent caller while it is held observes `false`. A claim on a key
    /// already finalized in `entries` (a completed, recorded result) still
    /// returns `true` here — `process_one` always checks `check` first and
    /// only calls `try_claim` on a miss, so a finalized key is never reached.
    async fn try_claim(&self, group: &str, event_id: &str) -> bool {
        let key = (group.to_string(), event_id.to_string());
        self.in_flight.insert(key, ()).is_none()
    }

    async fn release_claim(&self, group: &str, event_id: &str) {
        self.in_flight.remove(&(group.to_string(), event_id.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_record_succeeds_and_is_visible_via_check() {
        let cache = MemoryIdempotencyCache::with_default_ttl();
        cache.record("g", "E1", "digest-a").await.unwrap();
        assert_eq!(cache.check("g", "E1").await, Some("digest-a".to_string()));
    }

    #[tokio::test]
    async fn recording_same_digest_twice_is_a_no_op() {
        let cache = MemoryIdempotencyCache::with_default_ttl();
        cache.record("g", "E1", "digest-a").await.unwrap();
        cache.record("g", "E1", "digest-a").await.unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn recording_a_different_digest_is_rejected() {
        let cache = MemoryIdempotencyCache::with_default_ttl();
        cache.record("g", "E1", "digest-a").await.unwrap();
        let err = cache.record("g", "E1", "digest-b").await.unwrap_err();
        assert_eq!(
            err,
            IdempotencyError::DigestConflict {
                group: "g".to_string(),
                event_id: "E1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn keys_are_scoped_per_group() {
        let cache = MemoryIdempotencyCache::with_default_ttl();
        cache.record("g1", "E1", "digest-a").await.unwrap();
        assert_eq!(cache.check("g2", "E1").await, None);
    }

    #[tokio::test]
    async fn concurrent_claims_on_the_same_key_let_only_one_through() {
        let cache = MemoryIdempotencyCache::with_default_ttl();
        assert!(cache.try_claim("g", "E1").await);
        assert!(!cache.try_claim("g", "E1").await, "a second overlapping claim must lose the race");
    }

    #[tokio::test]
    async fn releasing_a_claim_allows_a_future_claim_to_succeed() {
        let cache = MemoryIdempotencyCache::with_default_ttl();
        assert!(cache.try_claim("g", "E1").await);
        cache.release_claim("g", "E1").await;
        assert!(cache.try_claim("g", "E1").await, "a released claim must be re-claimable");
    }

    #[tokio::test]
    async fn recording_a_result_clears_the_in_flight_claim() {
        let cache = MemoryIdempotencyCache::with_default_ttl();
        assert!(cache.try_claim("g", "E1").await);
        cache.record("g", "E1", "ok").await.unwrap();
        // The claim slot itself is gone; a later redelivery goes through
        // `check` and short-circuits before ever calling `try_claim` again.
        assert_eq!(cache.check("g", "E1").await, Some("ok".to_string()));
    }

    #[tokio::test]
    async fn sweep_expired_drops_stale_entries_only() {
        let cache = MemoryIdempotencyCache::new(Duration::from_millis(0));
        cache.record("g", "E1", "digest-a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.sweep_expired();
        assert!(cache.is_empty());
    }
}
