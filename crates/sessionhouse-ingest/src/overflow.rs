//! Overflow Detector
//!
//! A token-bucket evaluator keyed by `(team, session)`. Each accepted
//! message spends its on-wire size from the session's bucket; a bucket in
//! deficit marks the session as overflowing - a single session producing
//! faster than any buffer can reasonably absorb - and its id is published
//! to a shared quarantine set so upstream can divert it to the overflow
//! topic.
//!
//! ## Bucket model
//!
//! Buckets hold `burst_bytes` tokens when fresh and refill at
//! `replenish_bytes_per_second`, refilled on demand from the elapsed time
//! since the bucket was last touched, capped at capacity. There is no
//! background task.
//!
//! ## Quarantine set
//!
//! One score-ordered set shared by the whole deployment; member = session
//! id, score = expiry epoch seconds. Members are added only if absent
//! (first detection wins the expiry) and entries older than "now" are
//! pruned on every write. Publication is best-effort: a kv failure is
//! logged and dropped.
//!
//! Only the primary consumer runs the detector; the overflow-reading
//! instance has it disabled by configuration.

use std::collections::HashMap;
use std::sync::Arc;

use sessionhouse_store::KvStore;

use crate::buffer::SessionKey;
use crate::error::Result;

struct TokenBucket {
    tokens: f64,
    last_seen_ms: i64,
}

/// Detects hot sessions and publishes them to the quarantine set.
pub struct OverflowDetector {
    kv: Arc<dyn KvStore>,
    set_key: String,
    burst_bytes: f64,
    replenish_per_sec: f64,
    ttl_seconds: i64,
    min_sessions_per_batch: usize,
    buckets: HashMap<SessionKey, TokenBucket>,
}

impl OverflowDetector {
    pub fn new(
        kv: Arc<dyn KvStore>,
        set_key: String,
        burst_bytes: u64,
        replenish_bytes_per_second: u64,
        ttl_seconds: i64,
        min_sessions_per_batch: usize,
    ) -> Self {
        Self {
            kv,
            set_key,
            burst_bytes: burst_bytes as f64,
            replenish_per_sec: replenish_bytes_per_second as f64,
            ttl_seconds,
            min_sessions_per_batch,
            buckets: HashMap::new(),
        }
    }

    /// Spend `size_bytes` from the session's bucket. Returns whether the
    /// session is now overflowing.
    pub fn record(&mut self, key: &SessionKey, size_bytes: usize, now_ms: i64) -> bool {
        let capacity = self.burst_bytes;
        let replenish = self.replenish_per_sec;
        let bucket = self.buckets.entry(key.clone()).or_insert(TokenBucket {
            tokens: capacity,
            last_seen_ms: now_ms,
        });

        let elapsed_secs = (now_ms - bucket.last_seen_ms).max(0) as f64 / 1000.0;
        bucket.tokens = (bucket.tokens + elapsed_secs * replenish).min(capacity);
        bucket.last_seen_ms = now_ms;
        bucket.tokens -= size_bytes as f64;
        bucket.tokens < 0.0
    }

    /// Publish an overflowing session to the quarantine set and prune
    /// expired members. Returns whether the session was newly added.
    pub async fn publish(&self, session_id: &str, now_secs: i64) -> Result<bool> {
        let added = self
            .kv
            .sorted_set_add_if_absent(&self.set_key, session_id, now_secs + self.ttl_seconds)
            .await?;
        self.kv
            .sorted_set_remove_below(&self.set_key, now_secs)
            .await?;
        if added {
            tracing::warn!(
                session_id,
                ttl_seconds = self.ttl_seconds,
                "Session overflowing, published to quarantine set"
            );
        }
        Ok(added)
    }

    /// Guarantee the per-batch consideration floor: refresh idle buckets,
    /// least-recently-seen first, until `touched` plus the refreshed count
    /// reaches the configured minimum. Fully refilled buckets are dropped,
    /// which bounds the map to sessions still spending. Returns the total
    /// sessions considered.
    pub fn consider_batch(&mut self, touched: usize, now_ms: i64) -> usize {
        let extra = self.min_sessions_per_batch.saturating_sub(touched);
        if extra == 0 {
            return touched;
        }

        let mut idle: Vec<(i64, SessionKey)> = self
            .buckets
            .iter()
            .map(|(key, bucket)| (bucket.last_seen_ms, key.clone()))
            .collect();
        idle.sort();

        let mut refreshed = 0;
        for (_, key) in idle.into_iter().take(extra) {
            let overflowing = self.record(&key, 0, now_ms);
            refreshed += 1;
            if !overflowing {
                if let Some(bucket) = self.buckets.get(&key) {
                    if bucket.tokens >= self.burst_bytes {
                        self.buckets.remove(&key);
                    }
                }
            }
        }
        touched + refreshed
    }

    /// Number of sessions with live buckets.
    pub fn tracked_sessions(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sessionhouse_store::MemoryKvStore;

    fn detector(kv: Arc<MemoryKvStore>) -> OverflowDetector {
        OverflowDetector::new(kv, "overflow/replay".to_string(), 1_000_000, 1_000, 86_400, 10)
    }

    fn sid(n: u32) -> SessionKey {
        SessionKey::new(1, format!("sid{n}"))
    }

    // ---------------------------------------------------------------
    // Bucket mechanics
    // ---------------------------------------------------------------

    #[test]
    fn test_burst_within_capacity_is_fine() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut det = detector(kv);
        // 6 x 150kB = 900kB, inside the 1MB burst.
        for i in 0..6 {
            assert!(!det.record(&sid(1), 150_000, i * 10));
        }
    }

    #[test]
    fn test_fast_burst_overflows() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut det = detector(kv);
        // 10 x 150kB in 100ms blows through 1MB with negligible refill.
        let mut overflowed = false;
        for i in 0..10 {
            overflowed |= det.record(&sid(1), 150_000, i * 10);
        }
        assert!(overflowed);
    }

    #[test]
    fn test_slow_traffic_refills_and_never_overflows() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut det = detector(kv);
        // Same bytes, 150s apart: each gap refills the 150kB spent.
        for i in 0..10 {
            assert!(!det.record(&sid(1), 150_000, i * 150_000));
        }
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut det = detector(kv);
        det.record(&sid(1), 100_000, 0);
        // A very long idle period cannot bank more than one burst.
        assert!(!det.record(&sid(1), 1_000_000, 1_000_000_000));
        assert!(det.record(&sid(1), 1, 1_000_000_000));
    }

    #[test]
    fn test_buckets_are_per_session() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut det = detector(kv);
        assert!(det.record(&sid(1), 2_000_000, 0));
        assert!(!det.record(&sid(2), 100, 0));
    }

    #[test]
    fn test_deficit_persists_until_refilled() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut det = detector(kv);
        assert!(det.record(&sid(1), 1_500_000, 0));
        // 1s later only 1kB refilled; still in deficit.
        assert!(det.record(&sid(1), 0, 1_000));
        // 500_000 bytes deficit needs ~500s of refill.
        assert!(!det.record(&sid(1), 0, 600_000));
    }

    // ---------------------------------------------------------------
    // Quarantine publication
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_publish_adds_with_expiry_score() {
        let kv = Arc::new(MemoryKvStore::new());
        let det = detector(kv.clone());

        assert!(det.publish("sid1", 1_000).await.unwrap());
        let members = kv.sorted_set_members("overflow/replay").await.unwrap();
        assert_eq!(members, vec![("sid1".to_string(), 1_000 + 86_400)]);
    }

    #[tokio::test]
    async fn test_publish_is_add_if_absent() {
        let kv = Arc::new(MemoryKvStore::new());
        let det = detector(kv.clone());

        assert!(det.publish("sid1", 1_000).await.unwrap());
        assert!(!det.publish("sid1", 2_000).await.unwrap());
        let members = kv.sorted_set_members("overflow/replay").await.unwrap();
        // First detection keeps its expiry.
        assert_eq!(members[0].1, 1_000 + 86_400);
    }

    #[tokio::test]
    async fn test_publish_prunes_expired_members() {
        let kv = Arc::new(MemoryKvStore::new());
        let det = detector(kv.clone());

        det.publish("stale", 1_000).await.unwrap();
        // Well past the stale entry's expiry, a new publication sweeps it.
        det.publish("fresh", 1_000 + 86_400 + 10).await.unwrap();

        let members = kv.sorted_set_members("overflow/replay").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].0, "fresh");
    }

    // ---------------------------------------------------------------
    // Per-batch consideration floor
    // ---------------------------------------------------------------

    #[test]
    fn test_consider_batch_refreshes_up_to_minimum() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut det = detector(kv);
        for n in 0..20 {
            det.record(&sid(n), 500_000, 0);
        }
        assert_eq!(det.tracked_sessions(), 20);

        // 3 sessions touched in this batch; at least 7 more get considered.
        let considered = det.consider_batch(3, 1_000);
        assert_eq!(considered, 10);
    }

    #[test]
    fn test_consider_batch_drops_refilled_buckets() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut det = detector(kv);
        det.record(&sid(1), 10_000, 0);
        assert_eq!(det.tracked_sessions(), 1);

        // 10s refills the full 10kB spent; the bucket is dropped.
        det.consider_batch(0, 10_000);
        assert_eq!(det.tracked_sessions(), 0);
    }

    #[test]
    fn test_consider_batch_noop_when_floor_met() {
        let kv = Arc::new(MemoryKvStore::new());
        let mut det = detector(kv);
        det.record(&sid(1), 999_999, 0);
        assert_eq!(det.consider_batch(10, 1), 10);
        assert_eq!(det.tracked_sessions(), 1);
    }
}
