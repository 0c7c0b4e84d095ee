//! Offset Commit Coordinator
//!
//! Computes, per owned partition, the greatest offset safe to commit and
//! forwards it to the log client.
//!
//! ## Algorithm
//!
//! For a partition with highest observed offset `L` and lowest offset `B`
//! held by any unflushed buffer:
//!
//! ```text
//! candidate = min(L + 1, B)
//! ```
//!
//! Committing `B` - not `B - 1`, not `B + 1` - says "everything strictly
//! below `B` is durably recorded". The log client's convention is that a
//! committed offset names the next message to deliver, so a restart replays
//! the blocking session's first message, which is correct: that buffer's
//! contents were never flushed. With nothing blocking the candidate is
//! `L + 1`, which also carries commits past ranges where every message was
//! dropped (disabled team, decode failure, replay).
//!
//! ## The committed floor
//!
//! A candidate is only committed if it strictly exceeds the partition's
//! floor. The floor seeds from the broker's committed offset at assignment
//! or, when the group has never committed, from the first offset observed
//! on the partition - being handed offset `N` with no prior commit means
//! the position already is `N`, so committing `N` would acknowledge
//! nothing. Every successful commit raises the floor, which makes the
//! sequence of committed values strictly increasing; a repeated flush with
//! no new messages therefore never re-commits.

use std::collections::HashMap;
use std::sync::Arc;

use sessionhouse_store::LogClient;

use crate::error::{IngestError, Result};
use crate::registry::SessionRegistry;
use crate::tracker::PartitionTracker;

/// Per-partition commit state and the commit algorithm.
pub struct OffsetCommitCoordinator {
    log: Arc<dyn LogClient>,
    topic: String,
    floors: HashMap<i32, u64>,
}

impl OffsetCommitCoordinator {
    pub fn new(log: Arc<dyn LogClient>, topic: impl Into<String>) -> Self {
        Self {
            log,
            topic: topic.into(),
            floors: HashMap::new(),
        }
    }

    /// Seed the floor from the broker's committed offset at assignment.
    pub fn set_floor(&mut self, partition: i32, floor: u64) {
        self.floors.insert(partition, floor);
    }

    /// Seed the floor from the first delivered offset, unless assignment
    /// already seeded it.
    pub fn observe_first_offset(&mut self, partition: i32, offset: u64) {
        self.floors.entry(partition).or_insert(offset);
    }

    pub fn floor(&self, partition: i32) -> Option<u64> {
        self.floors.get(&partition).copied()
    }

    pub fn forget_partition(&mut self, partition: i32) {
        self.floors.remove(&partition);
    }

    /// Run the commit algorithm for one partition. Returns the committed
    /// offset, or `None` when nothing can advance. A failed commit leaves
    /// the floor untouched so the next pass retries.
    pub async fn commit_partition(
        &mut self,
        partition: i32,
        tracker: &PartitionTracker,
        registry: &SessionRegistry,
    ) -> Result<Option<u64>> {
        let Some(metrics) = tracker.get(partition) else {
            return Ok(None);
        };
        let caught_up = metrics.last_message_offset + 1;
        let candidate = match registry.lowest_blocking_offset(partition) {
            Some(blocking) => caught_up.min(blocking),
            None => caught_up,
        };

        let floor = self.floors.get(&partition).copied().unwrap_or(0);
        if candidate <= floor {
            return Ok(None);
        }

        self.log
            .commit(&self.topic, partition, candidate)
            .await
            .map_err(|err| IngestError::Commit(err.to_string()))?;
        self.floors.insert(partition, candidate);

        tracing::debug!(
            topic = %self.topic,
            partition,
            offset = candidate,
            last_message_offset = metrics.last_message_offset,
            "Committed offset"
        );
        Ok(Some(candidate))
    }

    /// Run the commit algorithm across `partitions`, collecting what was
    /// committed. Individual failures are logged and skipped; the next
    /// periodic pass retries them.
    pub async fn commit_partitions(
        &mut self,
        partitions: &[i32],
        tracker: &PartitionTracker,
        registry: &SessionRegistry,
    ) -> Vec<(i32, u64)> {
        let mut committed = Vec::new();
        for &partition in partitions {
            match self.commit_partition(partition, tracker, registry).await {
                Ok(Some(offset)) => committed.push((partition, offset)),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        topic = %self.topic,
                        partition,
                        error = %err,
                        "Offset commit failed, will retry next pass"
                    );
                }
            }
        }
        committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SessionKey;
    use bytes::Bytes;
    use sessionhouse_core::LogMessage;
    use sessionhouse_store::MemoryLogClient;

    fn msg(partition: i32, offset: u64) -> LogMessage {
        LogMessage::new("events", partition, offset, 1_000, Bytes::from("x"))
    }

    fn setup(dir: &std::path::Path) -> (Arc<MemoryLogClient>, OffsetCommitCoordinator, PartitionTracker, SessionRegistry) {
        let log = Arc::new(MemoryLogClient::new());
        let coordinator = OffsetCommitCoordinator::new(log.clone(), "events");
        let tracker = PartitionTracker::new();
        let registry = SessionRegistry::new(dir.to_path_buf(), 1024 * 1024);
        (log, coordinator, tracker, registry)
    }

    #[tokio::test]
    async fn test_no_commit_without_observations() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut coordinator, tracker, registry) = setup(dir.path());
        assert_eq!(
            coordinator.commit_partition(1, &tracker, &registry).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_blocking_buffer_withholds_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut coordinator, mut tracker, mut registry) = setup(dir.path());

        coordinator.observe_first_offset(1, 1);
        tracker.observe(1, 2, 1_000);
        let key = SessionKey::new(1, "sid1");
        registry.get_or_create(1, &key).add(&msg(1, 1), b"a\n", 1).unwrap();
        registry.get_or_create(1, &key).add(&msg(1, 2), b"b\n", 1).unwrap();

        // candidate = min(3, 1) = 1, not above the floor of 1.
        assert_eq!(
            coordinator.commit_partition(1, &tracker, &registry).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_caught_up_commits_one_past_last_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (log, mut coordinator, mut tracker, registry) = setup(dir.path());

        coordinator.observe_first_offset(1, 12);
        tracker.observe(1, 13, 1_000);

        let committed = coordinator.commit_partition(1, &tracker, &registry).await.unwrap();
        assert_eq!(committed, Some(14));
        assert_eq!(log.commits().await.len(), 1);
        assert_eq!(log.commits().await[0].offset, 14);
    }

    #[tokio::test]
    async fn test_partial_block_commits_below_blocker() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut coordinator, mut tracker, mut registry) = setup(dir.path());

        coordinator.observe_first_offset(1, 1);
        tracker.observe(1, 4, 1_000);
        // sid2 blocks at 2; message 1 has been flushed away already.
        let key = SessionKey::new(1, "sid2");
        registry.get_or_create(1, &key).add(&msg(1, 2), b"a\n", 1).unwrap();

        let committed = coordinator.commit_partition(1, &tracker, &registry).await.unwrap();
        assert_eq!(committed, Some(2));
    }

    #[tokio::test]
    async fn test_commits_strictly_increase() {
        let dir = tempfile::tempdir().unwrap();
        let (log, mut coordinator, mut tracker, registry) = setup(dir.path());

        coordinator.observe_first_offset(1, 1);
        tracker.observe(1, 5, 1_000);
        assert_eq!(
            coordinator.commit_partition(1, &tracker, &registry).await.unwrap(),
            Some(6)
        );

        // Nothing new: a second pass must not re-commit the same offset.
        assert_eq!(
            coordinator.commit_partition(1, &tracker, &registry).await.unwrap(),
            None
        );

        tracker.observe(1, 9, 2_000);
        assert_eq!(
            coordinator.commit_partition(1, &tracker, &registry).await.unwrap(),
            Some(10)
        );

        let offsets: Vec<u64> = log.commits().await.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![6, 10]);
    }

    #[tokio::test]
    async fn test_floor_seeded_from_assignment_wins() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut coordinator, mut tracker, registry) = setup(dir.path());

        coordinator.set_floor(1, 20);
        coordinator.observe_first_offset(1, 5);
        tracker.observe(1, 15, 1_000);

        // candidate 16 is below the committed floor of 20.
        assert_eq!(
            coordinator.commit_partition(1, &tracker, &registry).await.unwrap(),
            None
        );
        assert_eq!(coordinator.floor(1), Some(20));
    }

    #[tokio::test]
    async fn test_failed_commit_keeps_floor_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (log, mut coordinator, mut tracker, registry) = setup(dir.path());

        coordinator.observe_first_offset(1, 1);
        tracker.observe(1, 3, 1_000);

        log.fail_commits(true);
        assert!(coordinator.commit_partition(1, &tracker, &registry).await.is_err());
        assert_eq!(coordinator.floor(1), Some(1));

        log.fail_commits(false);
        assert_eq!(
            coordinator.commit_partition(1, &tracker, &registry).await.unwrap(),
            Some(4)
        );
    }

    #[tokio::test]
    async fn test_commit_partitions_skips_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (log, mut coordinator, mut tracker, registry) = setup(dir.path());

        coordinator.observe_first_offset(1, 1);
        coordinator.observe_first_offset(2, 1);
        tracker.observe(1, 3, 1_000);
        tracker.observe(2, 7, 1_000);

        let committed = coordinator
            .commit_partitions(&[1, 2, 3], &tracker, &registry)
            .await;
        assert_eq!(committed, vec![(1, 4), (2, 8)]);
        assert_eq!(log.commits().await.len(), 2);
    }

    #[tokio::test]
    async fn test_forget_partition_clears_floor() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut coordinator, _, _) = setup(dir.path());
        coordinator.set_floor(1, 10);
        coordinator.forget_partition(1);
        assert_eq!(coordinator.floor(1), None);
    }
}
