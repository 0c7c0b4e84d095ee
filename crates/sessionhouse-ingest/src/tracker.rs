//! Partition Tracker
//!
//! For each owned partition, the highest message offset ever observed and
//! the wall-clock timestamp of the last message. This is the source of
//! truth for "which offset would be safe to commit if no session were
//! blocking" - it advances even for messages that were skipped (disabled
//! team, decode failure, watermark replay), which is what lets commits move
//! past drop-only ranges.

use std::collections::HashMap;

/// Per-partition observation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionMetrics {
    /// Highest message offset observed on this partition.
    pub last_message_offset: u64,
    /// Wall-clock timestamp (ms) of the most recent message.
    pub last_message_timestamp: i64,
}

/// Tracks observation state per owned partition. Entries are created on
/// first message and deleted on revocation.
#[derive(Default)]
pub struct PartitionTracker {
    partitions: HashMap<i32, PartitionMetrics>,
}

impl PartitionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message sighting. Offsets only move forward; the timestamp
    /// follows the latest sighting.
    pub fn observe(&mut self, partition: i32, offset: u64, timestamp: i64) {
        let entry = self
            .partitions
            .entry(partition)
            .or_insert(PartitionMetrics {
                last_message_offset: offset,
                last_message_timestamp: timestamp,
            });
        entry.last_message_offset = entry.last_message_offset.max(offset);
        entry.last_message_timestamp = timestamp;
    }

    pub fn get(&self, partition: i32) -> Option<PartitionMetrics> {
        self.partitions.get(&partition).copied()
    }

    /// Seconds since the partition last saw a message, if it ever has.
    pub fn idle_seconds(&self, partition: i32, now_ms: i64) -> Option<i64> {
        self.get(partition)
            .map(|m| (now_ms - m.last_message_timestamp) / 1000)
    }

    pub fn remove(&mut self, partition: i32) {
        self.partitions.remove(&partition);
    }

    pub fn partitions(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.partitions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
