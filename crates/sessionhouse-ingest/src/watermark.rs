//! High-Water Marks
//!
//! Two persisted bookkeeping tables, both hashes of `field -> offset` in
//! the shared kv store, one hash per `(group, topic, partition)`:
//!
//! - **Session marks** (`SessionWaterMarker`): `session_id -> last durably
//!   flushed offset`. The ingest filter consults this before routing a
//!   message, dropping replays for sessions already flushed past the
//!   message's offset. Entries are trimmed once they fall below the
//!   partition's committed offset - at that point the committed offset
//!   itself guarantees no replay can reach them.
//! - **Subsystem marks** (`SubsystemWaterMarker`): `subsystem -> last
//!   offset processed` for each downstream pipeline sharing this log
//!   position.
//!
//! Both tables are monotonically non-decreasing per field. Monotonicity is
//! enforced here against an in-memory cache loaded at partition
//! assignment; the kv store only sees the winning writes. Writes go
//! through before the cache is updated, so a kv failure leaves the cache
//! honest and the caller retries later.

use std::collections::HashMap;
use std::sync::Arc;

use sessionhouse_store::KvStore;

use crate::error::Result;

/// One cached `field -> offset` hash per partition, write-through and
/// monotonic.
struct OffsetHash {
    kv: Arc<dyn KvStore>,
    base_key: String,
    cache: HashMap<i32, HashMap<String, u64>>,
}

impl OffsetHash {
    fn new(kv: Arc<dyn KvStore>, base_key: String) -> Self {
        Self {
            kv,
            base_key,
            cache: HashMap::new(),
        }
    }

    fn key(&self, partition: i32) -> String {
        format!("{}/{}", self.base_key, partition)
    }

    async fn load_partition(&mut self, partition: i32) -> Result<usize> {
        let entries = self.kv.hash_get_all(&self.key(partition)).await?;
        let count = entries.len();
        self.cache.insert(partition, entries);
        Ok(count)
    }

    fn drop_partition(&mut self, partition: i32) {
        self.cache.remove(&partition);
    }

    fn get(&self, partition: i32, field: &str) -> Option<u64> {
        self.cache.get(&partition)?.get(field).copied()
    }

    /// Raise `field` to `offset` if that is an advance. Returns whether a
    /// write happened.
    async fn advance(&mut self, partition: i32, field: &str, offset: u64) -> Result<bool> {
        if self.get(partition, field).is_some_and(|current| current >= offset) {
            return Ok(false);
        }
        self.kv.hash_set(&self.key(partition), field, offset).await?;
        self.cache
            .entry(partition)
            .or_default()
            .insert(field.to_string(), offset);
        Ok(true)
    }
}

/// Persists, per partition, each session's last durably-flushed offset.
pub struct SessionWaterMarker {
    inner: OffsetHash,
}

impl SessionWaterMarker {
    pub fn new(kv: Arc<dyn KvStore>, base_key: String) -> Self {
        Self {
            inner: OffsetHash::new(kv, base_key),
        }
    }

    /// Load the stored marks for a newly assigned partition.
    pub async fn load_partition(&mut self, partition: i32) -> Result<usize> {
        self.inner.load_partition(partition).await
    }

    pub fn drop_partition(&mut self, partition: i32) {
        self.inner.drop_partition(partition);
    }

    /// Whether a message is a duplicate replay: the session was already
    /// flushed at or past this offset.
    pub fn is_replay(&self, partition: i32, session_id: &str, offset: u64) -> bool {
        self.inner
            .get(partition, session_id)
            .is_some_and(|mark| mark >= offset)
    }

    pub fn get(&self, partition: i32, session_id: &str) -> Option<u64> {
        self.inner.get(partition, session_id)
    }

    /// Record that `session_id` is durably flushed through `offset`.
    pub async fn advance(&mut self, partition: i32, session_id: &str, offset: u64) -> Result<bool> {
        self.inner.advance(partition, session_id, offset).await
    }

    /// Drop entries the committed offset already covers. Returns how many
    /// were removed.
    pub async fn trim(&mut self, partition: i32, committed: u64) -> Result<usize> {
        let Some(entries) = self.inner.cache.get_mut(&partition) else {
            return Ok(0);
        };
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, offset)| **offset < committed)
            .map(|(session, _)| session.clone())
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        let key = format!("{}/{}", self.inner.base_key, partition);
        self.inner.kv.hash_remove(&key, &stale).await?;
        for session in &stale {
            entries.remove(session);
        }
        Ok(stale.len())
    }
}

/// Persists, per partition, the last offset each downstream subsystem has
/// processed.
pub struct SubsystemWaterMarker {
    inner: OffsetHash,
}

impl SubsystemWaterMarker {
    pub fn new(kv: Arc<dyn KvStore>, base_key: String) -> Self {
        Self {
            inner: OffsetHash::new(kv, base_key),
        }
    }

    pub async fn load_partition(&mut self, partition: i32) -> Result<usize> {
        self.inner.load_partition(partition).await
    }

    pub fn drop_partition(&mut self, partition: i32) {
        self.inner.drop_partition(partition);
    }

    pub fn get(&self, partition: i32, subsystem: &str) -> Option<u64> {
        self.inner.get(partition, subsystem)
    }

    pub async fn advance(&mut self, partition: i32, subsystem: &str, offset: u64) -> Result<bool> {
        self.inner.advance(partition, subsystem, offset).await
    }
}
