//! Session Registry
//!
//! The mapping `(team, session) -> SessionBuffer` for the partitions this
//! consumer currently owns, with a per-partition index so revocation can
//! enumerate a partition's buffers without walking the whole map.
//!
//! Buffers and indexes are a flat store keyed by ids - no cross-references
//! between buffers, the tracker, and the lifecycle table - so the whole
//! ingest state can be owned by one value and instantiated many times
//! side-by-side in tests.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use crate::buffer::{BufferState, SessionBuffer, SessionKey};

/// Owner of all live session buffers.
pub struct SessionRegistry {
    buffers: HashMap<SessionKey, SessionBuffer>,
    by_partition: HashMap<i32, BTreeSet<SessionKey>>,
    spill_dir: PathBuf,
    spill_threshold: usize,
}

impl SessionRegistry {
    pub fn new(spill_dir: PathBuf, spill_threshold: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            by_partition: HashMap::new(),
            spill_dir,
            spill_threshold,
        }
    }

    /// Look up the buffer for `key`, creating an open one on `partition`
    /// if absent.
    pub fn get_or_create(&mut self, partition: i32, key: &SessionKey) -> &mut SessionBuffer {
        if !self.buffers.contains_key(key) {
            let buffer =
                SessionBuffer::create(key.clone(), partition, &self.spill_dir, self.spill_threshold);
            self.by_partition
                .entry(partition)
                .or_default()
                .insert(key.clone());
            self.buffers.insert(key.clone(), buffer);
        }
        self.buffers
            .get_mut(key)
            .unwrap_or_else(|| unreachable!("buffer inserted above"))
    }

    pub fn get(&self, key: &SessionKey) -> Option<&SessionBuffer> {
        self.buffers.get(key)
    }

    pub fn get_mut(&mut self, key: &SessionKey) -> Option<&mut SessionBuffer> {
        self.buffers.get_mut(key)
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.buffers.contains_key(key)
    }

    /// Keys of every buffer living on `partition`, in stable order.
    pub fn keys_for_partition(&self, partition: i32) -> Vec<SessionKey> {
        self.by_partition
            .get(&partition)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All session keys, in stable order.
    pub fn keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.buffers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// The lowest offset held by any unflushed buffer of `partition`.
    /// `None` means nothing blocks a commit there.
    pub fn lowest_blocking_offset(&self, partition: i32) -> Option<u64> {
        self.by_partition
            .get(&partition)?
            .iter()
            .filter_map(|key| self.buffers.get(key).and_then(|b| b.lowest_offset()))
            .min()
    }

    /// Destroy and remove one session. Destroying an unflushed buffer that
    /// holds events is legal only on the revocation path; the uncommitted
    /// offsets make another consumer replay the data.
    pub fn destroy_session(&mut self, key: &SessionKey) {
        if let Some(mut buffer) = self.buffers.remove(key) {
            if buffer.state() == BufferState::Open && buffer.event_count() > 0 {
                tracing::warn!(
                    session = %key,
                    partition = buffer.partition(),
                    events = buffer.event_count(),
                    "Destroying unflushed session buffer; its offsets stay uncommitted"
                );
            }
            if let Some(keys) = self.by_partition.get_mut(&buffer.partition()) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_partition.remove(&buffer.partition());
                }
            }
            buffer.destroy();
        }
    }

    /// Destroy and remove every buffer of `partition`. Returns how many
    /// were destroyed.
    pub fn destroy_partition(&mut self, partition: i32) -> usize {
        let keys = self.keys_for_partition(partition);
        for key in &keys {
            self.destroy_session(key);
        }
        keys.len()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
