//! Partition Lifecycle
//!
//! Ownership state per partition:
//!
//! ```text
//! Unowned ──▶ Assigning ──▶ Owned ──▶ Revoking ──▶ Unowned
//! ```
//!
//! Messages are accepted only in `Owned`. A partition enters `Revoking`
//! the moment the broker signals revocation, which rejects any (defensive;
//! the broker guarantees none) message that still arrives for it while its
//! buffers are flushed, committed, and destroyed. The full revocation
//! sequencing lives in the ingester; this table is only the source of truth
//! for which transitions are legal.

use std::collections::HashMap;

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Unowned,
    Assigning,
    Owned,
    Revoking,
}

/// Flat ownership table for every partition this consumer has seen.
#[derive(Default)]
pub struct PartitionLifecycle {
    states: HashMap<i32, PartitionState>,
}

impl PartitionLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, partition: i32) -> PartitionState {
        self.states
            .get(&partition)
            .copied()
            .unwrap_or(PartitionState::Unowned)
    }

    /// Whether batches for this partition are currently accepted.
    pub fn is_owned(&self, partition: i32) -> bool {
        self.state(partition) == PartitionState::Owned
    }

    /// `Unowned -> Assigning`.
    pub fn begin_assign(&mut self, partition: i32) -> Result<()> {
        self.transition(partition, PartitionState::Unowned, PartitionState::Assigning)
    }

    /// `Assigning -> Owned`.
    pub fn finish_assign(&mut self, partition: i32) -> Result<()> {
        self.transition(partition, PartitionState::Assigning, PartitionState::Owned)
    }

    /// `Owned -> Revoking`.
    pub fn begin_revoke(&mut self, partition: i32) -> Result<()> {
        self.transition(partition, PartitionState::Owned, PartitionState::Revoking)
    }

    /// `Revoking -> Unowned`.
    pub fn finish_revoke(&mut self, partition: i32) -> Result<()> {
        let state = self.state(partition);
        if state != PartitionState::Revoking {
            return Err(IngestError::InvalidPartitionTransition {
                partition,
                from: state,
                to: PartitionState::Unowned,
            });
        }
        self.states.remove(&partition);
        Ok(())
    }

    fn transition(
        &mut self,
        partition: i32,
        expected: PartitionState,
        next: PartitionState,
    ) -> Result<()> {
        let state = self.state(partition);
        if state != expected {
            return Err(IngestError::InvalidPartitionTransition {
                partition,
                from: state,
                to: next,
            });
        }
        self.states.insert(partition, next);
        Ok(())
    }

    /// Partitions currently in `Owned`, in stable order.
    pub fn owned_partitions(&self) -> Vec<i32> {
        let mut owned: Vec<i32> = self
            .states
            .iter()
            .filter(|(_, state)| **state == PartitionState::Owned)
            .map(|(partition, _)| *partition)
            .collect();
        owned.sort_unstable();
        owned
    }
}
