//! Log Client
//!
//! The ingester never talks to the broker directly; group membership and the
//! fetch loop live outside this codebase. What it does need from the log
//! client is small:
//!
//! - **commit**: record that messages below an offset need not be
//!   redelivered. The convention throughout is that a committed offset
//!   points to the NEXT message to be delivered.
//! - **committed**: read the group's committed offset for a partition,
//!   used to seed the commit floor when a partition is assigned.
//! - **heartbeat**: keep the group session alive; invoked at least once per
//!   message processed and once per maintenance pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;

/// A single offset commit as observed by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: u64,
}

/// Narrow capability interface over the log client.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Commit `offset` for `(topic, partition)`; the offset names the next
    /// message to be delivered after a restart.
    async fn commit(&self, topic: &str, partition: i32, offset: u64) -> Result<()>;

    /// The group's committed offset for `(topic, partition)`, if any.
    async fn committed(&self, topic: &str, partition: i32) -> Result<Option<u64>>;

    /// Signal liveness to the group coordinator.
    async fn heartbeat(&self);
}

/// In-memory [`LogClient`] used by tests and local runs. Records every
/// commit in order and counts heartbeats.
#[derive(Default)]
pub struct MemoryLogClient {
    commits: RwLock<Vec<CommittedOffset>>,
    positions: RwLock<HashMap<(String, i32), u64>>,
    heartbeats: AtomicU64,
    fail_commits: AtomicBool,
}

impl MemoryLogClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a committed offset, as if a previous consumer had run.
    pub async fn seed_committed(&self, topic: &str, partition: i32, offset: u64) {
        self.positions
            .write()
            .await
            .insert((topic.to_string(), partition), offset);
    }

    /// Every commit issued, in order.
    pub async fn commits(&self) -> Vec<CommittedOffset> {
        self.commits.read().await.clone()
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// When set, `commit` fails until cleared.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl LogClient for MemoryLogClient {
    async fn commit(&self, topic: &str, partition: i32, offset: u64) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(crate::StoreError::Log("injected commit failure".to_string()));
        }
        self.commits.write().await.push(CommittedOffset {
            topic: topic.to_string(),
            partition,
            offset,
        });
        self.positions
            .write()
            .await
            .insert((topic.to_string(), partition), offset);
        Ok(())
    }

    async fn committed(&self, topic: &str, partition: i32) -> Result<Option<u64>> {
        Ok(self
            .positions
            .read()
            .await
            .get(&(topic.to_string(), partition))
            .copied())
    }

    async fn heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_records_in_order() {
        let log = MemoryLogClient::new();
        log.commit("events", 1, 10).await.unwrap();
        log.commit("events", 1, 20).await.unwrap();
        log.commit("events", 2, 5).await.unwrap();

        let commits = log.commits().await;
        assert_eq!(commits.len(), 3);
        assert_eq!(commits[0].offset, 10);
        assert_eq!(commits[1].offset, 20);
        assert_eq!(commits[2].partition, 2);
    }

    #[tokio::test]
    async fn test_committed_reflects_last_commit() {
        let log = MemoryLogClient::new();
        assert_eq!(log.committed("events", 1).await.unwrap(), None);
        log.commit("events", 1, 42).await.unwrap();
        assert_eq!(log.committed("events", 1).await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_seed_committed() {
        let log = MemoryLogClient::new();
        log.seed_committed("events", 3, 17).await;
        assert_eq!(log.committed("events", 3).await.unwrap(), Some(17));
        assert!(log.commits().await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_counter() {
        let log = MemoryLogClient::new();
        log.heartbeat().await;
        log.heartbeat().await;
        assert_eq!(log.heartbeats(), 2);
    }

    #[tokio::test]
    async fn test_commit_failure_injection() {
        let log = MemoryLogClient::new();
        log.fail_commits(true);
        assert!(log.commit("events", 1, 10).await.is_err());
        assert!(log.commits().await.is_empty());

        log.fail_commits(false);
        log.commit("events", 1, 10).await.unwrap();
        assert_eq!(log.commits().await.len(), 1);
    }
}
