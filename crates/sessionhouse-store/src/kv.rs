//! Shared Key/Value Store
//!
//! The ingester keeps two kinds of state in a shared kv store:
//!
//! - **Hashes** mapping string fields to offsets - the session and
//!   subsystem high-water marks, one hash per `(group, topic, partition)`.
//! - **One score-ordered set** - the overflow quarantine set, member =
//!   session id, score = expiry epoch seconds.
//!
//! The trait is sized to exactly those usages. Monotonicity of watermark
//! values is the caller's responsibility (the watermark layer compares
//! against its cache before writing); the store only has to be atomic per
//! operation.
//!
//! ## Thread Safety
//!
//! All implementations must be `Send + Sync`, shared as `Arc<dyn KvStore>`.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;

/// Narrow capability interface over the shared kv store.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read every field of a hash. Missing keys read as empty.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, u64>>;

    /// Set a single hash field, creating the hash if absent.
    async fn hash_set(&self, key: &str, field: &str, value: u64) -> Result<()>;

    /// Remove fields from a hash. Unknown fields are ignored.
    async fn hash_remove(&self, key: &str, fields: &[String]) -> Result<()>;

    /// Add a member to a score-ordered set only if it is not already
    /// present. Returns whether the member was added.
    async fn sorted_set_add_if_absent(&self, key: &str, member: &str, score: i64) -> Result<bool>;

    /// Remove members whose score is strictly below `score`. Returns the
    /// number removed.
    async fn sorted_set_remove_below(&self, key: &str, score: i64) -> Result<u64>;

    /// All members of a score-ordered set with their scores, ascending by
    /// score. Intended for diagnostics and tests.
    async fn sorted_set_members(&self, key: &str) -> Result<Vec<(String, i64)>>;
}

#[derive(Default)]
struct MemoryKvInner {
    hashes: HashMap<String, HashMap<String, u64>>,
    sets: HashMap<String, BTreeMap<String, i64>>,
}

/// In-memory [`KvStore`] used by tests and local runs.
///
/// Supports failure injection on hash writes so callers can exercise the
/// "flush incomplete, buffer returns to open" path.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: RwLock<MemoryKvInner>,
    fail_hash_writes: std::sync::atomic::AtomicBool,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, `hash_set` fails until cleared.
    pub fn fail_hash_writes(&self, fail: bool) {
        self.fail_hash_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, u64>> {
        let inner = self.inner.read().await;
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, field: &str, value: u64) -> Result<()> {
        if self.fail_hash_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(crate::StoreError::Kv("injected hash write failure".to_string()));
        }
        let mut inner = self.inner.write().await;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_remove(&self, key: &str, fields: &[String]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(hash) = inner.hashes.get_mut(key) {
            for field in fields {
                hash.remove(field);
            }
        }
        Ok(())
    }

    async fn sorted_set_add_if_absent(&self, key: &str, member: &str, score: i64) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let set = inner.sets.entry(key.to_string()).or_default();
        if set.contains_key(member) {
            return Ok(false);
        }
        set.insert(member.to_string(), score);
        Ok(true)
    }

    async fn sorted_set_remove_below(&self, key: &str, score: i64) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let Some(set) = inner.sets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|_, s| *s >= score);
        Ok((before - set.len()) as u64)
    }

    async fn sorted_set_members(&self, key: &str) -> Result<Vec<(String, i64)>> {
        let inner = self.inner.read().await;
        let mut members: Vec<(String, i64)> = inner
            .sets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }
}
