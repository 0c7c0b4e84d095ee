//! Session Ingester
//!
//! The facade wiring the buffering state machine to its collaborators: the
//! log client (commits, heartbeats), the blob sink (flush uploads), the
//! shared kv store (watermarks, overflow set), and the team directory.
//!
//! ## Batch handling
//!
//! One batch at a time. Each message is decoded, team-resolved,
//! watermark-filtered, and routed into (or creating) its session buffer.
//! Skipped messages - undecodable, unknown or disabled team, watermark
//! replay - still advance the partition's `last_message_offset`, which is
//! what lets commits move past drop-only ranges. A local disk failure
//! fails the whole batch; the in-memory state for the affected partitions
//! is then suspect and the caller should tear the ingester down and let
//! the group rebalance (redelivered duplicates are suppressed by the
//! watermarks).
//!
//! ## Maintenance
//!
//! `run_maintenance` flushes buffers whose age, size, or partition-level
//! idleness crossed the configured thresholds, runs the commit
//! coordinator, trims covered watermarks, and lets the overflow detector
//! refresh idle buckets. Maintenance failures are logged, never
//! propagated - they must not cancel batch handling.
//!
//! ## Lifecycle
//!
//! Assignment loads committed offsets and stored watermarks before the
//! first batch. Revocation flushes, commits, and destroys everything the
//! revoked partitions own before returning, so the broker may only hand
//! the partitions to another consumer once their progress is durable.
//!
//! All mutable state lives behind one `tokio::sync::Mutex`, which
//! serializes batch handling, maintenance, and lifecycle callbacks against
//! each other. Tests instantiate several ingesters side-by-side against
//! shared fakes to exercise hand-off.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use object_store::ObjectStore;
use tokio::sync::Mutex;

use sessionhouse_core::time::{now_epoch_secs, now_ms};
use sessionhouse_core::{LogMessage, RecordingPayload};
use sessionhouse_store::{KvStore, LogClient, TeamResolver};

use crate::buffer::{FlushReason, SessionKey};
use crate::commit::OffsetCommitCoordinator;
use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::lifecycle::PartitionLifecycle;
use crate::overflow::OverflowDetector;
use crate::registry::SessionRegistry;
use crate::tracker::PartitionTracker;
use crate::watermark::{SessionWaterMarker, SubsystemWaterMarker};

/// How long a shutdown-triggered revocation may run before the consumer
/// gives up and exits anyway to avoid split-brain.
const SHUTDOWN_REVOCATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome counters for one batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub accepted: usize,
    pub dropped_decode: usize,
    pub dropped_disabled: usize,
    pub dropped_replay: usize,
    pub dropped_unowned: usize,
    pub overflow_published: usize,
    pub sessions_considered: usize,
}

/// Outcome counters for one maintenance pass.
#[derive(Debug, Default, Clone)]
pub struct MaintenanceStats {
    pub flushed: usize,
    pub flush_failures: usize,
    pub committed: Vec<(i32, u64)>,
    pub watermarks_trimmed: usize,
}

struct IngestState {
    registry: SessionRegistry,
    tracker: PartitionTracker,
    lifecycle: PartitionLifecycle,
    session_marks: SessionWaterMarker,
    subsystem_marks: SubsystemWaterMarker,
    commits: OffsetCommitCoordinator,
    overflow: Option<OverflowDetector>,
}

/// The session-recording ingestion consumer core.
pub struct SessionIngester {
    config: IngestConfig,
    blob: Arc<dyn ObjectStore>,
    log: Arc<dyn LogClient>,
    teams: Arc<dyn TeamResolver>,
    state: Mutex<IngestState>,
}

impl SessionIngester {
    pub fn new(
        config: IngestConfig,
        blob: Arc<dyn ObjectStore>,
        kv: Arc<dyn KvStore>,
        log: Arc<dyn LogClient>,
        teams: Arc<dyn TeamResolver>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.local_spill_directory)?;

        let registry = SessionRegistry::new(
            config.local_spill_directory.clone(),
            config.spill_threshold_bytes,
        );
        let session_marks = SessionWaterMarker::new(kv.clone(), config.session_watermark_base());
        let subsystem_marks =
            SubsystemWaterMarker::new(kv.clone(), config.subsystem_watermark_base());
        let commits = OffsetCommitCoordinator::new(log.clone(), config.consumed_topic());
        let overflow = config.detector_active().then(|| {
            OverflowDetector::new(
                kv,
                config.overflow_set_key(),
                config.overflow_burst_bytes,
                config.overflow_replenish_bytes_per_second,
                config.overflow_ttl_seconds,
                config.overflow_min_sessions_per_batch,
            )
        });

        tracing::info!(
            topic = config.consumed_topic(),
            group = %config.consumer_group,
            consume_overflow = config.consume_overflow,
            detector = overflow.is_some(),
            spill_dir = %config.local_spill_directory.display(),
            "Session ingester created"
        );

        Ok(Self {
            config,
            blob,
            log,
            teams,
            state: Mutex::new(IngestState {
                registry,
                tracker: PartitionTracker::new(),
                lifecycle: PartitionLifecycle::new(),
                session_marks,
                subsystem_marks,
                commits,
                overflow,
            }),
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// The broker granted new partitions: seed commit floors from the
    /// group's committed offsets and load the stored watermarks, then
    /// start accepting batches for them.
    pub async fn on_assign(&self, partitions: &[i32]) -> Result<()> {
        let mut state = self.state.lock().await;
        let st = &mut *state;
        for &partition in partitions {
            st.lifecycle.begin_assign(partition)?;

            let committed = self
                .log
                .committed(self.config.consumed_topic(), partition)
                .await
                .map_err(|err| IngestError::Commit(err.to_string()))?;
            if let Some(offset) = committed {
                st.commits.set_floor(partition, offset);
            }
            let session_marks = st.session_marks.load_partition(partition).await?;
            st.subsystem_marks.load_partition(partition).await?;

            st.lifecycle.finish_assign(partition)?;
            tracing::info!(
                partition,
                committed = ?committed,
                stored_session_marks = session_marks,
                "Partition assigned"
            );
        }
        Ok(())
    }

    /// The broker is revoking partitions. Everything they own is flushed,
    /// committed, and destroyed before this returns; only then may the
    /// broker hand them to another consumer.
    pub async fn on_revoke(&self, partitions: &[i32]) -> Result<()> {
        let mut state = self.state.lock().await;
        let st = &mut *state;

        // Stop accepting first, so a (defensively handled) straggler batch
        // cannot race the teardown.
        for &partition in partitions {
            st.lifecycle.begin_revoke(partition)?;
        }

        for &partition in partitions {
            for key in st.registry.keys_for_partition(partition) {
                if let Err(err) = self
                    .flush_locked(st, &key, FlushReason::PartitionRevoked)
                    .await
                {
                    // The buffer stays unflushed and keeps blocking the
                    // commit below it; the next owner replays its messages.
                    tracing::error!(
                        partition,
                        session = %key,
                        error = %err,
                        "Flush during revocation failed, offsets stay uncommitted"
                    );
                }
            }
        }

        let committed = st
            .commits
            .commit_partitions(partitions, &st.tracker, &st.registry)
            .await;
        for (partition, offset) in &committed {
            if let Err(err) = st.session_marks.trim(*partition, *offset).await {
                tracing::warn!(partition, error = %err, "Watermark trim failed during revocation");
            }
        }

        for &partition in partitions {
            let destroyed = st.registry.destroy_partition(partition);
            st.tracker.remove(partition);
            st.session_marks.drop_partition(partition);
            st.subsystem_marks.drop_partition(partition);
            st.commits.forget_partition(partition);
            st.lifecycle.finish_revoke(partition)?;
            tracing::info!(partition, buffers_destroyed = destroyed, "Partition revoked");
        }
        Ok(())
    }

    /// Revoke every owned partition. Bounded by a deadline; on expiry the
    /// consumer proceeds to exit anyway rather than risk split-brain with
    /// the partitions' next owner.
    pub async fn shutdown(&self) {
        let owned = self.state.lock().await.lifecycle.owned_partitions();
        if owned.is_empty() {
            return;
        }
        match tokio::time::timeout(SHUTDOWN_REVOCATION_TIMEOUT, self.on_revoke(&owned)).await {
            Ok(Ok(())) => tracing::info!(partitions = ?owned, "Shutdown revocation complete"),
            Ok(Err(err)) => {
                tracing::error!(error = %err, "Shutdown revocation failed, exiting anyway")
            }
            Err(_) => {
                let err = IngestError::RevocationTimeout(SHUTDOWN_REVOCATION_TIMEOUT);
                tracing::error!(error = %err, "Shutdown revocation timed out, exiting anyway");
            }
        }
    }

    // ------------------------------------------------------------------
    // Batch handling
    // ------------------------------------------------------------------

    /// Drain one ordered batch into the session buffers.
    pub async fn handle_batch(&self, messages: &[LogMessage]) -> Result<BatchStats> {
        let mut stats = BatchStats::default();
        let mut touched: HashSet<SessionKey> = HashSet::new();

        let mut state = self.state.lock().await;
        let st = &mut *state;

        for message in messages {
            self.log.heartbeat().await;
            let partition = message.partition;
            let debug = self.config.debug_partition == Some(partition);

            if !st.lifecycle.is_owned(partition) {
                stats.dropped_unowned += 1;
                tracing::warn!(
                    partition,
                    offset = message.offset,
                    "Dropping message for partition not owned"
                );
                continue;
            }

            let payload = match RecordingPayload::decode(&message.payload) {
                Ok(payload) => payload,
                Err(err) => {
                    stats.dropped_decode += 1;
                    st.tracker.observe(partition, message.offset, message.timestamp);
                    st.commits.observe_first_offset(partition, message.offset);
                    tracing::warn!(
                        partition,
                        offset = message.offset,
                        error = %err,
                        "Skipping undecodable message"
                    );
                    continue;
                }
            };

            let team = match self.teams.resolve(&payload.team_token).await {
                Ok(Some(team)) if team.recording_enabled => team,
                Ok(_) => {
                    // Unknown token or recording disabled: skipped, but
                    // still accounted toward partition offsets.
                    stats.dropped_disabled += 1;
                    st.tracker.observe(partition, message.offset, message.timestamp);
                    st.commits.observe_first_offset(partition, message.offset);
                    if debug {
                        tracing::debug!(
                            partition,
                            offset = message.offset,
                            session_id = %payload.session_id,
                            "Skipping message for unknown or disabled team"
                        );
                    }
                    continue;
                }
                Err(err) => {
                    stats.dropped_disabled += 1;
                    st.tracker.observe(partition, message.offset, message.timestamp);
                    st.commits.observe_first_offset(partition, message.offset);
                    tracing::warn!(
                        partition,
                        offset = message.offset,
                        error = %err,
                        "Team resolution failed, skipping message"
                    );
                    continue;
                }
            };

            st.tracker.observe(partition, message.offset, message.timestamp);
            st.commits.observe_first_offset(partition, message.offset);

            if st
                .session_marks
                .is_replay(partition, &payload.session_id, message.offset)
            {
                stats.dropped_replay += 1;
                if debug {
                    tracing::debug!(
                        partition,
                        offset = message.offset,
                        session_id = %payload.session_id,
                        "Dropping replayed message below session watermark"
                    );
                }
                continue;
            }

            let body = match payload.to_jsonl() {
                Ok(body) => body,
                Err(err) => {
                    stats.dropped_decode += 1;
                    tracing::warn!(
                        partition,
                        offset = message.offset,
                        error = %err,
                        "Skipping message with unencodable events"
                    );
                    continue;
                }
            };

            let key = SessionKey::new(team.team_id, payload.session_id.clone());
            let buffer = st.registry.get_or_create(partition, &key);
            buffer.add(message, &body, payload.events.len() as u64)?;
            stats.accepted += 1;

            if debug {
                tracing::debug!(
                    partition,
                    offset = message.offset,
                    session = %key,
                    size_bytes = message.size_bytes,
                    events = payload.events.len(),
                    "Buffered message"
                );
            }

            if let Some(detector) = st.overflow.as_mut() {
                touched.insert(key.clone());
                if detector.record(&key, message.size_bytes, now_ms()) {
                    match detector.publish(&key.session_id, now_epoch_secs()).await {
                        Ok(true) => stats.overflow_published += 1,
                        Ok(false) => {}
                        Err(err) => tracing::warn!(
                            session = %key,
                            error = %err,
                            "Overflow publication failed, dropping"
                        ),
                    }
                }
            }
        }

        if let Some(detector) = st.overflow.as_mut() {
            stats.sessions_considered = detector.consider_batch(touched.len(), now_ms());
        }

        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Flushing and committing
    // ------------------------------------------------------------------

    /// Flush one session buffer, record its watermarks, and retire it.
    pub async fn flush_session(&self, key: &SessionKey, reason: FlushReason) -> Result<()> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state, key, reason).await
    }

    async fn flush_locked(
        &self,
        st: &mut IngestState,
        key: &SessionKey,
        reason: FlushReason,
    ) -> Result<()> {
        let (partition, metadata) = {
            let Some(buffer) = st.registry.get_mut(key) else {
                return Ok(());
            };
            let partition = buffer.partition();
            let metadata = buffer.flush(reason, &self.blob).await?;
            (partition, metadata)
        };

        // The upload is durable; record progress before declaring the
        // flush complete. If recording fails the buffer reopens and the
        // next pass re-uploads to the same path.
        let mut progress = st
            .session_marks
            .advance(partition, &key.session_id, metadata.newest_offset)
            .await
            .map(|_| ());
        if progress.is_ok() {
            if let Some(metrics) = st.tracker.get(partition) {
                for subsystem in &self.config.subsystems {
                    if let Err(err) = st
                        .subsystem_marks
                        .advance(partition, subsystem, metrics.last_message_offset)
                        .await
                    {
                        progress = Err(err);
                        break;
                    }
                }
            }
        }

        match progress {
            Ok(()) => {
                if let Some(buffer) = st.registry.get_mut(key) {
                    buffer.complete_flush()?;
                }
                st.registry.destroy_session(key);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    partition,
                    session = %key,
                    error = %err,
                    "Recording flush progress failed, buffer stays open"
                );
                if let Some(buffer) = st.registry.get_mut(key) {
                    buffer.abort_flush()?;
                }
                Err(err)
            }
        }
    }

    /// Run the commit coordinator across every owned partition, then trim
    /// session watermarks the new committed offsets cover.
    pub async fn commit_offsets(&self) -> Vec<(i32, u64)> {
        let mut state = self.state.lock().await;
        let st = &mut *state;
        let owned = st.lifecycle.owned_partitions();
        let committed = st
            .commits
            .commit_partitions(&owned, &st.tracker, &st.registry)
            .await;
        for (partition, offset) in &committed {
            if let Err(err) = st.session_marks.trim(*partition, *offset).await {
                tracing::warn!(partition, error = %err, "Watermark trim failed");
            }
        }
        committed
    }

    /// One periodic pass: flush due buffers, commit, trim, refresh idle
    /// overflow buckets. Errors are logged and retried next pass; they
    /// never cancel batch handling.
    pub async fn run_maintenance(&self) -> MaintenanceStats {
        let mut stats = MaintenanceStats::default();
        self.log.heartbeat().await;

        let mut state = self.state.lock().await;
        let st = &mut *state;
        let now = now_ms();

        for partition in st.lifecycle.owned_partitions() {
            let idle = st
                .tracker
                .idle_seconds(partition, now)
                .is_some_and(|secs| secs >= self.config.partition_idle_seconds as i64);

            for key in st.registry.keys_for_partition(partition) {
                let reason = {
                    let Some(buffer) = st.registry.get(&key) else {
                        continue;
                    };
                    if idle {
                        Some(FlushReason::PartitionShutdown)
                    } else if buffer.age_seconds(now) >= self.config.max_buffer_age_seconds as i64 {
                        Some(FlushReason::BufferAge)
                    } else if buffer.size_bytes() >= self.config.max_buffer_size_bytes {
                        Some(FlushReason::BufferSize)
                    } else {
                        None
                    }
                };
                let Some(reason) = reason else {
                    continue;
                };

                match self.flush_locked(st, &key, reason).await {
                    Ok(()) => stats.flushed += 1,
                    Err(err) => {
                        stats.flush_failures += 1;
                        tracing::warn!(
                            partition,
                            session = %key,
                            reason = reason.as_str(),
                            error = %err,
                            "Scheduled flush failed, will retry"
                        );
                    }
                }
            }
        }

        let owned = st.lifecycle.owned_partitions();
        let committed = st
            .commits
            .commit_partitions(&owned, &st.tracker, &st.registry)
            .await;
        for (partition, offset) in &committed {
            match st.session_marks.trim(*partition, *offset).await {
                Ok(trimmed) => stats.watermarks_trimmed += trimmed,
                Err(err) => tracing::warn!(partition, error = %err, "Watermark trim failed"),
            }
        }
        stats.committed = committed;

        if let Some(detector) = st.overflow.as_mut() {
            detector.consider_batch(0, now);
        }

        stats
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Keys of every live session buffer, in stable order.
    pub async fn active_sessions(&self) -> Vec<SessionKey> {
        self.state.lock().await.registry.keys()
    }

    pub async fn owned_partitions(&self) -> Vec<i32> {
        self.state.lock().await.lifecycle.owned_partitions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use object_store::memory::InMemory;
    use sessionhouse_core::Team;
    use sessionhouse_store::{MemoryKvStore, MemoryLogClient, StaticTeamResolver};

    struct Harness {
        ingester: SessionIngester,
        log: Arc<MemoryLogClient>,
        _spill: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let spill = tempfile::tempdir().unwrap();
        let config = IngestConfig {
            local_spill_directory: spill.path().to_path_buf(),
            ..IngestConfig::default()
        };
        let log = Arc::new(MemoryLogClient::new());
        let teams = StaticTeamResolver::new()
            .with_team("tok-live", Team::new(1, true))
            .with_team("tok-off", Team::new(2, false));
        let ingester = SessionIngester::new(
            config,
            Arc::new(InMemory::new()),
            Arc::new(MemoryKvStore::new()),
            log.clone(),
            Arc::new(teams),
        )
        .unwrap();
        Harness {
            ingester,
            log,
            _spill: spill,
        }
    }

    fn msg(partition: i32, offset: u64, token: &str, session: &str) -> LogMessage {
        let payload = format!(
            r#"{{"team_token":"{token}","session_id":"{session}","events":[{{"t":{offset}}}]}}"#
        );
        LogMessage::new("session_recording_events", partition, offset, 1_000, Bytes::from(payload))
    }

    #[tokio::test]
    async fn test_batch_routes_messages_into_buffers() {
        let h = harness();
        h.ingester.on_assign(&[1]).await.unwrap();

        let stats = h
            .ingester
            .handle_batch(&[
                msg(1, 1, "tok-live", "sid1"),
                msg(1, 2, "tok-live", "sid1"),
                msg(1, 3, "tok-live", "sid2"),
            ])
            .await
            .unwrap();

        assert_eq!(stats.accepted, 3);
        let sessions = h.ingester.active_sessions().await;
        assert_eq!(sessions.len(), 2);
    }

    #[tokio::test]
    async fn test_decode_failures_and_disabled_teams_are_skipped() {
        let h = harness();
        h.ingester.on_assign(&[1]).await.unwrap();

        let garbage =
            LogMessage::new("session_recording_events", 1, 1, 1_000, Bytes::from("not json"));
        let stats = h
            .ingester
            .handle_batch(&[
                garbage,
                msg(1, 2, "tok-off", "sid1"),
                msg(1, 3, "tok-unknown", "sid1"),
                msg(1, 4, "tok-live", "sid1"),
            ])
            .await
            .unwrap();

        assert_eq!(stats.dropped_decode, 1);
        assert_eq!(stats.dropped_disabled, 2);
        assert_eq!(stats.accepted, 1);
        assert_eq!(h.ingester.active_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unowned_partition_messages_rejected() {
        let h = harness();
        h.ingester.on_assign(&[1]).await.unwrap();

        let stats = h
            .ingester
            .handle_batch(&[msg(2, 1, "tok-live", "sid1")])
            .await
            .unwrap();
        assert_eq!(stats.dropped_unowned, 1);
        assert!(h.ingester.active_sessions().await.is_empty());
        // Unowned messages do not advance anything committable.
        assert!(h.ingester.commit_offsets().await.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeats_at_least_once_per_message_and_pass() {
        let h = harness();
        h.ingester.on_assign(&[1]).await.unwrap();
        h.ingester
            .handle_batch(&[msg(1, 1, "tok-live", "sid1"), msg(1, 2, "tok-live", "sid1")])
            .await
            .unwrap();
        h.ingester.run_maintenance().await;

        assert!(h.log.heartbeats() >= 3);
    }

    #[tokio::test]
    async fn test_maintenance_flushes_aged_buffers_and_commits() {
        let spill = tempfile::tempdir().unwrap();
        let config = IngestConfig {
            local_spill_directory: spill.path().to_path_buf(),
            // Everything is immediately "aged".
            max_buffer_age_seconds: 0,
            ..IngestConfig::default()
        };
        let log = Arc::new(MemoryLogClient::new());
        let teams = StaticTeamResolver::new().with_team("tok-live", Team::new(1, true));
        let ingester = SessionIngester::new(
            config,
            Arc::new(InMemory::new()),
            Arc::new(MemoryKvStore::new()),
            log.clone(),
            Arc::new(teams),
        )
        .unwrap();

        ingester.on_assign(&[1]).await.unwrap();
        ingester
            .handle_batch(&[msg(1, 1, "tok-live", "sid1"), msg(1, 2, "tok-live", "sid1")])
            .await
            .unwrap();

        let stats = ingester.run_maintenance().await;
        assert_eq!(stats.flushed, 1);
        assert_eq!(stats.committed, vec![(1, 3)]);
        assert!(ingester.active_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_revokes_everything() {
        let h = harness();
        h.ingester.on_assign(&[1, 2]).await.unwrap();
        h.ingester
            .handle_batch(&[msg(1, 1, "tok-live", "sid1"), msg(2, 5, "tok-live", "sid2")])
            .await
            .unwrap();

        h.ingester.shutdown().await;
        assert!(h.ingester.owned_partitions().await.is_empty());
        assert!(h.ingester.active_sessions().await.is_empty());

        let offsets: Vec<(i32, u64)> = h
            .log
            .commits()
            .await
            .iter()
            .map(|c| (c.partition, c.offset))
            .collect();
        assert!(offsets.contains(&(1, 2)));
        assert!(offsets.contains(&(2, 6)));
    }

    #[tokio::test]
    async fn test_overflow_disabled_for_overflow_consumer() {
        let spill = tempfile::tempdir().unwrap();
        let config = IngestConfig {
            local_spill_directory: spill.path().to_path_buf(),
            consume_overflow: true,
            ..IngestConfig::default()
        };
        let ingester = SessionIngester::new(
            config,
            Arc::new(InMemory::new()),
            Arc::new(MemoryKvStore::new()),
            Arc::new(MemoryLogClient::new()),
            Arc::new(StaticTeamResolver::new().with_team("tok-live", Team::new(1, true))),
        )
        .unwrap();
        assert_eq!(
            ingester.config().consumed_topic(),
            "session_recording_events_overflow"
        );

        ingester.on_assign(&[1]).await.unwrap();
        // A message far over the burst budget: no detector, no publication.
        let stats = ingester
            .handle_batch(&[msg(1, 1, "tok-live", "sid1").with_size(10_000_000)])
            .await
            .unwrap();
        assert_eq!(stats.overflow_published, 0);
        assert_eq!(stats.sessions_considered, 0);
    }
}
