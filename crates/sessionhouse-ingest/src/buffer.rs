//! Session Buffer
//!
//! An append-only accumulator for one `(team, session)` pair within a single
//! partition. Knows its lowest and highest held log offset, the wall-clock
//! extremes of its events, and its accumulated byte size, and can flush
//! itself to the blob sink.
//!
//! ## Body placement
//!
//! The body is newline-delimited JSON. It lives wholly in memory below the
//! spill threshold and wholly in two on-disk files above it: the
//! gzip-compressed body (`{team}.{session}.{nonce}.jsonl.gz`) and a sidecar
//! metadata file (`{team}.{session}.{nonce}.metadata.json`). There is no
//! mixed state.
//!
//! ## State machine
//!
//! ```text
//! Open ──flush──▶ Flushing ──complete_flush──▶ Flushed ──destroy──▶ Destroyed
//!   ▲                │
//!   └──abort_flush───┘   (upload failure, or progress not recorded)
//! ```
//!
//! `flush` uploads both blobs and leaves the buffer in `Flushing`; the
//! driver records watermarks and then either completes or aborts. An aborted
//! buffer is `Open` again with offsets unchanged, so a retry is valid. The
//! blob path is derived only from buffer state, so a retry with no
//! intervening `add` reuses the identical path and the sink stays
//! idempotent.
//!
//! A failed flush of a spilled buffer finalizes the current gzip member and
//! leaves the file in place; the next `add` appends a fresh member.
//! Concatenated members are valid gzip and decompress as one stream.
//!
//! ## Hot path
//!
//! `add` is synchronous - no suspension between the batch handler taking a
//! message and the buffer owning its bytes.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use object_store::path::Path as BlobPath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};

use sessionhouse_core::LogMessage;

use crate::error::{IngestError, Result};

/// Lifecycle state of a [`SessionBuffer`]. Transitions only move forward,
/// except the sanctioned `Flushing -> Open` failure edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Open,
    Flushing,
    Flushed,
    Destroyed,
}

/// Why a buffer is being flushed. Carried into logs and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    BufferAge,
    BufferSize,
    PartitionShutdown,
    PartitionRevoked,
}

impl FlushReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            FlushReason::BufferAge => "buffer_age",
            FlushReason::BufferSize => "buffer_size",
            FlushReason::PartitionShutdown => "partition_shutdown",
            FlushReason::PartitionRevoked => "partition_revoked",
        }
    }
}

/// Identity of a session buffer: the team plus the session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub team_id: u64,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(team_id: u64, session_id: impl Into<String>) -> Self {
        Self {
            team_id,
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.team_id, self.session_id)
    }
}

/// Sidecar metadata uploaded next to the compressed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferMetadata {
    pub oldest_offset: u64,
    pub newest_offset: u64,
    pub event_count: u64,
    pub size_bytes: u64,
    pub first_timestamp: i64,
    pub last_timestamp: i64,
}

enum BufferBody {
    Memory(Vec<u8>),
    Spilled {
        /// `None` between a finalized gzip member and the next append.
        encoder: Option<GzEncoder<BufWriter<File>>>,
    },
}

/// Append-only accumulator for one session's events between flushes.
pub struct SessionBuffer {
    key: SessionKey,
    partition: i32,
    state: BufferState,

    oldest_offset: u64,
    newest_offset: u64,
    oldest_timestamp: i64,
    newest_timestamp: i64,
    size_bytes: u64,
    event_count: u64,
    messages: u64,

    body: BufferBody,
    spill_threshold: usize,
    data_path: PathBuf,
    meta_path: PathBuf,
}

impl SessionBuffer {
    /// Create an empty open buffer. No files are touched until the body
    /// crosses the spill threshold.
    pub fn create(
        key: SessionKey,
        partition: i32,
        spill_dir: &Path,
        spill_threshold: usize,
    ) -> Self {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let stem = format!("{}.{}.{}", key.team_id, key.session_id, nonce);
        Self {
            key,
            partition,
            state: BufferState::Open,
            oldest_offset: 0,
            newest_offset: 0,
            oldest_timestamp: 0,
            newest_timestamp: 0,
            size_bytes: 0,
            event_count: 0,
            messages: 0,
            body: BufferBody::Memory(Vec::new()),
            spill_threshold,
            data_path: spill_dir.join(format!("{stem}.jsonl.gz")),
            meta_path: spill_dir.join(format!("{stem}.metadata.json")),
        }
    }

    /// Append one message's rendered events.
    ///
    /// `body` is the JSONL rendering of the message's event records and
    /// `events` their count. Requires `state = Open`.
    pub fn add(&mut self, message: &LogMessage, body: &[u8], events: u64) -> Result<()> {
        if self.state != BufferState::Open {
            return Err(IngestError::BufferClosed { state: self.state });
        }

        if self.messages == 0 {
            self.oldest_offset = message.offset;
            self.oldest_timestamp = message.timestamp;
            self.newest_timestamp = message.timestamp;
        }
        self.newest_offset = message.offset;
        self.oldest_timestamp = self.oldest_timestamp.min(message.timestamp);
        self.newest_timestamp = self.newest_timestamp.max(message.timestamp);
        self.size_bytes += message.size_bytes as u64;
        self.event_count += events;
        self.messages += 1;

        self.write_body(body)
    }

    fn write_body(&mut self, body: &[u8]) -> Result<()> {
        match &mut self.body {
            BufferBody::Memory(buf) => {
                buf.extend_from_slice(body);
                if buf.len() >= self.spill_threshold {
                    self.spill()?;
                }
            }
            BufferBody::Spilled { encoder } => {
                if encoder.is_none() {
                    // A flush attempt finalized the previous gzip member;
                    // append a fresh one.
                    let file = OpenOptions::new().append(true).open(&self.data_path)?;
                    *encoder = Some(GzEncoder::new(BufWriter::new(file), Compression::default()));
                }
                if let Some(enc) = encoder {
                    enc.write_all(body)?;
                }
            }
        }
        Ok(())
    }

    /// Move the in-memory body to the two on-disk files.
    fn spill(&mut self) -> Result<()> {
        let BufferBody::Memory(buf) = &mut self.body else {
            return Ok(());
        };
        let pending = std::mem::take(buf);

        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&self.data_path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        encoder.write_all(&pending)?;
        self.body = BufferBody::Spilled {
            encoder: Some(encoder),
        };
        self.write_sidecar()?;

        tracing::debug!(
            session = %self.key,
            partition = self.partition,
            bytes = pending.len(),
            path = %self.data_path.display(),
            "Session buffer spilled to disk"
        );
        Ok(())
    }

    fn write_sidecar(&self) -> Result<()> {
        let json = serde_json::to_vec(&self.metadata())?;
        std::fs::write(&self.meta_path, json)?;
        Ok(())
    }

    /// Upload the compressed body and its metadata sidecar.
    ///
    /// Leaves the buffer in `Flushing` on success so the driver can record
    /// watermarks before calling [`complete_flush`](Self::complete_flush).
    /// On upload failure the buffer is `Open` again with offsets unchanged.
    pub async fn flush(
        &mut self,
        reason: FlushReason,
        store: &Arc<dyn ObjectStore>,
    ) -> Result<BufferMetadata> {
        if self.state != BufferState::Open {
            return Err(IngestError::BufferClosed { state: self.state });
        }
        self.state = BufferState::Flushing;

        let compressed = match self.prepare_body() {
            Ok(bytes) => bytes,
            Err(err) => {
                self.state = BufferState::Open;
                return Err(err);
            }
        };
        let metadata = self.metadata();
        let meta_json = match serde_json::to_vec(&metadata) {
            Ok(json) => json,
            Err(err) => {
                self.state = BufferState::Open;
                return Err(err.into());
            }
        };

        let data_path = self.blob_data_path();
        let meta_path = self.blob_metadata_path();
        for (path, bytes) in [(&data_path, compressed), (&meta_path, meta_json)] {
            if let Err(err) = store.put(path, Bytes::from(bytes)).await {
                tracing::warn!(
                    session = %self.key,
                    partition = self.partition,
                    path = %path,
                    reason = reason.as_str(),
                    error = %err,
                    "Session buffer upload failed, buffer stays open"
                );
                self.state = BufferState::Open;
                return Err(IngestError::Flush(err.to_string()));
            }
        }

        tracing::info!(
            session = %self.key,
            partition = self.partition,
            reason = reason.as_str(),
            oldest_offset = metadata.oldest_offset,
            newest_offset = metadata.newest_offset,
            events = metadata.event_count,
            size_bytes = metadata.size_bytes,
            path = %data_path,
            "Session buffer uploaded"
        );
        Ok(metadata)
    }

    fn prepare_body(&mut self) -> Result<Vec<u8>> {
        match &mut self.body {
            BufferBody::Memory(buf) => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(buf)?;
                Ok(encoder.finish()?)
            }
            BufferBody::Spilled { encoder } => {
                if let Some(enc) = encoder.take() {
                    let mut inner = enc.finish()?;
                    inner.flush()?;
                }
                self.write_sidecar()?;
                Ok(std::fs::read(&self.data_path)?)
            }
        }
    }

    /// Mark the flush durable: `Flushing -> Flushed`.
    pub fn complete_flush(&mut self) -> Result<()> {
        if self.state != BufferState::Flushing {
            return Err(IngestError::BufferClosed { state: self.state });
        }
        self.state = BufferState::Flushed;
        Ok(())
    }

    /// The upload happened but progress was not recorded: `Flushing -> Open`
    /// so a later pass re-uploads to the same path.
    pub fn abort_flush(&mut self) -> Result<()> {
        if self.state != BufferState::Flushing {
            return Err(IngestError::BufferClosed { state: self.state });
        }
        self.state = BufferState::Open;
        Ok(())
    }

    /// Delete the on-disk files and retire the buffer. Idempotent.
    pub fn destroy(&mut self) {
        if self.state == BufferState::Destroyed {
            return;
        }
        if let BufferBody::Spilled { encoder } = &mut self.body {
            // Drop the handle before unlinking.
            encoder.take();
            for path in [&self.data_path, &self.meta_path] {
                if let Err(err) = std::fs::remove_file(path) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(
                            session = %self.key,
                            path = %path.display(),
                            error = %err,
                            "Failed to delete spill file"
                        );
                    }
                }
            }
        }
        self.state = BufferState::Destroyed;
    }

    /// The offset that blocks commits while this buffer is unflushed.
    pub fn lowest_offset(&self) -> Option<u64> {
        match self.state {
            BufferState::Open | BufferState::Flushing if self.messages > 0 => {
                Some(self.oldest_offset)
            }
            _ => None,
        }
    }

    /// Age of the oldest event, in seconds.
    pub fn age_seconds(&self, now_ms: i64) -> i64 {
        if self.messages == 0 {
            0
        } else {
            (now_ms - self.oldest_timestamp) / 1000
        }
    }

    pub fn metadata(&self) -> BufferMetadata {
        BufferMetadata {
            oldest_offset: self.oldest_offset,
            newest_offset: self.newest_offset,
            event_count: self.event_count,
            size_bytes: self.size_bytes,
            first_timestamp: self.oldest_timestamp,
            last_timestamp: self.newest_timestamp,
        }
    }

    pub fn blob_data_path(&self) -> BlobPath {
        BlobPath::from(format!(
            "team_{}/session_{}/data-{}-{}.jsonl.gz",
            self.key.team_id, self.key.session_id, self.oldest_timestamp, self.newest_timestamp
        ))
    }

    pub fn blob_metadata_path(&self) -> BlobPath {
        BlobPath::from(format!(
            "team_{}/session_{}/data-{}-{}.metadata.json",
            self.key.team_id, self.key.session_id, self.oldest_timestamp, self.newest_timestamp
        ))
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn oldest_offset(&self) -> u64 {
        self.oldest_offset
    }

    pub fn newest_offset(&self) -> u64 {
        self.newest_offset
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.body, BufferBody::Spilled { .. })
    }

    pub fn spill_data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn spill_metadata_path(&self) -> &Path {
        &self.meta_path
    }
}
