//! Session-Recording Ingestion Core
//!
//! A stateful stream processor that consumes ordered event batches from a
//! partitioned log, groups messages into per-session buffers, flushes
//! completed or aged buffers to object storage, and advances committed log
//! offsets so that no message is acknowledged before its session buffer has
//! been durably persisted.
//!
//! ## Components
//!
//! - [`buffer::SessionBuffer`] - append-only accumulator for one
//!   `(team, session)` pair; in memory below a spill threshold, gzip-spilled
//!   to disk above it
//! - [`registry::SessionRegistry`] - `(team, session) -> buffer` for the
//!   partitions currently owned
//! - [`tracker::PartitionTracker`] - highest observed offset and last
//!   message timestamp per owned partition
//! - [`watermark`] - session and subsystem high-water marks persisted in the
//!   shared kv store; filters duplicate replays after rebalance
//! - [`commit::OffsetCommitCoordinator`] - the greatest safe offset per
//!   partition, respecting blocking (unflushed) sessions
//! - [`overflow::OverflowDetector`] - token-bucket hot-session detection
//!   with publication to a shared quarantine set
//! - [`lifecycle::PartitionLifecycle`] - per-partition ownership state
//! - [`ingester::SessionIngester`] - the facade wiring all of the above to
//!   the log client, blob sink, kv store, and team directory
//!
//! ## Flow
//!
//! ```text
//! handle_batch(messages)
//!     ↓ decode → resolve team → watermark filter
//! SessionRegistry / SessionBuffer.add()     ← hot path, no suspension
//!     ↓ (periodic)
//! flush due buffers → blob sink             ← age / size / idle / revoked
//!     ↓
//! advance watermarks → kv store
//!     ↓
//! OffsetCommitCoordinator → log client
//! ```

pub mod buffer;
pub mod commit;
pub mod config;
pub mod error;
pub mod ingester;
pub mod lifecycle;
pub mod overflow;
pub mod registry;
pub mod tracker;
pub mod watermark;

pub use buffer::{BufferMetadata, BufferState, FlushReason, SessionBuffer, SessionKey};
pub use config::IngestConfig;
pub use error::{IngestError, Result};
pub use ingester::{BatchStats, MaintenanceStats, SessionIngester};
