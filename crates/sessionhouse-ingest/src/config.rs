//! Ingester Configuration
//!
//! Controls buffering, flushing, commit cadence, overflow detection, and
//! topic selection. Every field is defaulted and overridable; a deployment
//! runs two code-identical instances differing only in `consume_overflow`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Flush a buffer once its oldest event is this old (default: 5 minutes).
    #[serde(default = "default_max_buffer_age_seconds")]
    pub max_buffer_age_seconds: u64,

    /// Flush a buffer once it has accumulated this many payload bytes
    /// (default: 50MB).
    #[serde(default = "default_max_buffer_size_bytes")]
    pub max_buffer_size_bytes: u64,

    /// Buffers smaller than this stay wholly in memory; crossing it spills
    /// the body to disk (default: 64KB).
    #[serde(default = "default_spill_threshold_bytes")]
    pub spill_threshold_bytes: usize,

    /// Flush every buffer of a partition that has seen no new message for
    /// this long (default: 2 minutes).
    #[serde(default = "default_partition_idle_seconds")]
    pub partition_idle_seconds: u64,

    /// Period of the offset commit coordinator (default: 5s).
    #[serde(default = "default_commit_interval_seconds")]
    pub commit_interval_seconds: u64,

    /// Whether the overflow detector runs (default: true). Forced off when
    /// `consume_overflow` is set.
    #[serde(default = "default_overflow_enabled")]
    pub overflow_enabled: bool,

    /// Token-bucket capacity in bytes (default: 1MB).
    #[serde(default = "default_overflow_burst_bytes")]
    pub overflow_burst_bytes: u64,

    /// Token-bucket refill rate in bytes per second (default: 1kB/s).
    #[serde(default = "default_overflow_replenish_bytes_per_second")]
    pub overflow_replenish_bytes_per_second: u64,

    /// Minimum number of sessions the detector considers per batch
    /// (default: 10).
    #[serde(default = "default_overflow_min_sessions_per_batch")]
    pub overflow_min_sessions_per_batch: usize,

    /// Quarantine window for overflowing sessions (default: 24h).
    #[serde(default = "default_overflow_ttl_seconds")]
    pub overflow_ttl_seconds: i64,

    /// When set, verbose per-message tracing for exactly this partition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_partition: Option<i32>,

    /// Directory for buffer spill files. Exclusive to this process.
    #[serde(default = "default_local_spill_directory")]
    pub local_spill_directory: PathBuf,

    /// When true, subscribe to the overflow topic instead of the main topic
    /// and disable this instance's own overflow detector.
    #[serde(default)]
    pub consume_overflow: bool,

    /// Consumer group name, used in commits and kv keys.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Main topic name.
    #[serde(default = "default_main_topic")]
    pub main_topic: String,

    /// Overflow topic name.
    #[serde(default = "default_overflow_topic")]
    pub overflow_topic: String,

    /// Prefix for every kv key this instance writes.
    #[serde(default = "default_kv_prefix")]
    pub kv_prefix: String,

    /// Downstream subsystem names tracked by the persistent high-water
    /// marker.
    #[serde(default = "default_subsystems")]
    pub subsystems: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_buffer_age_seconds: default_max_buffer_age_seconds(),
            max_buffer_size_bytes: default_max_buffer_size_bytes(),
            spill_threshold_bytes: default_spill_threshold_bytes(),
            partition_idle_seconds: default_partition_idle_seconds(),
            commit_interval_seconds: default_commit_interval_seconds(),
            overflow_enabled: default_overflow_enabled(),
            overflow_burst_bytes: default_overflow_burst_bytes(),
            overflow_replenish_bytes_per_second: default_overflow_replenish_bytes_per_second(),
            overflow_min_sessions_per_batch: default_overflow_min_sessions_per_batch(),
            overflow_ttl_seconds: default_overflow_ttl_seconds(),
            debug_partition: None,
            local_spill_directory: default_local_spill_directory(),
            consume_overflow: false,
            consumer_group: default_consumer_group(),
            main_topic: default_main_topic(),
            overflow_topic: default_overflow_topic(),
            kv_prefix: default_kv_prefix(),
            subsystems: default_subsystems(),
        }
    }
}

impl IngestConfig {
    /// The topic this instance subscribes to.
    pub fn consumed_topic(&self) -> &str {
        if self.consume_overflow {
            &self.overflow_topic
        } else {
            &self.main_topic
        }
    }

    /// Whether this instance runs the overflow detector.
    pub fn detector_active(&self) -> bool {
        self.overflow_enabled && !self.consume_overflow
    }

    /// kv key base of the session high-water hashes; one hash per
    /// partition underneath.
    pub fn session_watermark_base(&self) -> String {
        format!(
            "{}/sessions/{}/{}",
            self.kv_prefix,
            self.consumer_group,
            self.consumed_topic()
        )
    }

    /// kv key base of the subsystem high-water hashes.
    pub fn subsystem_watermark_base(&self) -> String {
        format!(
            "{}/subsystems/{}/{}",
            self.kv_prefix,
            self.consumer_group,
            self.consumed_topic()
        )
    }

    /// kv key of the session high-water hash for one partition.
    pub fn session_watermark_key(&self, partition: i32) -> String {
        format!("{}/{}", self.session_watermark_base(), partition)
    }

    /// kv key of the subsystem high-water hash for one partition.
    pub fn subsystem_watermark_key(&self, partition: i32) -> String {
        format!("{}/{}", self.subsystem_watermark_base(), partition)
    }

    /// kv key of the shared overflow quarantine set. One set per
    /// deployment, not per instance.
    pub fn overflow_set_key(&self) -> String {
        format!("{}/capture-overflow/replay", self.kv_prefix)
    }
}

fn default_max_buffer_age_seconds() -> u64 {
    300
}

fn default_max_buffer_size_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_spill_threshold_bytes() -> usize {
    64 * 1024
}

fn default_partition_idle_seconds() -> u64 {
    120
}

fn default_commit_interval_seconds() -> u64 {
    5
}

fn default_overflow_enabled() -> bool {
    true
}

fn default_overflow_burst_bytes() -> u64 {
    1024 * 1024
}

fn default_overflow_replenish_bytes_per_second() -> u64 {
    1_000
}

fn default_overflow_min_sessions_per_batch() -> usize {
    10
}

fn default_overflow_ttl_seconds() -> i64 {
    24 * 60 * 60
}

fn default_local_spill_directory() -> PathBuf {
    PathBuf::from("./session-buffers")
}

fn default_consumer_group() -> String {
    "session-recordings".to_string()
}

fn default_main_topic() -> String {
    "session_recording_events".to_string()
}

fn default_overflow_topic() -> String {
    "session_recording_events_overflow".to_string()
}

fn default_kv_prefix() -> String {
    "@sessionhouse".to_string()
}

fn default_subsystems() -> Vec<String> {
    vec!["blob_ingestion".to_string()]
}
