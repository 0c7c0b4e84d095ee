//! Sessionhouse server binary.
//!
//! Wires the ingester to local collaborators and runs the maintenance
//! timer. Intended for development and smoke-testing: the blob sink is a
//! local filesystem directory, the kv store and log client are in-memory,
//! and batches can be fed from a JSONL file (`--feed`) in place of a real
//! broker subscription. Production deployments embed
//! `sessionhouse-ingest` behind their own log client.
//!
//! ```text
//! sessionhouse --config config.json --feed recordings.jsonl
//! RUST_LOG=sessionhouse_ingest=debug sessionhouse --config config.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sessionhouse_core::{time::now_ms, LogMessage, Team};
use sessionhouse_ingest::{IngestConfig, SessionIngester};
use sessionhouse_store::{MemoryKvStore, MemoryLogClient, StaticTeamResolver};

#[derive(Debug, Parser)]
#[command(name = "sessionhouse", about = "Session-recording ingestion consumer")]
struct Args {
    /// Path to a JSON config file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSONL file of recording payloads to feed as one batch.
    #[arg(long)]
    feed: Option<PathBuf>,

    /// Partition the fed messages are placed on.
    #[arg(long, default_value_t = 0)]
    partition: i32,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    #[serde(default)]
    ingest: IngestConfig,

    /// Directory backing the local blob sink.
    #[serde(default = "default_blob_directory")]
    blob_directory: PathBuf,

    /// Token table for the static team resolver.
    #[serde(default)]
    teams: Vec<TeamEntry>,

    /// Partitions to assign at startup.
    #[serde(default = "default_partitions")]
    partitions: Vec<i32>,
}

#[derive(Debug, Deserialize)]
struct TeamEntry {
    token: String,
    team_id: u64,
    #[serde(default = "default_recording_enabled")]
    recording_enabled: bool,
}

fn default_blob_directory() -> PathBuf {
    PathBuf::from("./session-blobs")
}

fn default_partitions() -> Vec<i32> {
    vec![0]
}

fn default_recording_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ingest: IngestConfig::default(),
            blob_directory: default_blob_directory(),
            teams: Vec::new(),
            partitions: default_partitions(),
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ServerConfig> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))
        }
        None => Ok(ServerConfig::default()),
    }
}

fn feed_messages(path: &PathBuf, topic: &str, partition: i32) -> anyhow::Result<Vec<LogMessage>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading feed file {}", path.display()))?;
    let now = now_ms();
    Ok(raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            LogMessage::new(topic, partition, i as u64 + 1, now, Bytes::from(line.to_string()))
        })
        .collect())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    std::fs::create_dir_all(&config.blob_directory)
        .with_context(|| format!("creating blob directory {}", config.blob_directory.display()))?;
    let blob = Arc::new(
        object_store::local::LocalFileSystem::new_with_prefix(&config.blob_directory)
            .context("opening local blob sink")?,
    );
    let kv = Arc::new(MemoryKvStore::new());
    let log = Arc::new(MemoryLogClient::new());

    let mut teams = StaticTeamResolver::new();
    for entry in &config.teams {
        teams.insert(&entry.token, Team::new(entry.team_id, entry.recording_enabled));
    }

    let ingester = SessionIngester::new(config.ingest, blob, kv, log.clone(), Arc::new(teams))?;
    let topic = ingester.config().consumed_topic().to_string();

    ingester.on_assign(&config.partitions).await?;
    info!(topic = %topic, partitions = ?config.partitions, "Ingester started");

    if let Some(feed) = &args.feed {
        let messages = feed_messages(feed, &topic, args.partition)?;
        let stats = ingester.handle_batch(&messages).await?;
        info!(
            fed = messages.len(),
            accepted = stats.accepted,
            dropped_decode = stats.dropped_decode,
            dropped_disabled = stats.dropped_disabled,
            "Feed batch processed"
        );
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(
        ingester.config().commit_interval_seconds.max(1),
    ));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = ingester.run_maintenance().await;
                if stats.flushed > 0 || !stats.committed.is_empty() {
                    info!(
                        flushed = stats.flushed,
                        committed = ?stats.committed,
                        "Maintenance pass"
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                ingester.shutdown().await;
                for commit in log.commits().await {
                    info!(
                        partition = commit.partition,
                        offset = commit.offset,
                        "Final committed offset"
                    );
                }
                break;
            }
        }
    }

    Ok(())
}
