//! Collaborator Interfaces
//!
//! The ingester talks to three external systems it does not own: a shared
//! key/value store (watermarks, overflow quarantine set), the log client
//! (offset commits, group heartbeats), and a team directory (token
//! resolution). This crate defines each of them as a narrow capability
//! trait, sized to exactly the operations the ingester uses, so tests can
//! substitute in-memory fakes and production can bind whatever backend it
//! runs against.
//!
//! The blob sink is deliberately NOT wrapped here: the `object_store` crate
//! already is the capability trait for that collaborator, and its in-memory
//! implementation serves the same role the fakes in this crate do.

pub mod error;
pub mod kv;
pub mod log;
pub mod teams;

pub use error::{Result, StoreError};
pub use kv::{KvStore, MemoryKvStore};
pub use log::{CommittedOffset, LogClient, MemoryLogClient};
pub use teams::{StaticTeamResolver, TeamResolver};
