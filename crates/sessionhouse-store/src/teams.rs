//! Team Resolution
//!
//! Maps an opaque `team_token` to a [`Team`]. In production this is backed
//! by the application's team directory; tests and local runs use
//! [`StaticTeamResolver`] with a fixed token table.

use std::collections::HashMap;

use async_trait::async_trait;
use sessionhouse_core::Team;

use crate::error::Result;

/// Narrow capability interface over team lookup.
#[async_trait]
pub trait TeamResolver: Send + Sync {
    /// Resolve a token. `Ok(None)` means the token is unknown; an `Err`
    /// means the directory itself failed.
    async fn resolve(&self, token: &str) -> Result<Option<Team>>;
}

/// Fixed-table [`TeamResolver`] for tests and local runs.
#[derive(Default)]
pub struct StaticTeamResolver {
    teams: HashMap<String, Team>,
}

impl StaticTeamResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_team(mut self, token: impl Into<String>, team: Team) -> Self {
        self.teams.insert(token.into(), team);
        self
    }

    pub fn insert(&mut self, token: impl Into<String>, team: Team) {
        self.teams.insert(token.into(), team);
    }
}

#[async_trait]
impl TeamResolver for StaticTeamResolver {
    async fn resolve(&self, token: &str) -> Result<Option<Team>> {
        Ok(self.teams.get(token).copied())
    }
}
