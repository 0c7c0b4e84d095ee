//! Team identity.
//!
//! A message carries an opaque `team_token`; the ingester resolves it to a
//! `Team` before routing. Teams that have recording disabled are skipped,
//! but their messages still advance partition offsets so commits are not
//! held back by traffic nobody wants persisted.

use serde::{Deserialize, Serialize};

/// A team resolved from an API token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    /// Opaque numeric identifier, used in blob paths.
    pub team_id: u64,

    /// Whether session recording is enabled for this team.
    pub recording_enabled: bool,
}

impl Team {
    pub fn new(team_id: u64, recording_enabled: bool) -> Self {
        Self {
            team_id,
            recording_enabled,
        }
    }
}
