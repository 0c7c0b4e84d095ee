//! Wall-clock helpers.
//!
//! All timestamps in the system are milliseconds since the Unix epoch,
//! matching the log client's message timestamps. The overflow quarantine set
//! scores entries in whole epoch seconds.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn now_epoch_secs() -> i64 {
    now_ms() / 1000
}
