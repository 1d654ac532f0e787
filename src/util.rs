//! Small helpers shared across modules.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix timestamp in whole seconds.
pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
