use std::time::Duration;

/// Rotation and skipped-key bounds for a [`RatchetSession`](crate::RatchetSession).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Sent messages on one chain after which a ratchet is due.
    pub message_bound: u64,
    /// Wall-clock time since the last ratchet after which a ratchet is due.
    pub time_bound: Duration,
    /// Largest gap a single decrypt may walk the receiving chain forward.
    pub max_message_skip: u64,
    /// Cap on cached skipped message keys.
    pub max_stored_skipped_keys: usize,
    /// Skipped keys older than this are discarded on prune.
    pub skipped_key_max_age: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            message_bound: 100,
            time_bound: Duration::from_secs(60 * 60), // 1 hour
            max_message_skip: 1000,
            max_stored_skipped_keys: 2000,
            skipped_key_max_age: Duration::from_secs(24 * 60 * 60), // 24 hours
        }
    }
}
