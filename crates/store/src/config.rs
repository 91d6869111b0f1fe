//! Store tunables, read from `HZ_*` environment variables with fallbacks.

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Read-modify-write attempts Apply makes before surfacing a conflict.
    pub apply_retries: usize,
    /// Change feed fan-out buffer per subscriber.
    pub watch_buffer: usize,
    /// How many recent (key, revision) pairs the change feed remembers.
    pub feed_dedup_window: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { apply_retries: 5, watch_buffer: 1024, feed_dedup_window: 4096 }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            apply_retries: env_usize("HZ_APPLY_RETRIES", d.apply_retries).max(1),
            watch_buffer: env_usize("HZ_WATCH_BUFFER", d.watch_buffer).max(1),
            feed_dedup_window: env_usize("HZ_FEED_DEDUP_WINDOW", d.feed_dedup_window).max(1),
        }
    }
}
