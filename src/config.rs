use std::time::Duration;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const DEFAULT_CACHE_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_TYPING_LIVENESS: Duration = Duration::from_secs(5);
pub const DEFAULT_TYPING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
// Per-subscription event buffer.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 100;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub page_size: usize,
    /// Cache entries older than this are treated as absent.
    pub cache_retention: Duration,
    pub typing_liveness: Duration,
    pub typing_sweep_interval: Duration,
    pub subscription_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_retention: DEFAULT_CACHE_RETENTION,
            typing_liveness: DEFAULT_TYPING_LIVENESS,
            typing_sweep_interval: DEFAULT_TYPING_SWEEP_INTERVAL,
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
        }
    }
}
