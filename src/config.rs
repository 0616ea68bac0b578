use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the build queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Directory holding the persisted queue state (`queue.json`, legacy `queue.txt`).
    pub state_dir: PathBuf,
    /// Interval of the periodic maintenance backstop.
    pub maintenance_interval: Duration,
    /// Lower bound on how long a parked executor sleeps before re-checking.
    pub min_park: Duration,
    /// How long the read-only item snapshot may lag behind the true state.
    pub snapshot_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("."),
            maintenance_interval: Duration::from_secs(5),
            min_park: Duration::from_millis(100),
            snapshot_ttl: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn with_min_park(mut self, min_park: Duration) -> Self {
        self.min_park = min_park;
        self
    }
}
