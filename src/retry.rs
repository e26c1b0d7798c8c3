use std::time::Duration;

/// Bounded polling: `attempts` probes at most, `interval` between them.
///
/// Used when a blob-backed video's track id is known but its network
/// metadata has not arrived yet. The budget is deliberately small; when it
/// runs out the caller proceeds with whatever was collected.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

/// Default budget for blob track resolution: 5 × 200ms, 1s ceiling.
pub const BLOB_TRACK_POLICY: RetryPolicy = RetryPolicy::new(5, Duration::from_millis(200));

impl RetryPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Probes until a value appears or the attempt budget is spent.
    ///
    /// The sleeper is injected so tests run against a fake clock. No sleep
    /// after the final attempt.
    pub fn poll<T, S, F>(&self, mut sleep: S, mut probe: F) -> Option<T>
    where
        S: FnMut(Duration),
        F: FnMut() -> Option<T>,
    {
        for attempt in 0..self.attempts {
            if let Some(value) = probe() {
                return Some(value);
            }
            if attempt + 1 < self.attempts {
                sleep(self.interval);
            }
        }
        None
    }
}
