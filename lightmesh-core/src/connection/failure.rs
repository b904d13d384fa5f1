use tracing::{debug, warn};

/// Counts consecutive authentication and transport failures on a session
#[derive(Debug, Clone)]
pub struct FailureTracker {
    consecutive: u32,
    threshold: u32,
    total: u64,
}

impl FailureTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
            total: 0,
        }
    }

    /// Record a failure. Returns true when this failure reaches the
    /// threshold; the count starts over afterwards.
    pub fn record_failure(&mut self, reason: &str) -> bool {
        self.consecutive += 1;
        self.total += 1;
        debug!(
            "Session failure {}/{}: {}",
            self.consecutive, self.threshold, reason
        );

        if self.consecutive < self.threshold {
            return false;
        }

        warn!(
            "Session invalidated after {} consecutive failures",
            self.consecutive
        );
        self.consecutive = 0;
        true
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}
