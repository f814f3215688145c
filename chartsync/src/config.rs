use crate::series::DEFAULT_WHITESPACE_BARS;
use std::time::Duration;

/// Compute side [`Workspace`](crate::workspace::Workspace) configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceConfig {
    /// Interval between scheduled watcher passes
    pub pass_interval: Duration,
    /// How long shutdown waits for tracked tasks before cancelling them
    pub drain_timeout: Duration,
    /// Placeholder slots reserved ahead of each series
    pub whitespace_bars: usize,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            pass_interval: Duration::from_millis(16),
            drain_timeout: Duration::from_secs(5),
            whitespace_bars: DEFAULT_WHITESPACE_BARS,
        }
    }
}

impl WorkspaceConfig {
    /// Set pass interval
    pub fn with_pass_interval(mut self, interval: Duration) -> Self {
        self.pass_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set shutdown drain timeout
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set whitespace tail length
    pub fn with_whitespace_bars(mut self, count: usize) -> Self {
        self.whitespace_bars = count;
        self
    }
}

/// Presentation side [`PresentationAdapter`](crate::adapter::PresentationAdapter)
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Maximum number of deltas applied per frame boundary
    pub max_batch: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self { max_batch: 100 }
    }
}

impl AdapterConfig {
    /// Set batch size
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }
}
