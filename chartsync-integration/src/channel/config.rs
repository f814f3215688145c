use crate::stream::timeout::DEFAULT_IDLE_TIMEOUT;
use std::time::Duration;

/// Forward channel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Maximum number of frames buffered per direction before producers are blocked
    pub capacity: usize,
    /// Number of times a transiently failed frame is re-sent before the transport is
    /// declared broken
    pub max_retries: u32,
    /// Delay before the first retry, doubled on every further attempt
    pub retry_delay: Duration,
    /// How long a producer may stay blocked on a full buffer before the channel fails
    pub backpressure_limit: Duration,
    /// How long the closing side waits for the peer's `CloseAck`
    pub close_timeout: Duration,
    /// Idle period after which a silent transport is treated as dead
    pub idle_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_retries: 3,
            retry_delay: Duration::from_millis(50),
            backpressure_limit: Duration::from_secs(30),
            close_timeout: Duration::from_secs(5),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl ChannelConfig {
    /// Set buffer capacity
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Set retry policy
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Set how long producers may be blocked by backpressure
    pub fn with_backpressure_limit(mut self, limit: Duration) -> Self {
        self.backpressure_limit = limit;
        self
    }

    /// Set close handshake timeout
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Set transport idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Delay before retry number `attempt` (zero based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        self.retry_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}
