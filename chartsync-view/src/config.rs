use chartsync::AdapterConfig;
use std::time::Duration;

/// Presentation process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewConfig {
    /// Compute server URL
    pub url: String,
    /// Fail the transport when nothing arrives for this long
    pub idle_timeout: Duration,
    /// Render frame boundary
    pub frame_interval: Duration,
    /// Forward channel buffer size
    pub channel_capacity: usize,
    /// Log a chart summary every this many rendered frames
    pub summary_every: u64,
    pub adapter: AdapterConfig,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9101".to_string(),
            idle_timeout: Duration::from_secs(30),
            frame_interval: Duration::from_millis(16),
            channel_capacity: 1024,
            summary_every: 120,
            adapter: AdapterConfig::default(),
        }
    }
}

impl ViewConfig {
    /// Create a new configuration with custom URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Read `CHARTSYNC_*` environment variables over the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Unset or unparsable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |name: &str| lookup(name).and_then(|value| value.trim().parse::<u64>().ok());
        let mut config = Self::default();

        if let Some(url) = lookup("CHARTSYNC_URL") {
            config.url = url;
        }
        if let Some(secs) = parse("CHARTSYNC_IDLE_TIMEOUT_SECS") {
            config = config.with_idle_timeout(Duration::from_secs(secs));
        }
        if let Some(millis) = parse("CHARTSYNC_FRAME_MS") {
            config = config.with_frame_interval(Duration::from_millis(millis));
        }
        if let Some(capacity) = parse("CHARTSYNC_CHANNEL_CAPACITY") {
            config = config.with_channel_capacity(capacity as usize);
        }
        if let Some(max_batch) = parse("CHARTSYNC_MAX_BATCH") {
            config.adapter = config.adapter.with_max_batch(max_batch as usize);
        }
        config
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout.max(Duration::from_secs(1));
        self
    }

    /// Set frame interval
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set channel buffer size
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Set summary cadence
    pub fn with_summary_every(mut self, frames: u64) -> Self {
        self.summary_every = frames.max(1);
        self
    }
}
