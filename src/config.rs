//! Proxy configuration.
//!
//! All knobs live on [`ProxyConfig`]; there is no environment or file based
//! configuration in the core. The listener backlog is fixed (see
//! [`crate::proxy::acceptor::BACKLOG`]).

use std::time::Duration;

/// Default minimum interval between tick emissions.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(1);

/// Unread pipe bytes at which a flush suspends.
pub const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024;

/// Unread pipe bytes at which a suspended flush resumes.
pub const DEFAULT_LOW_WATERMARK: usize = 16 * 1024;

/// Bytes requested from the receive pipe per socket read.
pub const DEFAULT_RECV_CHUNK: usize = 4 * 1024;

/// Configuration for an event loop and the sessions it runs.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Minimum interval between tick emissions. Zero means spin.
    pub tick_period: Duration,

    /// Unread bytes at which a pipe flush suspends the producer.
    pub pipe_high_watermark: usize,

    /// Unread bytes at which a suspended flush resumes.
    pub pipe_low_watermark: usize,

    /// Bytes of writable pipe memory requested per socket read.
    pub recv_chunk: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            tick_period: DEFAULT_TICK_PERIOD,
            pipe_high_watermark: DEFAULT_HIGH_WATERMARK,
            pipe_low_watermark: DEFAULT_LOW_WATERMARK,
            recv_chunk: DEFAULT_RECV_CHUNK,
        }
    }
}

impl ProxyConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum interval between tick emissions.
    pub fn with_tick_period(mut self, period: Duration) -> Self {
        self.tick_period = period;
        self
    }

    /// Set the pipe watermarks.
    pub fn with_watermarks(mut self, high: usize, low: usize) -> Self {
        self.pipe_high_watermark = high;
        self.pipe_low_watermark = low;
        self
    }
}
