//! Reconnection bookkeeping for one subscription.
//!
//! Pure state: the driver task in [`super::subscription`] feeds events in and
//! sleeps for whatever delay comes back.

use std::time::Duration;

/// Backoff after a successful notification and for the first failure.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);
/// Upper bound on the reconnect delay.
pub const MAX_BACKOFF: Duration = Duration::from_millis(8000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    channel: String,
    backoff: Duration,
    error_suppressed: bool,
    retries: u64,
}

impl SubscriptionState {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            backoff: DEFAULT_BACKOFF,
            error_suppressed: false,
            retries: 0,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn error_suppressed(&self) -> bool {
        self.error_suppressed
    }

    /// Reconnects scheduled so far.
    pub fn retries(&self) -> u64 {
        self.retries
    }

    /// A new connection attempt starts; errors are reported again.
    pub fn begin_attempt(&mut self) {
        self.error_suppressed = false;
    }

    /// The connection failed or died.
    ///
    /// Returns the delay before reconnecting, or `None` when a reconnect is
    /// already pending for this attempt and the event must be ignored.
    pub fn on_connection_error(&mut self) -> Option<Duration> {
        if self.error_suppressed {
            return None;
        }
        self.error_suppressed = true;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        self.retries += 1;
        Some(self.backoff)
    }

    /// LISTEN itself was rejected. Retry after the current backoff without
    /// growing it.
    pub fn on_listen_failure(&mut self) -> Duration {
        self.retries += 1;
        self.backoff
    }

    /// The handler rejected a notification; the session is re-established
    /// after the current backoff.
    pub fn on_handler_rejected(&mut self) -> Duration {
        self.retries += 1;
        self.backoff
    }

    /// A notification arrived: the connection is healthy again.
    pub fn on_notification(&mut self) {
        self.backoff = DEFAULT_BACKOFF;
    }
}
