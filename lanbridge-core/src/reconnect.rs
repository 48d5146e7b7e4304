//! Exponential backoff for re-establishing the control channel

use lanbridge_common::ResilienceConfig;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Starting delay, restored after every successful connect
    pub base: Duration,
    /// A delay above this starts over from `base` before doubling
    pub reset_above: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            reset_above: Duration::from_millis(60_000),
        }
    }
}

impl From<ResilienceConfig> for BackoffConfig {
    fn from(config: ResilienceConfig) -> Self {
        Self {
            base: config.reconnect_base,
            reset_above: config.reconnect_max,
        }
    }
}

/// Doubling backoff that wraps around instead of saturating.
///
/// Before each wait the current value is reset to the base if it has grown
/// past `reset_above`, then doubled; the doubled value is the wait. From a
/// 1 s base this yields 2, 4, 8, 16, 32, 64, 2, 4, ... seconds.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.base,
            config,
            attempt: 0,
        }
    }

    /// Get the next delay and advance
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        if self.current > self.config.reset_above {
            self.current = self.config.base;
        }
        self.current = self.current.saturating_mul(2);
        self.attempt = self.attempt.saturating_add(1);
        self.current
    }

    /// Reset the backoff (call after successful connection)
    pub fn reset(&mut self) {
        self.current = self.config.base;
        self.attempt = 0;
    }

    /// Failed attempts since the last reset
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Reconnection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    /// Initial connection attempt
    Connecting,
    /// Connected and running
    Connected,
    /// Waiting before reconnection
    Backoff,
    /// Shut down
    Stopped,
}

/// Drives the connect/backoff cycle of the control channel.
#[derive(Debug)]
pub struct ReconnectManager {
    backoff: Backoff,
    state: ReconnectState,
}

impl ReconnectManager {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            backoff: Backoff::new(config),
            state: ReconnectState::Connecting,
        }
    }

    /// Mark connection as successful
    pub fn on_connected(&mut self) {
        self.backoff.reset();
        self.state = ReconnectState::Connected;
    }

    /// Handle connection failure or loss, returning the delay before the
    /// next attempt.
    pub fn on_disconnected(&mut self) -> Duration {
        self.state = ReconnectState::Backoff;
        self.backoff.next_delay()
    }

    /// Sleeps for `delay` unless `shutdown` fires first.
    ///
    /// Returns false when interrupted by shutdown.
    pub async fn wait(&mut self, delay: Duration, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            () = tokio::time::sleep(delay) => {
                self.state = ReconnectState::Connecting;
                true
            }
            () = shutdown.cancelled() => {
                self.state = ReconnectState::Stopped;
                false
            }
        }
    }

    #[must_use]
    pub fn state(&self) -> ReconnectState {
        self.state
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.backoff.attempts()
    }
}
