use std::time::Duration;
use thiserror::Error;

const MINUTE: Duration = Duration::from_secs(60);

/// Longest accepted window, roughly 100 years.
///
/// Keeps `Instant + window` (and the sweep's `2 * window` horizon) representable on every
/// platform.
pub const MAX_WINDOW: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 100);

#[derive(Debug, Clone, Copy, Error, Eq, PartialEq)]
pub enum ConfigurationError {
    #[error("max_requests must be greater than zero")]
    ZeroMaxRequests,
    #[error("window duration must be greater than zero")]
    ZeroWindow,
    #[error("window duration must not exceed 100 years")]
    WindowTooLarge,
}

/// The limit applied by a single limiter instance.
///
/// A policy can only be obtained through [Policy::new] (or one of the presets), so a value of this
/// type always has a non-zero request count and a window between zero and [MAX_WINDOW].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Policy {
    max_requests: u64,
    window: Duration,
}

impl Policy {
    /// # Arguments
    ///
    /// * `max_requests`: The total requests to be admitted within any window.
    /// * `window`: The length of the sliding window.
    pub fn new(max_requests: u64, window: Duration) -> Result<Self, ConfigurationError> {
        if max_requests == 0 {
            return Err(ConfigurationError::ZeroMaxRequests);
        }
        if window.is_zero() {
            return Err(ConfigurationError::ZeroWindow);
        }
        if window > MAX_WINDOW {
            return Err(ConfigurationError::WindowTooLarge);
        }
        Ok(Self {
            max_requests,
            window,
        })
    }

    /// Authentication sensitive endpoints: 5 requests per minute.
    pub const fn auth() -> Self {
        Self::per_minute(5)
    }

    /// Write-heavy tracked actions: 20 requests per minute.
    pub const fn savings_track() -> Self {
        Self::per_minute(20)
    }

    /// Read-heavy status checks: 30 requests per minute.
    pub const fn savings_stats() -> Self {
        Self::per_minute(30)
    }

    /// General reads: 60 requests per minute.
    pub const fn general_api() -> Self {
        Self::per_minute(60)
    }

    // Callers must pass a non-zero count.
    const fn per_minute(max_requests: u64) -> Self {
        Self {
            max_requests,
            window: MINUTE,
        }
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
