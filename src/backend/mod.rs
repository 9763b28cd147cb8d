mod input_builder;

#[cfg(feature = "dashmap")]
#[cfg_attr(docsrs, doc(cfg(feature = "dashmap")))]
pub mod memory;

pub use input_builder::{KeyFunctionBuilder, KeyFuture, UNKNOWN_KEY};
use std::future::Future;

use actix_web::rt::time::Instant;
use std::time::Duration;

/// The outcome of a rate limit check.
///
/// A denial is an ordinary outcome and not an error.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Decision {
    Admitted {
        /// Number of further requests that would currently be admitted.
        remaining: u64,
        /// When the request just admitted leaves the window.
        reset_at: Instant,
    },
    Denied {
        /// When the oldest counted request leaves the window, freeing a slot.
        reset_at: Instant,
        /// Whole seconds to wait before retrying, never less than 1.
        retry_after: u64,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }

    pub fn remaining(&self) -> u64 {
        match self {
            Self::Admitted { remaining, .. } => *remaining,
            Self::Denied { .. } => 0,
        }
    }

    pub fn reset_at(&self) -> Instant {
        match self {
            Self::Admitted { reset_at, .. } | Self::Denied { reset_at, .. } => *reset_at,
        }
    }

    /// Only set when the request was denied.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Admitted { .. } => None,
            Self::Denied { retry_after, .. } => Some(*retry_after),
        }
    }

    /// Seconds from now until [Decision::reset_at] (rounded upwards, so that waiting for the
    /// duration is guaranteed to reach it). Returns 0 once the instant has passed.
    pub fn seconds_until_reset(&self) -> u64 {
        ceil_secs(self.reset_at().saturating_duration_since(Instant::now()))
    }
}

pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// What a [Backend] reports to the [RateLimiter](crate::RateLimiter) for a single request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RateLimitStatus {
    /// Total number of requests that are permitted within the window.
    pub limit: u64,
    pub decision: Decision,
}

impl RateLimitStatus {
    /// Value for the `x-ratelimit-limit` header.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Value for the `x-ratelimit-remaining` header.
    pub fn remaining(&self) -> u64 {
        self.decision.remaining()
    }

    /// Value for the `x-ratelimit-reset` header.
    pub fn seconds_until_reset(&self) -> u64 {
        self.decision.seconds_until_reset()
    }

    /// Value for the `retry-after` header.
    pub fn retry_after(&self) -> u64 {
        self.decision
            .retry_after()
            .unwrap_or_else(|| self.seconds_until_reset())
            .max(1)
    }
}

/// Describes an implementation of a rate limiting store and algorithm.
///
/// A Backend is required to implement [Clone], usually this means wrapping your data store within
/// an [Arc](std::sync::Arc). Clones must share the same counters.
pub trait Backend<I: 'static = String>: Clone {
    type RollbackToken;
    type Error;

    /// Process an incoming request.
    ///
    /// The input is usually the rate limit key derived from the request.
    ///
    /// Returns the decision together with the limit it was made against, and a token to allow the
    /// rate limit counter to be rolled back in certain conditions.
    fn request(
        &self,
        input: I,
    ) -> impl Future<Output = Result<(RateLimitStatus, Self::RollbackToken), Self::Error>>;

    /// Under certain conditions we may not want a request to count against the limit.
    ///
    /// E.g. We may want to exclude 5xx errors from counting against a user's rate limit,
    /// we can only exclude them after having already allowed the request through the rate limiter
    /// in the first place, so we must therefore deduct from the rate limit counter afterwards.
    ///
    /// Note that if this function fails there is not much the [RateLimiter](crate::RateLimiter)
    /// can do about it, given that the request has already been allowed.
    ///
    /// # Arguments
    ///
    /// * `token`: The token returned from the initial call to [Backend::request()].
    fn rollback(&self, token: Self::RollbackToken)
        -> impl Future<Output = Result<(), Self::Error>>;
}

/// Additional functions for a [Backend] keyed by plain strings.
pub trait KeyedBackend: Backend<String> {
    /// Removes all state held for a given rate limit key.
    ///
    /// The next request for the key is treated as if the key had never been seen.
    fn remove_key(&self, key: &str) -> impl Future<Output = Result<(), Self::Error>>;
}
