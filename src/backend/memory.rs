use crate::backend::{ceil_secs, Backend, Decision, KeyedBackend, RateLimitStatus};
use crate::policy::{ConfigurationError, Policy};
use actix_web::rt::time::Instant;
use dashmap::DashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 60 * 5;

/// A Sliding Window rate limiter [Backend] that uses [Dashmap](dashmap::DashMap) to store a log
/// of admitted request times per key in memory.
///
/// Stale keys are reclaimed by a sweep that piggybacks on [InMemoryBackend::check] at most once
/// per sweep interval; no background task is spawned.
#[derive(Clone)]
pub struct InMemoryBackend {
    map: Arc<DashMap<String, Vec<Instant>>>,
    policy: Policy,
    sweeper: Arc<Sweeper>,
}

/// Returned from [Backend::request], identifying the timestamp to remove on rollback.
#[derive(Debug, Clone)]
pub struct AdmissionToken {
    key: String,
    admitted_at: Option<Instant>,
}

impl InMemoryBackend {
    pub fn builder(policy: Policy) -> InMemoryBackendBuilder {
        InMemoryBackendBuilder {
            policy,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS),
        }
    }

    /// Shorthand for building a backend with the default sweep interval.
    pub fn new(max_requests: u64, window: Duration) -> Result<Self, ConfigurationError> {
        Ok(Self::builder(Policy::new(max_requests, window)?).build())
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Number of keys currently holding state.
    pub fn tracked_keys(&self) -> usize {
        self.map.len()
    }

    /// Check (and count) a request for `key` at the current time.
    pub fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    /// Check (and count) a request for `key` at the instant `now`.
    pub fn check_at(&self, key: &str, now: Instant) -> Decision {
        if self.sweeper.is_due(now) {
            self.sweep(now);
        }

        let window = self.policy.window();
        let max_requests = self.policy.max_requests();

        // The shard lock is held across prune, count and append.
        let mut timestamps = self.map.entry(key.to_owned()).or_default();
        if let Some(window_start) = now.checked_sub(window) {
            timestamps.retain(|t| *t > window_start);
        }

        let count = timestamps.len() as u64;
        if count >= max_requests {
            let oldest = timestamps.first().copied().unwrap_or(now);
            let reset_at = oldest + window;
            let retry_after = ceil_secs(reset_at.saturating_duration_since(now)).max(1);
            log::debug!("Rate limit exceeded for {key}, retry after {retry_after}s");
            return Decision::Denied {
                reset_at,
                retry_after,
            };
        }

        // Keeps the log ascending even if callers supply instants out of order.
        let position = timestamps.partition_point(|t| *t <= now);
        timestamps.insert(position, now);
        Decision::Admitted {
            remaining: max_requests - (count + 1),
            reset_at: now + window,
        }
    }

    // Drops keys that are empty or have been idle for more than twice the window.
    fn sweep(&self, now: Instant) {
        let horizon = self.policy.window().saturating_mul(2);
        let before = self.map.len();
        self.map.retain(|_, timestamps| match timestamps.last() {
            Some(latest) => now.saturating_duration_since(*latest) <= horizon,
            None => false,
        });
        let remaining = self.map.len();
        log::debug!(
            "Rate limiter sweep removed {} stale keys, {} remaining",
            before.saturating_sub(remaining),
            remaining
        );
    }
}

impl Backend<String> for InMemoryBackend {
    type RollbackToken = AdmissionToken;
    type Error = Infallible;

    async fn request(
        &self,
        key: String,
    ) -> Result<(RateLimitStatus, Self::RollbackToken), Self::Error> {
        let now = Instant::now();
        let decision = self.check_at(&key, now);
        let status = RateLimitStatus {
            limit: self.policy.max_requests(),
            decision,
        };
        let token = AdmissionToken {
            key,
            admitted_at: decision.is_allowed().then_some(now),
        };
        Ok((status, token))
    }

    async fn rollback(&self, token: Self::RollbackToken) -> Result<(), Self::Error> {
        let Some(admitted_at) = token.admitted_at else {
            return Ok(());
        };
        if let Some(mut timestamps) = self.map.get_mut(&token.key) {
            if let Some(position) = timestamps.iter().rposition(|t| *t == admitted_at) {
                timestamps.remove(position);
            }
        }
        Ok(())
    }
}

impl KeyedBackend for InMemoryBackend {
    async fn remove_key(&self, key: &str) -> Result<(), Self::Error> {
        self.map.remove(key);
        Ok(())
    }
}

/// Tracks when the last sweep ran, as nanoseconds since the backend was built.
struct Sweeper {
    interval: Duration,
    epoch: Instant,
    last_sweep: AtomicU64,
}

impl Sweeper {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            epoch: Instant::now(),
            last_sweep: AtomicU64::new(0),
        }
    }

    /// Returns true once the interval has elapsed since the last sweep. Concurrent callers race
    /// on the recorded mark so only one of them wins, except with a zero interval where every
    /// caller is due.
    fn is_due(&self, now: Instant) -> bool {
        let elapsed = as_nanos(now.saturating_duration_since(self.epoch));
        let last = self.last_sweep.load(Ordering::Acquire);
        if elapsed.saturating_sub(last) < as_nanos(self.interval) {
            return false;
        }
        self.last_sweep
            .compare_exchange(last, elapsed, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn as_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

pub struct InMemoryBackendBuilder {
    policy: Policy,
    sweep_interval: Duration,
}

impl InMemoryBackendBuilder {
    /// Override the default sweep interval.
    ///
    /// The sweep scans the internal map, removing keys with no request in the last two windows.
    /// It runs inside [InMemoryBackend::check] when at least this much time has passed since the
    /// previous sweep (or since the backend was built). A zero interval sweeps on every check.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn build(self) -> InMemoryBackend {
        InMemoryBackend {
            map: Arc::new(DashMap::new()),
            policy: self.policy,
            sweeper: Arc::new(Sweeper::new(self.sweep_interval)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_configuration_error() {
        assert_eq!(
            InMemoryBackend::new(0, MINUTE).err(),
            Some(ConfigurationError::ZeroMaxRequests)
        );
        assert_eq!(
            InMemoryBackend::new(5, Duration::ZERO).err(),
            Some(ConfigurationError::ZeroWindow)
        );
    }

    #[actix_web::test]
    async fn test_allow_deny() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder(Policy::auth()).build();
        for expected in (0..5).rev() {
            // First 5 should be admitted, remaining counting down to zero
            let decision = backend.check("ip:203.0.113.5");
            assert!(decision.is_allowed());
            assert_eq!(decision.remaining(), expected);
            assert_eq!(decision.reset_at(), Instant::now() + MINUTE);
        }
        // Sixth should be denied
        let decision = backend.check("ip:203.0.113.5");
        assert!(decision.is_denied());
        assert_eq!(decision.remaining(), 0);
        assert_eq!(decision.retry_after(), Some(60));
        assert_eq!(decision.reset_at(), Instant::now() + MINUTE);
    }

    #[actix_web::test]
    async fn test_recovery_after_retry_after() {
        tokio::time::pause();
        let backend = InMemoryBackend::new(3, MINUTE).unwrap();
        for _ in 0..3 {
            assert!(backend.check("KEY1").is_allowed());
            tokio::time::advance(Duration::from_millis(1500)).await;
        }
        let decision = backend.check("KEY1");
        // Oldest was 4.5s ago, so 55.5s remain, rounded up
        assert_eq!(decision.retry_after(), Some(56));
        tokio::time::advance(secs(decision.retry_after().unwrap())).await;
        assert!(backend.check("KEY1").is_allowed());
    }

    #[actix_web::test]
    async fn test_repeated_denials() {
        tokio::time::pause();
        let backend = InMemoryBackend::new(1, MINUTE).unwrap();
        assert!(backend.check("KEY1").is_allowed());
        let mut previous = u64::MAX;
        for _ in 0..5 {
            let decision = backend.check("KEY1");
            let retry_after = decision.retry_after().unwrap();
            assert!(retry_after >= 1 && retry_after <= previous);
            previous = retry_after;
        }
        // Denials are not recorded, so nothing extends the window
        tokio::time::advance(MINUTE).await;
        assert!(backend.check("KEY1").is_allowed());
    }

    #[test]
    fn test_retry_after_floor() {
        let backend = InMemoryBackend::new(1, secs(10)).unwrap();
        let start = Instant::now();
        assert!(backend.check_at("KEY1", start).is_allowed());
        // 1ns short of the oldest request leaving the window
        let now = start + secs(10) - Duration::from_nanos(1);
        assert_eq!(backend.check_at("KEY1", now).retry_after(), Some(1));
    }

    #[test]
    fn test_key_isolation() {
        let backend = InMemoryBackend::new(2, MINUTE).unwrap();
        let now = Instant::now();
        assert!(backend.check_at("A", now).is_allowed());
        assert!(backend.check_at("A", now).is_allowed());
        assert!(backend.check_at("A", now).is_denied());
        let decision = backend.check_at("B", now);
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining(), 1);
    }

    #[test]
    fn test_sliding_not_fixed() {
        let backend = InMemoryBackend::new(2, secs(10)).unwrap();
        let start = Instant::now();
        assert!(backend.check_at("KEY1", start).is_allowed());
        assert!(backend.check_at("KEY1", start + secs(5)).is_allowed());
        assert!(backend.check_at("KEY1", start + secs(9)).is_denied());
        // The request at t=0 has left the window, the one at t=5 has not
        let decision = backend.check_at("KEY1", start + secs(11));
        assert!(decision.is_allowed());
        assert_eq!(decision.remaining(), 0);
        assert!(backend.check_at("KEY1", start + secs(12)).is_denied());
    }

    #[test]
    fn test_window_boundary_is_exclusive() {
        let backend = InMemoryBackend::new(1, secs(10)).unwrap();
        let start = Instant::now();
        assert!(backend.check_at("KEY1", start).is_allowed());
        // A request exactly one window old no longer counts
        assert!(backend.check_at("KEY1", start + secs(10)).is_allowed());
    }

    #[actix_web::test]
    async fn test_sweep() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder(Policy::new(2, MINUTE).unwrap())
            .with_sweep_interval(secs(60 * 5))
            .build();
        backend.check("KEY1");
        backend.check("KEY1");
        assert_eq!(backend.check("KEY1").retry_after(), Some(60));
        tokio::time::advance(secs(60 * 4)).await;
        backend.check("KEY2");
        // No sweep is due yet
        assert!(backend.map.contains_key("KEY1"));
        tokio::time::advance(secs(60)).await;
        // Unrelated traffic triggers the sweep; KEY1 idle for 5 minutes, KEY2 only 1 minute
        backend.check("KEY3");
        assert!(!backend.map.contains_key("KEY1"));
        assert!(backend.map.contains_key("KEY2"));
        assert!(backend.map.contains_key("KEY3"));
        assert_eq!(backend.tracked_keys(), 2);
        // A reclaimed key behaves like a new one
        assert_eq!(backend.check("KEY1").remaining(), 1);
    }

    #[actix_web::test]
    async fn test_sweep_keeps_recent_keys() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder(Policy::new(5, MINUTE).unwrap())
            .with_sweep_interval(secs(30))
            .build();
        backend.check("KEY1");
        // Idle for exactly two windows, which is not yet more than two windows
        tokio::time::advance(MINUTE * 2).await;
        backend.check("KEY2");
        assert!(backend.map.contains_key("KEY1"));
        tokio::time::advance(secs(30)).await;
        backend.check("KEY2");
        assert!(!backend.map.contains_key("KEY1"));
    }

    #[test]
    fn test_sweep_runs_once_per_interval() {
        let sweeper = Sweeper::new(secs(10));
        let epoch = sweeper.epoch;
        assert!(!sweeper.is_due(epoch + secs(9)));
        assert!(sweeper.is_due(epoch + secs(10)));
        assert!(!sweeper.is_due(epoch + secs(10)));
        assert!(!sweeper.is_due(epoch + secs(19)));
        assert!(sweeper.is_due(epoch + secs(20)));
    }

    #[test]
    fn test_zero_sweep_interval_is_always_due() {
        let sweeper = Sweeper::new(Duration::ZERO);
        let now = sweeper.epoch + secs(1);
        assert!(sweeper.is_due(now));
        assert!(sweeper.is_due(now));
        assert!(sweeper.is_due(now + secs(1)));
    }

    #[actix_web::test]
    async fn test_zero_sweep_interval_sweeps_every_check() {
        tokio::time::pause();
        let backend = InMemoryBackend::builder(Policy::new(1, secs(10)).unwrap())
            .with_sweep_interval(Duration::ZERO)
            .build();
        backend.check("KEY1");
        tokio::time::advance(secs(21)).await;
        backend.check("KEY2");
        assert!(!backend.map.contains_key("KEY1"));
        assert_eq!(backend.tracked_keys(), 1);
    }

    #[test]
    fn test_largest_window_checks_without_overflow() {
        let policy = Policy::new(1, crate::policy::MAX_WINDOW).unwrap();
        let backend = InMemoryBackend::builder(policy).build();
        let admitted = backend.check("KEY1");
        assert!(admitted.is_allowed());
        let denied = backend.check("KEY1");
        assert!(denied.is_denied());
        assert!(denied.retry_after().unwrap() >= 1);
        assert!(InMemoryBackend::new(1, Duration::MAX).is_err());
    }

    #[actix_web::test]
    async fn test_request_and_rollback() {
        tokio::time::pause();
        let backend = InMemoryBackend::new(5, MINUTE).unwrap();
        let (status, token) = backend.request("KEY1".to_string()).await.unwrap();
        assert_eq!(status.limit, 5);
        assert_eq!(status.remaining(), 4);
        backend.rollback(token).await.unwrap();
        // Remaining requests should still be the same, since the previous call was excluded
        let (status, _) = backend.request("KEY1".to_string()).await.unwrap();
        assert_eq!(status.remaining(), 4);
    }

    #[actix_web::test]
    async fn test_rollback_denied_is_noop() {
        tokio::time::pause();
        let backend = InMemoryBackend::new(1, MINUTE).unwrap();
        let (status, _) = backend.request("KEY1".to_string()).await.unwrap();
        assert!(status.decision.is_allowed());
        let (status, token) = backend.request("KEY1".to_string()).await.unwrap();
        assert!(status.decision.is_denied());
        backend.rollback(token).await.unwrap();
        assert!(backend.check("KEY1").is_denied());
    }

    #[actix_web::test]
    async fn test_remove_key() {
        tokio::time::pause();
        let backend = InMemoryBackend::new(1, MINUTE).unwrap();
        assert!(backend.check("KEY1").is_allowed());
        assert!(backend.check("KEY1").is_denied());
        backend.remove_key("KEY1").await.unwrap();
        // Counter should have been reset
        assert!(backend.check("KEY1").is_allowed());
    }

    #[test]
    fn test_clones_share_state() {
        let backend = InMemoryBackend::new(1, MINUTE).unwrap();
        let clone = backend.clone();
        let separate = InMemoryBackend::new(1, MINUTE).unwrap();
        assert!(backend.check("KEY1").is_allowed());
        assert!(clone.check("KEY1").is_denied());
        assert!(separate.check("KEY1").is_allowed());
    }

    #[test]
    fn test_concurrent_checks() {
        let backend = InMemoryBackend::new(100, MINUTE).unwrap();
        let admitted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let backend = backend.clone();
                    scope.spawn(move || {
                        (0..50)
                            .filter(|_| backend.check("shared").is_allowed())
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(admitted, 100);
    }
}
