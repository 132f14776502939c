//! Redelivery policy and exception classification.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use switchyard_core::{
    ContractViolation, DeadLetterFailed, ExchangeCancelled, Failure, TypeConversionError,
};

// ---------------------------------------------------------------------------
// RedeliveryPolicy
// ---------------------------------------------------------------------------

/// Where a redelivery re-enters the wrapped pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedeliverFrom {
    /// From the first step, with the message restored to what it was when
    /// the exchange entered the handler.
    #[default]
    Start,
    /// From the step that failed, with the message as that step left it.
    FailedStep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryPolicy {
    /// Retries after the first attempt. Zero disables redelivery.
    pub max_redeliveries: u32,
    /// Delay before the first redelivery.
    pub redelivery_delay: Duration,
    /// Growth factor applied per attempt when `use_exponential_backoff` is set.
    pub backoff_multiplier: f64,
    pub use_exponential_backoff: bool,
    /// Upper bound on any single delay, before jitter.
    pub max_redelivery_delay: Duration,
    /// Random spread applied to each delay, as a fraction (`0.1` is ±10%).
    pub jitter_factor: f64,
    pub redeliver_from: RedeliverFrom,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: 0,
            redelivery_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            use_exponential_backoff: false,
            max_redelivery_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
            redeliver_from: RedeliverFrom::Start,
        }
    }
}

impl RedeliveryPolicy {
    #[must_use]
    pub fn with_max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = max;
        self
    }

    #[must_use]
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    #[must_use]
    pub fn with_exponential_backoff(mut self, multiplier: f64) -> Self {
        self.use_exponential_backoff = true;
        self.backoff_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn with_max_redelivery_delay(mut self, max: Duration) -> Self {
        self.max_redelivery_delay = max;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_redeliver_from(mut self, from: RedeliverFrom) -> Self {
        self.redeliver_from = from;
        self
    }

    /// Delay before redelivery number `attempt` (1-based), before jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base = self.redelivery_delay.as_secs_f64();
        let raw = if self.use_exponential_backoff {
            let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
            base * self.backoff_multiplier.max(1.0).powi(exponent)
        } else {
            base
        };
        let capped = raw.min(self.max_redelivery_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_redelivery_delay)
    }

    /// Delay before redelivery number `attempt` (1-based), jitter included.
    /// Never exceeds `max_redelivery_delay`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_factor <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::rng().random_range(-self.jitter_factor..=self.jitter_factor);
        base.mul_f64((1.0 + spread).max(0.0))
            .min(self.max_redelivery_delay)
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Predicate over a failure, usually "is this error type somewhere in the
/// chain".
#[derive(Clone)]
pub struct ExceptionMatcher {
    name: String,
    matches: Arc<dyn Fn(&Failure) -> bool + Send + Sync>,
}

impl ExceptionMatcher {
    /// Matches failures whose source chain contains an `E`.
    #[must_use]
    pub fn of<E>() -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            name: std::any::type_name::<E>().to_string(),
            matches: Arc::new(|failure: &Failure| failure.is::<E>()),
        }
    }

    pub fn custom<F>(name: impl Into<String>, matches: F) -> Self
    where
        F: Fn(&Failure) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            matches: Arc::new(matches),
        }
    }

    #[must_use]
    pub fn matches(&self, failure: &Failure) -> bool {
        (self.matches)(failure)
    }
}

impl fmt::Debug for ExceptionMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ExceptionMatcher").field(&self.name).finish()
    }
}

/// How the handler treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Redeliver while attempts remain, then dead-letter.
    Retry,
    /// Dead-letter immediately.
    DeadLetter,
    /// Leave unhandled; neither retried nor dead-lettered.
    Surface,
}

/// Retryable and non-retryable exception sets.
///
/// Non-retryable matches win. With an empty retryable set everything else is
/// retryable; otherwise only matches are.
#[derive(Debug, Clone, Default)]
pub struct ExceptionPolicy {
    pub retryable: Vec<ExceptionMatcher>,
    pub non_retryable: Vec<ExceptionMatcher>,
}

impl ExceptionPolicy {
    #[must_use]
    pub fn retry_on(mut self, matcher: ExceptionMatcher) -> Self {
        self.retryable.push(matcher);
        self
    }

    #[must_use]
    pub fn never_retry(mut self, matcher: ExceptionMatcher) -> Self {
        self.non_retryable.push(matcher);
        self
    }

    #[must_use]
    pub fn classify(&self, failure: &Failure) -> Disposition {
        // Engine-level failures always surface.
        if failure.is::<ContractViolation>()
            || failure.is::<ExchangeCancelled>()
            || failure.is::<DeadLetterFailed>()
        {
            return Disposition::Surface;
        }
        if failure.is::<TypeConversionError>() {
            return Disposition::DeadLetter;
        }
        if self.non_retryable.iter().any(|m| m.matches(failure)) {
            return Disposition::DeadLetter;
        }
        if self.retryable.is_empty() || self.retryable.iter().any(|m| m.matches(failure)) {
            Disposition::Retry
        } else {
            Disposition::DeadLetter
        }
    }
}

#[cfg(test)]
mod tests {
    use switchyard_core::{CancelReason, TypeKey};

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("transient")]
    struct Transient;

    #[derive(Debug, thiserror::Error)]
    #[error("bad input")]
    struct BadInput;

    #[test]
    fn fixed_delay_ignores_attempt() {
        let p = RedeliveryPolicy::default().with_redelivery_delay(Duration::from_millis(200));
        assert_eq!(p.base_delay(1), Duration::from_millis(200));
        assert_eq!(p.base_delay(5), Duration::from_millis(200));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let p = RedeliveryPolicy::default()
            .with_redelivery_delay(Duration::from_millis(100))
            .with_exponential_backoff(2.0)
            .with_max_redelivery_delay(Duration::from_millis(500));
        assert_eq!(p.base_delay(1), Duration::from_millis(100));
        assert_eq!(p.base_delay(2), Duration::from_millis(200));
        assert_eq!(p.base_delay(3), Duration::from_millis(400));
        assert_eq!(p.base_delay(4), Duration::from_millis(500));
        assert_eq!(p.base_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = RedeliveryPolicy::default()
            .with_redelivery_delay(Duration::from_millis(1000))
            .with_jitter(0.2);
        for attempt in 1..50 {
            let d = p.delay_for(attempt);
            assert!(d >= Duration::from_millis(799), "{d:?}");
            assert!(d <= Duration::from_millis(1201), "{d:?}");
        }
    }

    #[test]
    fn jitter_never_pushes_past_the_cap() {
        let p = RedeliveryPolicy::default()
            .with_redelivery_delay(Duration::from_secs(10))
            .with_max_redelivery_delay(Duration::from_secs(10))
            .with_jitter(0.5);
        for attempt in 1..200 {
            let d = p.delay_for(attempt);
            assert!(d <= Duration::from_secs(10), "{d:?}");
            assert!(d >= Duration::from_millis(4999), "{d:?}");
        }
    }

    #[test]
    fn default_retries_everything_but_engine_failures() {
        let policy = ExceptionPolicy::default();
        assert_eq!(policy.classify(&Failure::new(Transient)), Disposition::Retry);
        let cancelled = Failure::new(ExchangeCancelled {
            exchange_id: "x".into(),
            reason: CancelReason::RouteStopped,
        });
        assert_eq!(policy.classify(&cancelled), Disposition::Surface);
        let violation = Failure::new(ContractViolation {
            processor: "p".into(),
            detail: "d".into(),
        });
        assert_eq!(policy.classify(&violation), Disposition::Surface);
    }

    #[test]
    fn conversion_failures_are_dead_lettered_not_retried() {
        let failure = Failure::new(TypeConversionError::NoConversionAvailable {
            from: TypeKey::of::<String>(),
            to: TypeKey::of::<i64>(),
        });
        assert_eq!(
            ExceptionPolicy::default().classify(&failure),
            Disposition::DeadLetter
        );
    }

    #[test]
    fn non_retryable_wins_over_retryable() {
        let policy = ExceptionPolicy::default()
            .retry_on(ExceptionMatcher::of::<BadInput>())
            .never_retry(ExceptionMatcher::of::<BadInput>());
        assert_eq!(policy.classify(&Failure::new(BadInput)), Disposition::DeadLetter);
    }

    #[test]
    fn explicit_retryable_set_excludes_others() {
        let policy = ExceptionPolicy::default().retry_on(ExceptionMatcher::of::<Transient>());
        assert_eq!(policy.classify(&Failure::new(Transient)), Disposition::Retry);
        assert_eq!(policy.classify(&Failure::new(BadInput)), Disposition::DeadLetter);
    }

    #[test]
    fn matcher_sees_wrapped_errors() {
        let failure = Failure::new(anyhow::Error::new(Transient).context("calling upstream"));
        assert!(ExceptionMatcher::of::<Transient>().matches(&failure));
        let by_text = ExceptionMatcher::custom("mentions upstream", |f| {
            f.to_string().contains("upstream")
        });
        assert!(by_text.matches(&failure));
    }
}
