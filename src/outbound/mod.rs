//! Outbound Controller (§4.9): bounded concurrency, idempotent call placement keyed on a
//! caller-supplied correlation id, a token-bucket rate limiter, and a per-destination
//! circuit breaker. Sits in front of [`crate::telephony`]'s REST call-creation client.
//!
//! Grounded in the resource-pool shape of [`crate::pool`] for the concurrency gate, and in
//! the governor crate (as used elsewhere in the wider corpus for outbound rate limiting)
//! for the token bucket. The circuit breaker is a plain state machine — the corpus has no
//! off-the-shelf breaker crate in active use, so it is hand-written in the same style as
//! [`crate::pool::ResourcePool`].

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use governor::{Quota, RateLimiter};
use lru::LruCache;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::models::{FailureClass, NewCall};
use crate::db::{CallRepo, DbPool};
use crate::error::{AppError, AppResult};
use crate::telephony::is_valid_e164;

#[derive(Debug, Error)]
pub enum OutboundError {
    #[error("outbound concurrency limit reached")]
    ConcurrencyExhausted,
    #[error("rate limit exceeded, retry later")]
    RateLimited,
    #[error("circuit open for destination {0}, rejecting until it recovers")]
    CircuitOpen(String),
    #[error("{0} is not a valid E.164 phone number")]
    InvalidPhone(String),
    #[error(transparent)]
    Db(#[from] AppError),
}

impl From<OutboundError> for AppError {
    fn from(err: OutboundError) -> Self {
        match err {
            OutboundError::ConcurrencyExhausted | OutboundError::RateLimited => {
                AppError::resource_exhausted(err.to_string())
            }
            OutboundError::CircuitOpen(dest) => AppError::service_unavailable(format!("circuit open for {dest}")),
            OutboundError::InvalidPhone(_) => AppError::validation(err.to_string()),
            OutboundError::Db(e) => e,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Per-destination circuit breaker: opens after `threshold` consecutive failures, stays
/// open for `open_duration`, then allows exactly one half-open probe before deciding
/// whether to close again or re-open (§4.9).
pub struct CircuitBreaker {
    threshold: u32,
    open_duration: Duration,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_duration: Duration) -> Self {
        Self {
            threshold,
            open_duration,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether `destination` may be dialed right now, transitioning `Open` to
    /// `HalfOpen` once the open window has elapsed.
    pub async fn admit(&self, destination: &str) -> Result<(), OutboundError> {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers.entry(destination.to_string()).or_insert_with(|| Breaker {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        });

        match breaker.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = breaker.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.open_duration {
                    breaker.state = BreakerState::HalfOpen;
                    info!(destination, "circuit half-open, allowing one probe");
                    Ok(())
                } else {
                    Err(OutboundError::CircuitOpen(destination.to_string()))
                }
            }
        }
    }

    pub async fn record_success(&self, destination: &str) {
        let mut breakers = self.breakers.lock().await;
        if let Some(breaker) = breakers.get_mut(destination) {
            breaker.state = BreakerState::Closed;
            breaker.consecutive_failures = 0;
            breaker.opened_at = None;
        }
    }

    pub async fn record_failure(&self, destination: &str) {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers.entry(destination.to_string()).or_insert_with(|| Breaker {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        });

        breaker.consecutive_failures += 1;
        if breaker.state == BreakerState::HalfOpen || breaker.consecutive_failures >= self.threshold {
            breaker.state = BreakerState::Open;
            breaker.opened_at = Some(Instant::now());
            warn!(destination, failures = breaker.consecutive_failures, "circuit opened");
        }
    }
}

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Coordinates concurrency, rate limiting, idempotency, and breaker admission for every
/// outbound call placement. One instance is shared across the web layer and the scheduler
/// worker (§4.9, §4.10 both place calls through here).
pub struct OutboundController {
    max_concurrent: i64,
    limiter: DirectRateLimiter,
    min_spacing: Duration,
    last_dial: Mutex<Option<Instant>>,
    breaker: CircuitBreaker,
    /// In-memory fast path for idempotency; the database `correlation_id` unique index is
    /// the durable source of truth (§8: idempotency must survive a process restart).
    recent_correlations: Mutex<LruCache<String, String>>,
}

impl OutboundController {
    pub fn new(
        max_concurrent: usize,
        rate_per_sec: u32,
        min_spacing: Duration,
        breaker_threshold: u32,
        breaker_open: Duration,
    ) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(rate_per_sec.max(1)).unwrap());
        Self {
            max_concurrent: max_concurrent as i64,
            limiter: RateLimiter::direct(quota),
            min_spacing,
            last_dial: Mutex::new(None),
            breaker: CircuitBreaker::new(breaker_threshold, breaker_open),
            recent_correlations: Mutex::new(LruCache::new(std::num::NonZeroUsize::new(4096).unwrap())),
        }
    }

    /// Place an outbound call, or return the call already produced by an earlier request
    /// bearing the same `correlation_id` (§8 idempotency property).
    ///
    /// The concurrency cap (§4.9) is measured against the count of outbound Calls
    /// currently in a non-terminal state, not against placement-request throughput — a
    /// permit held only for the instant of `INSERT` would let far more than
    /// `max_concurrent` live calls through. There is no internal queue: once the cap is
    /// hit, the caller gets `ConcurrencyExhausted` and queueing is left to the scheduler.
    pub async fn place_call(&self, pool: &DbPool, new_call: NewCall) -> Result<crate::db::models::Call, OutboundError> {
        if !is_valid_e164(&new_call.to_number) {
            return Err(OutboundError::InvalidPhone(new_call.to_number.clone()));
        }

        if let Some(correlation_id) = &new_call.correlation_id {
            if let Some(existing_call_id) = self.recent_correlations.lock().await.get(correlation_id).cloned() {
                if let Some(call) = CallRepo::get_by_id(pool, &existing_call_id).await.map_err(OutboundError::Db)? {
                    return Ok(call);
                }
            }
            if let Some(call) = CallRepo::find_by_correlation_id(pool, correlation_id)
                .await
                .map_err(OutboundError::Db)?
            {
                self.recent_correlations.lock().await.put(correlation_id.clone(), call.id.clone());
                return Ok(call);
            }
        }

        self.breaker.admit(&new_call.to_number).await?;

        let in_flight = CallRepo::count_non_terminal_outbound(pool).await.map_err(OutboundError::Db)?;
        if in_flight >= self.max_concurrent {
            return Err(OutboundError::ConcurrencyExhausted);
        }

        if self.limiter.check().is_err() {
            return Err(OutboundError::RateLimited);
        }

        {
            let mut last_dial = self.last_dial.lock().await;
            if let Some(last) = *last_dial {
                if last.elapsed() < self.min_spacing {
                    return Err(OutboundError::RateLimited);
                }
            }
            *last_dial = Some(Instant::now());
        }

        let correlation_id = new_call.correlation_id.clone();
        let to_number = new_call.to_number.clone();
        let call = CallRepo::create(pool, new_call).await.map_err(OutboundError::Db)?;

        if let Some(correlation_id) = correlation_id {
            self.recent_correlations.lock().await.put(correlation_id, call.id.clone());
        }

        info!(call_id = %call.id, to = %to_number, "outbound call placed");
        Ok(call)
    }

    pub async fn record_outcome(&self, destination: &str, failure_class: Option<FailureClass>) {
        match failure_class {
            None => self.breaker.record_success(destination).await,
            Some(class) if class.is_retryable() => self.breaker.record_failure(destination).await,
            Some(_) => self.breaker.record_failure(destination).await,
        }
    }

    pub async fn available_concurrency(&self, pool: &DbPool) -> i64 {
        let in_flight = CallRepo::count_non_terminal_outbound(pool).await.unwrap_or(self.max_concurrent);
        (self.max_concurrent - in_flight).max(0)
    }
}

pub fn retry_backoff(attempt_number: i64, base_backoff_ms: i64) -> Duration {
    let exponent = attempt_number.clamp(0, 10) as u32;
    let millis = base_backoff_ms.saturating_mul(2i64.saturating_pow(exponent));
    Duration::from_millis(millis.max(0) as u64)
}

pub fn app_result_from_outbound(result: Result<crate::db::models::Call, OutboundError>) -> AppResult<crate::db::models::Call> {
    result.map_err(AppError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn breaker_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.admit("+15551234567").await.unwrap();
        breaker.record_failure("+15551234567").await;
        breaker.admit("+15551234567").await.unwrap();
        breaker.record_failure("+15551234567").await;
        let err = breaker.admit("+15551234567").await.unwrap_err();
        assert!(matches!(err, OutboundError::CircuitOpen(_)));
    }

    #[tokio::test]
    async fn breaker_half_opens_after_window_elapses() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.admit("+1").await.unwrap();
        breaker.record_failure("+1").await;
        assert!(breaker.admit("+1").await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.admit("+1").await.is_ok());
    }

    #[tokio::test]
    async fn breaker_closes_on_success_after_half_open_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
        breaker.record_failure("+1").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        breaker.admit("+1").await.unwrap();
        breaker.record_success("+1").await;
        breaker.admit("+1").await.unwrap();
    }

    #[test]
    fn retry_backoff_doubles_per_attempt() {
        assert_eq!(retry_backoff(0, 1000), Duration::from_millis(1000));
        assert_eq!(retry_backoff(1, 1000), Duration::from_millis(2000));
        assert_eq!(retry_backoff(2, 1000), Duration::from_millis(4000));
    }

    fn snapshot() -> crate::db::models::AgentSnapshot {
        crate::db::models::AgentSnapshot {
            agent_id: "agent-1".into(),
            persona: "p".into(),
            greeting: "hi".into(),
            language: "en".into(),
            llm_model: "m".into(),
            llm_temperature: 0.5,
            llm_max_tokens: None,
            tts_provider: "t".into(),
            tts_voice_id: "v".into(),
            end_call_phrases: vec![],
            knowledge_base_id: None,
        }
    }

    fn new_call(to: &str, correlation_id: Option<&str>) -> NewCall {
        NewCall {
            direction: crate::db::models::CallDirection::Outbound,
            from_number: "+15550000000".into(),
            to_number: to.into(),
            agent_id: "agent-1".into(),
            phone_id: None,
            correlation_id: correlation_id.map(String::from),
            agent_snapshot: snapshot(),
        }
    }

    /// §8 testable property: the concurrency cap is measured against live (non-terminal)
    /// Calls this controller produced, not against placement-request throughput — so it
    /// stays exhausted across separate `place_call` invocations until a call ends.
    #[tokio::test]
    async fn concurrency_cap_is_measured_against_non_terminal_calls() {
        let pool = crate::db::queries::setup_test_db().await;
        let controller = OutboundController::new(2, 1000, Duration::from_millis(0), 100, Duration::from_secs(60));

        let first = controller.place_call(&pool, new_call("+15551111111", None)).await.unwrap();
        controller.place_call(&pool, new_call("+15552222222", None)).await.unwrap();

        let err = controller.place_call(&pool, new_call("+15553333333", None)).await.unwrap_err();
        assert!(matches!(err, OutboundError::ConcurrencyExhausted));

        crate::db::CallRepo::mark_ended(&pool, &first.id, None).await.unwrap();
        let third = controller.place_call(&pool, new_call("+15553333333", None)).await.unwrap();
        assert_ne!(third.id, first.id);
    }

    #[tokio::test]
    async fn place_call_is_idempotent_on_correlation_id() {
        let pool = crate::db::queries::setup_test_db().await;
        let controller = OutboundController::new(5, 1000, Duration::from_millis(0), 100, Duration::from_secs(60));

        let first = controller.place_call(&pool, new_call("+15551111111", Some("corr-1"))).await.unwrap();
        let second = controller.place_call(&pool, new_call("+15551111111", Some("corr-1"))).await.unwrap();
        assert_eq!(first.id, second.id);
    }
}
