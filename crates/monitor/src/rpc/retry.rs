//! Retry/backoff policy for upstream calls, expressed as a small state
//! machine so the delay schedule can be exercised without a network.

use std::{
    future::Future,
    time::{Duration, Instant},
};

use holder_watch_domain::{config::RpcConfig, FetchErrorKind};
use metrics::{counter, histogram};
use rand::Rng;
use tracing::{error, info, warn};

use super::{types::AttemptError, FetchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    /// Attempt `n` (1-based) is running.
    Attempting(u32),
    /// Attempt `n` failed and the sequence is waiting before `n + 1`.
    Backoff(u32),
    Succeeded,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    seed: Duration,
    ceiling: Duration,
    jitter_ratio: f64,
}

impl RetryPolicy {
    pub const DEFAULT_JITTER_RATIO: f64 = 0.25;

    pub fn new(max_attempts: u32, seed: Duration, ceiling: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            seed,
            ceiling: ceiling.max(seed),
            jitter_ratio: Self::DEFAULT_JITTER_RATIO,
        }
    }

    pub fn from_config(config: &RpcConfig) -> Self {
        Self::new(
            config.max_retries(),
            config.backoff_seed(),
            config.backoff_ceiling(),
        )
    }

    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after failed attempt `attempt` (1-based), before jitter:
    /// `seed * 2^(attempt - 1)` capped at the ceiling.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.seed
            .checked_mul(1u32 << exponent)
            .map_or(self.ceiling, |delay| delay.min(self.ceiling))
    }

    /// Base delay plus up to `jitter_ratio` of it drawn from `rng`.
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let spread = base.mul_f64(self.jitter_ratio);
        if spread.is_zero() {
            return base;
        }
        base + spread.mul_f64(rng.gen_range(0.0..=1.0))
    }
}

/// Attempt record for one retry sequence; dropped once it settles.
#[derive(Debug)]
pub struct RetrySequence {
    policy: RetryPolicy,
    state: RetryState,
    attempts: u32,
    started: Instant,
    last_error: Option<AttemptError>,
}

impl RetrySequence {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Idle,
            attempts: 0,
            started: Instant::now(),
            last_error: None,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn last_error(&self) -> Option<&AttemptError> {
        self.last_error.as_ref()
    }

    /// Moves to the next attempt and returns its number, or `None` when the
    /// sequence cannot start another attempt from its current state.
    pub fn begin_attempt(&mut self) -> Option<u32> {
        let next = match self.state {
            RetryState::Idle => 1,
            RetryState::Backoff(n) => n + 1,
            _ => return None,
        };
        self.attempts = next;
        self.state = RetryState::Attempting(next);
        Some(next)
    }

    pub fn record_success(&mut self) {
        if let RetryState::Attempting(_) = self.state {
            self.state = RetryState::Succeeded;
        }
    }

    /// Records a failed attempt. Returns the backoff to wait before the next
    /// attempt, or `None` when the error is final or attempts are used up.
    pub fn record_failure(&mut self, err: AttemptError) -> Option<Duration> {
        self.record_failure_with(err, &mut rand::thread_rng())
    }

    pub fn record_failure_with<R: Rng + ?Sized>(
        &mut self,
        err: AttemptError,
        rng: &mut R,
    ) -> Option<Duration> {
        let RetryState::Attempting(n) = self.state else {
            return None;
        };
        let retryable = err.kind.is_retryable();
        self.last_error = Some(err);

        if retryable && n < self.policy.max_attempts {
            self.state = RetryState::Backoff(n);
            Some(self.policy.delay(n, rng))
        } else {
            self.state = RetryState::Exhausted;
            None
        }
    }

    /// Stops a sequence that is waiting to retry.
    pub fn abandon(&mut self) {
        if let RetryState::Backoff(_) = self.state {
            self.state = RetryState::Exhausted;
        }
    }

    /// Final error for an exhausted sequence.
    pub fn into_error(self) -> FetchError {
        let attempts = self.attempts;
        let elapsed = self.started.elapsed();
        match self.last_error {
            Some(AttemptError { kind, message }) => match kind {
                FetchErrorKind::Timeout => FetchError::Timeout { attempts, elapsed },
                FetchErrorKind::Transport => FetchError::Transport { attempts, message },
                FetchErrorKind::RemoteRejected => FetchError::RemoteRejected { attempts, message },
                FetchErrorKind::RateLimited => FetchError::RateLimited { attempts, message },
            },
            None => FetchError::Transport {
                attempts,
                message: "retry sequence ended without an attempt".to_string(),
            },
        }
    }
}

/// Drives `op` through a [`RetrySequence`], bounding every attempt by
/// `attempt_timeout` and sleeping the policy's backoff between attempts.
///
/// The whole sequence never runs longer than `attempt_timeout` times the
/// attempt count: the last attempt is cut short and a backoff that would
/// reach the deadline ends the sequence instead.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    operation: &'static str,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let budget = attempt_timeout * policy.max_attempts();
    let mut sequence = RetrySequence::new(policy.clone());

    while let Some(attempt) = sequence.begin_attempt() {
        let limit = attempt_timeout.min(budget.saturating_sub(sequence.elapsed()));
        counter!("holder_rpc_attempts_total", "operation" => operation).increment(1);
        let outcome = match tokio::time::timeout(limit, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(AttemptError::new(
                FetchErrorKind::Timeout,
                format!("no response within {limit:?}"),
            )),
        };

        match outcome {
            Ok(value) => {
                sequence.record_success();
                let elapsed = sequence.elapsed();
                histogram!("holder_rpc_duration_seconds", "operation" => operation)
                    .record(elapsed.as_secs_f64());
                counter!("holder_rpc_requests_total", "operation" => operation, "result" => "ok")
                    .increment(1);
                if attempt > 1 {
                    info!(operation, attempt, ?elapsed, "rpc call succeeded after retries");
                }
                return Ok(value);
            }
            Err(err) => {
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts(),
                    kind = err.kind.as_ref(),
                    error = %err.message,
                    "rpc attempt failed"
                );
                match sequence.record_failure(err) {
                    Some(delay) if delay < budget.saturating_sub(sequence.elapsed()) => {
                        tokio::time::sleep(delay).await
                    }
                    Some(delay) => {
                        warn!(operation, attempt, ?delay, ?budget, "retry budget spent");
                        sequence.abandon();
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    let error = sequence.into_error();
    counter!(
        "holder_rpc_requests_total",
        "operation" => operation,
        "result" => error.kind().as_ref().to_owned()
    )
    .increment(1);
    error!(
        operation,
        attempts = error.attempts(),
        kind = error.kind().as_ref(),
        %error,
        "rpc call failed"
    );
    Err(error)
}
