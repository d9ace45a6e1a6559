use std::future::Future;
use std::time::{Duration, Instant};

use log::warn;
use rand::Rng;
use tokio::sync::Mutex;

use crate::errors::CoreError;

/// Circuit breaker state machine, mirrored from the teacher's enrichment
/// client and reused here to guard the object-store gateway's upstream
/// calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
	Closed,
	Open { opened_at: Instant },
	HalfOpen,
}

pub struct CircuitBreaker {
	state: CircuitState,
	failure_count: u32,
	threshold: u32,
	reset_timeout: Duration,
}

impl CircuitBreaker {
	pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
		Self {
			state: CircuitState::Closed,
			failure_count: 0,
			threshold,
			reset_timeout,
		}
	}

	fn record_success(&mut self) {
		self.failure_count = 0;
		self.state = CircuitState::Closed;
	}

	fn record_failure(&mut self) {
		self.failure_count += 1;
		match self.state {
			CircuitState::Open { .. } => {}
			_ if self.failure_count >= self.threshold => {
				warn!(
					"gateway circuit breaker opening after {} failures",
					self.failure_count
				);
				self.state = CircuitState::Open {
					opened_at: Instant::now(),
				};
			}
			_ => {}
		}
	}

	fn can_attempt(&mut self) -> bool {
		match self.state {
			CircuitState::Closed | CircuitState::HalfOpen => true,
			CircuitState::Open { opened_at } => {
				if opened_at.elapsed() >= self.reset_timeout {
					self.state = CircuitState::HalfOpen;
					true
				} else {
					false
				}
			}
		}
	}
}

/// Retry policy applied to infrastructure calls (§7: "sync operations retry
/// infrastructure errors up to `N=3` with exponential backoff; no retry for
/// `validation`/`authorization`"). Generalized here to any gateway call, not
/// just sync: the same rule applies to every upstream the core talks to.
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub initial_backoff: Duration,
	pub max_backoff: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			initial_backoff: Duration::from_millis(200),
			max_backoff: Duration::from_secs(5),
		}
	}
}

fn is_retryable(err: &CoreError) -> bool {
	matches!(err, CoreError::Infrastructure { .. } | CoreError::Timeout(_))
}

/// Run `op` under the circuit breaker and retry policy, giving up early on
/// non-retryable error taxonomy buckets.
pub async fn with_resilience<T, F, Fut>(
	breaker: &Mutex<CircuitBreaker>,
	policy: &RetryPolicy,
	mut op: F,
) -> Result<T, CoreError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, CoreError>>,
{
	let mut backoff = policy.initial_backoff;
	let mut attempt = 0u32;

	loop {
		{
			let mut cb = breaker.lock().await;
			if !cb.can_attempt() {
				return Err(CoreError::infrastructure(
					"object_store_gateway",
					anyhow::anyhow!("circuit breaker open"),
				));
			}
		}

		match op().await {
			Ok(v) => {
				breaker.lock().await.record_success();
				return Ok(v);
			}
			Err(e) => {
				attempt += 1;
				let retryable = is_retryable(&e);
				if !retryable || attempt >= policy.max_attempts {
					breaker.lock().await.record_failure();
					return Err(e);
				}

				warn!(
					"gateway call failed (attempt {}/{}): {}; retrying after {:?}",
					attempt, policy.max_attempts, e, backoff
				);
				tokio::time::sleep(backoff).await;

				let jitter_ms = rand::thread_rng().gen_range(0..=(backoff.as_millis() as u64 / 4).max(1));
				backoff = (backoff * 2 + Duration::from_millis(jitter_ms)).min(policy.max_backoff);
			}
		}
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	#[tokio::test]
	async fn retries_infrastructure_errors_up_to_max_attempts() {
		let breaker = Mutex::new(CircuitBreaker::new(10, Duration::from_secs(60)));
		let policy = RetryPolicy {
			max_attempts: 3,
			initial_backoff: Duration::from_millis(1),
			max_backoff: Duration::from_millis(5),
		};
		let calls = AtomicU32::new(0);

		let result: Result<(), CoreError> = with_resilience(&breaker, &policy, || {
			calls.fetch_add(1, Ordering::SeqCst);
			async { Err(CoreError::infrastructure("test", anyhow::anyhow!("boom"))) }
		})
		.await;

		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test]
	async fn does_not_retry_validation_errors() {
		let breaker = Mutex::new(CircuitBreaker::new(10, Duration::from_secs(60)));
		let policy = RetryPolicy::default();
		let calls = AtomicU32::new(0);

		let result: Result<(), CoreError> = with_resilience(&breaker, &policy, || {
			calls.fetch_add(1, Ordering::SeqCst);
			async { Err(CoreError::Validation("bad input".to_string())) }
		})
		.await;

		assert!(result.is_err());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}
}
