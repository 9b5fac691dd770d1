// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Retry logic with optional exponential backoff.

use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
	/// Total attempts, including the first.
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub backoff_factor: f64,
	pub jitter: bool,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_delay: Duration::from_millis(200),
			max_delay: Duration::from_secs(5),
			backoff_factor: 2.0,
			jitter: true,
		}
	}
}

impl RetryConfig {
	/// One immediate retry, two attempts in total.
	pub fn single_retry() -> Self {
		Self {
			max_attempts: 2,
			base_delay: Duration::ZERO,
			max_delay: Duration::ZERO,
			backoff_factor: 1.0,
			jitter: false,
		}
	}
}

pub trait RetryableError {
	fn is_retryable(&self) -> bool;
}

fn calculate_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
	let exponential_delay = cfg.base_delay.as_secs_f64() * cfg.backoff_factor.powi(attempt as i32);
	let capped_delay = exponential_delay.min(cfg.max_delay.as_secs_f64());

	let final_delay = if cfg.jitter {
		let jitter_factor = 0.5 + fastrand::f64();
		capped_delay * jitter_factor
	} else {
		capped_delay
	};

	Duration::from_secs_f64(final_delay)
}

/// Runs `f` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent.
pub async fn retry<F, Fut, T, E>(cfg: &RetryConfig, mut f: F) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = Result<T, E>>,
	E: RetryableError + std::fmt::Debug,
{
	let mut attempt = 0;

	loop {
		match f().await {
			Ok(result) => return Ok(result),
			Err(err) => {
				attempt += 1;

				if !err.is_retryable() {
					return Err(err);
				}

				if attempt >= cfg.max_attempts {
					warn!(
						error = ?err,
						attempt = attempt,
						max_attempts = cfg.max_attempts,
						"max retry attempts exhausted"
					);
					return Err(err);
				}

				let delay = calculate_delay(cfg, attempt - 1);
				warn!(
					error = ?err,
					attempt = attempt,
					delay_ms = delay.as_millis(),
					"retrying after error"
				);

				if !delay.is_zero() {
					tokio::time::sleep(delay).await;
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::sync::Arc;

	#[derive(Debug)]
	struct MockError {
		retryable: bool,
	}

	impl RetryableError for MockError {
		fn is_retryable(&self) -> bool {
			self.retryable
		}
	}

	async fn count_attempts(cfg: &RetryConfig, retryable: bool) -> u32 {
		let attempts = Arc::new(AtomicU32::new(0));
		let counter = Arc::clone(&attempts);
		let result: Result<(), MockError> = retry(cfg, || {
			let counter = Arc::clone(&counter);
			async move {
				counter.fetch_add(1, Ordering::SeqCst);
				Err(MockError { retryable })
			}
		})
		.await;
		assert!(result.is_err());
		attempts.load(Ordering::SeqCst)
	}

	#[tokio::test]
	async fn non_retryable_error_fails_immediately() {
		assert_eq!(count_attempts(&RetryConfig::default(), false).await, 1);
	}

	#[tokio::test]
	async fn single_retry_makes_two_attempts() {
		assert_eq!(count_attempts(&RetryConfig::single_retry(), true).await, 2);
	}

	#[tokio::test]
	async fn retryable_error_retries_up_to_max_attempts() {
		let cfg = RetryConfig {
			max_attempts: 3,
			base_delay: Duration::from_millis(1),
			max_delay: Duration::from_millis(10),
			backoff_factor: 2.0,
			jitter: false,
		};
		assert_eq!(count_attempts(&cfg, true).await, 3);
	}

	#[tokio::test]
	async fn succeeds_after_transient_failure() {
		let attempts = Arc::new(AtomicU32::new(0));
		let counter = Arc::clone(&attempts);

		let result: Result<&str, MockError> = retry(&RetryConfig::single_retry(), || {
			let counter = Arc::clone(&counter);
			async move {
				if counter.fetch_add(1, Ordering::SeqCst) == 0 {
					Err(MockError { retryable: true })
				} else {
					Ok("sent")
				}
			}
		})
		.await;

		assert_eq!(result.unwrap(), "sent");
		assert_eq!(attempts.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn delay_respects_max_delay() {
		let cfg = RetryConfig {
			max_attempts: 10,
			base_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(5),
			backoff_factor: 10.0,
			jitter: false,
		};

		for attempt in 0..10 {
			assert!(calculate_delay(&cfg, attempt) <= Duration::from_secs(5));
		}
	}

	#[test]
	fn single_retry_has_no_delay() {
		assert!(calculate_delay(&RetryConfig::single_retry(), 0).is_zero());
	}
}
