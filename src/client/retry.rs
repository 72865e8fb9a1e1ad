use crate::error::{AbortCause, ScuError};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Bounded exponential backoff for transport failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
	/// Total number of attempts, including the first one. Configuration files must give at
	/// least 1. A policy built in code with 0 still makes one attempt.
	#[serde(deserialize_with = "at_least_one")]
	pub max_attempts: u32,
	#[serde(with = "millis")]
	pub base_delay: Duration,
	#[serde(with = "millis")]
	pub max_delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(30),
		}
	}
}

impl RetryPolicy {
	/// A single attempt.
	pub const fn never() -> Self {
		Self {
			max_attempts: 1,
			base_delay: Duration::ZERO,
			max_delay: Duration::ZERO,
		}
	}

	/// Delay after the failed attempt with the given number (starting at 1): the base delay
	/// doubled for every previous attempt, capped at the maximum delay.
	pub fn next_delay(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(31);
		self.base_delay
			.checked_mul(1 << exponent)
			.map_or(self.max_delay, |delay| delay.min(self.max_delay))
	}

	pub(crate) const fn attempts<'a>(&'a self, cancellation: &'a CancellationToken) -> Attempts<'a> {
		Attempts {
			policy: self,
			cancellation,
			attempt: 0,
		}
	}
}

/// Drives one retry loop:
///
/// ```ignore
/// let mut attempts = policy.attempts(&cancellation);
/// loop {
///     attempts.start()?;
///     match operation().await {
///         Ok(value) => return Ok(value),
///         Err(err) => attempts.backoff(err).await?,
///     }
/// }
/// ```
pub(crate) struct Attempts<'a> {
	policy: &'a RetryPolicy,
	cancellation: &'a CancellationToken,
	attempt: u32,
}

impl Attempts<'_> {
	/// Begins the next attempt unless the caller cancelled. Returns its number.
	pub(crate) fn start(&mut self) -> Result<u32, ScuError> {
		if self.cancellation.is_cancelled() {
			return Err(ScuError::Aborted(AbortCause::Cancelled));
		}
		self.attempt += 1;
		Ok(self.attempt)
	}

	/// Sleeps before the next attempt, or hands the error back if it is final.
	pub(crate) async fn backoff(&mut self, err: ScuError) -> Result<(), ScuError> {
		if !err.is_retryable() || self.attempt >= self.policy.max_attempts {
			return Err(err);
		}
		let delay = self.policy.next_delay(self.attempt);
		warn!(
			attempt = self.attempt,
			max_attempts = self.policy.max_attempts,
			"Attempt failed, retrying in {delay:?}: {err}"
		);
		tokio::select! {
			biased;
			() = self.cancellation.cancelled() => Err(ScuError::Aborted(AbortCause::Cancelled)),
			() = tokio::time::sleep(delay) => Ok(()),
		}
	}
}

fn at_least_one<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
	match u32::deserialize(deserializer)? {
		0 => Err(serde::de::Error::invalid_value(
			serde::de::Unexpected::Unsigned(0),
			&"at least one attempt",
		)),
		attempts => Ok(attempts),
	}
}

mod millis {
	use serde::{Deserialize, Deserializer};
	use std::time::Duration;

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn delays_double_up_to_the_cap() {
		let policy = RetryPolicy {
			max_attempts: 10,
			base_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(5),
		};
		let delays: Vec<_> = (1..=5).map(|attempt| policy.next_delay(attempt)).collect();
		assert_eq!(
			delays,
			[1, 2, 4, 5, 5].map(Duration::from_secs).to_vec()
		);
		assert_eq!(policy.next_delay(u32::MAX), Duration::from_secs(5));
	}

	async fn run(
		policy: &RetryPolicy,
		cancellation: &CancellationToken,
		mut failures: Vec<ScuError>,
	) -> (Result<&'static str, ScuError>, Vec<Duration>) {
		let started = tokio::time::Instant::now();
		let mut attempted_at = Vec::new();
		let mut attempts = policy.attempts(cancellation);
		failures.reverse();
		let result = loop {
			if let Err(err) = attempts.start() {
				break Err(err);
			}
			attempted_at.push(started.elapsed());
			match failures.pop() {
				None => break Ok("done"),
				Some(err) => {
					if let Err(err) = attempts.backoff(err).await {
						break Err(err);
					}
				}
			}
		};
		(result, attempted_at)
	}

	#[tokio::test(start_paused = true)]
	async fn retries_timeouts_with_growing_delays() {
		let policy = RetryPolicy {
			max_attempts: 4,
			..RetryPolicy::default()
		};
		let failures = vec![
			ScuError::Timeout(Duration::from_secs(30)),
			ScuError::ConnectionFailed(String::from("refused")),
		];
		let (result, attempted_at) = run(&policy, &CancellationToken::new(), failures).await;

		assert_eq!(result.unwrap(), "done");
		assert_eq!(attempted_at.len(), 3);
		let gaps: Vec<_> = attempted_at.windows(2).map(|w| w[1] - w[0]).collect();
		assert_eq!(gaps, vec![Duration::from_secs(1), Duration::from_secs(2)]);
	}

	#[tokio::test(start_paused = true)]
	async fn gives_up_after_max_attempts() {
		let policy = RetryPolicy::default();
		let failures = (0..5).map(|_| ScuError::Timeout(Duration::from_secs(1))).collect();
		let (result, attempted_at) = run(&policy, &CancellationToken::new(), failures).await;
		assert!(matches!(result, Err(ScuError::Timeout(_))));
		assert_eq!(attempted_at.len(), 3);
	}

	#[test]
	fn zero_attempts_are_refused() {
		assert!(serde_json::from_str::<RetryPolicy>(r#"{"max_attempts": 0}"#).is_err());
		let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
		assert_eq!(policy.max_attempts, 5);
		assert_eq!(policy.base_delay, RetryPolicy::default().base_delay);
	}

	#[tokio::test(start_paused = true)]
	async fn zero_attempts_built_in_code_still_try_once() {
		let policy = RetryPolicy {
			max_attempts: 0,
			..RetryPolicy::default()
		};
		let failures = vec![ScuError::Timeout(Duration::from_secs(1))];
		let (result, attempted_at) = run(&policy, &CancellationToken::new(), failures).await;
		assert!(matches!(result, Err(ScuError::Timeout(_))));
		assert_eq!(attempted_at.len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn rejection_is_not_retried() {
		use crate::association::pdu::{
			AssociationRJ, AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource,
		};
		let failures = vec![ScuError::AssociationRejected(AssociationRJ {
			result: AssociationRJResult::Permanent,
			source: AssociationRJSource::ServiceUser(
				AssociationRJServiceUserReason::CalledAETitleNotRecognized,
			),
		})];
		let (result, attempted_at) =
			run(&RetryPolicy::default(), &CancellationToken::new(), failures).await;
		assert!(matches!(result, Err(ScuError::AssociationRejected(_))));
		assert_eq!(attempted_at.len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn cancellation_interrupts_backoff() {
		let cancellation = CancellationToken::new();
		let policy = RetryPolicy {
			base_delay: Duration::from_secs(60),
			..RetryPolicy::default()
		};
		let mut attempts = policy.attempts(&cancellation);
		attempts.start().unwrap();

		let token = cancellation.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_secs(1)).await;
			token.cancel();
		});
		let result = attempts.backoff(ScuError::Timeout(Duration::from_secs(1))).await;
		assert!(matches!(result, Err(ScuError::Aborted(AbortCause::Cancelled))));
		assert!(matches!(attempts.start(), Err(ScuError::Aborted(AbortCause::Cancelled))));
	}
}
