// SPDX-License-Identifier: Apache-2.0

//! Delivery retry policy with status-code dispositions.

use crate::decision::config::RetryConfig;
use rand::Rng as _;
use std::time::Duration;

const DEFAULT_PERIOD: Duration = Duration::from_secs(1);
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// What to do with a delivery that returned a given status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
	Success,
	Backoff,
	Drop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
	pub period: Duration,
	pub max_attempts: u32,
	pub max_backoff: Duration,
	pub backoff_on: Vec<u16>,
	pub drop_on: Vec<u16>,
	pub successful_on: Vec<u16>,
	/// Transport-level errors (no status at all) are dropped after the
	/// attempts are exhausted rather than held forever.
	pub drop_on_error: bool,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		RetryPolicy::from_config(&RetryConfig::default())
	}
}

impl RetryPolicy {
	pub fn from_config(config: &RetryConfig) -> Self {
		RetryPolicy {
			period: config.period.unwrap_or(DEFAULT_PERIOD),
			max_attempts: config.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
			max_backoff: config.max_backoff.unwrap_or(DEFAULT_MAX_BACKOFF),
			backoff_on: config.backoff_on.clone(),
			drop_on: config.drop_on.clone(),
			successful_on: config.successful_on.clone(),
			drop_on_error: true,
		}
	}

	/// Classify a response status. The explicit lists win over the
	/// defaults; among them, success beats drop beats backoff.
	pub fn classify(&self, status: u16) -> Disposition {
		if self.successful_on.contains(&status) {
			return Disposition::Success;
		}
		if self.drop_on.contains(&status) {
			return Disposition::Drop;
		}
		if self.backoff_on.contains(&status) {
			return Disposition::Backoff;
		}

		match status {
			200..=299 => Disposition::Success,
			429 | 500..=599 => Disposition::Backoff,
			_ => Disposition::Drop,
		}
	}

	/// Backoff before the given retry attempt: exponential from
	/// `period`, capped at `max_backoff`, with up to 10% jitter so
	/// synchronized sinks do not stampede.
	pub fn backoff(&self, attempt: u32) -> Duration {
		let exp = attempt.min(16);
		let base = self
			.period
			.saturating_mul(2u32.saturating_pow(exp))
			.min(self.max_backoff);
		let jitter = rand::rng().random_range(0.0..0.1);
		base.mul_f64(1.0 + jitter)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn policy_from_lists() -> RetryPolicy {
		RetryPolicy::from_config(&RetryConfig {
			period: Some(Duration::from_secs(5)),
			max_attempts: Some(10),
			max_backoff: Some(Duration::from_secs(600)),
			backoff_on: vec![400, 429],
			drop_on: vec![300],
			successful_on: vec![202],
		})
	}

	#[test]
	fn config_fields_carry_through() {
		let policy = policy_from_lists();
		assert_eq!(policy.period, Duration::from_secs(5));
		assert_eq!(policy.max_attempts, 10);
		assert_eq!(policy.max_backoff, Duration::from_secs(600));
		assert_eq!(policy.backoff_on, vec![400, 429]);
		assert_eq!(policy.drop_on, vec![300]);
		assert_eq!(policy.successful_on, vec![202]);
		assert!(policy.drop_on_error);
	}

	#[test]
	fn explicit_lists_override_defaults() {
		let policy = policy_from_lists();
		// 400 would drop by default but the config says back off.
		assert_eq!(policy.classify(400), Disposition::Backoff);
		// 300 would drop by default too, and stays a drop.
		assert_eq!(policy.classify(300), Disposition::Drop);
		// 202 is a success by default and by list.
		assert_eq!(policy.classify(202), Disposition::Success);
	}

	#[test]
	fn default_dispositions() {
		let policy = RetryPolicy::default();
		assert_eq!(policy.classify(200), Disposition::Success);
		assert_eq!(policy.classify(503), Disposition::Backoff);
		assert_eq!(policy.classify(429), Disposition::Backoff);
		assert_eq!(policy.classify(404), Disposition::Drop);
	}

	#[test]
	fn backoff_grows_and_caps() {
		let policy = RetryPolicy {
			period: Duration::from_millis(100),
			max_backoff: Duration::from_millis(500),
			..RetryPolicy::default()
		};
		assert!(policy.backoff(0) >= Duration::from_millis(100));
		// Capped at max_backoff plus at most 10% jitter.
		assert!(policy.backoff(10) <= Duration::from_millis(550));
	}
}
