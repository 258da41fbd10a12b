// SPDX-License-Identifier: Apache-2.0

//! Token-bucket rate limiting for sink deliveries.
//!
//! Resources are shared across sinks pointed at the same URL via a
//! stable key derived from the URL, so two outputs shipping to one
//! endpoint share one budget.

use crate::decision::config::RateLimitConfig;
use std::{
	collections::HashMap,
	sync::Mutex,
	sync::Arc,
	time::{Duration, Instant},
};

/// Stable resource key for a sink URL.
pub fn resource_key(url: &str) -> String {
	format!("{:x}", md5::compute(url))
}

struct Bucket {
	tokens: f64,
	last_refill: Instant,
}

pub struct RateLimiter {
	label: String,
	capacity: f64,
	interval: Duration,
	bucket: Mutex<Bucket>,
}

impl RateLimiter {
	pub fn new(label: String, count: u64, interval: Duration) -> Self {
		RateLimiter {
			label,
			capacity: count as f64,
			interval,
			bucket: Mutex::new(Bucket {
				tokens: count as f64,
				last_refill: Instant::now(),
			}),
		}
	}

	pub fn from_config(config: &RateLimitConfig, url: &str) -> Self {
		let label = config
			.label
			.clone()
			.unwrap_or_else(|| resource_key(url));
		RateLimiter::new(label, config.count, config.interval)
	}

	pub fn label(&self) -> &str {
		&self.label
	}

	/// Refill based on elapsed time and try to take one token.
	pub fn try_acquire(&self) -> bool {
		let mut bucket = self.bucket.lock().expect("bucket lock poisoned");
		let now = Instant::now();
		let elapsed = now.duration_since(bucket.last_refill);
		let refill = elapsed.as_secs_f64() / self.interval.as_secs_f64() * self.capacity;
		bucket.tokens = (bucket.tokens + refill).min(self.capacity);
		bucket.last_refill = now;

		if bucket.tokens >= 1.0 {
			bucket.tokens -= 1.0;
			true
		} else {
			false
		}
	}

	/// Wait until a token is available.
	pub async fn acquire(&self) {
		loop {
			if self.try_acquire() {
				return;
			}
			// Sleep roughly one token's worth of refill time.
			let wait = self.interval.div_f64(self.capacity.max(1.0));
			tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
		}
	}
}

/// The shared rate-limit resources of one pipeline, keyed by
/// [`resource_key`].
#[derive(Default)]
pub struct RateLimits {
	resources: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl RateLimits {
	pub fn new() -> Self {
		RateLimits::default()
	}

	/// Fetch the resource for `url`, constructing it on first use. Later
	/// sinks with the same URL share the first sink's limiter.
	pub fn shared(&self, config: &RateLimitConfig, url: &str) -> Arc<RateLimiter> {
		let key = resource_key(url);
		let mut resources = self.resources.lock().expect("resources lock poisoned");
		Arc::clone(
			resources
				.entry(key)
				.or_insert_with(|| Arc::new(RateLimiter::from_config(config, url))),
		)
	}
}
