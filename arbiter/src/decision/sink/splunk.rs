// SPDX-License-Identifier: Apache-2.0

//! Splunk HEC sink.
//!
//! HEC expects a sequence of events rather than a JSON array, so array
//! framing is forced off, and every message is wrapped as
//! `{"event": <original>, "time": <unix-seconds>}`.

use crate::{
	decision::{
		batch::{Batch, BatchConfig},
		config::SplunkSinkConfig,
		event::DecisionEvent,
		rate_limit::{RateLimiter, RateLimits},
		retry::RetryPolicy,
		sink::{http::build_client, Delivery, Sink, SinkError},
	},
	error::Error,
};
use flate2::{write::GzEncoder, Compression};
use serde_json::json;
use std::{io::Write as _, sync::Arc};

pub struct SplunkSink {
	url: String,
	token: String,
	client: reqwest::Client,
	batch: BatchConfig,
	retry: RetryPolicy,
	limiter: Option<Arc<RateLimiter>>,
	compress: bool,
}

impl SplunkSink {
	pub fn from_config(
		config: &SplunkSinkConfig,
		rate_limits: &RateLimits,
	) -> Result<Self, Error> {
		let client = build_client(config.tls.as_ref(), config.timeout)?;
		let limiter = config
			.rate_limit
			.as_ref()
			.map(|rl| rate_limits.shared(rl, &config.url));

		let mut batch = config.batching.clone();
		batch.array = false;

		Ok(SplunkSink {
			url: config.url.clone(),
			token: config.token.clone(),
			client,
			batch,
			retry: RetryPolicy::from_config(&config.retry),
			limiter,
			compress: config.compress,
		})
	}

	/// The HEC body: one `{"event": ..., "time": ...}` wrapper per
	/// event, concatenated.
	pub(crate) fn hec_body(events: &[Arc<DecisionEvent>]) -> Result<Vec<u8>, SinkError> {
		let mut out = Vec::new();
		for event in events {
			let wrapped = json!({
				"event": event.as_ref(),
				"time": event.timestamp.timestamp(),
			});
			out.extend_from_slice(
				&serde_json::to_vec(&wrapped).map_err(|e| SinkError::Transport(e.to_string()))?,
			);
			out.push(b'\n');
		}
		Ok(out)
	}
}

#[tonic::async_trait]
impl Sink for SplunkSink {
	fn name(&self) -> &str {
		"splunk"
	}

	fn batch_config(&self) -> &BatchConfig {
		&self.batch
	}

	fn retry_policy(&self) -> &RetryPolicy {
		&self.retry
	}

	fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
		self.limiter.as_ref()
	}

	async fn deliver(&self, batch: &Batch) -> Result<Delivery, SinkError> {
		let mut body = SplunkSink::hec_body(batch.events())?;
		if self.compress {
			let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
			encoder.write_all(&body).expect("write to Vec cannot fail");
			body = encoder.finish().expect("write to Vec cannot fail");
		}

		let mut request = self
			.client
			.post(&self.url)
			.header("Content-Type", "application/json")
			.header("Authorization", format!("Splunk {}", self.token))
			.body(body);
		if self.compress {
			request = request.header("Content-Encoding", "gzip");
		}

		let response = request
			.send()
			.await
			.map_err(|e| SinkError::Transport(e.to_string()))?;
		Ok(Delivery::Status(response.status().as_u16()))
	}
}
