// SPDX-License-Identifier: Apache-2.0

//! Console sink: JSON-line events on stdout.

use crate::decision::{
	batch::{Batch, BatchConfig},
	config::ConsoleSinkConfig,
	retry::RetryPolicy,
	sink::{Delivery, Sink, SinkError},
};
use std::io::Write as _;

pub struct ConsoleSink {
	batch: BatchConfig,
	retry: RetryPolicy,
}

impl ConsoleSink {
	pub fn from_config(config: &ConsoleSinkConfig) -> Self {
		// Stdout gets one event per line regardless of the array flag.
		let mut batch = config.batching.clone();
		batch.array = false;
		ConsoleSink {
			batch,
			retry: RetryPolicy::default(),
		}
	}
}

#[tonic::async_trait]
impl Sink for ConsoleSink {
	fn name(&self) -> &str {
		"console"
	}

	fn batch_config(&self) -> &BatchConfig {
		&self.batch
	}

	fn retry_policy(&self) -> &RetryPolicy {
		&self.retry
	}

	async fn deliver(&self, batch: &Batch) -> Result<Delivery, SinkError> {
		let stdout = std::io::stdout();
		let mut out = stdout.lock();
		for event in batch.events() {
			let line = serde_json::to_vec(event.as_ref())
				.map_err(|e| SinkError::Transport(e.to_string()))?;
			out.write_all(&line)
				.and_then(|_| out.write_all(b"\n"))
				.map_err(|e| SinkError::Transport(e.to_string()))?;
		}
		Ok(Delivery::Accepted)
	}
}
