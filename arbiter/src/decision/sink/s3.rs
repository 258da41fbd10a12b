// SPDX-License-Identifier: Apache-2.0

//! S3 sink.
//!
//! Batching here is "unprocessed": framing is expressed by the object
//! key mapping instead. Keys encode the batch's first and last event
//! timestamps plus a batch UUID, with the extension naming the layout:
//! `.json` for an array body, `.jsonl` for lines, plus `.gz` when
//! compression is on.

use crate::{
	decision::{
		batch::{frame_events, Batch, BatchConfig, Framing},
		config::S3SinkConfig,
		retry::RetryPolicy,
		sink::{Delivery, Sink, SinkError},
	},
	error::Error,
};
use aws_sdk_s3::primitives::ByteStream;
use uuid::Uuid;

pub struct S3Sink {
	client: aws_sdk_s3::Client,
	bucket: String,
	prefix: String,
	batch: BatchConfig,
	retry: RetryPolicy,
	array: bool,
	compress: bool,
}

impl S3Sink {
	pub async fn from_config(config: &S3SinkConfig) -> Result<Self, Error> {
		config.validate()?;
		let bucket = config.bucket.clone().expect("validated above");
		let region = config.region.clone().expect("validated above");

		let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
			.region(aws_config::Region::new(region));
		if let Some(endpoint) = &config.endpoint {
			loader = loader.endpoint_url(endpoint);
		}
		let sdk_config = loader.load().await;

		Ok(S3Sink {
			client: aws_sdk_s3::Client::new(&sdk_config),
			bucket,
			prefix: config.prefix.clone(),
			batch: config.batching.clone(),
			retry: RetryPolicy::from_config(&config.retry),
			array: config.batching.array,
			compress: config.compress,
		})
	}

	/// Object key for a batch:
	/// `<prefix>/<first-ts>_<last-ts>_<uuid>.json[l][.gz]` with
	/// unix-second timestamps. Lexicographic order matches time order.
	pub(crate) fn object_key(&self, batch: &Batch, id: Uuid) -> String {
		let first = batch
			.first_timestamp()
			.map(|t| t.timestamp())
			.unwrap_or_default();
		let last = batch
			.last_timestamp()
			.map(|t| t.timestamp())
			.unwrap_or_default();

		let prefix = if self.prefix.is_empty() {
			String::new()
		} else {
			format!("{}/", self.prefix.trim_end_matches('/'))
		};
		let extension = if self.array { "json" } else { "jsonl" };
		let gz = if self.compress { ".gz" } else { "" };

		format!("{}{}_{}_{}.{}{}", prefix, first, last, id, extension, gz)
	}
}

#[tonic::async_trait]
impl Sink for S3Sink {
	fn name(&self) -> &str {
		"s3"
	}

	fn batch_config(&self) -> &BatchConfig {
		&self.batch
	}

	fn retry_policy(&self) -> &RetryPolicy {
		&self.retry
	}

	async fn deliver(&self, batch: &Batch) -> Result<Delivery, SinkError> {
		let framing = if self.array {
			Framing::Array
		} else {
			Framing::Lines
		};
		let body = frame_events(batch.events(), framing, self.compress)
			.map_err(|e| SinkError::Transport(e.to_string()))?;
		let key = self.object_key(batch, Uuid::new_v4());

		self.client
			.put_object()
			.bucket(&self.bucket)
			.key(&key)
			.body(ByteStream::from(body))
			.send()
			.await
			.map_err(|e| SinkError::Transport(e.to_string()))?;

		Ok(Delivery::Accepted)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::decision::event::DecisionEvent;
	use std::{collections::BTreeMap, sync::Arc};

	fn sink(prefix: &str, array: bool, compress: bool) -> S3Sink {
		// Credentials are resolved lazily, so an offline client is fine
		// for key-template tests.
		let sdk_config = aws_sdk_s3::Config::builder()
			.behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
			.region(aws_sdk_s3::config::Region::new("us-east-1"))
			.build();
		S3Sink {
			client: aws_sdk_s3::Client::from_conf(sdk_config),
			bucket: "logs".to_owned(),
			prefix: prefix.to_owned(),
			batch: BatchConfig::default(),
			retry: RetryPolicy::default(),
			array,
			compress,
		}
	}

	fn batch() -> Batch {
		let mut batch = Batch::new();
		batch.push(Arc::new(DecisionEvent::new(&BTreeMap::new(), "/a")));
		batch.push(Arc::new(DecisionEvent::new(&BTreeMap::new(), "/b")));
		batch
	}

	#[test]
	fn key_encodes_timestamps_and_uuid() {
		let sink = sink("", true, false);
		let batch = batch();
		let id = Uuid::new_v4();
		let key = sink.object_key(&batch, id);

		let first = batch.first_timestamp().unwrap().timestamp();
		let last = batch.last_timestamp().unwrap().timestamp();
		assert_eq!(key, format!("{}_{}_{}.json", first, last, id));
	}

	#[test]
	fn key_extension_tracks_framing_and_compression() {
		let id = Uuid::new_v4();
		assert!(sink("", false, false).object_key(&batch(), id).ends_with(".jsonl"));
		assert!(sink("", true, true).object_key(&batch(), id).ends_with(".json.gz"));
		assert!(sink("", false, true)
			.object_key(&batch(), id)
			.ends_with(".jsonl.gz"));
	}

	#[test]
	fn prefix_is_slash_joined() {
		let id = Uuid::new_v4();
		let key = sink("decisions/", true, false).object_key(&batch(), id);
		assert!(key.starts_with("decisions/"));
		assert!(!key.contains("//"));
	}
}
