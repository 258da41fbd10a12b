// SPDX-License-Identifier: Apache-2.0

//! Kafka sink over rdkafka's future producer.

use crate::decision::{
	batch::{Batch, BatchConfig},
	config::KafkaSinkConfig,
	retry::RetryPolicy,
	sink::{Delivery, Sink, SinkError},
};
use crate::error::Error;
use rdkafka::{
	config::ClientConfig,
	producer::{FutureProducer, FutureRecord},
};
use std::time::Duration;

pub struct KafkaSink {
	producer: FutureProducer,
	topic: String,
	batch: BatchConfig,
	retry: RetryPolicy,
}

impl KafkaSink {
	pub fn from_config(config: &KafkaSinkConfig) -> Result<Self, Error> {
		let mut client_config = ClientConfig::new();
		client_config.set("bootstrap.servers", config.brokers.join(","));
		client_config.set("message.timeout.ms", "5000");
		client_config.set("acks", "all");

		let security_protocol = config
			.security_protocol
			.clone()
			.unwrap_or_else(|| default_security_protocol(config));
		client_config.set("security.protocol", &security_protocol);

		if let Some(sasl) = &config.sasl {
			client_config.set("sasl.mechanism", &sasl.mechanism);
			client_config.set("sasl.username", &sasl.username);
			client_config.set("sasl.password", &sasl.password);
		}
		if let Some(tls) = &config.tls {
			if let Some(ca) = &tls.ca_cert_file {
				client_config.set("ssl.ca.location", ca.to_string_lossy());
			}
			if let Some(cert) = &tls.client_cert_file {
				client_config.set("ssl.certificate.location", cert.to_string_lossy());
			}
			if let Some(key) = &tls.client_key_file {
				client_config.set("ssl.key.location", key.to_string_lossy());
			}
		}

		let producer: FutureProducer = client_config
			.create()
			.map_err(|e| Error::config(format!("kafka producer: {}", e)))?;

		// Kafka carries one event per record; array framing does not
		// apply.
		let mut batch = config.batching.clone();
		batch.array = false;

		Ok(KafkaSink {
			producer,
			topic: config.topic.clone(),
			batch,
			retry: RetryPolicy::from_config(&config.retry),
		})
	}
}

fn default_security_protocol(config: &KafkaSinkConfig) -> String {
	match (&config.sasl, &config.tls) {
		(Some(_), Some(_)) | (Some(_), None) => "sasl_ssl".to_owned(),
		(None, Some(_)) => "ssl".to_owned(),
		(None, None) => "plaintext".to_owned(),
	}
}

#[tonic::async_trait]
impl Sink for KafkaSink {
	fn name(&self) -> &str {
		"kafka"
	}

	fn batch_config(&self) -> &BatchConfig {
		&self.batch
	}

	fn retry_policy(&self) -> &RetryPolicy {
		&self.retry
	}

	async fn deliver(&self, batch: &Batch) -> Result<Delivery, SinkError> {
		for event in batch.events() {
			let payload = serde_json::to_vec(event.as_ref())
				.map_err(|e| SinkError::Transport(e.to_string()))?;
			let record = FutureRecord::to(&self.topic)
				.payload(&payload)
				.key(&event.decision_id);

			self.producer
				.send(record, Duration::from_secs(5))
				.await
				.map_err(|(e, _)| SinkError::Transport(e.to_string()))?;
		}
		Ok(Delivery::Accepted)
	}
}
