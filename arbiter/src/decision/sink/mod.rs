// SPDX-License-Identifier: Apache-2.0

//! Sink trait, construction, and the per-sink delivery runner.

pub mod console;
pub mod http;
pub mod kafka;
pub mod s3;
pub mod splunk;

use crate::{
	config::ServiceConfig,
	decision::{
		batch::{Batch, BatchConfig},
		config::{ExperimentalSinkConfig, HttpSinkConfig, SinkConfig},
		event::DecisionEvent,
		rate_limit::{RateLimiter, RateLimits},
		retry::{Disposition, RetryPolicy},
	},
	error::Error,
	supervisor::{Manager, PluginStatus},
};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc, time::Instant};
use tokio::sync::mpsc;

/// What a delivery attempt produced. `Accepted` is for transports
/// without a status-code vocabulary (console, kafka, s3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
	Accepted,
	Status(u16),
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
	#[error("transport failure: {0}")]
	Transport(String),

	/// Misconfiguration discovered at delivery time; flips the plugin
	/// status to Err.
	#[error("fatal sink error: {0}")]
	Fatal(String),
}

#[tonic::async_trait]
pub trait Sink: Send + Sync {
	fn name(&self) -> &str;

	fn batch_config(&self) -> &BatchConfig;

	fn retry_policy(&self) -> &RetryPolicy;

	fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
		None
	}

	async fn deliver(&self, batch: &Batch) -> Result<Delivery, SinkError>;
}

/// A factory for `type: experimental` outputs, registered by name.
pub type ExperimentalSinkFactory =
	Arc<dyn Fn(&Value) -> Result<Arc<dyn Sink>, Error> + Send + Sync>;

pub struct SinkBuildContext<'a> {
	pub services: &'a BTreeMap<String, ServiceConfig>,
	pub rate_limits: &'a RateLimits,
	pub experimental: &'a BTreeMap<String, ExperimentalSinkFactory>,
}

/// Construct every configured sink.
pub async fn build_sinks(
	configs: &[SinkConfig],
	ctx: &SinkBuildContext<'_>,
) -> Result<Vec<Arc<dyn Sink>>, Error> {
	let mut sinks: Vec<Arc<dyn Sink>> = Vec::with_capacity(configs.len());
	for config in configs {
		sinks.push(build_sink(config, ctx).await?);
	}
	Ok(sinks)
}

async fn build_sink(
	config: &SinkConfig,
	ctx: &SinkBuildContext<'_>,
) -> Result<Arc<dyn Sink>, Error> {
	match config {
		SinkConfig::Http(http) => Ok(Arc::new(http::HttpSink::from_config(
			http,
			ctx.rate_limits,
		)?)),
		SinkConfig::Console(console) => {
			Ok(Arc::new(console::ConsoleSink::from_config(console)))
		}
		SinkConfig::Kafka(kafka) => Ok(Arc::new(kafka::KafkaSink::from_config(kafka)?)),
		SinkConfig::Splunk(splunk) => Ok(Arc::new(splunk::SplunkSink::from_config(
			splunk,
			ctx.rate_limits,
		)?)),
		SinkConfig::S3(s3) => Ok(Arc::new(s3::S3Sink::from_config(s3).await?)),
		SinkConfig::Service(service) => {
			let resolved = resolve_service(service, ctx.services)?;
			Ok(Arc::new(http::HttpSink::from_config(
				&resolved,
				ctx.rate_limits,
			)?))
		}
		SinkConfig::Experimental(experimental) => build_experimental(experimental, ctx),
	}
}

/// Resolve a `type: service` output into a plain http output against
/// the named service entry.
fn resolve_service(
	config: &crate::decision::config::ServiceSinkConfig,
	services: &BTreeMap<String, ServiceConfig>,
) -> Result<HttpSinkConfig, Error> {
	let Some(service) = services.get(&config.service) else {
		return Err(Error::config(format!(
			"output service references unknown service \"{}\"",
			config.service
		)));
	};

	let url = match &config.resource {
		Some(resource) => format!(
			"{}/{}",
			service.url.trim_end_matches('/'),
			resource.trim_start_matches('/')
		),
		None => service.url.clone(),
	};

	Ok(HttpSinkConfig {
		url,
		headers: service.headers.clone(),
		batching: config.batching.clone(),
		retry: config.retry.clone(),
		rate_limit: config.rate_limit.clone(),
		tls: service.tls.clone(),
		oauth2: service.oauth2.clone(),
		compress: config.compress,
		timeout: None,
	})
}

fn build_experimental(
	config: &ExperimentalSinkConfig,
	ctx: &SinkBuildContext<'_>,
) -> Result<Arc<dyn Sink>, Error> {
	let Some(factory) = ctx.experimental.get(&config.name) else {
		return Err(Error::config(format!(
			"unknown experimental output \"{}\"",
			config.name
		)));
	};
	factory(&config.config)
}

/// Deliver one batch with the sink's retry policy, honoring its rate
/// limiter first. Returns an error when the batch is ultimately
/// dropped, so the unbuffered path can surface it.
pub async fn deliver_with_retry(
	sink: &dyn Sink,
	batch: &Batch,
	manager: Option<&Manager>,
) -> Result<(), SinkError> {
	if batch.is_empty() {
		return Ok(());
	}

	if let Some(limiter) = sink.rate_limiter() {
		limiter.acquire().await;
	}

	let policy = sink.retry_policy();
	let mut attempt: u32 = 0;

	loop {
		match sink.deliver(batch).await {
			Ok(Delivery::Accepted) => return Ok(()),
			Ok(Delivery::Status(status)) => match policy.classify(status) {
				Disposition::Success => return Ok(()),
				Disposition::Drop => {
					return Err(SinkError::Transport(format!(
						"sink {} dropped batch on status {}",
						sink.name(),
						status
					)))
				}
				Disposition::Backoff => {
					attempt += 1;
					if attempt >= policy.max_attempts {
						return Err(SinkError::Transport(format!(
							"sink {} gave up after {} attempts, last status {}",
							sink.name(),
							attempt,
							status
						)));
					}
					tokio::time::sleep(policy.backoff(attempt)).await;
				}
			},
			Err(SinkError::Fatal(msg)) => {
				if let Some(manager) = manager {
					manager.update_status(super::PLUGIN_NAME, PluginStatus::Err);
				}
				return Err(SinkError::Fatal(msg));
			}
			Err(SinkError::Transport(msg)) => {
				attempt += 1;
				if attempt >= policy.max_attempts {
					if policy.drop_on_error {
						return Err(SinkError::Transport(format!(
							"sink {} gave up after {} attempts: {}",
							sink.name(),
							attempt,
							msg
						)));
					}
					attempt = policy.max_attempts.saturating_sub(1);
				}
				tokio::time::sleep(policy.backoff(attempt)).await;
			}
		}
	}
}

/// The queue-draining task for one sink: batches incoming events and
/// flushes on the count/bytes triggers or the period timer. Exits when
/// the queue closes, flushing what remains.
pub(crate) async fn run_sink(
	sink: Arc<dyn Sink>,
	mut rx: mpsc::Receiver<Arc<DecisionEvent>>,
	manager: Arc<Manager>,
) {
	let config = sink.batch_config().clone();
	let mut batch = Batch::new();
	let mut last_flush = Instant::now();

	loop {
		let deadline =
			tokio::time::Instant::from_std(last_flush + config.flush_at_period);

		tokio::select! {
			received = rx.recv() => match received {
				Some(event) => {
					batch.push(event);
					if batch.should_flush(&config) {
						flush(sink.as_ref(), &mut batch, &manager).await;
						last_flush = Instant::now();
					}
				}
				None => {
					flush(sink.as_ref(), &mut batch, &manager).await;
					break;
				}
			},
			_ = tokio::time::sleep_until(deadline) => {
				if !batch.is_empty() {
					flush(sink.as_ref(), &mut batch, &manager).await;
				}
				last_flush = Instant::now();
			}
		}
	}

	log::debug!("sink {} runner stopped", sink.name());
}

async fn flush(sink: &dyn Sink, batch: &mut Batch, manager: &Manager) {
	let due = batch.take();
	if due.is_empty() {
		return;
	}
	if let Err(e) = deliver_with_retry(sink, &due, Some(manager)).await {
		// Batches that exhaust their retry budget are logged and
		// dropped; ordering inside a sink is best-effort per batch.
		log::error!(
			"sink {}: dropped batch of {} events: {}",
			sink.name(),
			due.len(),
			e
		);
	}
}
