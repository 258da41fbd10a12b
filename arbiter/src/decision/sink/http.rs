// SPDX-License-Identifier: Apache-2.0

//! HTTP sink with TLS client auth and OAuth2 client-credentials.

use crate::{
	decision::{
		batch::{frame_events, Batch, BatchConfig},
		config::{HttpSinkConfig, OAuth2Config, TlsClientConfig},
		rate_limit::{RateLimiter, RateLimits},
		retry::RetryPolicy,
		sink::{Delivery, Sink, SinkError},
	},
	error::Error,
	util::http::client_builder,
};
use serde::Deserialize;
use std::{
	collections::BTreeMap,
	sync::Arc,
	time::{Duration, Instant},
};

pub struct HttpSink {
	url: String,
	headers: BTreeMap<String, String>,
	client: reqwest::Client,
	batch: BatchConfig,
	retry: RetryPolicy,
	limiter: Option<Arc<RateLimiter>>,
	compress: bool,
	oauth: Option<OAuth2Flow>,
}

impl HttpSink {
	pub fn from_config(config: &HttpSinkConfig, rate_limits: &RateLimits) -> Result<Self, Error> {
		let client = build_client(config.tls.as_ref(), config.timeout)?;
		let limiter = config
			.rate_limit
			.as_ref()
			.map(|rl| rate_limits.shared(rl, &config.url));
		let oauth = config
			.oauth2
			.as_ref()
			.map(|oauth| OAuth2Flow::new(oauth.clone()));

		Ok(HttpSink {
			url: config.url.clone(),
			headers: config.headers.clone(),
			client,
			batch: config.batching.clone(),
			retry: RetryPolicy::from_config(&config.retry),
			limiter,
			compress: config.compress,
			oauth,
		})
	}
}

#[tonic::async_trait]
impl Sink for HttpSink {
	fn name(&self) -> &str {
		"http"
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
		let body = frame_events(batch.events(), self.batch.framing(), self.compress)
			.map_err(|e| SinkError::Transport(e.to_string()))?;

		let mut request = self
			.client
			.post(&self.url)
			.header("Content-Type", "application/json")
			.body(body);
		for (name, value) in &self.headers {
			request = request.header(name, value);
		}
		if self.compress {
			request = request.header("Content-Encoding", "gzip");
		}
		if let Some(oauth) = &self.oauth {
			request = request.bearer_auth(oauth.bearer(&self.client).await?);
		}

		let response = request
			.send()
			.await
			.map_err(|e| SinkError::Transport(e.to_string()))?;
		Ok(Delivery::Status(response.status().as_u16()))
	}
}

/// Shared client construction for HTTP-flavored sinks.
pub(crate) fn build_client(
	tls: Option<&TlsClientConfig>,
	timeout: Option<Duration>,
) -> Result<reqwest::Client, Error> {
	client_builder(tls, timeout)?
		.build()
		.map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))
}

/// OAuth2 client-credentials flow with token caching.
pub(crate) struct OAuth2Flow {
	config: OAuth2Config,
	cached: tokio::sync::Mutex<Option<(String, Instant)>>,
}

#[derive(Deserialize)]
struct TokenResponse {
	access_token: String,
	#[serde(default)]
	expires_in: Option<u64>,
}

impl OAuth2Flow {
	pub(crate) fn new(config: OAuth2Config) -> Self {
		OAuth2Flow {
			config,
			cached: tokio::sync::Mutex::new(None),
		}
	}

	pub(crate) async fn bearer(&self, client: &reqwest::Client) -> Result<String, SinkError> {
		let mut cached = self.cached.lock().await;
		if let Some((token, expires)) = cached.as_ref() {
			if Instant::now() < *expires {
				return Ok(token.clone());
			}
		}

		let mut form = vec![
			("grant_type", "client_credentials".to_owned()),
			("client_id", self.config.client_id.clone()),
			("client_secret", self.config.client_secret.clone()),
		];
		if !self.config.scopes.is_empty() {
			form.push(("scope", self.config.scopes.join(" ")));
		}

		let response = client
			.post(&self.config.token_url)
			.form(&form)
			.send()
			.await
			.map_err(|e| SinkError::Transport(format!("token request failed: {}", e)))?;
		if !response.status().is_success() {
			return Err(SinkError::Transport(format!(
				"token request returned {}",
				response.status()
			)));
		}
		let token: TokenResponse = response
			.json()
			.await
			.map_err(|e| SinkError::Transport(format!("bad token response: {}", e)))?;

		// Refresh slightly early so in-flight requests never carry an
		// expired token.
		let ttl = Duration::from_secs(token.expires_in.unwrap_or(3600).saturating_sub(30));
		*cached = Some((token.access_token.clone(), Instant::now() + ttl));
		Ok(token.access_token)
	}
}
