// SPDX-License-Identifier: Apache-2.0

//! The HTTP poller.
//!
//! A long-running task fetches the configured URL on an interval whose
//! first tick fires immediately, keeps an ETag across iterations, and
//! writes the parsed (and optionally policy-transformed) result into
//! the subtree the poller owns.

use crate::{
	data::{parse::parse_body, DataPlugin},
	decision::config::TlsClientConfig,
	error::Error,
	query::PolicyQuery,
	store::{StorePath, TxnParams, WriteOp},
	supervisor::{Manager, TriggerToken},
	util::{
		duration::{serde_duration, serde_opt_duration},
		http::client_builder,
	},
};
use serde::Deserialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};

/// Accept header sent when the configuration does not set one.
pub const DEFAULT_ACCEPT: &str =
	"application/json, application/yaml, application/xml, text/plain";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HttpPollerConfig {
	pub url: String,

	#[serde(default = "default_method")]
	pub method: String,

	#[serde(default)]
	pub headers: BTreeMap<String, String>,

	/// Request body, re-sent from the start on every iteration.
	#[serde(default)]
	pub body: Option<String>,

	#[serde(default = "default_interval", with = "serde_duration")]
	pub polling_interval: Duration,

	#[serde(default, with = "serde_opt_duration")]
	pub timeout: Option<Duration>,

	#[serde(default)]
	pub tls: Option<TlsClientConfig>,

	#[serde(default = "default_true")]
	pub follow_redirects: bool,

	/// Query reference (e.g. `data.transforms.ingest`) applied to the
	/// fetched document before writing.
	#[serde(default)]
	pub rego_transform: Option<String>,

	/// The owning path; created on start, and this poller is its sole
	/// writer.
	pub path: String,
}

fn default_method() -> String {
	"GET".to_owned()
}

fn default_interval() -> Duration {
	Duration::from_secs(30)
}

fn default_true() -> bool {
	true
}

pub struct HttpPoller {
	name: String,
	manager: Arc<Manager>,
	state: tokio::sync::Mutex<PollerState>,
}

struct PollerState {
	config: HttpPollerConfig,
	transform: Option<Arc<PolicyQuery>>,
	trigger: Option<TriggerToken>,
	task: Option<RunningTask>,
}

struct RunningTask {
	stop_tx: mpsc::Sender<()>,
	handle: JoinHandle<()>,
}

impl HttpPoller {
	pub fn new(name: &str, config: HttpPollerConfig, manager: Arc<Manager>) -> Self {
		HttpPoller {
			name: name.to_owned(),
			manager,
			state: tokio::sync::Mutex::new(PollerState {
				config,
				transform: None,
				trigger: None,
				task: None,
			}),
		}
	}

	async fn start_locked(&self, state: &mut PollerState) -> Result<(), Error> {
		if state.task.is_some() {
			return Ok(());
		}

		let own_path = StorePath::parse(&state.config.path)
			.map_err(|e| Error::config(format!("data plugin {}: {}", self.name, e)))?;
		if state.config.polling_interval.is_zero() {
			return Err(Error::config(format!(
				"data plugin {}: polling_interval must be positive",
				self.name
			)));
		}

		// Prepare the transform before claiming anything, so a bad
		// reference fails start.
		let transform_query = state.config.rego_transform.clone();
		let transform = match transform_query {
			Some(query) => {
				let transform = Arc::new(PolicyQuery::from_query(
					&format!("data.{} transform", self.name),
					&query,
					&self.manager,
				));
				transform.refresh();
				let refresh_target = Arc::clone(&transform);
				state.trigger = Some(
					self.manager
						.register_compiler_trigger(move || refresh_target.refresh()),
				);
				Some(transform)
			}
			None => None,
		};
		state.transform = transform.clone();

		// Claim the owning path.
		let store = self.manager.store();
		let txn = store.new_transaction(TxnParams::write_owned_by(&self.name))?;
		store.make_dir(&txn, &own_path)?;
		store.commit(txn)?;

		let mut builder =
			client_builder(state.config.tls.as_ref(), state.config.timeout)?;
		if !state.config.follow_redirects {
			builder = builder.redirect(reqwest::redirect::Policy::none());
		}
		let client = builder
			.build()
			.map_err(|e| Error::config(format!("data plugin {}: {}", self.name, e)))?;

		let (stop_tx, stop_rx) = mpsc::channel(1);
		let handle = tokio::spawn(run_poller(
			PollerCtx {
				name: self.name.clone(),
				client,
				config: state.config.clone(),
				own_path,
				transform,
				manager: Arc::clone(&self.manager),
			},
			stop_rx,
		));
		state.task = Some(RunningTask { stop_tx, handle });

		log::info!("data plugin {} started", self.name);
		Ok(())
	}

	async fn stop_locked(&self, state: &mut PollerState) {
		if let Some(task) = state.task.take() {
			// The polling loop acknowledges by exiting; dropping the
			// client closes idle connections.
			let _ = task.stop_tx.send(()).await;
			let _ = task.handle.await;
		}
		if let Some(trigger) = state.trigger.take() {
			self.manager.unregister_compiler_trigger(trigger);
		}
		state.transform = None;
		log::info!("data plugin {} stopped", self.name);
	}
}

#[tonic::async_trait]
impl DataPlugin for HttpPoller {
	fn name(&self) -> &str {
		&self.name
	}

	async fn start(&self) -> Result<(), Error> {
		let mut state = self.state.lock().await;
		self.start_locked(&mut state).await
	}

	async fn stop(&self) {
		let mut state = self.state.lock().await;
		self.stop_locked(&mut state).await;
	}

	async fn reconfigure(&self, config: serde_yaml::Value) -> Result<(), Error> {
		let next: HttpPollerConfig = serde_yaml::from_value(config)
			.map_err(|e| Error::config(format!("data plugin {}: {}", self.name, e)))?;

		let mut state = self.state.lock().await;
		if next == state.config {
			return Ok(());
		}

		self.stop_locked(&mut state).await;
		state.config = next;
		self.start_locked(&mut state).await
	}
}

struct PollerCtx {
	name: String,
	client: reqwest::Client,
	config: HttpPollerConfig,
	own_path: StorePath,
	transform: Option<Arc<PolicyQuery>>,
	manager: Arc<Manager>,
}

async fn run_poller(ctx: PollerCtx, mut stop_rx: mpsc::Receiver<()>) {
	let mut etag: Option<String> = None;
	// The first tick completes immediately, so the first fetch happens
	// at start rather than one interval later.
	let mut ticker = tokio::time::interval(ctx.config.polling_interval);
	ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			_ = ticker.tick() => {
				if let Err(e) = poll_once(&ctx, &mut etag).await {
					log::error!("data plugin {}: {}", ctx.name, e);
				}
			}
			_ = stop_rx.recv() => break,
		}
	}

	log::debug!("data plugin {} polling loop exited", ctx.name);
}

async fn poll_once(ctx: &PollerCtx, etag: &mut Option<String>) -> Result<(), Error> {
	let method = reqwest::Method::from_bytes(ctx.config.method.to_uppercase().as_bytes())
		.map_err(|_| Error::config(format!("bad method \"{}\"", ctx.config.method)))?;

	let mut request = ctx.client.request(method, &ctx.config.url);
	let mut saw_accept = false;
	for (name, value) in &ctx.config.headers {
		if name.eq_ignore_ascii_case("accept") {
			saw_accept = true;
		}
		request = request.header(name, value);
	}
	if !saw_accept {
		request = request.header("Accept", DEFAULT_ACCEPT);
	}
	if let Some(body) = &ctx.config.body {
		request = request.body(body.clone());
	}
	if let Some(etag) = etag.as_ref() {
		request = request.header("If-None-Match", etag);
	}

	let response = request
		.send()
		.await
		.map_err(|e| Error::Server(format!("poll {} failed: {}", ctx.config.url, e)))?;

	let status = response.status();
	if status == reqwest::StatusCode::NOT_MODIFIED {
		log::debug!("data plugin {}: not modified", ctx.name);
		return Ok(());
	}
	if status.is_client_error() || status.is_server_error() {
		let body = response.text().await.unwrap_or_default();
		if body.is_empty() {
			return Err(Error::Server(format!("poll returned status {}", status)));
		}
		return Err(Error::Server(format!(
			"poll returned status {}: {}",
			status, body
		)));
	}

	let next_etag = response
		.headers()
		.get(reqwest::header::ETAG)
		.and_then(|v| v.to_str().ok())
		.map(str::to_owned);
	let bytes = response
		.bytes()
		.await
		.map_err(|e| Error::Server(format!("failed reading poll body: {}", e)))?;

	let parsed = parse_body(&bytes)?;
	let document = match &ctx.transform {
		Some(transform) => transform.eval(&parsed).ok_or_else(|| {
			Error::Server(format!(
				"transform {} returned no value",
				transform.query_ref()
			))
		})?,
		None => parsed,
	};

	let store = ctx.manager.store();
	let txn = store.new_transaction(TxnParams::write_owned_by(&ctx.name))?;
	store.write(&txn, WriteOp::Add, &ctx.own_path, document)?;
	store.commit(txn)?;

	// Only a fully ingested response advances the ETag.
	*etag = next_etag;
	log::debug!("data plugin {}: wrote {}", ctx.name, ctx.own_path);
	Ok(())
}
