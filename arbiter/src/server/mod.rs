// SPDX-License-Identifier: Apache-2.0

//! The gRPC API server: Data, Policy and Bulk services, TLS with hot
//! certificate reload, authentication/authorization, and per-method
//! metrics.

pub mod auth;
pub mod cache;
pub mod metrics;
pub mod service;
pub mod status;
pub mod tls;

use crate::{
	decision::DecisionLogger,
	error::Error,
	query::PolicyQuery,
	server::{
		auth::{AuthnMode, AuthzMode},
		cache::QueryCache,
		metrics::GrpcMetrics,
		service::{bulk::BulkApi, data::DataApi, policy::PolicyApi, ServerDeps},
		tls::{incoming_tls, run_cert_refresh, server_config, ReloadingCert, TlsServerConfig},
	},
	supervisor::{Manager, PluginStatus, TriggerToken},
};
use arbiter_common::proto::{
	bulk::v1::bulk_service_server::BulkServiceServer,
	data::v1::data_service_server::DataServiceServer,
	policy::v1::policy_service_server::PolicyServiceServer,
};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
	net::TcpListener,
	sync::{mpsc, oneshot},
	task::JoinHandle,
};
use tokio_rustls::TlsAcceptor;
use tonic::{service::interceptor::InterceptedService, transport::Server};

pub const PLUGIN_NAME: &str = "grpc";

/// The query consulted for basic authorization.
const AUTHZ_QUERY: &str = "data.system.authz.allow";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GrpcConfig {
	#[serde(default = "default_addr")]
	pub addr: String,

	#[serde(default)]
	pub authentication: AuthnMode,

	#[serde(default)]
	pub authorization: AuthzMode,

	#[serde(default)]
	pub tls: Option<TlsServerConfig>,

	#[serde(default)]
	pub max_recv_message_size: Option<usize>,
}

fn default_addr() -> String {
	"127.0.0.1:9090".to_owned()
}

pub struct GrpcServer {
	manager: Arc<Manager>,
	logger: Option<Arc<DecisionLogger>>,
	state: tokio::sync::Mutex<Option<Running>>,
}

struct Running {
	config: GrpcConfig,
	deps: Arc<ServerDeps>,
	cache_trigger: TriggerToken,
	shutdown_tx: oneshot::Sender<()>,
	done_rx: oneshot::Receiver<()>,
	serve_handle: JoinHandle<()>,
	refresh: Option<RefreshTask>,
}

struct RefreshTask {
	stop_tx: mpsc::Sender<()>,
	done_rx: oneshot::Receiver<()>,
	handle: JoinHandle<()>,
}

impl GrpcServer {
	pub fn new(manager: Arc<Manager>, logger: Option<Arc<DecisionLogger>>) -> Self {
		GrpcServer {
			manager,
			logger,
			state: tokio::sync::Mutex::new(None),
		}
	}

	pub async fn start(&self, config: GrpcConfig) -> Result<(), Error> {
		let mut state = self.state.lock().await;
		if state.is_some() {
			return Err(Error::Server("gRPC server already running".to_owned()));
		}
		self.manager.update_status(PLUGIN_NAME, PluginStatus::NotReady);

		let addr: SocketAddr = config
			.addr
			.parse()
			.map_err(|e| Error::config(format!("bad listen address {:?}: {}", config.addr, e)))?;

		let authz = match config.authorization {
			AuthzMode::Basic => Some(Arc::new(PolicyQuery::from_query(
				"grpc authz",
				AUTHZ_QUERY,
				&self.manager,
			))),
			AuthzMode::Off => None,
		};

		let deps = Arc::new(ServerDeps {
			manager: Arc::clone(&self.manager),
			cache: QueryCache::new(),
			logger: self.logger.clone(),
			metrics: Some(GrpcMetrics::new(self.manager.registry())),
			authz,
		});

		// Compiler changes invalidate every prepared query before any
		// later read can observe stale results.
		let cache_deps = Arc::clone(&deps);
		let cache_trigger = self
			.manager
			.register_compiler_trigger(move || cache_deps.cache.clear());

		let interceptor = auth::interceptor(config.authentication);

		let data_service = DataServiceServer::new(DataApi::new(Arc::clone(&deps)));
		let policy_service = PolicyServiceServer::new(PolicyApi::new(Arc::clone(&deps)));
		let bulk_service = BulkServiceServer::new(BulkApi::new(Arc::clone(&deps)));

		let (data_service, policy_service, bulk_service) = match config.max_recv_message_size {
			Some(limit) => (
				data_service.max_decoding_message_size(limit),
				policy_service.max_decoding_message_size(limit),
				bulk_service.max_decoding_message_size(limit),
			),
			None => (data_service, policy_service, bulk_service),
		};

		let router = Server::builder()
			.add_service(InterceptedService::new(data_service, interceptor.clone()))
			.add_service(InterceptedService::new(policy_service, interceptor.clone()))
			.add_service(InterceptedService::new(bulk_service, interceptor));

		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let (done_tx, done_rx) = oneshot::channel();
		let shutdown = async move {
			let _ = shutdown_rx.await;
		};

		let mut refresh = None;
		let serve_handle = match &config.tls {
			Some(tls_config) => {
				let resolver = Arc::new(ReloadingCert::load(
					&tls_config.cert_file,
					&tls_config.cert_key_file,
				)?);

				let rustls_config = server_config(
					Arc::clone(&resolver),
					tls_config,
					config.authentication == AuthnMode::Tls,
				)?;
				let acceptor = TlsAcceptor::from(Arc::new(rustls_config));
				let listener = TcpListener::bind(addr).await?;
				let incoming = incoming_tls(listener, acceptor);

				let (refresh_stop_tx, refresh_stop_rx) = mpsc::channel(1);
				let (refresh_done_tx, refresh_done_rx) = oneshot::channel();
				let refresh_handle = tokio::spawn(run_cert_refresh(
					resolver,
					tls_config.cert_refresh_interval,
					refresh_stop_rx,
					refresh_done_tx,
				));
				refresh = Some(RefreshTask {
					stop_tx: refresh_stop_tx,
					done_rx: refresh_done_rx,
					handle: refresh_handle,
				});

				tokio::spawn(async move {
					if let Err(e) = router
						.serve_with_incoming_shutdown(incoming, shutdown)
						.await
					{
						log::error!("gRPC server exited with error: {}", e);
					}
					let _ = done_tx.send(());
				})
			}
			None => tokio::spawn(async move {
				if let Err(e) = router.serve_with_shutdown(addr, shutdown).await {
					log::error!("gRPC server exited with error: {}", e);
				}
				let _ = done_tx.send(());
			}),
		};

		*state = Some(Running {
			config,
			deps,
			cache_trigger,
			shutdown_tx,
			done_rx,
			serve_handle,
			refresh,
		});
		self.manager.update_status(PLUGIN_NAME, PluginStatus::Ok);
		log::info!("gRPC server listening on {}", addr);
		Ok(())
	}

	/// Drain and stop. Waits for the serve loop's
	/// shutdown-complete acknowledgement so no task leaks.
	pub async fn stop(&self) {
		let mut state = self.state.lock().await;
		let Some(running) = state.take() else {
			return;
		};
		drop(state);

		let _ = running.shutdown_tx.send(());
		let _ = running.done_rx.await;
		let _ = running.serve_handle.await;

		if let Some(refresh) = running.refresh {
			let _ = refresh.stop_tx.send(()).await;
			let _ = refresh.done_rx.await;
			let _ = refresh.handle.await;
		}

		if let Some(metrics) = &running.deps.metrics {
			metrics.unregister();
		}
		self.manager.unregister_compiler_trigger(running.cache_trigger);
		self.manager.update_status(PLUGIN_NAME, PluginStatus::NotReady);
		log::info!("gRPC server stopped");
	}

	/// Equal configurations are a no-op; anything else restarts the
	/// server. Metrics unregister then re-register, so reconfigure
	/// cannot trip duplicate-registration errors.
	pub async fn reconfigure(&self, config: GrpcConfig) -> Result<(), Error> {
		{
			let state = self.state.lock().await;
			if let Some(running) = state.as_ref() {
				if running.config == config {
					return Ok(());
				}
			}
		}
		self.stop().await;
		self.start(config).await
	}
}
