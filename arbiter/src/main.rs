// SPDX-License-Identifier: Apache-2.0

use arbiter::{
	cli::{Cli, Commands, RunArgs},
	config::Config,
	data::{http::HttpPoller, DataPluginSet},
	decision::DecisionLogger,
	engine::data::DataEngine,
	error::Result,
	server::GrpcServer,
	store::MemoryStore,
	supervisor::{Labels, Manager},
};
use clap::Parser as _;
use env_logger::Env;
use rustls::crypto::{ring, CryptoProvider};
use std::{process::ExitCode, sync::Arc};

fn init_logging() {
	let env = Env::new()
		.filter("ARBITER_LOG")
		.write_style("ARBITER_LOG_STYLE");
	env_logger::Builder::from_env(env).init();
}

fn main() -> ExitCode {
	init_logging();

	// Install a process-wide default crypto provider.
	CryptoProvider::install_default(ring::default_provider())
		.expect("installed process-wide default crypto provider");

	let cli = Cli::parse();
	match cli.command {
		Commands::Run(args) => cmd_run(&args),
	}
}

fn cmd_run(args: &RunArgs) -> ExitCode {
	let config = match &args.config {
		Some(path) => match Config::load_from(path) {
			Ok(config) => config,
			Err(e) => {
				eprintln!("configuration error: {}", e);
				return ExitCode::FAILURE;
			}
		},
		None => Config::default(),
	};

	let runtime = match tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
	{
		Ok(runtime) => runtime,
		Err(e) => {
			eprintln!("failed to start runtime: {}", e);
			return ExitCode::FAILURE;
		}
	};

	match runtime.block_on(run(config, args)) {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			log::error!("fatal: {}", e);
			eprintln!("error: {}", e);
			ExitCode::FAILURE
		}
	}
}

async fn run(config: Config, args: &RunArgs) -> Result<()> {
	let store = Arc::new(MemoryStore::new());
	let engine = Arc::new(DataEngine::new());
	let labels = Labels::new("arbiterd", config.labels.clone());
	let manager = Arc::new(
		Manager::new(store, engine, labels).with_registry(prometheus::Registry::new()),
	);
	// Policy-changing commits recompile and fan out through the
	// store's own commit trigger.
	manager.watch_policy_commits()?;

	// Decision logs come up first so every later subsystem can emit
	// events from the start.
	let logger = match &config.decision_logs {
		Some(dl_config) => {
			let logger = Arc::new(DecisionLogger::new(
				Arc::clone(&manager),
				config.services.clone(),
			));
			logger.start(dl_config.clone()).await?;
			Some(logger)
		}
		None => None,
	};

	let mut data_plugins = DataPluginSet::new(Arc::clone(&manager));
	for (name, poller_config) in &config.plugins.data {
		data_plugins.add(Arc::new(HttpPoller::new(
			name,
			poller_config.clone(),
			Arc::clone(&manager),
		)));
	}
	data_plugins.start_all().await?;

	let mut grpc_config = config.plugins.grpc.clone().unwrap_or_else(|| {
		serde_yaml::from_str("{}").expect("empty gRPC config is valid")
	});
	if let Some(addr) = &args.addr {
		grpc_config.addr = addr.clone();
	}
	let server = GrpcServer::new(Arc::clone(&manager), logger.clone());
	server.start(grpc_config).await?;

	wait_for_shutdown().await;
	log::info!("shutting down");

	// Reverse dependency order: drain the server, stop the pollers,
	// then flush and close the decision logs.
	server.stop().await;
	data_plugins.stop_all().await;
	if let Some(logger) = logger {
		logger.stop().await;
	}

	Ok(())
}

async fn wait_for_shutdown() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};
		let mut term =
			signal(SignalKind::terminate()).expect("installed SIGTERM handler");
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {}
			_ = term.recv() => {}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}
