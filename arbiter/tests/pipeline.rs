// SPDX-License-Identifier: Apache-2.0

//! Integration tests over the public surface: decision-log pipeline
//! lifecycles and the gRPC server plugin lifecycle.

use arbiter::{
	decision::{
		batch::{Batch, BatchConfig},
		config::{
			BufferConfig, DecisionLogConfig, DiskBufferConfig, ExperimentalSinkConfig,
			MemoryBufferConfig, Outputs, SinkConfig,
		},
		retry::RetryPolicy,
		sink::{Delivery, Sink, SinkError},
		DecisionEvent, DecisionLogger,
	},
	engine::data::DataEngine,
	server::{GrpcConfig, GrpcServer},
	store::MemoryStore,
	supervisor::{Labels, Manager, PluginStatus},
};
use std::{
	collections::BTreeMap,
	sync::Arc,
	time::{Duration, Instant},
};
use tokio::sync::mpsc;

fn manager() -> Arc<Manager> {
	Arc::new(Manager::new(
		Arc::new(MemoryStore::new()),
		Arc::new(DataEngine::new()),
		Labels::new("arbiterd", BTreeMap::new()),
	))
}

struct CaptureSink {
	batch: BatchConfig,
	retry: RetryPolicy,
	tx: mpsc::UnboundedSender<DecisionEvent>,
}

#[tonic::async_trait]
impl Sink for CaptureSink {
	fn name(&self) -> &str {
		"capture"
	}

	fn batch_config(&self) -> &BatchConfig {
		&self.batch
	}

	fn retry_policy(&self) -> &RetryPolicy {
		&self.retry
	}

	async fn deliver(&self, batch: &Batch) -> Result<Delivery, SinkError> {
		for event in batch.events() {
			let _ = self.tx.send(event.as_ref().clone());
		}
		Ok(Delivery::Accepted)
	}
}

fn capture_logger(
	manager: &Arc<Manager>,
) -> (Arc<DecisionLogger>, mpsc::UnboundedReceiver<DecisionEvent>) {
	let (tx, rx) = mpsc::unbounded_channel();
	let mut logger = DecisionLogger::new(Arc::clone(manager), BTreeMap::new());
	logger.register_experimental(
		"capture",
		Arc::new(move |_config| {
			Ok(Arc::new(CaptureSink {
				batch: BatchConfig {
					flush_at_count: 1,
					..BatchConfig::default()
				},
				retry: RetryPolicy::default(),
				tx: tx.clone(),
			}) as Arc<dyn Sink>)
		}),
	);
	(Arc::new(logger), rx)
}

fn capture_output() -> Outputs {
	Outputs::One(Box::new(SinkConfig::Experimental(ExperimentalSinkConfig {
		name: "capture".to_owned(),
		config: serde_json::Value::Null,
	})))
}

async fn recv_with_deadline(
	rx: &mut mpsc::UnboundedReceiver<DecisionEvent>,
) -> DecisionEvent {
	tokio::time::timeout(Duration::from_secs(5), rx.recv())
		.await
		.expect("event within deadline")
		.expect("channel open")
}

#[tokio::test]
async fn memory_buffered_events_reach_the_sink() {
	let manager = manager();
	let (logger, mut events) = capture_logger(&manager);

	logger
		.start(DecisionLogConfig {
			drop_decision: "/system/log/drop".to_owned(),
			mask_decision: "/system/log/mask".to_owned(),
			buffer: BufferConfig::Memory(MemoryBufferConfig {
				flush_at_count: 1,
				flush_at_period: Duration::from_millis(50),
				..MemoryBufferConfig::default()
			}),
			output: capture_output(),
		})
		.await
		.unwrap();
	assert_eq!(
		manager.plugin_status("decision_logs"),
		Some(PluginStatus::Ok)
	);

	logger
		.log(DecisionEvent::new(&BTreeMap::new(), "/a"))
		.await
		.unwrap();

	let event = recv_with_deadline(&mut events).await;
	assert_eq!(event.path, "/a");

	logger.stop().await;
	assert_eq!(
		manager.plugin_status("decision_logs"),
		Some(PluginStatus::NotReady)
	);
}

#[tokio::test]
async fn stop_flushes_buffered_events() {
	let manager = manager();
	let (logger, mut events) = capture_logger(&manager);

	// A long flush period, so only the stop-path flush can deliver.
	logger
		.start(DecisionLogConfig {
			drop_decision: "/system/log/drop".to_owned(),
			mask_decision: "/system/log/mask".to_owned(),
			buffer: BufferConfig::Memory(MemoryBufferConfig {
				flush_at_period: Duration::from_secs(3600),
				..MemoryBufferConfig::default()
			}),
			output: capture_output(),
		})
		.await
		.unwrap();

	logger
		.log(DecisionEvent::new(&BTreeMap::new(), "/flushed"))
		.await
		.unwrap();
	logger.stop().await;

	let event = recv_with_deadline(&mut events).await;
	assert_eq!(event.path, "/flushed");
}

#[test_log::test(tokio::test)]
async fn disk_buffered_events_survive_the_journal() {
	let dir = tempfile::tempdir().unwrap();
	let manager = manager();
	let (logger, mut events) = capture_logger(&manager);

	logger
		.start(DecisionLogConfig {
			drop_decision: "/system/log/drop".to_owned(),
			mask_decision: "/system/log/mask".to_owned(),
			buffer: BufferConfig::Disk(DiskBufferConfig {
				path: dir.path().join("dl.journal"),
			}),
			output: capture_output(),
		})
		.await
		.unwrap();

	logger
		.log(DecisionEvent::new(&BTreeMap::new(), "/from-disk"))
		.await
		.unwrap();

	let event = recv_with_deadline(&mut events).await;
	assert_eq!(event.path, "/from-disk");

	logger.stop().await;
}

#[tokio::test]
async fn reconfigure_with_equal_config_keeps_the_pipeline() {
	let manager = manager();
	let (logger, _events) = capture_logger(&manager);

	let config = DecisionLogConfig {
		drop_decision: "/system/log/drop".to_owned(),
		mask_decision: "/system/log/mask".to_owned(),
		buffer: BufferConfig::Unbuffered,
		output: capture_output(),
	};

	logger.start(config.clone()).await.unwrap();
	logger.reconfigure(config).await.unwrap();
	assert_eq!(
		manager.plugin_status("decision_logs"),
		Some(PluginStatus::Ok)
	);
	logger.stop().await;
}

// Unbuffered logging returns only once the sink has accepted the
// event.
#[tokio::test]
async fn unbuffered_log_blocks_until_accepted() {
	let manager = manager();
	let (logger, mut events) = capture_logger(&manager);

	logger
		.start(DecisionLogConfig {
			drop_decision: "/system/log/drop".to_owned(),
			mask_decision: "/system/log/mask".to_owned(),
			buffer: BufferConfig::Unbuffered,
			output: capture_output(),
		})
		.await
		.unwrap();

	let started = Instant::now();
	logger
		.log(DecisionEvent::new(&BTreeMap::new(), "/now"))
		.await
		.unwrap();

	// Delivery happened before log() returned.
	let event = events.try_recv().expect("event already delivered");
	assert_eq!(event.path, "/now");
	assert!(started.elapsed() < Duration::from_secs(5));

	logger.stop().await;
}

#[tokio::test]
async fn grpc_server_starts_and_stops() {
	let manager = manager();
	let server = GrpcServer::new(Arc::clone(&manager), None);

	let config: GrpcConfig = serde_yaml::from_str("addr: 127.0.0.1:0").unwrap();
	server.start(config).await.unwrap();
	assert_eq!(manager.plugin_status("grpc"), Some(PluginStatus::Ok));

	server.stop().await;
	assert_eq!(
		manager.plugin_status("grpc"),
		Some(PluginStatus::NotReady)
	);
}
