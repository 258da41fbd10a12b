// SPDX-License-Identifier: Apache-2.0

//! The decision-logging pipeline.
//!
//! Topology: producer → [buffer] → meta-scrub → drop? → mask? →
//! broker(sinks…). The buffer stage is unbuffered, in-memory with
//! backpressure, or an on-disk journal. Each sink owns its batching,
//! retry policy and rate-limit resource; drop and mask processors are
//! wired to compiler triggers through the registerer.

pub mod batch;
pub mod buffer;
pub mod config;
pub mod event;
pub mod mask;
pub mod processor;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod sink;

pub use config::DecisionLogConfig;
pub use event::DecisionEvent;

use crate::{
	config::ServiceConfig,
	decision::{
		buffer::{run_memory_buffer, DiskQueue, MemoryBuffer},
		processor::{DropProcessor, MaskProcessor},
		rate_limit::RateLimits,
		sink::{
			build_sinks, deliver_with_retry, run_sink, ExperimentalSinkFactory, Sink,
			SinkBuildContext,
		},
	},
	error::Error,
	supervisor::{Manager, PluginStatus, TriggerToken},
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{
	sync::{mpsc, watch},
	task::JoinHandle,
};

pub const PLUGIN_NAME: &str = "decision_logs";

/// The post-buffer processing chain and the broker of sinks.
struct Chain {
	drop: Arc<DropProcessor>,
	mask: Arc<MaskProcessor>,
	outputs: Vec<Output>,
	manager: Arc<Manager>,
}

enum Output {
	/// A buffered sink fed through its runner's queue.
	Queue {
		sink: Arc<dyn Sink>,
		tx: mpsc::Sender<Arc<DecisionEvent>>,
	},
	/// Unbuffered: delivered inline on the request path.
	Direct(Arc<dyn Sink>),
}

impl Chain {
	/// Scrub, drop, mask. `None` means the event was dropped.
	fn process(&self, mut event: DecisionEvent) -> Option<Arc<DecisionEvent>> {
		event.scrub();
		if self.drop.should_drop(&event) {
			log::debug!("decision {} dropped by policy", event.decision_id);
			return None;
		}
		self.mask.mask(&mut event);
		Some(Arc::new(event))
	}

	/// Hand an event to every buffered sink queue. Awaiting a full
	/// queue is how sink backpressure reaches the buffer stage.
	async fn dispatch(&self, event: Arc<DecisionEvent>) {
		for output in &self.outputs {
			match output {
				Output::Queue { sink, tx } => {
					if tx.send(Arc::clone(&event)).await.is_err() {
						log::warn!("sink {} queue closed, event dropped", sink.name());
					}
				}
				Output::Direct(sink) => {
					let mut batch = batch::Batch::new();
					batch.push(Arc::clone(&event));
					if let Err(e) =
						deliver_with_retry(sink.as_ref(), &batch, Some(&self.manager)).await
					{
						log::error!("sink {}: {}", sink.name(), e);
					}
				}
			}
		}
	}

	/// The unbuffered path: every sink must accept the event before
	/// this returns.
	async fn deliver_inline(&self, event: Arc<DecisionEvent>) -> Result<(), Error> {
		let deliveries = self.outputs.iter().map(|output| {
			let event = Arc::clone(&event);
			async move {
				match output {
					Output::Direct(sink) | Output::Queue { sink, .. } => {
						let mut batch = batch::Batch::new();
						batch.push(event);
						deliver_with_retry(sink.as_ref(), &batch, Some(&self.manager))
							.await
							.map_err(|e| Error::DecisionLog(e.to_string()))
					}
				}
			}
		});

		futures::future::try_join_all(deliveries).await.map(|_| ())
	}
}

enum Input {
	Unbuffered,
	Memory(MemoryBuffer),
	Disk(Arc<DiskQueue>),
}

struct Pipeline {
	input: Option<Input>,
	chain: Option<Arc<Chain>>,
	tasks: Vec<JoinHandle<()>>,
	trigger_tokens: Vec<TriggerToken>,
	stop_tx: Option<watch::Sender<bool>>,
}

struct LoggerState {
	config: Option<DecisionLogConfig>,
	pipeline: Option<Pipeline>,
}

/// The decision-log plugin.
pub struct DecisionLogger {
	manager: Arc<Manager>,
	services: BTreeMap<String, ServiceConfig>,
	experimental: BTreeMap<String, ExperimentalSinkFactory>,
	state: tokio::sync::Mutex<LoggerState>,
}

impl DecisionLogger {
	pub fn new(manager: Arc<Manager>, services: BTreeMap<String, ServiceConfig>) -> Self {
		DecisionLogger {
			manager,
			services,
			experimental: BTreeMap::new(),
			state: tokio::sync::Mutex::new(LoggerState {
				config: None,
				pipeline: None,
			}),
		}
	}

	/// Register a factory for `type: experimental` outputs. Must happen
	/// before `start`.
	pub fn register_experimental(&mut self, name: &str, factory: ExperimentalSinkFactory) {
		self.experimental.insert(name.to_owned(), factory);
	}

	pub async fn start(&self, config: DecisionLogConfig) -> Result<(), Error> {
		config.validate()?;
		self.manager.update_status(PLUGIN_NAME, PluginStatus::NotReady);

		let mut state = self.state.lock().await;
		if state.pipeline.is_some() {
			return Err(Error::config("decision logger already running"));
		}

		let pipeline = self.build_pipeline(&config).await?;
		state.config = Some(config);
		state.pipeline = Some(pipeline);

		self.manager.update_status(PLUGIN_NAME, PluginStatus::Ok);
		log::info!("decision logger started");
		Ok(())
	}

	async fn build_pipeline(&self, config: &DecisionLogConfig) -> Result<Pipeline, Error> {
		// Sinks first: misconfiguration should fail before any
		// processor registers.
		let rate_limits = RateLimits::new();
		let build_ctx = SinkBuildContext {
			services: &self.services,
			rate_limits: &rate_limits,
			experimental: &self.experimental,
		};
		let sinks = build_sinks(config.output.as_slice(), &build_ctx).await?;

		// Processors register through the registerer; construction
		// blocks until both have announced themselves.
		let (registerer, mut registrations) = registry::registerer();

		let drop = Arc::new(DropProcessor::new(&config.drop_decision, &self.manager)?);
		{
			let query = Arc::clone(drop.query());
			registerer.register("drop", move || query.refresh());
		}

		let mask = Arc::new(MaskProcessor::new(&config.mask_decision, &self.manager)?);
		{
			let query = Arc::clone(mask.query());
			registerer.register("mask", move || query.refresh());
		}

		let registered = registry::collect(&mut registrations, 2).await;
		let trigger_tokens: Vec<TriggerToken> = registered
			.into_iter()
			.map(|registration| {
				let callback = registration.on_compiler_change;
				self.manager.register_compiler_trigger(move || callback())
			})
			.collect();

		// Prime the prepared queries; failures are lazy-retried.
		drop.query().refresh();
		mask.query().refresh();

		let unbuffered = matches!(config.buffer, config::BufferConfig::Unbuffered);
		let mut tasks = Vec::new();
		let outputs = sinks
			.into_iter()
			.map(|sink| {
				if unbuffered {
					return Output::Direct(sink);
				}
				let (tx, rx) = mpsc::channel(128);
				tasks.push(tokio::spawn(run_sink(
					Arc::clone(&sink),
					rx,
					Arc::clone(&self.manager),
				)));
				Output::Queue { sink, tx }
			})
			.collect();

		let chain = Arc::new(Chain {
			drop,
			mask,
			outputs,
			manager: Arc::clone(&self.manager),
		});

		let mut stop_tx = None;
		let input = match &config.buffer {
			config::BufferConfig::Unbuffered => Input::Unbuffered,
			config::BufferConfig::Memory(memory) => {
				let (buffer, rx) = MemoryBuffer::new(memory);
				let chain_task = Arc::clone(&chain);
				tasks.push(tokio::spawn(run_memory_buffer(
					memory.clone(),
					rx,
					move |event| {
						let chain = Arc::clone(&chain_task);
						async move {
							if let Some(event) = chain.process(event) {
								chain.dispatch(event).await;
							}
						}
					},
				)));
				Input::Memory(buffer)
			}
			config::BufferConfig::Disk(disk) => {
				let queue = Arc::new(DiskQueue::open(&disk.path)?);
				let (tx, rx) = watch::channel(false);
				stop_tx = Some(tx);
				tasks.push(tokio::spawn(run_disk_reader(
					Arc::clone(&queue),
					Arc::clone(&chain),
					rx,
				)));
				Input::Disk(queue)
			}
		};

		Ok(Pipeline {
			input: Some(input),
			chain: Some(chain),
			tasks,
			trigger_tokens,
			stop_tx,
		})
	}

	/// Stop the pipeline: close the producer side, flush the buffer,
	/// close sinks, deregister processors.
	pub async fn stop(&self) {
		let mut state = self.state.lock().await;
		let Some(mut pipeline) = state.pipeline.take() else {
			return;
		};
		state.config = None;
		drop(state);

		self.manager.update_status(PLUGIN_NAME, PluginStatus::NotReady);

		if let Some(stop_tx) = pipeline.stop_tx.take() {
			let _ = stop_tx.send(true);
		}
		// Dropping the input and the chain closes the buffer and sink
		// queues; the tasks flush what remains and exit.
		pipeline.input.take();
		pipeline.chain.take();
		for task in pipeline.tasks {
			let _ = task.await;
		}
		for token in pipeline.trigger_tokens {
			self.manager.unregister_compiler_trigger(token);
		}

		log::info!("decision logger stopped");
	}

	/// Reconfigure: equal configs are a no-op, anything else is stop
	/// then start.
	pub async fn reconfigure(&self, config: DecisionLogConfig) -> Result<(), Error> {
		{
			let state = self.state.lock().await;
			if state.config.as_ref() == Some(&config) {
				return Ok(());
			}
		}
		self.stop().await;
		self.start(config).await
	}

	/// Accept one decision event. Unbuffered configurations block
	/// until every sink has accepted the event; the memory buffer
	/// blocks only when its byte budget is exhausted.
	pub async fn log(&self, event: DecisionEvent) -> Result<(), Error> {
		// Clone the handles out so delivery never holds the state lock.
		let (input, chain) = {
			let state = self.state.lock().await;
			let Some(pipeline) = state.pipeline.as_ref() else {
				log::warn!("decision logger not running, event dropped");
				return Ok(());
			};
			let chain = pipeline.chain.as_ref().map(Arc::clone);
			let input = match pipeline.input.as_ref() {
				Some(Input::Unbuffered) => InputHandle::Unbuffered,
				Some(Input::Memory(buffer)) => InputHandle::Memory(buffer.clone()),
				Some(Input::Disk(queue)) => InputHandle::Disk(Arc::clone(queue)),
				None => return Ok(()),
			};
			(input, chain)
		};

		let Some(chain) = chain else {
			return Ok(());
		};

		match input {
			InputHandle::Unbuffered => {
				let Some(event) = chain.process(event) else {
					return Ok(());
				};
				chain.deliver_inline(event).await
			}
			InputHandle::Memory(buffer) => buffer
				.push(event)
				.await
				.map_err(|_| Error::DecisionLog("buffer closed".to_owned())),
			InputHandle::Disk(queue) => queue
				.append(&event)
				.map_err(|e| Error::DecisionLog(e.to_string())),
		}
	}
}

enum InputHandle {
	Unbuffered,
	Memory(MemoryBuffer),
	Disk(Arc<DiskQueue>),
}

async fn run_disk_reader(queue: Arc<DiskQueue>, chain: Arc<Chain>, mut stop: watch::Receiver<bool>) {
	loop {
		match queue.next() {
			Ok(Some((event, len))) => {
				if let Some(event) = chain.process(event) {
					chain.dispatch(event).await;
				}
				if let Err(e) = queue.advance(len) {
					log::error!("disk buffer: failed to advance offset: {}", e);
				}
			}
			Ok(None) => {
				tokio::select! {
					_ = queue.wait_for_data() => {}
					_ = stop.changed() => break,
				}
			}
			Err(e) => {
				log::error!("disk buffer: read failed: {}", e);
				tokio::select! {
					_ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
					_ = stop.changed() => break,
				}
			}
		}
	}

	// Drain what is already on disk before exiting.
	while let Ok(Some((event, len))) = queue.next() {
		if let Some(event) = chain.process(event) {
			chain.dispatch(event).await;
		}
		if queue.advance(len).is_err() {
			break;
		}
	}
}
