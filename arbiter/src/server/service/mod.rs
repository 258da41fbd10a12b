// SPDX-License-Identifier: Apache-2.0

//! Shared plumbing for the Data/Policy/Bulk services: request
//! bookkeeping, the data read/write helpers, and the parallel read
//! pool.

pub mod bulk;
pub mod data;
pub mod policy;

#[cfg(test)]
mod tests;

use crate::{
	decision::{DecisionLogger, DecisionEvent},
	engine::{EvalMetrics, EvalParams, NdBuiltinCache},
	query::PolicyQuery,
	server::{
		auth::{self, TlsConnectInfo},
		cache::QueryCache,
		metrics::GrpcMetrics,
		status::{check_bundle_scope, engine_status, internal, parse_path, store_status},
	},
	store::{StorePath, Txn, TxnParams, WriteOp},
	supervisor::Manager,
};
use arbiter_common::{proto::data::v1 as datapb, value};
use futures::StreamExt as _;
use serde_json::Value;
use std::sync::Arc;
use tonic::{Extensions, Status};

pub(crate) struct ServerDeps {
	pub manager: Arc<Manager>,
	pub cache: QueryCache,
	pub logger: Option<Arc<DecisionLogger>>,
	pub metrics: Option<GrpcMetrics>,
	pub authz: Option<Arc<PolicyQuery>>,
}

impl ServerDeps {
	/// Per-request entry: count the method, then authorize.
	pub(crate) fn begin(
		&self,
		method: &'static str,
		extensions: &Extensions,
	) -> Result<(), Status> {
		if let Some(metrics) = &self.metrics {
			metrics.inc(method);
		}
		auth::authorize(self.authz.as_ref(), extensions, method)
	}
}

/// Worker-pool width for parallel reads and parses.
pub(crate) fn parallelism() -> usize {
	std::thread::available_parallelism()
		.map(|n| n.get())
		.unwrap_or(1)
}

/// Best-effort peer description for decision events.
pub(crate) fn requested_by(
	remote: Option<std::net::SocketAddr>,
	extensions: &Extensions,
) -> String {
	if let Some(addr) = remote {
		return addr.to_string();
	}
	if let Some(info) = extensions.get::<TlsConnectInfo>() {
		if let Some(addr) = info.remote_addr {
			return addr.to_string();
		}
	}
	String::new()
}

/// Evaluate `data.<path>` with the prepared-query cache and emit a
/// decision event whether or not evaluation succeeds. `Ok(None)` means
/// the query was undefined.
pub(crate) async fn eval_data_read(
	deps: &Arc<ServerDeps>,
	raw_path: &str,
	input: Option<Value>,
	requested_by: String,
) -> Result<Option<Value>, Status> {
	let path = parse_path(raw_path)?;

	let store = deps.manager.store();
	let txn = store
		.new_transaction(TxnParams::read())
		.map_err(internal)?;

	let key = QueryCache::data_key(false, &path.to_string());
	let prepared = match deps.cache.get(&key) {
		Some(prepared) => Ok(prepared),
		None => deps
			.manager
			.engine()
			.prepare(
				&path.data_ref(),
				store.as_ref(),
				&txn,
				deps.manager.prepare_opts(),
			)
			.map(|prepared| {
				deps.cache.insert(key, Arc::clone(&prepared));
				prepared
			}),
	};

	let metrics = EvalMetrics::new();
	let nd_cache = NdBuiltinCache::new();
	let outcome = match &prepared {
		Ok(prepared) => prepared.eval(
			store.as_ref(),
			&txn,
			EvalParams {
				input: input.as_ref(),
				metrics: Some(&metrics),
				inter_query_cache: Some(deps.manager.inter_query_cache()),
				nd_cache: Some(&nd_cache),
			},
		),
		Err(e) => Err(crate::engine::EngineError::Eval(e.to_string())),
	};

	// Read-only transactions never surface errors from abort.
	store.abort(txn);

	let mut event = DecisionEvent::new(&deps.manager.labels().as_map(), raw_path);
	event.query = path.data_ref();
	event.input = input;
	event.requested_by = requested_by;
	event.nd_builtin_cache = nd_cache.as_value();
	event.metrics = metrics.snapshot();

	let result = match outcome {
		Ok(mut values) if !values.is_empty() => {
			let value = values.swap_remove(0);
			event.result = Some(value.clone());
			Ok(Some(value))
		}
		Ok(_) => Ok(None),
		Err(e) => {
			event.error = Some(e.to_string());
			Err(engine_status(e))
		}
	};

	if let Some(logger) = &deps.logger {
		logger
			.log(event)
			.await
			.map_err(|e| Status::internal(e.to_string()))?;
	}

	result
}

/// Decode a wire document field; absent decodes as null.
pub(crate) fn decode_document(raw: &str) -> Result<Value, Status> {
	value::decode_opt(raw)
		.map(|document| document.unwrap_or(Value::Null))
		.map_err(|e| Status::invalid_argument(format!("invalid document JSON: {}", e)))
}

/// Decode a wire input field; absent stays absent.
pub(crate) fn decode_input(raw: &str) -> Result<Option<Value>, Status> {
	value::decode_opt(raw)
		.map_err(|e| Status::invalid_argument(format!("invalid input JSON: {}", e)))
}

/// A parsed, validated data write ready to execute.
pub(crate) enum DataWritePlan {
	Create { path: StorePath, document: Value },
	Update {
		path: StorePath,
		op: WriteOp,
		document: Value,
	},
	Delete { path: StorePath },
}

pub(crate) fn parse_data_write(write: datapb::DataWrite) -> Result<DataWritePlan, Status> {
	match write.write {
		Some(datapb::data_write::Write::Create(create)) => {
			let doc = create
				.data
				.ok_or_else(|| Status::invalid_argument("missing data document"))?;
			Ok(DataWritePlan::Create {
				path: parse_path(&doc.path)?,
				document: decode_document(&doc.document)?,
			})
		}
		Some(datapb::data_write::Write::Update(update)) => {
			let doc = update
				.data
				.ok_or_else(|| Status::invalid_argument("missing data document"))?;
			let op = match datapb::PatchOp::try_from(update.op) {
				Ok(datapb::PatchOp::Add) => WriteOp::Add,
				Ok(datapb::PatchOp::Remove) => WriteOp::Remove,
				Ok(datapb::PatchOp::Replace) | Ok(datapb::PatchOp::Unspecified) => {
					WriteOp::Replace
				}
				Err(_) => {
					return Err(Status::invalid_argument(format!(
						"unknown patch op {}",
						update.op
					)))
				}
			};
			Ok(DataWritePlan::Update {
				path: parse_path(&doc.path)?,
				op,
				document: decode_document(&doc.document)?,
			})
		}
		Some(datapb::data_write::Write::Delete(delete)) => Ok(DataWritePlan::Delete {
			path: parse_path(&delete.path)?,
		}),
		None => Err(Status::invalid_argument("empty write request")),
	}
}

/// Execute one planned write under the given transaction.
pub(crate) fn apply_data_write(
	deps: &ServerDeps,
	txn: &Txn,
	plan: &DataWritePlan,
) -> Result<(), Status> {
	let store = deps.manager.store();
	match plan {
		DataWritePlan::Create { path, document } => {
			check_bundle_scope(&deps.manager, path)?;
			if let Some((parent, _)) = path.split_last() {
				store.make_dir(txn, &parent).map_err(store_status)?;
			}
			store
				.write(txn, WriteOp::Add, path, document.clone())
				.map_err(store_status)
		}
		DataWritePlan::Update { path, op, document } => {
			check_bundle_scope(&deps.manager, path)?;
			store
				.write(txn, *op, path, document.clone())
				.map_err(store_status)
		}
		DataWritePlan::Delete { path } => {
			check_bundle_scope(&deps.manager, path)?;
			store
				.write(txn, WriteOp::Remove, path, Value::Null)
				.map_err(store_status)
		}
	}
}

/// Run data reads in parallel with per-read transactions, capped at
/// the worker-pool width. Failures are reported inline; response order
/// matches request order.
pub(crate) async fn run_data_reads(
	deps: &Arc<ServerDeps>,
	reads: Vec<datapb::DataRead>,
	requested_by: &str,
) -> Vec<datapb::DataReadResult> {
	let count = reads.len();
	let tasks = reads.into_iter().enumerate().map(|(index, read)| {
		let deps = Arc::clone(deps);
		let requested_by = requested_by.to_owned();
		async move {
			let outcome = match read.get {
				Some(get) => match decode_input(&get.input) {
					Ok(input) => eval_data_read(&deps, &get.path, input, requested_by)
						.await
						.map(|document| datapb::GetDataResponse {
							result: Some(datapb::DataDocument {
								path: get.path,
								document: value::encode_opt(document.as_ref()),
							}),
						}),
					Err(status) => Err(status),
				},
				None => Err(Status::invalid_argument("empty read request")),
			};
			(index, outcome)
		}
	});

	let mut slots = vec![datapb::DataReadResult::default(); count];
	let mut completed = futures::stream::iter(tasks).buffer_unordered(parallelism());
	while let Some((index, outcome)) = completed.next().await {
		slots[index] = match outcome {
			Ok(get) => datapb::DataReadResult {
				get: Some(get),
				error: String::new(),
			},
			Err(status) => datapb::DataReadResult {
				get: None,
				error: status.message().to_owned(),
			},
		};
	}
	slots
}

/// Parse write payloads in parallel, preserving request order.
pub(crate) async fn parse_data_writes(
	writes: Vec<datapb::DataWrite>,
) -> Vec<Result<DataWritePlan, Status>> {
	let count = writes.len();
	let tasks = writes
		.into_iter()
		.enumerate()
		.map(|(index, write)| async move { (index, parse_data_write(write)) });

	let mut slots: Vec<Result<DataWritePlan, Status>> = Vec::with_capacity(count);
	for _ in 0..count {
		slots.push(Err(Status::internal("write not parsed")));
	}
	let mut completed = futures::stream::iter(tasks).buffer_unordered(parallelism());
	while let Some((index, outcome)) = completed.next().await {
		slots[index] = outcome;
	}
	slots
}

/// One streaming frame: writes share a single transaction and run in
/// request order; reads run in parallel; the response preserves
/// request order throughout.
pub(crate) async fn process_data_frame(
	deps: &Arc<ServerDeps>,
	frame: datapb::StreamingDataRwRequest,
	requested_by: &str,
) -> datapb::StreamingDataRwResponse {
	let mut write_slots = vec![datapb::DataWriteResult::default(); frame.writes.len()];

	if !frame.writes.is_empty() {
		let plans = parse_data_writes(frame.writes).await;
		let store = deps.manager.store();

		match store.new_transaction(TxnParams::write()) {
			Ok(txn) => {
				let mut failure: Option<(usize, Status)> = None;
				for (index, plan) in plans.iter().enumerate() {
					let applied = match plan {
						Ok(plan) => apply_data_write(deps, &txn, plan),
						Err(status) => Err(status.clone()),
					};
					if let Err(status) = applied {
						failure = Some((index, status));
						break;
					}
				}

				match failure {
					None => {
						if let Err(e) = store.commit(txn) {
							let status = internal(e);
							for slot in &mut write_slots {
								slot.error = status.message().to_owned();
							}
						}
					}
					Some((index, status)) => {
						store.abort(txn);
						for (slot_index, slot) in write_slots.iter_mut().enumerate() {
							slot.error = if slot_index == index {
								status.message().to_owned()
							} else {
								"transaction aborted".to_owned()
							};
						}
					}
				}
			}
			Err(e) => {
				let status = internal(e);
				for slot in &mut write_slots {
					slot.error = status.message().to_owned();
				}
			}
		}
	}

	let read_slots = run_data_reads(deps, frame.reads, requested_by).await;

	datapb::StreamingDataRwResponse {
		writes: write_slots,
		reads: read_slots,
	}
}
