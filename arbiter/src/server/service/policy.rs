// SPDX-License-Identifier: Apache-2.0

//! The Policy service: module CRUD with full-set recompilation, and
//! the streaming policy R/W channel.

use crate::{
	server::{
		service::{parallelism, ServerDeps},
		status::{engine_status, internal, parse_path, store_status},
	},
	store::{Store, Txn, TxnParams},
};
use arbiter_common::proto::policy::v1::{
	policy_service_server::PolicyService, policy_write, CreatePolicyRequest,
	CreatePolicyResponse, DeletePolicyRequest, DeletePolicyResponse, GetPolicyRequest,
	GetPolicyResponse, ListPoliciesRequest, ListPoliciesResponse, Policy, PolicyRead,
	PolicyReadResult, PolicyWrite, PolicyWriteResult, StreamingPolicyRwRequest,
	StreamingPolicyRwResponse, UpdatePolicyRequest, UpdatePolicyResponse,
};
use futures::StreamExt as _;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

pub(crate) struct PolicyApi {
	deps: Arc<ServerDeps>,
}

impl PolicyApi {
	pub(crate) fn new(deps: Arc<ServerDeps>) -> Self {
		PolicyApi { deps }
	}

	/// Run one policy write in its own transaction. The store's commit
	/// trigger takes care of reinstalling the compiler snapshot.
	fn one_write(&self, write: PolicyWrite) -> Result<(), Status> {
		let store = self.deps.manager.store();
		let txn = store
			.new_transaction(TxnParams::write())
			.map_err(internal)?;

		match apply_policy_write(&self.deps, &txn, write) {
			Ok(()) => commit_policy_txn(&self.deps, txn),
			Err(status) => {
				store.abort(txn);
				Err(status)
			}
		}
	}
}

/// All modules visible to the given transaction, as text.
pub(crate) fn load_modules(
	store: &dyn Store,
	txn: &Txn,
) -> Result<BTreeMap<String, String>, Status> {
	let mut modules = BTreeMap::new();
	for id in store.list_policies(txn).map_err(store_status)? {
		let text = store.get_policy(txn, &id).map_err(store_status)?;
		modules.insert(id, String::from_utf8_lossy(&text).into_owned());
	}
	Ok(modules)
}

/// Create or update one module under `txn`. Fast-exit: stored bytes
/// equal to the incoming bytes skip recompilation entirely, and no
/// write is issued, so the commit trigger stays quiet.
pub(crate) fn upsert_policy_module(
	deps: &ServerDeps,
	txn: &Txn,
	id: &str,
	text: &str,
) -> Result<(), Status> {
	parse_path(id)?;
	let store = deps.manager.store();

	if let Ok(existing) = store.get_policy(txn, id) {
		if existing == text.as_bytes() {
			return Ok(());
		}
	}

	let parsed = deps
		.manager
		.engine()
		.parse_module(id, text)
		.map_err(engine_status)?;

	// The module's package must not land inside a bundle root; only
	// that bundle's activator may write there.
	if let Some((bundle, root)) = deps.manager.bundle_root_for(&parsed.package_path) {
		return Err(Status::failed_precondition(format!(
			"package path {} is within bundle root {} owned by bundle \"{}\"",
			parsed.package_path, root, bundle
		)));
	}

	// Full-set compile with this module substituted.
	let mut modules = load_modules(store.as_ref(), txn)?;
	modules.insert(id.to_owned(), text.to_owned());
	deps.manager
		.engine()
		.compile(&modules)
		.map_err(engine_status)?;

	store
		.upsert_policy(txn, id, text.as_bytes().to_vec())
		.map_err(store_status)
}

/// Delete one module under `txn`; the remaining set must still
/// compile or the delete is rejected.
pub(crate) fn delete_policy_module(
	deps: &ServerDeps,
	txn: &Txn,
	id: &str,
) -> Result<(), Status> {
	parse_path(id)?;
	let store = deps.manager.store();

	let mut modules = load_modules(store.as_ref(), txn)?;
	if modules.remove(id).is_none() {
		return Err(Status::not_found(format!("policy not found: {}", id)));
	}
	deps.manager
		.engine()
		.compile(&modules)
		.map_err(engine_status)?;

	store.delete_policy(txn, id).map_err(store_status)
}

pub(crate) fn apply_policy_write(
	deps: &ServerDeps,
	txn: &Txn,
	write: PolicyWrite,
) -> Result<(), Status> {
	match write.write {
		Some(policy_write::Write::Create(create)) => {
			let policy = create
				.policy
				.ok_or_else(|| Status::invalid_argument("missing policy"))?;
			upsert_policy_module(deps, txn, &policy.path, &policy.text)
		}
		Some(policy_write::Write::Update(update)) => {
			let policy = update
				.policy
				.ok_or_else(|| Status::invalid_argument("missing policy"))?;
			upsert_policy_module(deps, txn, &policy.path, &policy.text)
		}
		Some(policy_write::Write::Delete(delete)) => {
			delete_policy_module(deps, txn, &delete.path)
		}
		None => Err(Status::invalid_argument("empty policy write")),
	}
}

/// Commit a policy transaction. When the commit touched the policy
/// set, the store's commit trigger reinstalls the compiler snapshot
/// and fans the change out before this returns.
pub(crate) fn commit_policy_txn(deps: &ServerDeps, txn: Txn) -> Result<(), Status> {
	deps.manager.store().commit(txn).map(|_| ()).map_err(internal)
}

fn read_policy(deps: &ServerDeps, id: &str) -> Result<Policy, Status> {
	let store = deps.manager.store();
	let txn = store
		.new_transaction(TxnParams::read())
		.map_err(internal)?;
	let result = store.get_policy(&txn, id).map_err(store_status);
	store.abort(txn);

	result.map(|text| Policy {
		path: id.to_owned(),
		text: String::from_utf8_lossy(&text).into_owned(),
	})
}

/// Policy reads run in parallel with per-read transactions; failures
/// are reported inline in request order.
pub(crate) async fn run_policy_reads(
	deps: &Arc<ServerDeps>,
	reads: Vec<PolicyRead>,
) -> Vec<PolicyReadResult> {
	let count = reads.len();
	let tasks = reads.into_iter().enumerate().map(|(index, read)| {
		let deps = Arc::clone(deps);
		async move {
			let outcome = match read.get {
				Some(get) => read_policy(&deps, &get.path)
					.map(|policy| GetPolicyResponse {
						policy: Some(policy),
					}),
				None => Err(Status::invalid_argument("empty policy read")),
			};
			(index, outcome)
		}
	});

	let mut slots = vec![PolicyReadResult::default(); count];
	let mut completed = futures::stream::iter(tasks).buffer_unordered(parallelism());
	while let Some((index, outcome)) = completed.next().await {
		slots[index] = match outcome {
			Ok(get) => PolicyReadResult {
				get: Some(get),
				error: String::new(),
			},
			Err(status) => PolicyReadResult {
				get: None,
				error: status.message().to_owned(),
			},
		};
	}
	slots
}

/// One streaming policy frame: every write shares one transaction. A
/// failed write aborts the frame's transaction and is reported in its
/// response slot; the stream itself stays open.
pub(crate) async fn process_policy_frame(
	deps: &Arc<ServerDeps>,
	frame: StreamingPolicyRwRequest,
) -> StreamingPolicyRwResponse {
	let mut write_slots = vec![PolicyWriteResult::default(); frame.writes.len()];

	if !frame.writes.is_empty() {
		let store = deps.manager.store();
		match store.new_transaction(TxnParams::write()) {
			Ok(txn) => {
				let mut failure: Option<(usize, Status)> = None;
				for (index, write) in frame.writes.into_iter().enumerate() {
					match apply_policy_write(deps, &txn, write) {
						Ok(()) => {}
						Err(status) => {
							failure = Some((index, status));
							break;
						}
					}
				}

				match failure {
					None => {
						if let Err(status) = commit_policy_txn(deps, txn) {
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

	let read_slots = run_policy_reads(deps, frame.reads).await;

	StreamingPolicyRwResponse {
		writes: write_slots,
		reads: read_slots,
	}
}

#[tonic::async_trait]
impl PolicyService for PolicyApi {
	async fn list_policies(
		&self,
		request: Request<ListPoliciesRequest>,
	) -> Result<Response<ListPoliciesResponse>, Status> {
		self.deps.begin("v1.ListPolicies", request.extensions())?;

		let store = self.deps.manager.store();
		let txn = store
			.new_transaction(TxnParams::read())
			.map_err(internal)?;
		let result = load_modules(store.as_ref(), &txn);
		store.abort(txn);

		let modules = result?;
		Ok(Response::new(ListPoliciesResponse {
			policies: modules
				.into_iter()
				.map(|(path, text)| Policy { path, text })
				.collect(),
		}))
	}

	async fn get_policy(
		&self,
		request: Request<GetPolicyRequest>,
	) -> Result<Response<GetPolicyResponse>, Status> {
		self.deps.begin("v1.GetPolicy", request.extensions())?;
		let message = request.into_inner();
		let policy = read_policy(&self.deps, &message.path)?;
		Ok(Response::new(GetPolicyResponse {
			policy: Some(policy),
		}))
	}

	async fn create_policy(
		&self,
		request: Request<CreatePolicyRequest>,
	) -> Result<Response<CreatePolicyResponse>, Status> {
		self.deps.begin("v1.CreatePolicy", request.extensions())?;
		self.one_write(PolicyWrite {
			write: Some(policy_write::Write::Create(request.into_inner())),
		})?;
		Ok(Response::new(CreatePolicyResponse {}))
	}

	async fn update_policy(
		&self,
		request: Request<UpdatePolicyRequest>,
	) -> Result<Response<UpdatePolicyResponse>, Status> {
		self.deps.begin("v1.UpdatePolicy", request.extensions())?;
		self.one_write(PolicyWrite {
			write: Some(policy_write::Write::Update(request.into_inner())),
		})?;
		Ok(Response::new(UpdatePolicyResponse {}))
	}

	async fn delete_policy(
		&self,
		request: Request<DeletePolicyRequest>,
	) -> Result<Response<DeletePolicyResponse>, Status> {
		self.deps.begin("v1.DeletePolicy", request.extensions())?;
		self.one_write(PolicyWrite {
			write: Some(policy_write::Write::Delete(request.into_inner())),
		})?;
		Ok(Response::new(DeletePolicyResponse {}))
	}

	type StreamingPolicyRWStream = ReceiverStream<Result<StreamingPolicyRwResponse, Status>>;

	async fn streaming_policy_rw(
		&self,
		request: Request<Streaming<StreamingPolicyRwRequest>>,
	) -> Result<Response<Self::StreamingPolicyRWStream>, Status> {
		self.deps
			.begin("v1.StreamingPolicyRW", request.extensions())?;
		let mut frames = request.into_inner();

		let deps = Arc::clone(&self.deps);
		let (tx, rx) = mpsc::channel(16);

		tokio::spawn(async move {
			loop {
				match frames.message().await {
					Ok(Some(frame)) => {
						let response = process_policy_frame(&deps, frame).await;
						if tx.send(Ok(response)).await.is_err() {
							break;
						}
					}
					Ok(None) => break,
					Err(status) => {
						let _ = tx.send(Err(status)).await;
						break;
					}
				}
			}
		});

		Ok(Response::new(ReceiverStream::new(rx)))
	}
}
