// SPDX-License-Identifier: Apache-2.0

//! The Bulk service: a one-shot aggregate of policy writes, data
//! writes, and reads.
//!
//! Phase 1 opens a single write transaction and applies policy writes
//! then data writes sequentially; any failure aborts the whole
//! transaction and fails the call with the first error. Phase 2 runs
//! reads in parallel with per-read transactions; a read failure is
//! reported inline and never fails the call. Response order matches
//! request order.

use crate::{
	server::{
		service::{
			apply_data_write, parse_data_writes, requested_by, run_data_reads, ServerDeps,
		},
		service::policy::{apply_policy_write, commit_policy_txn, run_policy_reads},
		status::internal,
	},
	store::TxnParams,
};
use arbiter_common::proto::{
	bulk::v1::{bulk_service_server::BulkService, BulkRwRequest, BulkRwResponse},
	data::v1::DataWriteResult,
	policy::v1::PolicyWriteResult,
};
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub(crate) struct BulkApi {
	deps: Arc<ServerDeps>,
}

impl BulkApi {
	pub(crate) fn new(deps: Arc<ServerDeps>) -> Self {
		BulkApi { deps }
	}
}

#[tonic::async_trait]
impl BulkService for BulkApi {
	async fn bulk_rw(
		&self,
		request: Request<BulkRwRequest>,
	) -> Result<Response<BulkRwResponse>, Status> {
		self.deps.begin("v1.BulkRW", request.extensions())?;
		let peer = requested_by(request.remote_addr(), request.extensions());
		let message = request.into_inner();

		let policy_write_count = message.writes_policy.len();
		let data_write_count = message.writes_data.len();

		// Phase 1: all writes in one transaction, in request order.
		if policy_write_count > 0 || data_write_count > 0 {
			let plans = parse_data_writes(message.writes_data).await;
			let store = self.deps.manager.store();
			let txn = store
				.new_transaction(TxnParams::write())
				.map_err(internal)?;

			let applied = (|| {
				for write in message.writes_policy {
					apply_policy_write(&self.deps, &txn, write)?;
				}
				for plan in &plans {
					match plan {
						Ok(plan) => apply_data_write(&self.deps, &txn, plan)?,
						Err(status) => return Err(status.clone()),
					}
				}
				Ok(())
			})();

			// Any write failure rolls the whole phase back and becomes
			// the call's status.
			if let Err(status) = applied {
				store.abort(txn);
				return Err(status);
			}
			commit_policy_txn(&self.deps, txn)?;
		}

		// Phase 2: reads in parallel, responses in request order.
		let reads_data = run_data_reads(&self.deps, message.reads_data, &peer).await;
		let reads_policy = run_policy_reads(&self.deps, message.reads_policy).await;

		Ok(Response::new(BulkRwResponse {
			writes_policy: vec![PolicyWriteResult::default(); policy_write_count],
			writes_data: vec![DataWriteResult::default(); data_write_count],
			reads_data,
			reads_policy,
		}))
	}
}
