// SPDX-License-Identifier: Apache-2.0

//! The Data service: transactional document CRUD, policy-evaluated
//! reads, and the streaming R/W channel.

use crate::server::{
	service::{
		apply_data_write, decode_input, eval_data_read, parse_data_write, process_data_frame,
		requested_by, DataWritePlan, ServerDeps,
	},
	status::internal,
};
use crate::store::TxnParams;
use arbiter_common::{
	proto::data::v1::{
		data_service_server::DataService, CreateDataRequest, CreateDataResponse, DataDocument,
		DataWrite, DeleteDataRequest, DeleteDataResponse, GetDataRequest, GetDataResponse,
		StreamingDataRwRequest, StreamingDataRwResponse, UpdateDataRequest, UpdateDataResponse,
		data_write,
	},
	value,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

pub(crate) struct DataApi {
	deps: Arc<ServerDeps>,
}

impl DataApi {
	pub(crate) fn new(deps: Arc<ServerDeps>) -> Self {
		DataApi { deps }
	}

	/// Run a single planned write in its own transaction.
	fn one_write(&self, plan: DataWritePlan) -> Result<(), Status> {
		let store = self.deps.manager.store();
		let txn = store
			.new_transaction(TxnParams::write())
			.map_err(internal)?;

		match apply_data_write(&self.deps, &txn, &plan) {
			Ok(()) => store.commit(txn).map(|_| ()).map_err(internal),
			Err(status) => {
				store.abort(txn);
				Err(status)
			}
		}
	}
}

#[tonic::async_trait]
impl DataService for DataApi {
	async fn create_data(
		&self,
		request: Request<CreateDataRequest>,
	) -> Result<Response<CreateDataResponse>, Status> {
		self.deps.begin("v1.CreateData", request.extensions())?;
		let plan = parse_data_write(DataWrite {
			write: Some(data_write::Write::Create(request.into_inner())),
		})?;
		self.one_write(plan)?;
		Ok(Response::new(CreateDataResponse {}))
	}

	async fn get_data(
		&self,
		request: Request<GetDataRequest>,
	) -> Result<Response<GetDataResponse>, Status> {
		self.deps.begin("v1.GetData", request.extensions())?;
		let peer = requested_by(request.remote_addr(), request.extensions());
		let message = request.into_inner();

		let input = decode_input(&message.input)?;
		let document = eval_data_read(&self.deps, &message.path, input, peer).await?;

		Ok(Response::new(GetDataResponse {
			result: Some(DataDocument {
				path: message.path,
				document: value::encode_opt(document.as_ref()),
			}),
		}))
	}

	async fn update_data(
		&self,
		request: Request<UpdateDataRequest>,
	) -> Result<Response<UpdateDataResponse>, Status> {
		self.deps.begin("v1.UpdateData", request.extensions())?;
		let plan = parse_data_write(DataWrite {
			write: Some(data_write::Write::Update(request.into_inner())),
		})?;
		self.one_write(plan)?;
		Ok(Response::new(UpdateDataResponse {}))
	}

	async fn delete_data(
		&self,
		request: Request<DeleteDataRequest>,
	) -> Result<Response<DeleteDataResponse>, Status> {
		self.deps.begin("v1.DeleteData", request.extensions())?;
		let plan = parse_data_write(DataWrite {
			write: Some(data_write::Write::Delete(request.into_inner())),
		})?;
		self.one_write(plan)?;
		Ok(Response::new(DeleteDataResponse {}))
	}

	type StreamingDataRWStream = ReceiverStream<Result<StreamingDataRwResponse, Status>>;

	async fn streaming_data_rw(
		&self,
		request: Request<Streaming<StreamingDataRwRequest>>,
	) -> Result<Response<Self::StreamingDataRWStream>, Status> {
		self.deps.begin("v1.StreamingDataRW", request.extensions())?;
		let peer = requested_by(request.remote_addr(), request.extensions());
		let mut frames = request.into_inner();

		let deps = Arc::clone(&self.deps);
		let (tx, rx) = mpsc::channel(16);

		// A single receive loop keeps frames in arrival order; each
		// frame produces exactly one ordered response.
		tokio::spawn(async move {
			loop {
				match frames.message().await {
					Ok(Some(frame)) => {
						let response = process_data_frame(&deps, frame, &peer).await;
						if tx.send(Ok(response)).await.is_err() {
							break;
						}
					}
					// Client half-closed: terminate cleanly.
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
