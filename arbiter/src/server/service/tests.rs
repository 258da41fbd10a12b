// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests over the service implementations, driven through
//! the tonic service traits without a network in between.

use crate::{
	decision::{
		batch::{Batch, BatchConfig},
		config::{BufferConfig, DecisionLogConfig, ExperimentalSinkConfig, Outputs, SinkConfig},
		retry::RetryPolicy,
		sink::{Delivery, Sink, SinkError},
		DecisionEvent, DecisionLogger,
	},
	engine::data::DataEngine,
	server::{cache::QueryCache, metrics::GrpcMetrics, service::*},
	store::{MemoryStore, StorePath},
	supervisor::{Labels, Manager},
};
use arbiter_common::{
	proto::{
		bulk::v1::{bulk_service_server::BulkService, BulkRwRequest},
		data::v1::{
			data_service_server::DataService, data_write, CreateDataRequest, DataDocument,
			DataRead, DataWrite, DeleteDataRequest, GetDataRequest, PatchOp,
			StreamingDataRwRequest, UpdateDataRequest,
		},
		policy::v1::{
			policy_service_server::PolicyService, policy_write, CreatePolicyRequest,
			GetPolicyRequest, ListPoliciesRequest, Policy, PolicyWrite, StreamingPolicyRwRequest,
		},
	},
	value,
};
use serde_json::{json, Value};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;
use tonic::{Code, Request};

use super::bulk::BulkApi;
use super::data::DataApi;
use super::policy::PolicyApi;

fn manager_with(data: Value) -> Arc<Manager> {
	let manager = Arc::new(Manager::new(
		Arc::new(MemoryStore::with_data(data)),
		Arc::new(DataEngine::new()),
		Labels::new("arbiterd", BTreeMap::new()),
	));
	manager.watch_policy_commits().unwrap();
	manager
}

fn deps_for(manager: &Arc<Manager>) -> Arc<ServerDeps> {
	Arc::new(ServerDeps {
		manager: Arc::clone(manager),
		cache: QueryCache::new(),
		logger: None,
		metrics: None,
		authz: None,
	})
}

fn doc(path: &str, value: Value) -> DataDocument {
	DataDocument {
		path: path.to_owned(),
		document: value::encode(&value),
	}
}

async fn get(api: &DataApi, path: &str) -> (String, Option<Value>) {
	let response = api
		.get_data(Request::new(GetDataRequest {
			path: path.to_owned(),
			input: String::new(),
		}))
		.await
		.unwrap()
		.into_inner();
	let result = response.result.unwrap();
	(result.path, value::decode_opt(&result.document).unwrap())
}

// Store starts with {"a": 27}; reading /a yields the number 27.
#[tokio::test]
async fn get_data_reads_existing_documents() {
	let manager = manager_with(json!({"a": 27}));
	let api = DataApi::new(deps_for(&manager));

	let (path, document) = get(&api, "/a").await;
	assert_eq!(path, "/a");
	assert_eq!(document, Some(json!(27)));
}

// Create, read, replace, read, delete, read-empty.
#[tokio::test]
async fn data_crud_round_trip() {
	let manager = manager_with(json!({}));
	let api = DataApi::new(deps_for(&manager));

	api.create_data(Request::new(CreateDataRequest {
		data: Some(doc("/a", json!(27))),
	}))
	.await
	.unwrap();
	assert_eq!(get(&api, "/a").await.1, Some(json!(27)));

	api.update_data(Request::new(UpdateDataRequest {
		data: Some(doc("/a", json!(4))),
		op: PatchOp::Replace as i32,
	}))
	.await
	.unwrap();
	assert_eq!(get(&api, "/a").await.1, Some(json!(4)));

	api.delete_data(Request::new(DeleteDataRequest {
		path: "/a".to_owned(),
	}))
	.await
	.unwrap();

	// A never-written (or deleted) path reads back as an empty
	// document that still names the path.
	let (path, document) = get(&api, "/a").await;
	assert_eq!(path, "/a");
	assert_eq!(document, None);
}

#[tokio::test]
async fn create_data_builds_missing_ancestors() {
	let manager = manager_with(json!({}));
	let api = DataApi::new(deps_for(&manager));

	api.create_data(Request::new(CreateDataRequest {
		data: Some(doc("/deep/nested/leaf", json!(1))),
	}))
	.await
	.unwrap();
	assert_eq!(get(&api, "/deep/nested/leaf").await.1, Some(json!(1)));
}

#[tokio::test]
async fn malformed_paths_are_invalid_argument() {
	let manager = manager_with(json!({}));
	let api = DataApi::new(deps_for(&manager));

	let status = api
		.create_data(Request::new(CreateDataRequest {
			data: Some(doc("/a//b", json!(1))),
		}))
		.await
		.unwrap_err();
	assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn bundle_rooted_paths_are_failed_precondition() {
	let manager = manager_with(json!({}));
	manager.set_bundle_roots("b1", vec![StorePath::parse("/bundle").unwrap()]);
	let api = DataApi::new(deps_for(&manager));

	let status = api
		.create_data(Request::new(CreateDataRequest {
			data: Some(doc("/bundle/x", json!(1))),
		}))
		.await
		.unwrap_err();
	assert_eq!(status.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn update_of_missing_parent_is_not_found() {
	let manager = manager_with(json!({}));
	let api = DataApi::new(deps_for(&manager));

	let status = api
		.update_data(Request::new(UpdateDataRequest {
			data: Some(doc("/no/such/parent", json!(1))),
			op: PatchOp::Replace as i32,
		}))
		.await
		.unwrap_err();
	assert_eq!(status.code(), Code::NotFound);
}

const MODULE_A: &str = "package a\n\nx { true }\ny { false }\n";

// Policies round-trip byte-for-byte.
#[tokio::test]
async fn policy_crud_round_trip() {
	let manager = manager_with(json!({}));
	let deps = deps_for(&manager);
	let api = PolicyApi::new(Arc::clone(&deps));

	api.create_policy(Request::new(CreatePolicyRequest {
		policy: Some(Policy {
			path: "/a".to_owned(),
			text: MODULE_A.to_owned(),
		}),
	}))
	.await
	.unwrap();

	let listed = api
		.list_policies(Request::new(ListPoliciesRequest {}))
		.await
		.unwrap()
		.into_inner()
		.policies;
	assert_eq!(listed.len(), 1);
	assert_eq!(listed[0].path, "/a");
	assert_eq!(listed[0].text, MODULE_A);

	let fetched = api
		.get_policy(Request::new(GetPolicyRequest {
			path: "/a".to_owned(),
		}))
		.await
		.unwrap()
		.into_inner()
		.policy
		.unwrap();
	assert_eq!(fetched.text, MODULE_A);
}

// Identical bytes fast-exit without recompiling or reinstalling.
#[tokio::test]
async fn create_policy_twice_is_a_noop() {
	let manager = manager_with(json!({}));
	let api = PolicyApi::new(deps_for(&manager));

	let request = || {
		Request::new(CreatePolicyRequest {
			policy: Some(Policy {
				path: "/a".to_owned(),
				text: MODULE_A.to_owned(),
			}),
		})
	};

	// The first create installs a new compiler snapshot through the
	// commit trigger.
	let before = manager.engine().snapshot_id();
	api.create_policy(request()).await.unwrap();
	let snapshot = manager.engine().snapshot_id();
	assert!(snapshot > before);

	// Identical bytes fast-exit: no store write, no recompilation.
	api.create_policy(request()).await.unwrap();
	assert_eq!(manager.engine().snapshot_id(), snapshot);
}

#[tokio::test]
async fn bad_policy_is_invalid_argument() {
	let manager = manager_with(json!({}));
	let api = PolicyApi::new(deps_for(&manager));

	let status = api
		.create_policy(Request::new(CreatePolicyRequest {
			policy: Some(Policy {
				path: "/bad".to_owned(),
				text: "not a module".to_owned(),
			}),
		}))
		.await
		.unwrap_err();
	assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn delete_missing_policy_is_not_found() {
	let manager = manager_with(json!({}));
	let api = PolicyApi::new(deps_for(&manager));

	let status = api
		.delete_policy(Request::new(
			arbiter_common::proto::policy::v1::DeletePolicyRequest {
				path: "/missing".to_owned(),
			},
		))
		.await
		.unwrap_err();
	assert_eq!(status.code(), Code::NotFound);
}

fn bulk_create(path: &str, value: Value) -> DataWrite {
	DataWrite {
		write: Some(data_write::Write::Create(CreateDataRequest {
			data: Some(doc(path, value)),
		})),
	}
}

fn bulk_read(path: &str) -> DataRead {
	DataRead {
		get: Some(GetDataRequest {
			path: path.to_owned(),
			input: String::new(),
		}),
	}
}

// Mixed bulk: policy + data writes apply in order in one transaction,
// then reads observe the committed state, responses in request order.
#[tokio::test]
async fn bulk_rw_applies_writes_then_reads_in_order() {
	let manager = manager_with(json!({}));

	// Rule outputs for the policy under test: x, y fixed; z summed
	// from data the same bulk call writes.
	let engine = DataEngine::new();
	engine.add_const_rule("data.test.x", json!(true));
	engine.add_const_rule("data.test.y", json!(false));
	engine.add_rule("data.test.z", |_, read| {
		let lookup = |raw: &str| {
			read(&StorePath::parse(raw).unwrap())
				.and_then(|v| v.as_i64())
				.unwrap_or(0)
		};
		Ok(Some(json!(lookup("/a") + lookup("/b/c") + lookup("/b/d"))))
	});
	let manager = Arc::new(Manager::new(
		Arc::clone(manager.store()),
		Arc::new(engine),
		Labels::new("arbiterd", BTreeMap::new()),
	));
	manager.watch_policy_commits().unwrap();
	let api = BulkApi::new(deps_for(&manager));

	let response = api
		.bulk_rw(Request::new(BulkRwRequest {
			writes_policy: vec![PolicyWrite {
				write: Some(policy_write::Write::Create(CreatePolicyRequest {
					policy: Some(Policy {
						path: "/test".to_owned(),
						text: "package test\n\nx { true }\n".to_owned(),
					}),
				})),
			}],
			writes_data: vec![
				bulk_create("/a", json!(27)),
				bulk_create("/b", json!({"c": 1, "d": 2, "e": 3})),
				DataWrite {
					write: Some(data_write::Write::Update(UpdateDataRequest {
						data: Some(doc("/b/d", json!(10))),
						op: PatchOp::Replace as i32,
					})),
				},
			],
			reads_data: vec![
				bulk_read("/test/x"),
				bulk_read("/test/y"),
				bulk_read("/test/z"),
			],
			reads_policy: vec![],
		}))
		.await
		.unwrap()
		.into_inner();

	assert_eq!(response.writes_policy.len(), 1);
	assert!(response.writes_policy[0].error.is_empty());
	assert_eq!(response.writes_data.len(), 3);
	assert!(response.writes_data.iter().all(|w| w.error.is_empty()));

	let read_values: Vec<Option<Value>> = response
		.reads_data
		.into_iter()
		.map(|r| {
			assert!(r.error.is_empty());
			value::decode_opt(&r.get.unwrap().result.unwrap().document).unwrap()
		})
		.collect();
	assert_eq!(
		read_values,
		vec![
			Some(json!(true)),
			Some(json!(false)),
			Some(json!(27 + 1 + 10))
		]
	);
}

// A failing write rolls back every write in the call, and the call
// fails with the first error.
#[tokio::test]
async fn bulk_rw_write_failure_rolls_everything_back() {
	let manager = manager_with(json!({}));
	let deps = deps_for(&manager);
	let bulk = BulkApi::new(Arc::clone(&deps));
	let data = DataApi::new(deps);

	let status = bulk
		.bulk_rw(Request::new(BulkRwRequest {
			writes_policy: vec![],
			writes_data: vec![
				bulk_create("/a", json!(27)),
				DataWrite {
					write: Some(data_write::Write::Delete(DeleteDataRequest {
						path: "/b".to_owned(),
					})),
				},
			],
			reads_data: vec![],
			reads_policy: vec![],
		}))
		.await
		.unwrap_err();
	assert_eq!(status.code(), Code::NotFound);

	// The create of /a did not survive the rollback.
	assert_eq!(get(&data, "/a").await.1, None);
}

// Read failures inside bulk are inline, not call failures.
#[tokio::test]
async fn bulk_read_failures_are_inline() {
	let manager = manager_with(json!({"a": 1}));
	let api = BulkApi::new(deps_for(&manager));

	let response = api
		.bulk_rw(Request::new(BulkRwRequest {
			writes_policy: vec![],
			writes_data: vec![],
			reads_data: vec![bulk_read("/a"), bulk_read("/bad//path"), bulk_read("/a")],
			reads_policy: vec![],
		}))
		.await
		.unwrap()
		.into_inner();

	assert!(response.reads_data[0].error.is_empty());
	assert!(!response.reads_data[1].error.is_empty());
	assert!(response.reads_data[2].error.is_empty());
}

// One streaming frame: writes share a transaction, responses keep
// request order.
#[tokio::test]
async fn data_frame_processing_preserves_order() {
	let manager = manager_with(json!({}));
	let deps = deps_for(&manager);

	let response = process_data_frame(
		&deps,
		StreamingDataRwRequest {
			writes: vec![
				bulk_create("/x", json!(1)),
				bulk_create("/y", json!(2)),
			],
			reads: vec![bulk_read("/x"), bulk_read("/y"), bulk_read("/missing")],
		},
		"",
	)
	.await;

	assert_eq!(response.writes.len(), 2);
	assert!(response.writes.iter().all(|w| w.error.is_empty()));

	let values: Vec<Option<Value>> = response
		.reads
		.iter()
		.map(|r| {
			r.get
				.as_ref()
				.and_then(|g| g.result.as_ref())
				.and_then(|d| value::decode_opt(&d.document).unwrap())
		})
		.collect();
	assert_eq!(values, vec![Some(json!(1)), Some(json!(2)), None]);
}

#[tokio::test]
async fn data_frame_write_failure_aborts_the_frame() {
	let manager = manager_with(json!({}));
	let deps = deps_for(&manager);

	let response = process_data_frame(
		&deps,
		StreamingDataRwRequest {
			writes: vec![
				bulk_create("/x", json!(1)),
				DataWrite {
					write: Some(data_write::Write::Delete(DeleteDataRequest {
						path: "/missing".to_owned(),
					})),
				},
			],
			reads: vec![bulk_read("/x")],
		},
		"",
	)
	.await;

	assert_eq!(response.writes[0].error, "transaction aborted");
	assert!(!response.writes[1].error.is_empty());
	assert_ne!(response.writes[1].error, "transaction aborted");

	// The aborted write is not visible to the frame's reads.
	assert!(response.reads[0]
		.get
		.as_ref()
		.and_then(|g| g.result.as_ref())
		.and_then(|d| value::decode_opt(&d.document).unwrap())
		.is_none());
}

// A mid-stream policy compile failure lands in the per-write error
// slot; the frame (and stream) survive it.
#[tokio::test]
async fn policy_frame_reports_compile_failures_per_slot() {
	let manager = manager_with(json!({}));
	let deps = deps_for(&manager);

	let response = super::policy::process_policy_frame(
		&deps,
		StreamingPolicyRwRequest {
			writes: vec![PolicyWrite {
				write: Some(policy_write::Write::Create(CreatePolicyRequest {
					policy: Some(Policy {
						path: "/bad".to_owned(),
						text: "definitely not a module".to_owned(),
					}),
				})),
			}],
			reads: vec![],
		},
	)
	.await;

	assert_eq!(response.writes.len(), 1);
	assert!(!response.writes[0].error.is_empty());
}

// Any compiler trigger invalidates every cached prepared query before
// later reads return.
#[tokio::test]
async fn compiler_trigger_clears_the_query_cache() {
	let manager = manager_with(json!({"a": 27}));
	let deps = deps_for(&manager);
	let cache_deps = Arc::clone(&deps);
	manager.register_compiler_trigger(move || cache_deps.cache.clear());

	let api = DataApi::new(Arc::clone(&deps));
	let _ = get(&api, "/a").await;
	assert_eq!(deps.cache.len(), 1);

	manager.compiler_changed();
	assert!(deps.cache.is_empty());

	let _ = get(&api, "/a").await;
	assert_eq!(deps.cache.len(), 1);
}

#[tokio::test]
async fn request_counters_track_methods() {
	let manager = manager_with(json!({"a": 1}));
	let deps = Arc::new(ServerDeps {
		manager: Arc::clone(&manager),
		cache: QueryCache::new(),
		logger: None,
		metrics: Some(GrpcMetrics::new(None)),
		authz: None,
	});
	let api = DataApi::new(Arc::clone(&deps));

	let _ = get(&api, "/a").await;
	let _ = get(&api, "/a").await;
	assert_eq!(deps.metrics.as_ref().unwrap().count("v1.GetData"), 2);
}

/// A sink that forwards delivered events to a channel, so tests can
/// observe exactly what reached the output.
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
				batch: BatchConfig::default(),
				retry: RetryPolicy::default(),
				tx: tx.clone(),
			}) as Arc<dyn Sink>)
		}),
	);
	(Arc::new(logger), rx)
}

fn unbuffered_config(drop_path: &str, mask_path: &str) -> DecisionLogConfig {
	DecisionLogConfig {
		drop_decision: drop_path.to_owned(),
		mask_decision: mask_path.to_owned(),
		buffer: BufferConfig::Unbuffered,
		output: Outputs::One(Box::new(SinkConfig::Experimental(ExperimentalSinkConfig {
			name: "capture".to_owned(),
			config: Value::Null,
		}))),
	}
}

// GetData emits one decision event per request; unbuffered delivery
// returns only after the sink accepted it.
#[tokio::test]
async fn get_data_emits_decision_events() {
	let manager = manager_with(json!({"a": 27}));
	let (logger, mut events) = capture_logger(&manager);
	logger
		.start(unbuffered_config("/system/log/drop", "/system/log/mask"))
		.await
		.unwrap();

	let deps = Arc::new(ServerDeps {
		manager: Arc::clone(&manager),
		cache: QueryCache::new(),
		logger: Some(Arc::clone(&logger)),
		metrics: None,
		authz: None,
	});
	let api = DataApi::new(deps);

	let _ = get(&api, "/a").await;

	let event = events.try_recv().unwrap();
	assert_eq!(event.path, "/a");
	assert_eq!(event.result, Some(json!(27)));
	assert!(!event.decision_id.is_empty());

	logger.stop().await;
}

// The drop and mask processors sit between the request path and the
// sink.
#[tokio::test]
async fn decision_events_are_masked_before_delivery() {
	let manager = manager_with(json!({
		"a": {"b": 1},
		"system": {"log": {"mask": [{"op": "upsert", "path": "/result", "value": "***"}]}}
	}));
	let (logger, mut events) = capture_logger(&manager);
	logger
		.start(unbuffered_config("/system/log/drop", "/system/log/mask"))
		.await
		.unwrap();

	let deps = Arc::new(ServerDeps {
		manager: Arc::clone(&manager),
		cache: QueryCache::new(),
		logger: Some(Arc::clone(&logger)),
		metrics: None,
		authz: None,
	});
	let api = DataApi::new(deps);

	let _ = get(&api, "/a/b").await;

	let event = events.try_recv().unwrap();
	assert_eq!(event.result, Some(json!("***")));
	assert_eq!(event.masked, vec!["/result"]);

	logger.stop().await;
}

#[tokio::test]
async fn dropped_decisions_reach_no_sink() {
	let manager = manager_with(json!({
		"a": 1,
		"system": {"log": {"drop": true}}
	}));
	let (logger, mut events) = capture_logger(&manager);
	logger
		.start(unbuffered_config("/system/log/drop", "/system/log/mask"))
		.await
		.unwrap();

	let deps = Arc::new(ServerDeps {
		manager: Arc::clone(&manager),
		cache: QueryCache::new(),
		logger: Some(Arc::clone(&logger)),
		metrics: None,
		authz: None,
	});
	let api = DataApi::new(deps);

	let _ = get(&api, "/a").await;
	assert!(events.try_recv().is_err());

	logger.stop().await;
}
