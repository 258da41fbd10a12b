// SPDX-License-Identifier: Apache-2.0

//! The evaluator contract.
//!
//! The policy compiler and evaluator are external collaborators; the
//! service surfaces reach them through this narrow interface: parse a
//! module, compile a module set, prepare a query over a reference given
//! a transaction, evaluate a prepared query with an input. The crate
//! ships [`data::DataEngine`], which resolves plain `data.<path>`
//! references; a full evaluator plugs in behind the same traits.

pub mod data;

use crate::store::{Store, StorePath, Txn};
use serde_json::{Map, Value};
use std::{
	collections::BTreeMap,
	sync::{Arc, Mutex},
	time::Duration,
};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
	// Compiler error text is preserved verbatim for the RPC surface.
	#[error("{0}")]
	Parse(String),

	#[error("{0}")]
	Compile(String),

	#[error("evaluation failed: {0}")]
	Eval(String),
}

/// The outcome of parsing a single module: its package path, used for
/// bundle-scope checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedModule {
	pub package_path: StorePath,
}

/// Options inherited from the supervisor when preparing a query.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrepareOpts {
	pub enable_print: bool,
}

/// Parameters for a single evaluation.
#[derive(Default)]
pub struct EvalParams<'a> {
	pub input: Option<&'a Value>,
	pub metrics: Option<&'a EvalMetrics>,
	pub inter_query_cache: Option<&'a InterQueryCache>,
	pub nd_cache: Option<&'a NdBuiltinCache>,
}

/// The values of the first expression across all query results. Empty
/// means the query is undefined.
pub type ResultSet = Vec<Value>;

/// A compiled query over one compiler snapshot, reusable across
/// evaluations with different inputs.
pub trait PreparedQuery: Send + Sync {
	fn eval(
		&self,
		store: &dyn Store,
		txn: &Txn,
		params: EvalParams<'_>,
	) -> Result<ResultSet, EngineError>;
}

/// The compiler/evaluator handle.
pub trait PolicyEngine: Send + Sync {
	/// Identity of the current compiler snapshot. Increases whenever a
	/// new module set is installed.
	fn snapshot_id(&self) -> u64;

	fn parse_module(&self, id: &str, text: &str) -> Result<ParsedModule, EngineError>;

	/// Compile a full module set, with path-conflict checks. Does not
	/// install anything.
	fn compile(&self, modules: &BTreeMap<String, String>) -> Result<(), EngineError>;

	/// Install a compiled module set as the new snapshot. Callers
	/// compile first; install itself cannot fail.
	fn install(&self, modules: BTreeMap<String, String>);

	fn prepare(
		&self,
		query: &str,
		store: &dyn Store,
		txn: &Txn,
		opts: PrepareOpts,
	) -> Result<Arc<dyn PreparedQuery>, EngineError>;
}

/// Process-wide cache for idempotent builtin results across queries.
/// Cleared wholesale on any compiler trigger.
#[derive(Default)]
pub struct InterQueryCache {
	entries: Mutex<BTreeMap<String, Value>>,
}

impl InterQueryCache {
	pub fn new() -> Self {
		InterQueryCache::default()
	}

	pub fn get(&self, key: &str) -> Option<Value> {
		self.entries.lock().expect("cache lock poisoned").get(key).cloned()
	}

	pub fn insert(&self, key: String, value: Value) {
		self.entries
			.lock()
			.expect("cache lock poisoned")
			.insert(key, value);
	}

	pub fn clear(&self) {
		self.entries.lock().expect("cache lock poisoned").clear();
	}

	pub fn len(&self) -> usize {
		self.entries.lock().expect("cache lock poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Per-request cache of non-deterministic builtin results, captured for
/// decision-log reproducibility.
#[derive(Default)]
pub struct NdBuiltinCache {
	entries: Mutex<Map<String, Value>>,
}

impl NdBuiltinCache {
	pub fn new() -> Self {
		NdBuiltinCache::default()
	}

	pub fn insert(&self, key: String, value: Value) {
		self.entries
			.lock()
			.expect("cache lock poisoned")
			.insert(key, value);
	}

	/// The cache contents as a document, or `None` when nothing was
	/// recorded.
	pub fn as_value(&self) -> Option<Value> {
		let entries = self.entries.lock().expect("cache lock poisoned");
		if entries.is_empty() {
			return None;
		}
		Some(Value::Object(entries.clone()))
	}
}

/// Evaluation timings keyed by stage name, reported on decision events.
#[derive(Default)]
pub struct EvalMetrics {
	timers: Mutex<BTreeMap<String, u64>>,
}

impl EvalMetrics {
	pub fn new() -> Self {
		EvalMetrics::default()
	}

	pub fn observe(&self, name: &str, elapsed: Duration) {
		self.timers
			.lock()
			.expect("metrics lock poisoned")
			.insert(format!("timer_{}_ns", name), elapsed.as_nanos() as u64);
	}

	pub fn snapshot(&self) -> BTreeMap<String, Value> {
		self.timers
			.lock()
			.expect("metrics lock poisoned")
			.iter()
			.map(|(k, v)| (k.clone(), Value::from(*v)))
			.collect()
	}
}
