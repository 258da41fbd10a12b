// SPDX-License-Identifier: Apache-2.0

//! A minimal evaluator resolving plain `data.<path>` references.
//!
//! This engine answers queries by reading the store document at the
//! referenced path, which is exactly what the service surfaces need
//! when no rule evaluation is involved. Named rule outputs can be
//! registered programmatically, which is how tests exercise the
//! request paths without a full compiler.

use crate::{
	engine::{
		EngineError, EvalParams, ParsedModule, PolicyEngine, PrepareOpts, PreparedQuery, ResultSet,
	},
	store::{Store, StoreError, StorePath, Txn},
};
use serde_json::Value;
use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
};

/// A registered rule body: receives the evaluation input and a data
/// reader, returns the rule value or `None` for undefined.
pub type RuleFn = Arc<
	dyn Fn(Option<&Value>, &dyn Fn(&StorePath) -> Option<Value>) -> Result<Option<Value>, EngineError>
		+ Send
		+ Sync,
>;

pub struct DataEngine {
	snapshot: AtomicU64,
	modules: Mutex<BTreeMap<String, String>>,
	rules: Mutex<BTreeMap<String, RuleFn>>,
}

impl DataEngine {
	pub fn new() -> Self {
		DataEngine {
			snapshot: AtomicU64::new(1),
			modules: Mutex::new(BTreeMap::new()),
			rules: Mutex::new(BTreeMap::new()),
		}
	}

	/// Register a rule body for a dotted reference like `data.test.x`.
	pub fn add_rule<F>(&self, reference: &str, body: F)
	where
		F: Fn(
				Option<&Value>,
				&dyn Fn(&StorePath) -> Option<Value>,
			) -> Result<Option<Value>, EngineError>
			+ Send
			+ Sync
			+ 'static,
	{
		self.rules
			.lock()
			.expect("rules lock poisoned")
			.insert(reference.to_owned(), Arc::new(body));
	}

	/// Register a rule that always yields a fixed value.
	pub fn add_const_rule(&self, reference: &str, value: Value) {
		self.add_rule(reference, move |_, _| Ok(Some(value.clone())));
	}
}

impl Default for DataEngine {
	fn default() -> Self {
		DataEngine::new()
	}
}

impl PolicyEngine for DataEngine {
	fn snapshot_id(&self) -> u64 {
		self.snapshot.load(Ordering::SeqCst)
	}

	fn parse_module(&self, id: &str, text: &str) -> Result<ParsedModule, EngineError> {
		for line in text.lines() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}
			let Some(rest) = line.strip_prefix("package ") else {
				return Err(EngineError::Parse(format!(
					"{}: expected package declaration, found {:?}",
					id, line
				)));
			};
			let dotted = rest.trim();
			if dotted.is_empty() || dotted.split('.').any(|s| s.is_empty()) {
				return Err(EngineError::Parse(format!(
					"{}: malformed package path {:?}",
					id, dotted
				)));
			}
			return Ok(ParsedModule {
				package_path: StorePath::from_segments(dotted.split('.')),
			});
		}
		Err(EngineError::Parse(format!("{}: empty module", id)))
	}

	fn compile(&self, modules: &BTreeMap<String, String>) -> Result<(), EngineError> {
		for (id, text) in modules {
			self.parse_module(id, text)
				.map_err(|e| EngineError::Compile(e.to_string()))?;
		}
		Ok(())
	}

	fn install(&self, modules: BTreeMap<String, String>) {
		*self.modules.lock().expect("modules lock poisoned") = modules;
		self.snapshot.fetch_add(1, Ordering::SeqCst);
	}

	fn prepare(
		&self,
		query: &str,
		_store: &dyn Store,
		_txn: &Txn,
		_opts: PrepareOpts,
	) -> Result<Arc<dyn PreparedQuery>, EngineError> {
		let path = if query == "data" {
			StorePath::root()
		} else {
			let Some(dotted) = query.strip_prefix("data.") else {
				return Err(EngineError::Parse(format!(
					"unsupported query reference {:?}",
					query
				)));
			};
			if dotted.is_empty() || dotted.split('.').any(|s| s.is_empty()) {
				return Err(EngineError::Parse(format!(
					"malformed query reference {:?}",
					query
				)));
			}
			StorePath::from_segments(dotted.split('.'))
		};

		let rule = self
			.rules
			.lock()
			.expect("rules lock poisoned")
			.get(query)
			.cloned();

		Ok(Arc::new(PreparedDataQuery {
			path,
			rule,
			snapshot: self.snapshot_id(),
		}))
	}
}

struct PreparedDataQuery {
	path: StorePath,
	rule: Option<RuleFn>,
	#[allow(dead_code)]
	snapshot: u64,
}

impl PreparedQuery for PreparedDataQuery {
	fn eval(
		&self,
		store: &dyn Store,
		txn: &Txn,
		params: EvalParams<'_>,
	) -> Result<ResultSet, EngineError> {
		if let Some(rule) = &self.rule {
			let reader = |path: &StorePath| store.read(txn, path).ok();
			return match rule(params.input, &reader)? {
				Some(value) => Ok(vec![value]),
				None => Ok(Vec::new()),
			};
		}

		match store.read(txn, &self.path) {
			Ok(value) => Ok(vec![value]),
			Err(err) if err.is_not_found() => Ok(Vec::new()),
			Err(err) => Err(EngineError::Eval(err.to_string())),
		}
	}
}

// StoreError only reaches callers through EngineError::Eval text, but
// keep the conversion for prepare-time plumbing.
impl From<StoreError> for EngineError {
	fn from(err: StoreError) -> Self {
		EngineError::Eval(err.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::{MemoryStore, TxnParams};
	use serde_json::json;

	#[test]
	fn resolves_data_references() {
		let store = MemoryStore::with_data(json!({"a": 27}));
		let engine = DataEngine::new();

		let txn = store.new_transaction(TxnParams::read()).unwrap();
		let query = engine
			.prepare("data.a", &store, &txn, PrepareOpts::default())
			.unwrap();
		let results = query.eval(&store, &txn, EvalParams::default()).unwrap();
		assert_eq!(results, vec![json!(27)]);
		store.abort(txn);
	}

	#[test]
	fn missing_paths_are_undefined() {
		let store = MemoryStore::new();
		let engine = DataEngine::new();

		let txn = store.new_transaction(TxnParams::read()).unwrap();
		let query = engine
			.prepare("data.nope", &store, &txn, PrepareOpts::default())
			.unwrap();
		assert!(query
			.eval(&store, &txn, EvalParams::default())
			.unwrap()
			.is_empty());
		store.abort(txn);
	}

	#[test]
	fn registered_rules_take_precedence() {
		let store = MemoryStore::with_data(json!({"a": 2, "b": 3}));
		let engine = DataEngine::new();
		engine.add_rule("data.test.sum", |_, read| {
			let a = read(&StorePath::parse("/a").unwrap()).unwrap();
			let b = read(&StorePath::parse("/b").unwrap()).unwrap();
			Ok(Some(json!(a.as_i64().unwrap() + b.as_i64().unwrap())))
		});

		let txn = store.new_transaction(TxnParams::read()).unwrap();
		let query = engine
			.prepare("data.test.sum", &store, &txn, PrepareOpts::default())
			.unwrap();
		let results = query.eval(&store, &txn, EvalParams::default()).unwrap();
		assert_eq!(results, vec![json!(5)]);
		store.abort(txn);
	}

	#[test]
	fn parse_module_extracts_package() {
		let engine = DataEngine::new();
		let module = engine
			.parse_module("/a", "# comment\n\npackage a.b\n\nx { true }\n")
			.unwrap();
		assert_eq!(module.package_path, StorePath::parse("/a/b").unwrap());

		assert!(engine.parse_module("/a", "rule { true }").is_err());
		assert!(engine.parse_module("/a", "").is_err());
	}

	#[test]
	fn install_bumps_snapshot() {
		let engine = DataEngine::new();
		let before = engine.snapshot_id();
		engine.install(BTreeMap::new());
		assert!(engine.snapshot_id() > before);
	}
}
