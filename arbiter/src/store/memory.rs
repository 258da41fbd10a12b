// SPDX-License-Identifier: Apache-2.0

//! In-memory store with MVCC-flavored transactions.
//!
//! Reads run against an `Arc` snapshot taken at open, so they hold no
//! locks and never observe partial writes. Write transactions buffer
//! into a working copy; the first committer wins and later conflicting
//! commits fail.

use crate::store::{
	OnCommit, Store, StoreError, StorePath, TriggerHandle, Txn, TxnContext, TxnParams, TxnSummary,
	WriteOp,
};
use serde_json::{Map, Value};
use std::{
	collections::{BTreeMap, HashMap},
	sync::{Arc, Mutex},
};

pub struct MemoryStore {
	inner: Mutex<Inner>,
}

struct Inner {
	version: u64,
	data: Arc<Value>,
	policies: Arc<BTreeMap<String, Vec<u8>>>,
	owners: Vec<(StorePath, String)>,
	txns: HashMap<u64, TxnState>,
	next_txn_id: u64,
	next_trigger_id: u64,
	triggers: BTreeMap<u64, OnCommit>,
}

struct TxnState {
	write: bool,
	context: TxnContext,
	base_version: u64,
	snapshot_data: Arc<Value>,
	snapshot_policies: Arc<BTreeMap<String, Vec<u8>>>,
	working_data: Option<Value>,
	working_policies: Option<BTreeMap<String, Vec<u8>>>,
	claims: Vec<(StorePath, String)>,
	data_changed: bool,
	policy_changed: bool,
}

impl MemoryStore {
	pub fn new() -> Self {
		MemoryStore::with_data(Value::Object(Map::new()))
	}

	/// Create a store pre-seeded with a data document. The root must be
	/// an object.
	pub fn with_data(data: Value) -> Self {
		debug_assert!(data.is_object());
		MemoryStore {
			inner: Mutex::new(Inner {
				version: 0,
				data: Arc::new(data),
				policies: Arc::new(BTreeMap::new()),
				owners: Vec::new(),
				txns: HashMap::new(),
				next_txn_id: 0,
				next_trigger_id: 0,
				triggers: BTreeMap::new(),
			}),
		}
	}

	/// Seed a policy module outside any transaction. Intended for
	/// bring-up and tests.
	pub fn seed_policy(&self, id: &str, text: &[u8]) {
		let mut inner = self.inner.lock().expect("store lock poisoned");
		let mut policies = (*inner.policies).clone();
		policies.insert(id.to_owned(), text.to_vec());
		inner.policies = Arc::new(policies);
	}
}

impl Default for MemoryStore {
	fn default() -> Self {
		MemoryStore::new()
	}
}

impl Inner {
	fn txn_state(&self, txn: &Txn) -> Result<&TxnState, StoreError> {
		self.txns
			.get(&txn.id())
			.ok_or(StoreError::UnknownTransaction(txn.id()))
	}

	fn txn_state_mut(&mut self, txn: &Txn) -> Result<&mut TxnState, StoreError> {
		self.txns
			.get_mut(&txn.id())
			.ok_or(StoreError::UnknownTransaction(txn.id()))
	}

	/// Find the ownership claim covering `path`, if any. Claims pending
	/// in the writing transaction are honored alongside committed ones.
	fn owner_of(&self, state: &TxnState, path: &StorePath) -> Option<(StorePath, String)> {
		self.owners
			.iter()
			.chain(state.claims.iter())
			.find(|(root, _)| path.starts_with(root))
			.cloned()
	}

	fn check_ownership(&self, state: &TxnState, path: &StorePath) -> Result<(), StoreError> {
		if let Some((root, owner)) = self.owner_of(state, path) {
			if state.context.owner.as_deref() != Some(owner.as_str()) {
				return Err(StoreError::OwnedPath {
					path: root.to_string(),
					owner,
				});
			}
		}
		Ok(())
	}
}

impl Store for MemoryStore {
	fn new_transaction(&self, params: TxnParams) -> Result<Txn, StoreError> {
		let mut inner = self.inner.lock().expect("store lock poisoned");
		let id = inner.next_txn_id;
		inner.next_txn_id += 1;

		let state = TxnState {
			write: params.write,
			context: params.context,
			base_version: inner.version,
			snapshot_data: Arc::clone(&inner.data),
			snapshot_policies: Arc::clone(&inner.policies),
			working_data: None,
			working_policies: None,
			claims: Vec::new(),
			data_changed: false,
			policy_changed: false,
		};
		inner.txns.insert(id, state);

		Ok(Txn::new(id, params.write))
	}

	fn commit(&self, txn: Txn) -> Result<TxnSummary, StoreError> {
		let (summary, triggers) = {
			let mut inner = self.inner.lock().expect("store lock poisoned");
			let state = inner
				.txns
				.remove(&txn.id())
				.ok_or(StoreError::UnknownTransaction(txn.id()))?;

			if !state.write {
				return Ok(TxnSummary::default());
			}

			let changed = state.data_changed || state.policy_changed;
			if changed && inner.version != state.base_version {
				return Err(StoreError::Conflict(txn.id()));
			}

			if let Some(data) = state.working_data {
				inner.data = Arc::new(data);
			}
			if let Some(policies) = state.working_policies {
				inner.policies = Arc::new(policies);
			}
			inner.owners.extend(state.claims);
			if changed {
				inner.version += 1;
			}

			let summary = TxnSummary {
				data_changed: state.data_changed,
				policy_changed: state.policy_changed,
			};
			let triggers: Vec<OnCommit> = inner.triggers.values().cloned().collect();
			(summary, triggers)
		};

		// Triggers run outside the lock so they may open new
		// transactions against the committed state.
		for trigger in triggers {
			trigger(&summary);
		}

		Ok(summary)
	}

	fn abort(&self, txn: Txn) {
		let mut inner = self.inner.lock().expect("store lock poisoned");
		inner.txns.remove(&txn.id());
	}

	fn read(&self, txn: &Txn, path: &StorePath) -> Result<Value, StoreError> {
		let inner = self.inner.lock().expect("store lock poisoned");
		let state = inner.txn_state(txn)?;
		let root = state
			.working_data
			.as_ref()
			.unwrap_or_else(|| state.snapshot_data.as_ref());
		lookup(root, path).cloned()
	}

	fn write(
		&self,
		txn: &Txn,
		op: WriteOp,
		path: &StorePath,
		doc: Value,
	) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().expect("store lock poisoned");
		{
			let state = inner.txn_state(txn)?;
			if !state.write {
				return Err(StoreError::ReadOnly(txn.id()));
			}
			inner.check_ownership(state, path)?;
		}

		let state = inner.txn_state_mut(txn)?;
		if state.working_data.is_none() {
			state.working_data = Some((*state.snapshot_data).clone());
		}
		let root = state.working_data.as_mut().expect("working copy exists");
		apply_patch(root, op, path, doc)?;
		state.data_changed = true;
		Ok(())
	}

	fn make_dir(&self, txn: &Txn, path: &StorePath) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().expect("store lock poisoned");
		{
			let state = inner.txn_state(txn)?;
			if !state.write {
				return Err(StoreError::ReadOnly(txn.id()));
			}
			inner.check_ownership(state, path)?;
		}

		let state = inner.txn_state_mut(txn)?;
		if state.working_data.is_none() {
			state.working_data = Some((*state.snapshot_data).clone());
		}
		let root = state.working_data.as_mut().expect("working copy exists");

		let mut node = root;
		for segment in path.segments() {
			let obj = node.as_object_mut().ok_or_else(|| StoreError::InvalidWrite {
				path: path.clone(),
				reason: "intermediate value is not an object".to_owned(),
			})?;
			if !obj.contains_key(segment) {
				obj.insert(segment.clone(), Value::Object(Map::new()));
				state.data_changed = true;
			}
			node = obj.get_mut(segment).expect("segment just ensured");
			if !node.is_object() {
				return Err(StoreError::InvalidWrite {
					path: path.clone(),
					reason: format!("segment \"{}\" is not an object", segment),
				});
			}
		}

		// An owner context claims the subtree it created.
		if let Some(owner) = state.context.owner.clone() {
			let already = state.claims.iter().any(|(root, _)| root == path);
			if !already {
				state.claims.push((path.clone(), owner));
			}
		}

		Ok(())
	}

	fn list_policies(&self, txn: &Txn) -> Result<Vec<String>, StoreError> {
		let inner = self.inner.lock().expect("store lock poisoned");
		let state = inner.txn_state(txn)?;
		let policies = state
			.working_policies
			.as_ref()
			.unwrap_or_else(|| state.snapshot_policies.as_ref());
		Ok(policies.keys().cloned().collect())
	}

	fn get_policy(&self, txn: &Txn, id: &str) -> Result<Vec<u8>, StoreError> {
		let inner = self.inner.lock().expect("store lock poisoned");
		let state = inner.txn_state(txn)?;
		let policies = state
			.working_policies
			.as_ref()
			.unwrap_or_else(|| state.snapshot_policies.as_ref());
		policies
			.get(id)
			.cloned()
			.ok_or_else(|| StoreError::PolicyNotFound(id.to_owned()))
	}

	fn upsert_policy(&self, txn: &Txn, id: &str, text: Vec<u8>) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().expect("store lock poisoned");
		let state = inner.txn_state_mut(txn)?;
		if !state.write {
			return Err(StoreError::ReadOnly(txn.id()));
		}
		if state.working_policies.is_none() {
			state.working_policies = Some((*state.snapshot_policies).clone());
		}
		state
			.working_policies
			.as_mut()
			.expect("working copy exists")
			.insert(id.to_owned(), text);
		state.policy_changed = true;
		Ok(())
	}

	fn delete_policy(&self, txn: &Txn, id: &str) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().expect("store lock poisoned");
		let state = inner.txn_state_mut(txn)?;
		if !state.write {
			return Err(StoreError::ReadOnly(txn.id()));
		}
		if state.working_policies.is_none() {
			state.working_policies = Some((*state.snapshot_policies).clone());
		}
		let removed = state
			.working_policies
			.as_mut()
			.expect("working copy exists")
			.remove(id);
		if removed.is_none() {
			return Err(StoreError::PolicyNotFound(id.to_owned()));
		}
		state.policy_changed = true;
		Ok(())
	}

	fn register_trigger(
		&self,
		txn: &Txn,
		on_commit: OnCommit,
	) -> Result<TriggerHandle, StoreError> {
		let mut inner = self.inner.lock().expect("store lock poisoned");
		let state = inner.txn_state(txn)?;
		if !state.write {
			return Err(StoreError::ReadOnly(txn.id()));
		}
		let id = inner.next_trigger_id;
		inner.next_trigger_id += 1;
		inner.triggers.insert(id, on_commit);
		Ok(TriggerHandle(id))
	}

	fn unregister_trigger(&self, txn: &Txn, handle: TriggerHandle) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().expect("store lock poisoned");
		let state = inner.txn_state(txn)?;
		if !state.write {
			return Err(StoreError::ReadOnly(txn.id()));
		}
		inner.triggers.remove(&handle.0);
		Ok(())
	}
}

/// Resolve a path against a document. Objects index by key, arrays by
/// numeric segment.
fn lookup<'v>(root: &'v Value, path: &StorePath) -> Result<&'v Value, StoreError> {
	let mut node = root;
	for segment in path.segments() {
		node = match node {
			Value::Object(map) => map
				.get(segment)
				.ok_or_else(|| StoreError::NotFound(path.clone()))?,
			Value::Array(items) => {
				let index: usize = segment
					.parse()
					.map_err(|_| StoreError::NotFound(path.clone()))?;
				items
					.get(index)
					.ok_or_else(|| StoreError::NotFound(path.clone()))?
			}
			_ => return Err(StoreError::NotFound(path.clone())),
		};
	}
	Ok(node)
}

fn apply_patch(
	root: &mut Value,
	op: WriteOp,
	path: &StorePath,
	doc: Value,
) -> Result<(), StoreError> {
	let Some((parent_path, last)) = path.split_last() else {
		// Writing the root document.
		return match op {
			WriteOp::Add | WriteOp::Replace => {
				if !doc.is_object() {
					return Err(StoreError::InvalidWrite {
						path: path.clone(),
						reason: "root document must be an object".to_owned(),
					});
				}
				*root = doc;
				Ok(())
			}
			WriteOp::Remove => Err(StoreError::InvalidWrite {
				path: path.clone(),
				reason: "cannot remove the root document".to_owned(),
			}),
		};
	};

	let mut parent = root;
	for segment in parent_path.segments() {
		parent = match parent {
			Value::Object(map) => map
				.get_mut(segment)
				.ok_or_else(|| StoreError::NotFound(path.clone()))?,
			Value::Array(items) => {
				let index: usize = segment
					.parse()
					.map_err(|_| StoreError::NotFound(path.clone()))?;
				items
					.get_mut(index)
					.ok_or_else(|| StoreError::NotFound(path.clone()))?
			}
			_ => return Err(StoreError::NotFound(path.clone())),
		};
	}

	match parent {
		Value::Object(map) => match op {
			WriteOp::Add => {
				map.insert(last.to_owned(), doc);
				Ok(())
			}
			WriteOp::Replace => {
				if !map.contains_key(last) {
					return Err(StoreError::NotFound(path.clone()));
				}
				map.insert(last.to_owned(), doc);
				Ok(())
			}
			WriteOp::Remove => map
				.remove(last)
				.map(|_| ())
				.ok_or_else(|| StoreError::NotFound(path.clone())),
		},
		Value::Array(items) => {
			if op == WriteOp::Add && last == "-" {
				items.push(doc);
				return Ok(());
			}
			let index: usize = last.parse().map_err(|_| StoreError::InvalidWrite {
				path: path.clone(),
				reason: format!("\"{}\" is not an array index", last),
			})?;
			match op {
				WriteOp::Add => {
					if index > items.len() {
						return Err(StoreError::NotFound(path.clone()));
					}
					items.insert(index, doc);
					Ok(())
				}
				WriteOp::Replace => {
					if index >= items.len() {
						return Err(StoreError::NotFound(path.clone()));
					}
					items[index] = doc;
					Ok(())
				}
				WriteOp::Remove => {
					if index >= items.len() {
						return Err(StoreError::NotFound(path.clone()));
					}
					items.remove(index);
					Ok(())
				}
			}
		}
		_ => Err(StoreError::NotFound(path.clone())),
	}
}
