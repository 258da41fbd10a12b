// SPDX-License-Identifier: Apache-2.0

//! The storage contract the service surfaces are written against.
//!
//! The store owns all documents and policy modules; every other
//! component reaches them through transactions. Reads run against a
//! snapshot taken when the transaction opens; writes buffer against a
//! working copy and become visible at commit. The contract is
//! synchronous: the collaborating store is in-memory, so suspension
//! points live around transactions, not inside them.

pub mod memory;
pub mod path;

pub use memory::MemoryStore;
pub use path::{PathError, StorePath};

use serde_json::Value;
use std::sync::Arc;

/// The patch operation applied by [`Store::write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
	Add,
	Remove,
	Replace,
}

/// Extra context carried by a transaction. The `owner` names the data
/// plugin issuing writes, and is checked against path ownership claims.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxnContext {
	pub owner: Option<String>,
}

/// Parameters for opening a transaction.
#[derive(Debug, Clone, Default)]
pub struct TxnParams {
	pub write: bool,
	pub context: TxnContext,
}

impl TxnParams {
	pub fn read() -> Self {
		TxnParams::default()
	}

	pub fn write() -> Self {
		TxnParams {
			write: true,
			..TxnParams::default()
		}
	}

	pub fn write_owned_by<S: Into<String>>(owner: S) -> Self {
		TxnParams {
			write: true,
			context: TxnContext {
				owner: Some(owner.into()),
			},
		}
	}
}

/// An open transaction. Opaque to callers; all state lives in the
/// store. Dropping a `Txn` without committing leaks nothing, but the
/// polite path is `commit` or `abort`.
#[derive(Debug)]
pub struct Txn {
	id: u64,
	write: bool,
}

impl Txn {
	pub(crate) fn new(id: u64, write: bool) -> Self {
		Txn { id, write }
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn is_write(&self) -> bool {
		self.write
	}
}

/// What a committed write transaction touched. Commit triggers receive
/// this to decide whether recompilation or cache invalidation is due.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnSummary {
	pub data_changed: bool,
	pub policy_changed: bool,
}

/// A commit trigger callback.
pub type OnCommit = Arc<dyn Fn(&TxnSummary) + Send + Sync>;

/// Handle returned by trigger registration; pass back to
/// [`Store::unregister_trigger`] to remove the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerHandle(pub(crate) u64);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("storage path not found: {0}")]
	NotFound(StorePath),

	#[error("policy not found: {0}")]
	PolicyNotFound(String),

	// The message shape here is contractual; other writers probing an
	// owned subtree see exactly this text.
	#[error("path \"{path}\" is owned by plugin \"{owner}\"")]
	OwnedPath { path: String, owner: String },

	#[error("transaction {0} is read-only")]
	ReadOnly(u64),

	#[error("unknown transaction {0}")]
	UnknownTransaction(u64),

	#[error("write conflict committing transaction {0}")]
	Conflict(u64),

	#[error("invalid write to {path}: {reason}")]
	InvalidWrite { path: StorePath, reason: String },
}

impl StoreError {
	/// Whether this error means "the addressed thing does not exist".
	pub fn is_not_found(&self) -> bool {
		matches!(
			self,
			StoreError::NotFound(_) | StoreError::PolicyNotFound(_)
		)
	}
}

/// The transactional storage interface.
pub trait Store: Send + Sync {
	fn new_transaction(&self, params: TxnParams) -> Result<Txn, StoreError>;

	/// Commit a write transaction (or close a read transaction). Commit
	/// triggers run after the new state is visible.
	fn commit(&self, txn: Txn) -> Result<TxnSummary, StoreError>;

	/// Abort a transaction. Aborting is infallible; read-only callers
	/// never surface errors from it.
	fn abort(&self, txn: Txn);

	fn read(&self, txn: &Txn, path: &StorePath) -> Result<Value, StoreError>;

	fn write(
		&self,
		txn: &Txn,
		op: WriteOp,
		path: &StorePath,
		doc: Value,
	) -> Result<(), StoreError>;

	/// Ensure `path` exists as an object, creating intermediate objects
	/// as needed. Under an owner context this also claims the subtree
	/// for that plugin.
	fn make_dir(&self, txn: &Txn, path: &StorePath) -> Result<(), StoreError>;

	fn list_policies(&self, txn: &Txn) -> Result<Vec<String>, StoreError>;

	fn get_policy(&self, txn: &Txn, id: &str) -> Result<Vec<u8>, StoreError>;

	fn upsert_policy(&self, txn: &Txn, id: &str, text: Vec<u8>) -> Result<(), StoreError>;

	fn delete_policy(&self, txn: &Txn, id: &str) -> Result<(), StoreError>;

	/// Register an on-commit trigger under a write transaction.
	fn register_trigger(&self, txn: &Txn, on_commit: OnCommit)
		-> Result<TriggerHandle, StoreError>;

	fn unregister_trigger(&self, txn: &Txn, handle: TriggerHandle) -> Result<(), StoreError>;
}
