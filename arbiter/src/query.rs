// SPDX-License-Identifier: Apache-2.0

//! A prepared query slot that re-prepares on compiler triggers.
//!
//! Shared by the decision-log processors, the data-plugin transforms,
//! and gRPC authorization: the prepared handle lives behind a mutex,
//! `refresh` re-prepares it against the current compiler snapshot
//! under a read transaction, and evaluations read it without copying.
//! The supervisor is held weakly, so a registered trigger callback
//! never extends its lifetime.

use crate::{
	engine::{EvalParams, PreparedQuery},
	error::Error,
	store::{StorePath, TxnParams},
	supervisor::Manager,
};
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};

pub struct PolicyQuery {
	name: String,
	query: String,
	manager: Weak<Manager>,
	prepared: Mutex<Option<Arc<dyn PreparedQuery>>>,
}

impl PolicyQuery {
	/// A query over a data path like `/system/log/drop`.
	pub fn from_data_path(
		name: &str,
		data_path: &str,
		manager: &Arc<Manager>,
	) -> Result<Self, Error> {
		let path = StorePath::parse(data_path)
			.map_err(|e| Error::config(format!("{} decision path: {}", name, e)))?;
		Ok(PolicyQuery::from_query(name, &path.data_ref(), manager))
	}

	/// A query over a dotted reference like `data.transforms.ingest`.
	pub fn from_query(name: &str, query: &str, manager: &Arc<Manager>) -> Self {
		PolicyQuery {
			name: name.to_owned(),
			query: query.to_owned(),
			manager: Arc::downgrade(manager),
			prepared: Mutex::new(None),
		}
	}

	pub fn query_ref(&self) -> &str {
		&self.query
	}

	/// Re-prepare against the current compiler snapshot. On failure the
	/// previous prepared query stays in place.
	pub fn refresh(&self) {
		let Some(manager) = self.manager.upgrade() else {
			return;
		};

		let store = manager.store();
		let txn = match store.new_transaction(TxnParams::read()) {
			Ok(txn) => txn,
			Err(e) => {
				log::warn!("{}: failed to open txn: {}", self.name, e);
				return;
			}
		};

		match manager
			.engine()
			.prepare(&self.query, store.as_ref(), &txn, manager.prepare_opts())
		{
			Ok(prepared) => {
				*self.prepared.lock().expect("prepared lock poisoned") = Some(prepared);
			}
			Err(e) => {
				log::warn!("{}: failed to prepare {}: {}", self.name, self.query, e);
			}
		}
		store.abort(txn);
	}

	/// Evaluate against an input document. `None` means undefined or
	/// failed; callers treat both as "no value".
	pub fn eval(&self, input: &Value) -> Option<Value> {
		let manager = self.manager.upgrade()?;

		let prepared = {
			let mut slot = self.prepared.lock().expect("prepared lock poisoned");
			if slot.is_none() {
				drop(slot);
				self.refresh();
				slot = self.prepared.lock().expect("prepared lock poisoned");
			}
			slot.clone()
		}?;

		let store = manager.store();
		let txn = match store.new_transaction(TxnParams::read()) {
			Ok(txn) => txn,
			Err(e) => {
				log::warn!("{}: failed to open txn: {}", self.name, e);
				return None;
			}
		};

		let result = prepared.eval(
			store.as_ref(),
			&txn,
			EvalParams {
				input: Some(input),
				..EvalParams::default()
			},
		);
		store.abort(txn);

		match result {
			Ok(mut values) if !values.is_empty() => Some(values.swap_remove(0)),
			Ok(_) => None,
			Err(e) => {
				log::warn!("{}: evaluation failed: {}", self.name, e);
				None
			}
		}
	}
}
