// SPDX-License-Identifier: Apache-2.0

//! Drop and mask processors.
//!
//! Each processor holds a prepared query behind a mutex and re-prepares
//! it against the new compiler snapshot on every compiler trigger,
//! under a read transaction. Evaluation failures never drop or mask the
//! event; it continues downstream unchanged.

use crate::{
	decision::{
		event::DecisionEvent,
		mask::{apply_rules, parse_rules},
	},
	error::Error,
	query::PolicyQuery,
	supervisor::Manager,
};
use serde_json::Value;
use std::sync::Arc;

/// Decides whether an event is dropped before reaching any sink.
pub struct DropProcessor {
	query: Arc<PolicyQuery>,
}

impl DropProcessor {
	pub fn new(data_path: &str, manager: &Arc<Manager>) -> Result<Self, Error> {
		Ok(DropProcessor {
			query: Arc::new(PolicyQuery::from_data_path("drop", data_path, manager)?),
		})
	}

	pub fn query(&self) -> &Arc<PolicyQuery> {
		&self.query
	}

	pub fn should_drop(&self, event: &DecisionEvent) -> bool {
		let input = match serde_json::to_value(event) {
			Ok(input) => input,
			Err(e) => {
				log::warn!("drop processor: event serialization failed: {}", e);
				return false;
			}
		};
		match self.query.eval(&input) {
			Some(Value::Bool(allowed)) => allowed,
			Some(_) | None => false,
		}
	}
}

/// Applies the policy-provided mask ruleset to an event.
pub struct MaskProcessor {
	query: Arc<PolicyQuery>,
}

impl MaskProcessor {
	pub fn new(data_path: &str, manager: &Arc<Manager>) -> Result<Self, Error> {
		Ok(MaskProcessor {
			query: Arc::new(PolicyQuery::from_data_path("mask", data_path, manager)?),
		})
	}

	pub fn query(&self) -> &Arc<PolicyQuery> {
		&self.query
	}

	pub fn mask(&self, event: &mut DecisionEvent) {
		let input = match serde_json::to_value(&*event) {
			Ok(input) => input,
			Err(e) => {
				log::warn!("mask processor: event serialization failed: {}", e);
				return;
			}
		};
		let Some(ruleset) = self.query.eval(&input) else {
			return;
		};

		match parse_rules(&ruleset) {
			Ok(rules) => apply_rules(event, &rules),
			Err(e) => {
				log::warn!("mask processor: invalid ruleset: {}", e);
			}
		}
	}
}
