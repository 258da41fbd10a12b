// SPDX-License-Identifier: Apache-2.0

//! The decision event record shipped to sinks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Revision information for one activated bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleInfo {
	pub revision: String,
}

/// A single decision record. `decision_id` is unique per request.
/// Deserialize exists for the disk journal, which round-trips events
/// through their serialized form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionEvent {
	// Labels are coerced from map<string,string> into map<string,any>
	// to stabilize downstream templating.
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub labels: Map<String, Value>,

	pub decision_id: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub trace_id: Option<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub span_id: Option<String>,

	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub bundles: BTreeMap<String, BundleInfo>,

	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub path: String,

	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub query: String,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub input: Option<Value>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub mapped_result: Option<Value>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub nd_builtin_cache: Option<Value>,

	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub requested_by: String,

	pub timestamp: DateTime<Utc>,

	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub metrics: BTreeMap<String, Value>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub erased: Vec<String>,

	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub masked: Vec<String>,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl DecisionEvent {
	/// A fresh event with a unique decision id and the current time.
	pub fn new(labels: &BTreeMap<String, String>, path: &str) -> Self {
		DecisionEvent {
			labels: coerce_labels(labels),
			decision_id: Uuid::new_v4().to_string(),
			trace_id: None,
			span_id: None,
			bundles: BTreeMap::new(),
			path: path.to_owned(),
			query: String::new(),
			input: None,
			result: None,
			mapped_result: None,
			nd_builtin_cache: None,
			requested_by: String::new(),
			timestamp: Utc::now(),
			metrics: BTreeMap::new(),
			erased: Vec::new(),
			masked: Vec::new(),
			error: None,
		}
	}

	/// Approximate on-wire size, used for buffer byte accounting.
	pub fn estimated_bytes(&self) -> usize {
		serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
	}

	/// Strip intermediate metadata the request path attaches but sinks
	/// never need: empty trace/span ids and null optional documents.
	pub fn scrub(&mut self) {
		if self.trace_id.as_deref() == Some("") {
			self.trace_id = None;
		}
		if self.span_id.as_deref() == Some("") {
			self.span_id = None;
		}
		for slot in [
			&mut self.input,
			&mut self.result,
			&mut self.mapped_result,
			&mut self.nd_builtin_cache,
		] {
			if matches!(slot, Some(Value::Null)) {
				*slot = None;
			}
		}
	}
}

/// Coerce string labels into a `map<string, any>` document.
pub fn coerce_labels(labels: &BTreeMap<String, String>) -> Map<String, Value> {
	labels
		.iter()
		.map(|(k, v)| (k.clone(), Value::String(v.clone())))
		.collect()
}
