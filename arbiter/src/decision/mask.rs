// SPDX-License-Identifier: Apache-2.0

//! Policy-driven masking of decision events.
//!
//! A mask ruleset is user data and arbitrarily shaped: each rule is
//! either a string path (shorthand for remove) or an object
//! `{op: remove|upsert, path, value?}`. Paths must be rooted in
//! /input, /result or /nd_builtin_cache; anything else fails rule
//! parsing. Applying `remove` to a missing subpath is a silent no-op;
//! `upsert` creates intervening objects on object paths and is a
//! silent no-op on non-object parents and out-of-range array indices.

use crate::decision::event::DecisionEvent;
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MaskError {
	#[error(
		"mask rule path must be rooted in /input, /result or /nd_builtin_cache, got \"{0}\""
	)]
	InvalidRoot(String),

	#[error("invalid mask rule: {0}")]
	InvalidRule(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskOp {
	Remove,
	Upsert,
}

/// The event section a rule addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaskRoot {
	Input,
	Result,
	NdBuiltinCache,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaskRule {
	op: MaskOp,
	root: MaskRoot,
	segments: Vec<String>,
	value: Option<Value>,
	raw_path: String,
}

/// Parse a ruleset document (the mask query's value) into rules.
pub fn parse_rules(doc: &Value) -> Result<Vec<MaskRule>, MaskError> {
	let items = match doc {
		Value::Array(items) => items.as_slice(),
		other => {
			return Err(MaskError::InvalidRule(format!(
				"expected an array of rules, got {}",
				kind_name(other)
			)))
		}
	};

	items.iter().map(parse_rule).collect()
}

fn parse_rule(item: &Value) -> Result<MaskRule, MaskError> {
	match item {
		Value::String(path) => {
			let (root, segments) = parse_path(path)?;
			Ok(MaskRule {
				op: MaskOp::Remove,
				root,
				segments,
				value: None,
				raw_path: path.clone(),
			})
		}
		Value::Object(fields) => {
			let op = match fields.get("op").and_then(Value::as_str) {
				Some("remove") | None => MaskOp::Remove,
				Some("upsert") => MaskOp::Upsert,
				Some(other) => {
					return Err(MaskError::InvalidRule(format!("unknown op \"{}\"", other)))
				}
			};
			let Some(path) = fields.get("path").and_then(Value::as_str) else {
				return Err(MaskError::InvalidRule("rule is missing \"path\"".to_owned()));
			};
			let (root, segments) = parse_path(path)?;
			Ok(MaskRule {
				op,
				root,
				segments,
				value: fields.get("value").cloned(),
				raw_path: path.to_owned(),
			})
		}
		other => Err(MaskError::InvalidRule(format!(
			"expected string or object rule, got {}",
			kind_name(other)
		))),
	}
}

fn parse_path(path: &str) -> Result<(MaskRoot, Vec<String>), MaskError> {
	let trimmed = path.strip_prefix('/').unwrap_or(path);
	let mut parts = trimmed.split('/');

	let root = match parts.next() {
		Some("input") => MaskRoot::Input,
		Some("result") => MaskRoot::Result,
		Some("nd_builtin_cache") => MaskRoot::NdBuiltinCache,
		_ => return Err(MaskError::InvalidRoot(path.to_owned())),
	};

	let segments: Vec<String> = parts.map(str::to_owned).collect();
	if segments.iter().any(String::is_empty) {
		return Err(MaskError::InvalidRule(format!(
			"path \"{}\" contains an empty segment",
			path
		)));
	}
	Ok((root, segments))
}

fn kind_name(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "bool",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}

/// Apply a parsed ruleset to an event. Every rule that actually
/// modifies the event records its path in `erased` (remove) or
/// `masked` (upsert); reapplying a ruleset is idempotent.
pub fn apply_rules(event: &mut DecisionEvent, rules: &[MaskRule]) {
	for rule in rules {
		let section = match rule.root {
			MaskRoot::Input => &mut event.input,
			MaskRoot::Result => &mut event.result,
			MaskRoot::NdBuiltinCache => &mut event.nd_builtin_cache,
		};

		let applied = match rule.op {
			MaskOp::Remove => remove_from_section(section, &rule.segments),
			MaskOp::Upsert => upsert_into_section(
				section,
				&rule.segments,
				rule.value.clone().unwrap_or(Value::Null),
			),
		};

		if applied {
			let list = match rule.op {
				MaskOp::Remove => &mut event.erased,
				MaskOp::Upsert => &mut event.masked,
			};
			if !list.contains(&rule.raw_path) {
				list.push(rule.raw_path.clone());
			}
		}
	}
}

fn remove_from_section(section: &mut Option<Value>, segments: &[String]) -> bool {
	let Some(root) = section.as_mut() else {
		return false;
	};
	if segments.is_empty() {
		*section = None;
		return true;
	}
	remove_at(root, segments)
}

fn remove_at(node: &mut Value, segments: &[String]) -> bool {
	let (head, rest) = segments.split_first().expect("segments are non-empty");

	if rest.is_empty() {
		return match node {
			Value::Object(map) => map.remove(head).is_some(),
			Value::Array(items) => match array_index(head, items.len()) {
				Some(index) => {
					items.remove(index);
					true
				}
				None => false,
			},
			_ => false,
		};
	}

	let child = match node {
		Value::Object(map) => map.get_mut(head),
		Value::Array(items) => {
			let len = items.len();
			array_index(head, len).and_then(move |i| items.get_mut(i))
		}
		_ => None,
	};

	match child {
		Some(child) => remove_at(child, rest),
		None => false,
	}
}

fn upsert_into_section(section: &mut Option<Value>, segments: &[String], value: Value) -> bool {
	if segments.is_empty() {
		*section = Some(value);
		return true;
	}
	// Upserting below a missing section creates it.
	let root = section.get_or_insert_with(|| Value::Object(Map::new()));
	upsert_at(root, segments, value)
}

fn upsert_at(node: &mut Value, segments: &[String], value: Value) -> bool {
	let (head, rest) = segments.split_first().expect("segments are non-empty");

	if rest.is_empty() {
		return match node {
			Value::Object(map) => {
				map.insert(head.clone(), value);
				true
			}
			Value::Array(items) => match array_index(head, items.len()) {
				Some(index) => {
					items[index] = value;
					true
				}
				None => false,
			},
			_ => false,
		};
	}

	match node {
		Value::Object(map) => {
			// Missing intermediate object paths are created.
			let child = map
				.entry(head.clone())
				.or_insert_with(|| Value::Object(Map::new()));
			upsert_at(child, rest, value)
		}
		Value::Array(items) => {
			let len = items.len();
			match array_index(head, len).and_then(move |i| items.get_mut(i)) {
				Some(child) => upsert_at(child, rest, value),
				None => false,
			}
		}
		_ => false,
	}
}

/// Array indices are integers; negative addresses ("-1") and anything
/// out of range are out-of-range no-ops rather than errors.
fn array_index(segment: &str, len: usize) -> Option<usize> {
	let index: i64 = segment.parse().ok()?;
	if index < 0 {
		return None;
	}
	let index = index as usize;
	(index < len).then_some(index)
}
