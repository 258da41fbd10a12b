// SPDX-License-Identifier: Apache-2.0

//! JSON text encoding for documents on the wire.
//!
//! Document and input fields are JSON-encoded strings, with the empty
//! string meaning "absent". `google.protobuf.Value` was rejected for
//! these fields: it carries every number as a double, which silently
//! truncates integers beyond 2^53. JSON text preserves the full
//! integer/float distinction of `serde_json::Value`.

use serde_json::Value;

/// Encode a document for the wire.
pub fn encode(document: &Value) -> String {
	serde_json::to_string(document).expect("JSON values always serialize")
}

/// Encode an optional document; `None` becomes the empty string.
pub fn encode_opt(document: Option<&Value>) -> String {
	match document {
		Some(document) => encode(document),
		None => String::new(),
	}
}

/// Decode a wire document.
pub fn decode(raw: &str) -> Result<Value, serde_json::Error> {
	serde_json::from_str(raw)
}

/// Decode an optional wire document; the empty string is `None`.
pub fn decode_opt(raw: &str) -> Result<Option<Value>, serde_json::Error> {
	if raw.is_empty() {
		return Ok(None);
	}
	decode(raw).map(Some)
}
