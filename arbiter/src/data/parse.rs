// SPDX-License-Identifier: Apache-2.0

//! Response-body parsing for pollers.
//!
//! XML is attempted first when the body looks like XML; anything else
//! (and any XML parse failure) falls back to the YAML unmarshaller,
//! which accepts both JSON and YAML.

use crate::error::Error;
use serde_json::{Map, Value};
use xml::reader::{EventReader, XmlEvent};

/// Parse a poller response body into a document.
pub fn parse_body(bytes: &[u8]) -> Result<Value, Error> {
	if looks_like_xml(bytes) {
		if let Ok(value) = parse_xml(bytes) {
			return Ok(value);
		}
	}
	parse_yaml_or_json(bytes)
}

fn looks_like_xml(bytes: &[u8]) -> bool {
	bytes
		.iter()
		.find(|b| !b.is_ascii_whitespace())
		.is_some_and(|b| *b == b'<')
}

fn parse_yaml_or_json(bytes: &[u8]) -> Result<Value, Error> {
	let parsed: serde_yaml::Value = serde_yaml::from_slice(bytes)
		.map_err(|e| Error::config(format!("unparseable response body: {}", e)))?;
	serde_json::to_value(parsed)
		.map_err(|e| Error::config(format!("unparseable response body: {}", e)))
}

/// Fold an XML document into a JSON-like value: the root element name
/// maps to its folded content; attributes become string fields;
/// repeated child elements collapse into arrays; text-only elements
/// become strings.
fn parse_xml(bytes: &[u8]) -> Result<Value, Error> {
	struct Node {
		name: String,
		attrs: Map<String, Value>,
		children: Vec<(String, Value)>,
		text: String,
	}

	impl Node {
		fn finish(self) -> (String, Value) {
			let text = self.text.trim().to_owned();
			if self.attrs.is_empty() && self.children.is_empty() {
				let value = if text.is_empty() {
					Value::Null
				} else {
					Value::String(text)
				};
				return (self.name, value);
			}

			let mut object = self.attrs;
			let mut grouped: Vec<(String, Vec<Value>)> = Vec::new();
			for (name, value) in self.children {
				match grouped.iter_mut().find(|(n, _)| *n == name) {
					Some((_, values)) => values.push(value),
					None => grouped.push((name, vec![value])),
				}
			}
			for (name, mut values) in grouped {
				let value = if values.len() == 1 {
					values.pop().expect("one element")
				} else {
					Value::Array(values)
				};
				object.insert(name, value);
			}
			if !text.is_empty() {
				object.insert("#text".to_owned(), Value::String(text));
			}
			(self.name, Value::Object(object))
		}
	}

	let reader = EventReader::new(bytes);
	let mut stack: Vec<Node> = Vec::new();
	let mut root: Option<(String, Value)> = None;

	for event in reader {
		match event.map_err(|e| Error::config(format!("invalid xml: {}", e)))? {
			XmlEvent::StartElement {
				name, attributes, ..
			} => {
				let attrs = attributes
					.into_iter()
					.map(|attr| (attr.name.local_name, Value::String(attr.value)))
					.collect();
				stack.push(Node {
					name: name.local_name,
					attrs,
					children: Vec::new(),
					text: String::new(),
				});
			}
			XmlEvent::EndElement { .. } => {
				let node = stack.pop().expect("end matches a start");
				let finished = node.finish();
				match stack.last_mut() {
					Some(parent) => parent.children.push(finished),
					None => root = Some(finished),
				}
			}
			XmlEvent::Characters(text) | XmlEvent::CData(text) => {
				if let Some(node) = stack.last_mut() {
					node.text.push_str(&text);
				}
			}
			_ => {}
		}
	}

	let (name, value) = root.ok_or_else(|| Error::config("invalid xml: no root element"))?;
	let mut doc = Map::new();
	doc.insert(name, value);
	Ok(Value::Object(doc))
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn json_bodies_parse() {
		let doc = parse_body(br#"{"a": 27, "b": [1, 2]}"#).unwrap();
		assert_eq!(doc, json!({"a": 27, "b": [1, 2]}));
	}

	#[test]
	fn yaml_bodies_parse() {
		let doc = parse_body(b"a: 27\nb:\n  - 1\n  - 2\n").unwrap();
		assert_eq!(doc, json!({"a": 27, "b": [1, 2]}));
	}

	#[test]
	fn xml_bodies_parse_first() {
		let doc = parse_body(
			br#"<config env="prod"><host>a.example.com</host><host>b.example.com</host></config>"#,
		)
		.unwrap();
		assert_eq!(
			doc,
			json!({"config": {"env": "prod", "host": ["a.example.com", "b.example.com"]}})
		);
	}

	#[test]
	fn broken_xml_falls_back() {
		// Looks like XML but is not; YAML accepts it as a plain string.
		let doc = parse_body(b"<not really xml").unwrap();
		assert_eq!(doc, json!("<not really xml"));
	}

	#[test]
	fn empty_elements_are_null() {
		let doc = parse_body(b"<root><empty/></root>").unwrap();
		assert_eq!(doc, json!({"root": {"empty": null}}));
	}

	#[test]
	fn garbage_is_an_error() {
		assert!(parse_body(b"{: not valid").is_err());
	}
}
