// SPDX-License-Identifier: Apache-2.0

//! Per-sink batching and payload framing.

use crate::{decision::event::DecisionEvent, util::duration::serde_duration};
use chrono::{DateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use serde::Deserialize;
use std::{io::Write as _, sync::Arc, time::Duration};

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
	/// Flush once this many events are batched.
	#[serde(default = "default_flush_count")]
	pub flush_at_count: usize,

	/// Flush once the serialized batch reaches this many bytes. Zero
	/// disables the bytes trigger.
	#[serde(default)]
	pub flush_at_bytes: usize,

	#[serde(default = "default_flush_period", with = "serde_duration")]
	pub flush_at_period: Duration,

	/// Frame batches as a JSON array; false means JSON lines.
	#[serde(default = "default_true")]
	pub array: bool,
}

impl Default for BatchConfig {
	fn default() -> Self {
		BatchConfig {
			flush_at_count: default_flush_count(),
			flush_at_bytes: 0,
			flush_at_period: default_flush_period(),
			array: true,
		}
	}
}

fn default_flush_count() -> usize {
	100
}

fn default_flush_period() -> Duration {
	Duration::from_secs(1)
}

fn default_true() -> bool {
	true
}

/// How a batch body is laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
	/// One JSON array of events.
	Array,
	/// Newline-delimited JSON events.
	Lines,
	/// No framing here; the sink maps the batch itself (s3 key-naming).
	Unprocessed,
}

impl BatchConfig {
	pub fn framing(&self) -> Framing {
		if self.array {
			Framing::Array
		} else {
			Framing::Lines
		}
	}
}

/// An accumulating batch of events with byte accounting and first/last
/// timestamps for key templating.
#[derive(Debug, Default)]
pub struct Batch {
	events: Vec<Arc<DecisionEvent>>,
	bytes: usize,
	first: Option<DateTime<Utc>>,
	last: Option<DateTime<Utc>>,
}

impl Batch {
	pub fn new() -> Self {
		Batch::default()
	}

	pub fn push(&mut self, event: Arc<DecisionEvent>) {
		self.bytes += event.estimated_bytes();
		if self.first.is_none() {
			self.first = Some(event.timestamp);
		}
		self.last = Some(event.timestamp);
		self.events.push(event);
	}

	pub fn events(&self) -> &[Arc<DecisionEvent>] {
		&self.events
	}

	pub fn len(&self) -> usize {
		self.events.len()
	}

	pub fn is_empty(&self) -> bool {
		self.events.is_empty()
	}

	pub fn bytes(&self) -> usize {
		self.bytes
	}

	pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
		self.first
	}

	pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
		self.last
	}

	/// Whether the configured count/bytes triggers say this batch is
	/// due. The period trigger is the runner's timer, not ours.
	pub fn should_flush(&self, config: &BatchConfig) -> bool {
		(config.flush_at_count > 0 && self.events.len() >= config.flush_at_count)
			|| (config.flush_at_bytes > 0 && self.bytes >= config.flush_at_bytes)
	}

	pub fn take(&mut self) -> Batch {
		std::mem::take(self)
	}
}

/// Serialize events with the given framing, optionally gzipped.
pub fn frame_events(
	events: &[Arc<DecisionEvent>],
	framing: Framing,
	compress: bool,
) -> Result<Vec<u8>, serde_json::Error> {
	let body = match framing {
		Framing::Array | Framing::Unprocessed => {
			let refs: Vec<&DecisionEvent> = events.iter().map(|e| e.as_ref()).collect();
			serde_json::to_vec(&refs)?
		}
		Framing::Lines => {
			let mut out = Vec::new();
			for event in events {
				out.extend_from_slice(&serde_json::to_vec(event.as_ref())?);
				out.push(b'\n');
			}
			out
		}
	};

	if !compress {
		return Ok(body);
	}

	let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
	encoder.write_all(&body).expect("write to Vec cannot fail");
	Ok(encoder.finish().expect("write to Vec cannot fail"))
}

#[cfg(test)]
mod tests {
	use super::*;
	use flate2::read::GzDecoder;
	use std::{collections::BTreeMap, io::Read as _};

	fn event() -> Arc<DecisionEvent> {
		Arc::new(DecisionEvent::new(&BTreeMap::new(), "/a"))
	}

	#[test]
	fn count_trigger_fires() {
		let config = BatchConfig {
			flush_at_count: 2,
			..BatchConfig::default()
		};
		let mut batch = Batch::new();
		batch.push(event());
		assert!(!batch.should_flush(&config));
		batch.push(event());
		assert!(batch.should_flush(&config));
	}

	#[test]
	fn bytes_trigger_fires() {
		let config = BatchConfig {
			flush_at_count: 0,
			flush_at_bytes: 1,
			..BatchConfig::default()
		};
		let mut batch = Batch::new();
		batch.push(event());
		assert!(batch.should_flush(&config));
	}

	#[test]
	fn array_framing_is_json_array() {
		let events = vec![event(), event()];
		let body = frame_events(&events, Framing::Array, false).unwrap();
		let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
		assert_eq!(parsed.as_array().unwrap().len(), 2);
	}

	#[test]
	fn lines_framing_is_newline_delimited() {
		let events = vec![event(), event()];
		let body = frame_events(&events, Framing::Lines, false).unwrap();
		let text = String::from_utf8(body).unwrap();
		assert_eq!(text.trim_end().lines().count(), 2);
		for line in text.trim_end().lines() {
			serde_json::from_str::<serde_json::Value>(line).unwrap();
		}
	}

	#[test]
	fn gzip_round_trips() {
		let events = vec![event()];
		let compressed = frame_events(&events, Framing::Array, true).unwrap();
		let plain = frame_events(&events, Framing::Array, false).unwrap();

		let mut decoder = GzDecoder::new(compressed.as_slice());
		let mut out = Vec::new();
		decoder.read_to_end(&mut out).unwrap();
		assert_eq!(out, plain);
	}

	#[test]
	fn batch_tracks_timestamps() {
		let mut batch = Batch::new();
		let first = event();
		let second = event();
		batch.push(Arc::clone(&first));
		batch.push(Arc::clone(&second));
		assert_eq!(batch.first_timestamp().unwrap(), first.timestamp);
		assert_eq!(batch.last_timestamp().unwrap(), second.timestamp);
	}
}
