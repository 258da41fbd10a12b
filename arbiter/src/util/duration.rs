// SPDX-License-Identifier: Apache-2.0

//! Human-friendly duration strings for configuration files.
//!
//! Accepts one or more `<number><unit>` segments, e.g. "5s", "600s",
//! "1m30s", "250ms".

use std::time::Duration;

pub fn parse_duration(raw: &str) -> Result<Duration, String> {
	let s = raw.trim();
	if s.is_empty() {
		return Err("empty duration".to_owned());
	}

	let mut total = Duration::ZERO;
	let mut number = String::new();
	let mut unit = String::new();
	let mut saw_segment = false;

	let mut flush = |number: &mut String, unit: &mut String| -> Result<(), String> {
		if number.is_empty() {
			return Err(format!("malformed duration \"{}\"", raw));
		}
		let count: u64 = number
			.parse()
			.map_err(|_| format!("malformed duration \"{}\"", raw))?;
		let segment = match unit.as_str() {
			"ms" => Duration::from_millis(count),
			"s" => Duration::from_secs(count),
			"m" => Duration::from_secs(count * 60),
			"h" => Duration::from_secs(count * 3600),
			other => return Err(format!("unknown duration unit \"{}\"", other)),
		};
		number.clear();
		unit.clear();
		total += segment;
		Ok(())
	};

	for c in s.chars() {
		if c.is_ascii_digit() {
			if !unit.is_empty() {
				flush(&mut number, &mut unit)?;
				saw_segment = true;
			}
			number.push(c);
		} else if c.is_ascii_alphabetic() {
			unit.push(c);
		} else {
			return Err(format!("malformed duration \"{}\"", raw));
		}
	}
	if !number.is_empty() || !unit.is_empty() {
		flush(&mut number, &mut unit)?;
		saw_segment = true;
	}
	if !saw_segment {
		return Err(format!("malformed duration \"{}\"", raw));
	}

	Ok(total)
}

/// Serde adapter for required duration fields.
pub mod serde_duration {
	use super::parse_duration;
	use serde::{de::Error as _, Deserialize, Deserializer};
	use std::time::Duration;

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let raw = String::deserialize(deserializer)?;
		parse_duration(&raw).map_err(D::Error::custom)
	}
}

/// Serde adapter for optional duration fields.
pub mod serde_opt_duration {
	use super::parse_duration;
	use serde::{de::Error as _, Deserialize, Deserializer};
	use std::time::Duration;

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let raw = Option::<String>::deserialize(deserializer)?;
		raw.map(|s| parse_duration(&s).map_err(D::Error::custom))
			.transpose()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn single_segments() {
		assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
		assert_eq!(parse_duration("600s").unwrap(), Duration::from_secs(600));
		assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
		assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
	}

	#[test]
	fn compound_segments() {
		assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
	}

	#[test]
	fn rejects_garbage() {
		assert!(parse_duration("").is_err());
		assert!(parse_duration("fast").is_err());
		assert!(parse_duration("5 s").is_err());
		assert!(parse_duration("5x").is_err());
	}
}
