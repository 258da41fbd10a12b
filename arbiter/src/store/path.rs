// SPDX-License-Identifier: Apache-2.0

//! Slash-delimited storage paths.

use percent_encoding::percent_decode_str;
use std::fmt::{self, Display, Formatter};

/// An ordered sequence of string segments addressing a location in the
/// data store. Parsed from slash-delimited strings; empty segments are
/// rejected and segments are percent-decoded. Numeric segments may be
/// used as array indices at write time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StorePath(Vec<String>);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
	#[error("path \"{0}\" contains an empty segment")]
	EmptySegment(String),

	#[error("path \"{0}\" contains invalid percent-encoding")]
	BadEncoding(String),
}

impl StorePath {
	/// The root path, with no segments.
	pub fn root() -> Self {
		StorePath(Vec::new())
	}

	/// Parse a slash-delimited path. A leading slash is optional; the
	/// empty string and "/" both parse to the root path.
	pub fn parse(raw: &str) -> Result<Self, PathError> {
		let trimmed = raw.strip_prefix('/').unwrap_or(raw);
		if trimmed.is_empty() {
			return Ok(StorePath::root());
		}

		let mut segments = Vec::new();
		for part in trimmed.split('/') {
			if part.is_empty() {
				return Err(PathError::EmptySegment(raw.to_owned()));
			}
			let decoded = percent_decode_str(part)
				.decode_utf8()
				.map_err(|_| PathError::BadEncoding(raw.to_owned()))?;
			segments.push(decoded.into_owned());
		}

		Ok(StorePath(segments))
	}

	pub fn from_segments<I, S>(segments: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		StorePath(segments.into_iter().map(Into::into).collect())
	}

	pub fn segments(&self) -> &[String] {
		&self.0
	}

	pub fn is_root(&self) -> bool {
		self.0.is_empty()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// The path with the final segment removed, and that segment.
	/// Returns `None` for the root path.
	pub fn split_last(&self) -> Option<(StorePath, &str)> {
		let (last, parent) = self.0.split_last()?;
		Some((StorePath(parent.to_vec()), last))
	}

	pub fn child<S: Into<String>>(&self, segment: S) -> StorePath {
		let mut segments = self.0.clone();
		segments.push(segment.into());
		StorePath(segments)
	}

	/// Whether `self` equals `prefix` or descends from it. Every path
	/// descends from the root.
	pub fn starts_with(&self, prefix: &StorePath) -> bool {
		self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
	}

	/// The dotted `data` reference for this path, used to build query
	/// strings for the evaluator.
	pub fn data_ref(&self) -> String {
		if self.is_root() {
			return "data".to_owned();
		}
		format!("data.{}", self.0.join("."))
	}
}

impl Display for StorePath {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		if self.is_root() {
			return write!(f, "/");
		}
		for segment in &self.0 {
			write!(f, "/{}", segment)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_simple_paths() {
		let path = StorePath::parse("/a/b/c").unwrap();
		assert_eq!(path.segments(), &["a", "b", "c"]);
		assert_eq!(path.to_string(), "/a/b/c");
	}

	#[test]
	fn leading_slash_is_optional() {
		assert_eq!(
			StorePath::parse("a/b").unwrap(),
			StorePath::parse("/a/b").unwrap()
		);
	}

	#[test]
	fn root_forms() {
		assert!(StorePath::parse("").unwrap().is_root());
		assert!(StorePath::parse("/").unwrap().is_root());
		assert_eq!(StorePath::root().to_string(), "/");
	}

	#[test]
	fn rejects_empty_segments() {
		assert!(matches!(
			StorePath::parse("/a//b"),
			Err(PathError::EmptySegment(_))
		));
	}

	#[test]
	fn percent_decodes_segments() {
		let path = StorePath::parse("/a%20b/c%2Fd").unwrap();
		assert_eq!(path.segments(), &["a b", "c/d"]);
	}

	#[test]
	fn prefix_checks() {
		let owner = StorePath::parse("/http/placeholder").unwrap();
		let inner = StorePath::parse("/http/placeholder/deep").unwrap();
		let other = StorePath::parse("/http/other").unwrap();
		assert!(inner.starts_with(&owner));
		assert!(owner.starts_with(&owner));
		assert!(!other.starts_with(&owner));
		assert!(other.starts_with(&StorePath::root()));
	}

	#[test]
	fn data_refs() {
		assert_eq!(StorePath::root().data_ref(), "data");
		assert_eq!(StorePath::parse("/a/b").unwrap().data_ref(), "data.a.b");
	}
}
