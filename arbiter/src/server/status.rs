// SPDX-License-Identifier: Apache-2.0

//! Mapping of internal failures onto gRPC status codes.
//!
//! Validation → InvalidArgument; bundle-scope and ownership conflicts
//! → FailedPrecondition; store absence → NotFound; compile failures →
//! InvalidArgument with the compiler's text preserved; transaction and
//! other internal faults → Internal.

use crate::{
	engine::EngineError,
	store::{StoreError, StorePath},
	supervisor::Manager,
};
use tonic::Status;

pub(crate) fn parse_path(raw: &str) -> Result<StorePath, Status> {
	StorePath::parse(raw).map_err(|e| Status::invalid_argument(e.to_string()))
}

pub(crate) fn store_status(err: StoreError) -> Status {
	if err.is_not_found() {
		return Status::not_found(err.to_string());
	}
	match err {
		StoreError::OwnedPath { .. } => Status::failed_precondition(err.to_string()),
		StoreError::InvalidWrite { .. } => Status::invalid_argument(err.to_string()),
		_ => Status::internal(err.to_string()),
	}
}

pub(crate) fn engine_status(err: EngineError) -> Status {
	match err {
		EngineError::Parse(_) | EngineError::Compile(_) => {
			Status::invalid_argument(err.to_string())
		}
		EngineError::Eval(_) => Status::internal(err.to_string()),
	}
}

pub(crate) fn internal<E: std::fmt::Display>(err: E) -> Status {
	Status::internal(err.to_string())
}

/// Reject writes whose path descends from a bundle root.
pub(crate) fn check_bundle_scope(manager: &Manager, path: &StorePath) -> Result<(), Status> {
	if let Some((bundle, root)) = manager.bundle_root_for(path) {
		return Err(Status::failed_precondition(format!(
			"path {} is within bundle root {} owned by bundle \"{}\"",
			path, root, bundle
		)));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use tonic::Code;

	#[test]
	fn not_found_maps_to_not_found() {
		let err = StoreError::NotFound(StorePath::parse("/a").unwrap());
		assert_eq!(store_status(err).code(), Code::NotFound);
		let err = StoreError::PolicyNotFound("/p".to_owned());
		assert_eq!(store_status(err).code(), Code::NotFound);
	}

	#[test]
	fn ownership_maps_to_failed_precondition() {
		let err = StoreError::OwnedPath {
			path: "/http/placeholder".to_owned(),
			owner: "http".to_owned(),
		};
		let status = store_status(err);
		assert_eq!(status.code(), Code::FailedPrecondition);
		assert_eq!(
			status.message(),
			"path \"/http/placeholder\" is owned by plugin \"http\""
		);
	}

	#[test]
	fn conflicts_map_to_internal() {
		assert_eq!(store_status(StoreError::Conflict(1)).code(), Code::Internal);
	}

	#[test]
	fn compile_errors_preserve_text() {
		let status = engine_status(EngineError::Compile("/a: bad module".to_owned()));
		assert_eq!(status.code(), Code::InvalidArgument);
		assert_eq!(status.message(), "/a: bad module");
	}

	#[test]
	fn bad_paths_are_invalid_argument() {
		assert_eq!(
			parse_path("/a//b").unwrap_err().code(),
			Code::InvalidArgument
		);
	}
}
