// SPDX-License-Identifier: Apache-2.0

//! Shared wire-protocol types for the Arbiter gRPC services.
//!
//! The `proto` module contains the tonic-generated service and message
//! types for the `arbiter.data.v1`, `arbiter.policy.v1` and
//! `arbiter.bulk.v1` packages. The `value` module encodes and decodes
//! the JSON-text document fields those messages carry, preserving the
//! numeric precision of the in-process `serde_json::Value` documents.

pub mod value;

pub mod proto {
	pub mod data {
		pub mod v1 {
			tonic::include_proto!("arbiter.data.v1");
		}
	}

	pub mod policy {
		pub mod v1 {
			tonic::include_proto!("arbiter.policy.v1");
		}
	}

	pub mod bulk {
		pub mod v1 {
			tonic::include_proto!("arbiter.bulk.v1");
		}
	}
}
