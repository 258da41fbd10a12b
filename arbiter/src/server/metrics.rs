// SPDX-License-Identifier: Apache-2.0

//! Per-method request counters.

use prometheus::{IntCounterVec, Opts, Registry};

pub struct GrpcMetrics {
	requests: IntCounterVec,
	registry: Option<Registry>,
}

impl GrpcMetrics {
	/// Build the counters and register them if a registry is provided.
	/// Registration is idempotent: any stale collector from a previous
	/// server incarnation is unregistered first, so reconfigure cannot
	/// trip duplicate-registration errors.
	pub fn new(registry: Option<&Registry>) -> Self {
		let requests = IntCounterVec::new(
			Opts::new("grpc_request_count", "Count of gRPC requests by method."),
			&["method"],
		)
		.expect("static metric options are valid");

		if let Some(registry) = registry {
			let _ = registry.unregister(Box::new(requests.clone()));
			if let Err(e) = registry.register(Box::new(requests.clone())) {
				log::warn!("failed to register gRPC metrics: {}", e);
			}
		}

		GrpcMetrics {
			requests,
			registry: registry.cloned(),
		}
	}

	pub fn inc(&self, method: &str) {
		self.requests.with_label_values(&[method]).inc();
	}

	pub fn count(&self, method: &str) -> u64 {
		self.requests.with_label_values(&[method]).get()
	}

	/// Remove the collectors from the registry; called on reconfigure
	/// before a new server instance registers its own.
	pub fn unregister(&self) {
		if let Some(registry) = &self.registry {
			let _ = registry.unregister(Box::new(self.requests.clone()));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counts_by_method() {
		let metrics = GrpcMetrics::new(None);
		metrics.inc("v1.GetData");
		metrics.inc("v1.GetData");
		metrics.inc("v1.CreateData");
		assert_eq!(metrics.count("v1.GetData"), 2);
		assert_eq!(metrics.count("v1.CreateData"), 1);
	}

	#[test]
	fn reregistration_does_not_error() {
		let registry = Registry::new();
		let first = GrpcMetrics::new(Some(&registry));
		first.inc("v1.GetData");

		// A second instance against the same registry must not fail.
		let second = GrpcMetrics::new(Some(&registry));
		second.inc("v1.GetData");

		second.unregister();
	}
}
