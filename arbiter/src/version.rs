// SPDX-License-Identifier: Apache-2.0

//! Product version stamping.

/// The version of the running binary, as stamped at compile time.
pub fn version() -> &'static str {
	env!("CARGO_PKG_VERSION")
}

/// User-Agent value used by outbound HTTP requests (pollers, sinks).
pub fn user_agent() -> String {
	format!("arbiter/{}", version())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_agent_is_product_stamped() {
		let ua = user_agent();
		assert!(ua.starts_with("arbiter/"));
		assert_eq!(ua, format!("arbiter/{}", version()));
	}
}
