// SPDX-License-Identifier: Apache-2.0

//! Shared outbound HTTP client construction.

use crate::{decision::config::TlsClientConfig, error::Error, version};
use std::time::Duration;

/// A client builder stamped with the product User-Agent and the given
/// TLS material. Callers add their own redirect and timeout policy
/// before building.
pub fn client_builder(
	tls: Option<&TlsClientConfig>,
	timeout: Option<Duration>,
) -> Result<reqwest::ClientBuilder, Error> {
	let mut builder = reqwest::Client::builder().user_agent(version::user_agent());

	if let Some(timeout) = timeout {
		builder = builder.timeout(timeout);
	}

	if let Some(tls) = tls {
		if let Some(ca) = &tls.ca_cert_file {
			let pem = std::fs::read(ca)?;
			let cert = reqwest::Certificate::from_pem(&pem)
				.map_err(|e| Error::config(format!("bad CA certificate: {}", e)))?;
			builder = builder.add_root_certificate(cert);
		}
		if let (Some(cert), Some(key)) = (&tls.client_cert_file, &tls.client_key_file) {
			let mut pem = std::fs::read(cert)?;
			pem.extend_from_slice(&std::fs::read(key)?);
			let identity = reqwest::Identity::from_pem(&pem)
				.map_err(|e| Error::config(format!("bad client certificate: {}", e)))?;
			builder = builder.identity(identity);
		}
	}

	Ok(builder)
}
