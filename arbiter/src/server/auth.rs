// SPDX-License-Identifier: Apache-2.0

//! Authentication and authorization for the gRPC surface.
//!
//! Authentication establishes an identity: a bearer token in `token`
//! mode, the client certificate fingerprint in `tls` mode. Basic
//! authorization evaluates the `data.system.authz.allow` query with
//! `{identity, method}` as input; deny or undefined is
//! PermissionDenied.

use crate::query::PolicyQuery;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tonic::{metadata::MetadataMap, Extensions, Request, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthnMode {
	#[default]
	Off,
	Token,
	Tls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthzMode {
	#[default]
	Off,
	Basic,
}

/// The authenticated peer identity, inserted into request extensions
/// by the interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub String);

/// Connection info attached by the TLS acceptor.
#[derive(Debug, Clone)]
pub struct TlsConnectInfo {
	pub remote_addr: Option<std::net::SocketAddr>,
	/// SHA-256 fingerprint of the verified client certificate, when
	/// mTLS is on.
	pub peer_cert_fingerprint: Option<String>,
}

/// The interceptor applied to every service: establishes the identity
/// per the authentication mode, or rejects the request.
pub fn interceptor(
	mode: AuthnMode,
) -> impl FnMut(Request<()>) -> Result<Request<()>, Status> + Clone {
	move |mut request: Request<()>| {
		let identity = match mode {
			AuthnMode::Off => None,
			AuthnMode::Token => Some(bearer_token(request.metadata())?),
			AuthnMode::Tls => Some(peer_fingerprint(request.extensions())?),
		};
		if let Some(identity) = identity {
			request.extensions_mut().insert(Identity(identity));
		}
		Ok(request)
	}
}

fn bearer_token(metadata: &MetadataMap) -> Result<String, Status> {
	let header = metadata
		.get("authorization")
		.ok_or_else(|| Status::unauthenticated("missing authorization header"))?
		.to_str()
		.map_err(|_| Status::unauthenticated("malformed authorization header"))?;

	let Some(token) = header.strip_prefix("Bearer ") else {
		return Err(Status::unauthenticated(
			"authorization header is not a bearer token",
		));
	};
	if token.is_empty() {
		return Err(Status::unauthenticated("empty bearer token"));
	}
	Ok(token.to_owned())
}

fn peer_fingerprint(extensions: &Extensions) -> Result<String, Status> {
	extensions
		.get::<TlsConnectInfo>()
		.and_then(|info| info.peer_cert_fingerprint.clone())
		.ok_or_else(|| Status::unauthenticated("no verified client certificate"))
}

/// Evaluate basic authorization for one method call.
pub fn authorize(
	authz: Option<&Arc<PolicyQuery>>,
	extensions: &Extensions,
	method: &str,
) -> Result<(), Status> {
	let Some(query) = authz else {
		return Ok(());
	};

	let identity = extensions
		.get::<Identity>()
		.map(|identity| identity.0.clone());
	let input = json!({
		"identity": identity,
		"method": method,
	});

	match query.eval(&input) {
		Some(serde_json::Value::Bool(true)) => Ok(()),
		_ => Err(Status::permission_denied(format!(
			"not authorized for {}",
			method
		))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		engine::data::DataEngine,
		store::MemoryStore,
		supervisor::{Labels, Manager},
	};
	use serde_json::json;
	use std::collections::BTreeMap;

	#[test]
	fn token_mode_requires_bearer() {
		let mut intercept = interceptor(AuthnMode::Token);

		let request = Request::new(());
		assert_eq!(
			intercept(request).unwrap_err().code(),
			tonic::Code::Unauthenticated
		);

		let mut request = Request::new(());
		request
			.metadata_mut()
			.insert("authorization", "Bearer secret".parse().unwrap());
		let passed = intercept(request).unwrap();
		assert_eq!(
			passed.extensions().get::<Identity>(),
			Some(&Identity("secret".to_owned()))
		);
	}

	#[test]
	fn off_mode_passes_everything() {
		let mut intercept = interceptor(AuthnMode::Off);
		let passed = intercept(Request::new(())).unwrap();
		assert!(passed.extensions().get::<Identity>().is_none());
	}

	#[test]
	fn basic_authz_consults_the_policy() {
		let store = MemoryStore::with_data(
			json!({"system": {"authz": {"allow": true}}}),
		);
		let manager = Arc::new(Manager::new(
			Arc::new(store),
			Arc::new(DataEngine::new()),
			Labels::new("arbiterd", BTreeMap::new()),
		));
		let query = Arc::new(PolicyQuery::from_query(
			"authz",
			"data.system.authz.allow",
			&manager,
		));

		let extensions = Extensions::default();
		assert!(authorize(Some(&query), &extensions, "v1.GetData").is_ok());
	}

	#[test]
	fn undefined_authz_denies() {
		let manager = Arc::new(Manager::new(
			Arc::new(MemoryStore::new()),
			Arc::new(DataEngine::new()),
			Labels::new("arbiterd", BTreeMap::new()),
		));
		let query = Arc::new(PolicyQuery::from_query(
			"authz",
			"data.system.authz.allow",
			&manager,
		));

		let extensions = Extensions::default();
		let err = authorize(Some(&query), &extensions, "v1.GetData").unwrap_err();
		assert_eq!(err.code(), tonic::Code::PermissionDenied);
	}
}
