// SPDX-License-Identifier: Apache-2.0

//! TLS serving with hot certificate reload.
//!
//! The rustls server config holds a certificate resolver that reads a
//! lock-protected slot. A refresh task wakes every
//! `cert_refresh_interval`, hashes the cert and key files, and swaps
//! the slot when either hash changed. The server itself is never
//! rebuilt; new handshakes pick up the new certificate through the
//! resolver, and in-flight connections are untouched.

use crate::{
	error::Error,
	server::auth::TlsConnectInfo,
};
use rustls::{
	pki_types::{CertificateDer, PrivateKeyDer},
	server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier},
	sign::CertifiedKey,
	RootCertStore, ServerConfig,
};
use serde::Deserialize;
use std::{
	fmt,
	io::BufReader,
	path::{Path, PathBuf},
	pin::Pin,
	sync::{Arc, RwLock},
	task::{Context, Poll},
	time::Duration,
};
use tokio::{
	io::{AsyncRead, AsyncWrite, ReadBuf},
	net::{TcpListener, TcpStream},
	sync::{mpsc, oneshot},
};
use tokio_rustls::TlsAcceptor;
use tonic::transport::server::Connected;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TlsMinVersion {
	#[serde(rename = "1.0")]
	V1_0,
	#[serde(rename = "1.1")]
	V1_1,
	#[default]
	#[serde(rename = "1.2")]
	V1_2,
	#[serde(rename = "1.3")]
	V1_3,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TlsServerConfig {
	pub cert_file: PathBuf,
	pub cert_key_file: PathBuf,

	#[serde(
		default = "default_refresh_interval",
		with = "crate::util::duration::serde_duration"
	)]
	pub cert_refresh_interval: Duration,

	/// Root pool used to verify clients under mTLS.
	#[serde(default)]
	pub ca_cert_file: Option<PathBuf>,

	#[serde(default)]
	pub min_version: TlsMinVersion,
}

fn default_refresh_interval() -> Duration {
	Duration::from_secs(300)
}

/// The mutable certificate slot plus the file hashes it was loaded
/// from.
pub struct ReloadingCert {
	cert_file: PathBuf,
	key_file: PathBuf,
	current: RwLock<Arc<CertifiedKey>>,
	hashes: RwLock<(String, String)>,
}

impl fmt::Debug for ReloadingCert {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ReloadingCert")
			.field("cert_file", &self.cert_file)
			.field("key_file", &self.key_file)
			.finish()
	}
}

impl ReloadingCert {
	pub fn load(cert_file: &Path, key_file: &Path) -> Result<Self, Error> {
		let certified = load_certified_key(cert_file, key_file)?;
		let hashes = file_hashes(cert_file, key_file)?;
		Ok(ReloadingCert {
			cert_file: cert_file.to_path_buf(),
			key_file: key_file.to_path_buf(),
			current: RwLock::new(certified),
			hashes: RwLock::new(hashes),
		})
	}

	/// Hash both files; when either differs from the stored hash,
	/// reload and atomically swap the slot. Returns whether a swap
	/// happened.
	pub fn refresh_if_changed(&self) -> Result<bool, Error> {
		let next = file_hashes(&self.cert_file, &self.key_file)?;
		{
			let current = self.hashes.read().expect("hash lock poisoned");
			if *current == next {
				return Ok(false);
			}
		}

		let certified = load_certified_key(&self.cert_file, &self.key_file)?;
		*self.current.write().expect("cert lock poisoned") = certified;
		*self.hashes.write().expect("hash lock poisoned") = next;
		log::info!("reloaded TLS certificate from {:?}", self.cert_file);
		Ok(true)
	}
}

impl ResolvesServerCert for ReloadingCert {
	fn resolve(&self, _hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
		Some(Arc::clone(&self.current.read().expect("cert lock poisoned")))
	}
}

/// SHA-256 of both files, in (cert, key) order.
fn file_hashes(cert_file: &Path, key_file: &Path) -> Result<(String, String), Error> {
	let cert_bytes = std::fs::read(cert_file)?;
	let key_bytes = std::fs::read(key_file)?;
	Ok((sha256::digest(&cert_bytes), sha256::digest(&key_bytes)))
}

fn load_certified_key(cert_file: &Path, key_file: &Path) -> Result<Arc<CertifiedKey>, Error> {
	let mut cert_reader = BufReader::new(std::fs::File::open(cert_file)?);
	let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
		.collect::<Result<_, _>>()
		.map_err(|e| Error::config(format!("bad certificate file: {}", e)))?;
	if certs.is_empty() {
		return Err(Error::config(format!(
			"no certificates found in {:?}",
			cert_file
		)));
	}

	let mut key_reader = BufReader::new(std::fs::File::open(key_file)?);
	let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
		.map_err(|e| Error::config(format!("bad key file: {}", e)))?
		.ok_or_else(|| Error::config(format!("no private key found in {:?}", key_file)))?;

	let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
		.map_err(|e| Error::config(format!("unsupported private key: {}", e)))?;

	Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

/// Build the rustls server config around the reloading resolver.
pub fn server_config(
	resolver: Arc<ReloadingCert>,
	config: &TlsServerConfig,
	require_client_cert: bool,
) -> Result<ServerConfig, Error> {
	let versions: &[&'static rustls::SupportedProtocolVersion] = match config.min_version {
		// rustls does not implement 1.0/1.1; 1.2 is the floor.
		TlsMinVersion::V1_0 | TlsMinVersion::V1_1 | TlsMinVersion::V1_2 => {
			&[&rustls::version::TLS12, &rustls::version::TLS13]
		}
		TlsMinVersion::V1_3 => &[&rustls::version::TLS13],
	};
	if matches!(config.min_version, TlsMinVersion::V1_0 | TlsMinVersion::V1_1) {
		log::warn!("TLS 1.0/1.1 are not supported; using 1.2 as the minimum version");
	}

	let builder = ServerConfig::builder_with_protocol_versions(versions);

	let builder = if require_client_cert {
		let Some(ca_file) = &config.ca_cert_file else {
			return Err(Error::config(
				"tls authentication requires tls.ca_cert_file",
			));
		};
		let mut roots = RootCertStore::empty();
		let mut reader = BufReader::new(std::fs::File::open(ca_file)?);
		for cert in rustls_pemfile::certs(&mut reader) {
			let cert = cert.map_err(|e| Error::config(format!("bad CA file: {}", e)))?;
			roots
				.add(cert)
				.map_err(|e| Error::config(format!("bad CA certificate: {}", e)))?;
		}
		let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
			.build()
			.map_err(|e| Error::config(format!("client verifier: {}", e)))?;
		builder.with_client_cert_verifier(verifier)
	} else {
		builder.with_no_client_auth()
	};

	let mut server_config = builder.with_cert_resolver(resolver);
	server_config.alpn_protocols = vec![b"h2".to_vec()];
	Ok(server_config)
}

/// The certificate refresh loop. Stop signalling uses a dedicated
/// channel, and completion is acknowledged through `done_tx` so the
/// caller never leaks the task.
pub(crate) async fn run_cert_refresh(
	resolver: Arc<ReloadingCert>,
	interval: Duration,
	mut stop_rx: mpsc::Receiver<()>,
	done_tx: oneshot::Sender<()>,
) {
	loop {
		tokio::select! {
			_ = tokio::time::sleep(interval) => {
				match resolver.refresh_if_changed() {
					Ok(true) => {}
					Ok(false) => log::trace!("TLS certificate unchanged"),
					Err(e) => log::error!("TLS certificate refresh failed: {}", e),
				}
			}
			_ = stop_rx.recv() => break,
		}
	}
	let _ = done_tx.send(());
}

/// A served TLS connection carrying its connect info.
pub(crate) struct TlsStream {
	inner: tokio_rustls::server::TlsStream<TcpStream>,
	info: TlsConnectInfo,
}

impl Connected for TlsStream {
	type ConnectInfo = TlsConnectInfo;

	fn connect_info(&self) -> TlsConnectInfo {
		self.info.clone()
	}
}

impl AsyncRead for TlsStream {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl AsyncWrite for TlsStream {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<std::io::Result<usize>> {
		Pin::new(&mut self.inner).poll_write(cx, buf)
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
	) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}

/// Accept TCP connections and drive TLS handshakes off the accept
/// loop. Failed handshakes are logged, never fatal to the listener.
pub(crate) fn incoming_tls(
	listener: TcpListener,
	acceptor: TlsAcceptor,
) -> tokio_stream::wrappers::ReceiverStream<Result<TlsStream, std::io::Error>> {
	let (tx, rx) = mpsc::channel(16);

	tokio::spawn(async move {
		loop {
			// The receiver going away is server shutdown; release the
			// listener instead of accepting forever.
			let accepted = tokio::select! {
				_ = tx.closed() => break,
				accepted = listener.accept() => accepted,
			};
			let (tcp, remote_addr) = match accepted {
				Ok(accepted) => accepted,
				Err(e) => {
					log::warn!("accept failed: {}", e);
					continue;
				}
			};
			let acceptor = acceptor.clone();
			let tx = tx.clone();

			tokio::spawn(async move {
				match acceptor.accept(tcp).await {
					Ok(stream) => {
						let fingerprint = stream
							.get_ref()
							.1
							.peer_certificates()
							.and_then(|certs| certs.first())
							.map(|cert| sha256::digest(cert.as_ref()));
						let wrapped = TlsStream {
							inner: stream,
							info: TlsConnectInfo {
								remote_addr: Some(remote_addr),
								peer_cert_fingerprint: fingerprint,
							},
						};
						let _ = tx.send(Ok(wrapped)).await;
					}
					Err(e) => {
						log::debug!("TLS handshake with {} failed: {}", remote_addr, e);
					}
				}
			});
		}
	});

	tokio_stream::wrappers::ReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write as _;

	#[test]
	fn hash_pair_tracks_file_contents() {
		let dir = tempfile::tempdir().unwrap();
		let cert = dir.path().join("cert.pem");
		let key = dir.path().join("key.pem");
		std::fs::write(&cert, b"cert one").unwrap();
		std::fs::write(&key, b"key one").unwrap();

		let first = file_hashes(&cert, &key).unwrap();
		assert_eq!(first, file_hashes(&cert, &key).unwrap());

		let mut f = std::fs::OpenOptions::new().append(true).open(&cert).unwrap();
		f.write_all(b" changed").unwrap();
		drop(f);

		let second = file_hashes(&cert, &key).unwrap();
		assert_ne!(first.0, second.0);
		assert_eq!(first.1, second.1);
	}

	#[test]
	fn min_version_parses_dotted_strings() {
		#[derive(Deserialize)]
		struct Wrapper {
			min_version: TlsMinVersion,
		}
		let wrapper: Wrapper = serde_yaml::from_str("min_version: \"1.3\"").unwrap();
		assert_eq!(wrapper.min_version, TlsMinVersion::V1_3);
	}
}
