//! Transport dial: TCP, optionally wrapped in TLS.

use crate::{options::Options, Error};
use tokio::{
	io::{AsyncRead, AsyncWrite},
	net::TcpStream,
	time,
};

pub(crate) trait AsyncReadWrite: AsyncRead + AsyncWrite + Send {}
impl AsyncReadWrite for TcpStream {}

#[cfg(feature = "tls")]
impl AsyncReadWrite for tokio_rustls::client::TlsStream<TcpStream> {}

pub(crate) type Transport = Box<dyn AsyncReadWrite + Unpin>;

/// Dials `server`, completing the TCP connect and (if configured) the TLS
/// handshake within the dial timeout.
pub(crate) async fn dial(server: &str, options: &Options) -> Result<Transport, Error> {
	time::timeout(options.dial_timeout(), connect(server, options))
		.await
		.map_err(|_| Error::Timeout)?
}

#[cfg(not(feature = "tls"))]
async fn connect(server: &str, _options: &Options) -> Result<Transport, Error> {
	let stream = TcpStream::connect(server).await?;
	Ok(Box::new(stream))
}

#[cfg(feature = "tls")]
async fn connect(server: &str, options: &Options) -> Result<Transport, Error> {
	use std::sync::Arc;
	use tokio_rustls::{rustls::ServerName, TlsConnector};

	let stream = TcpStream::connect(server).await?;

	let Some(tls) = options.tls() else {
		return Ok(Box::new(stream));
	};

	let host = server.rsplit_once(':').map(|(host, _)| host).unwrap_or(server);
	let name = tls.server_name.as_deref().unwrap_or(host);
	let server_name = ServerName::try_from(name).map_err(|_| {
		Error::Io(std::io::Error::new(
			std::io::ErrorKind::InvalidInput,
			"invalid TLS server name",
		))
	})?;

	let connector = TlsConnector::from(Arc::clone(&tls.config));
	let stream = connector.connect(server_name, stream).await?;
	Ok(Box::new(stream))
}

/// Loads the PEM material of `options` into a rustls client configuration.
#[cfg(feature = "tls")]
pub(crate) fn configure_tls(
	options: &crate::options::TlsOptions,
) -> Result<std::sync::Arc<tokio_rustls::rustls::ClientConfig>, crate::options::OptionsError> {
	use crate::options::OptionsError;
	use std::{fs, path::Path, sync::Arc};
	use tokio_rustls::rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore};

	fn read_file(path: &Path) -> Result<Vec<u8>, OptionsError> {
		fs::read(path).map_err(|source| OptionsError::ReadFile {
			path: path.to_path_buf(),
			source,
		})
	}

	let cert_pem = read_file(&options.cert)?;
	let mut cert_slice = &cert_pem[..];
	let certs: Vec<Certificate> = rustls_pemfile::certs(&mut cert_slice)
		.map_err(|source| OptionsError::ReadFile {
			path: options.cert.clone(),
			source,
		})?
		.into_iter()
		.map(Certificate)
		.collect();
	if certs.is_empty() {
		return Err(OptionsError::MissingCertificate(options.cert.clone()));
	}

	let key_pem = read_file(&options.key)?;
	let mut key_slice = &key_pem[..];
	let key = loop {
		match rustls_pemfile::read_one(&mut key_slice).map_err(|source| {
			OptionsError::ReadFile {
				path: options.key.clone(),
				source,
			}
		})? {
			Some(rustls_pemfile::Item::PKCS8Key(key))
			| Some(rustls_pemfile::Item::RSAKey(key))
			| Some(rustls_pemfile::Item::ECKey(key)) => break PrivateKey(key),
			Some(_) => continue,
			None => return Err(OptionsError::MissingPrivateKey(options.key.clone())),
		}
	};

	let mut roots = RootCertStore::empty();
	match &options.ca {
		Some(path) => {
			let ca_pem = read_file(path)?;
			let mut ca_slice = &ca_pem[..];
			let ca_certs = rustls_pemfile::certs(&mut ca_slice).map_err(|source| {
				OptionsError::ReadFile {
					path: path.clone(),
					source,
				}
			})?;
			if ca_certs.is_empty() {
				return Err(OptionsError::InvalidCaCertificate(path.clone()));
			}
			for der in ca_certs {
				roots
					.add(&Certificate(der))
					.map_err(|_| OptionsError::InvalidCaCertificate(path.clone()))?;
			}
		}
		None => {
			roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|anchor| {
				tokio_rustls::rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
					anchor.subject,
					anchor.spki,
					anchor.name_constraints,
				)
			}));
		}
	}

	let mut config = ClientConfig::builder()
		.with_safe_defaults()
		.with_root_certificates(roots)
		.with_client_auth_cert(certs, key)?;

	if options.insecure_skip_verify {
		config
			.dangerous()
			.set_certificate_verifier(Arc::new(danger::NoVerify));
	}

	Ok(Arc::new(config))
}

#[cfg(feature = "tls")]
mod danger {
	use std::time::SystemTime;
	use tokio_rustls::rustls::{
		client::{ServerCertVerified, ServerCertVerifier},
		Certificate, ServerName,
	};

	/// Accepts any server certificate. Only installed when the options
	/// explicitly ask to skip verification.
	pub(super) struct NoVerify;

	impl ServerCertVerifier for NoVerify {
		fn verify_server_cert(
			&self,
			_end_entity: &Certificate,
			_intermediates: &[Certificate],
			_server_name: &ServerName,
			_scts: &mut dyn Iterator<Item = &[u8]>,
			_ocsp_response: &[u8],
			_now: SystemTime,
		) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
			Ok(ServerCertVerified::assertion())
		}
	}
}
