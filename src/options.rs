//! Immutable client configuration.

use crate::{
	backoff::Backoff,
	packet::{Connect, Credentials, Will},
};
use std::time::Duration;
use thiserror::Error;

#[cfg(feature = "tls")]
use std::path::PathBuf;

const DEFAULT_QUEUE_CAPACITY: usize = 128;
const MAX_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(120);
const DEFAULT_KEEP_ALIVE_FACTOR: f64 = 1.2;

/// Client options, immutable once built.
///
/// Assembled with [`Options::builder`] before the first connect; every
/// connection of the client reads the same snapshot.
#[derive(Debug)]
pub struct Options {
	servers: Vec<String>,
	dial_timeout: Duration,
	keep_alive: Duration,
	keep_alive_factor: f64,
	clean_session: bool,
	client_id: String,
	credentials: Option<Credentials>,
	will: Option<Will>,
	send_queue: usize,
	recv_queue: usize,
	backoff: Backoff,
	#[cfg(feature = "tls")]
	tls: Option<TlsConfig>,
}

/// TLS material for broker connections: client certificate and key, an
/// optional CA bundle (system roots are used otherwise), an optional SNI
/// override and a verification escape hatch.
///
/// The PEM files are read and validated when the options are built.
#[cfg(feature = "tls")]
#[derive(Clone, Debug)]
pub struct TlsOptions {
	pub cert: PathBuf,
	pub key: PathBuf,
	pub ca: Option<PathBuf>,
	pub server_name: Option<String>,
	pub insecure_skip_verify: bool,
}

#[cfg(feature = "tls")]
#[derive(Clone)]
pub(crate) struct TlsConfig {
	pub config: std::sync::Arc<tokio_rustls::rustls::ClientConfig>,
	pub server_name: Option<String>,
}

#[cfg(feature = "tls")]
impl std::fmt::Debug for TlsConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TlsConfig")
			.field("server_name", &self.server_name)
			.finish_non_exhaustive()
	}
}

/// Configuration rejected at construction.
#[derive(Debug, Error)]
pub enum OptionsError {
	#[error("client id cannot exceed maximum length for an MQTT string (65,535 bytes)")]
	ClientIdTooLong,

	#[cfg(feature = "tls")]
	#[error("failed to read {}: {source}", path.display())]
	ReadFile {
		path: PathBuf,
		source: std::io::Error,
	},

	#[cfg(feature = "tls")]
	#[error("no certificate found in {}", .0.display())]
	MissingCertificate(PathBuf),

	#[cfg(feature = "tls")]
	#[error("no private key found in {}", .0.display())]
	MissingPrivateKey(PathBuf),

	#[cfg(feature = "tls")]
	#[error("no usable CA certificate in {}", .0.display())]
	InvalidCaCertificate(PathBuf),

	#[cfg(feature = "tls")]
	#[error("tls configuration: {0}")]
	Tls(#[from] tokio_rustls::rustls::Error),
}

impl Options {
	pub fn builder() -> OptionsBuilder {
		OptionsBuilder::default()
	}

	/// Configured servers, each a `host:port` address.
	#[inline]
	pub fn servers(&self) -> &[String] {
		&self.servers
	}

	/// Bound on TCP dial, TLS handshake and the ConnAck wait.
	#[inline]
	pub fn dial_timeout(&self) -> Duration {
		self.dial_timeout
	}

	/// Keepalive interval. Zero disables the keepalive supervisor.
	#[inline]
	pub fn keep_alive(&self) -> Duration {
		self.keep_alive
	}

	/// Dead-connection threshold is `keep_alive × keep_alive_factor`.
	#[inline]
	pub fn keep_alive_factor(&self) -> f64 {
		self.keep_alive_factor
	}

	#[inline]
	pub fn clean_session(&self) -> bool {
		self.clean_session
	}

	#[inline]
	pub fn client_id(&self) -> &str {
		&self.client_id
	}

	/// Capacity of the shared outbound queue.
	#[inline]
	pub fn send_queue(&self) -> usize {
		self.send_queue
	}

	/// Capacity of the shared inbound publish queue.
	#[inline]
	pub fn recv_queue(&self) -> usize {
		self.recv_queue
	}

	/// Backoff parameters for callers building a reconnect supervisor.
	#[inline]
	pub fn backoff(&self) -> Backoff {
		self.backoff
	}

	#[cfg(feature = "tls")]
	pub(crate) fn tls(&self) -> Option<&TlsConfig> {
		self.tls.as_ref()
	}

	/// Builds the Connect packet announced to every broker.
	pub(crate) fn connect_packet(&self) -> Connect {
		Connect {
			client_id: self.client_id.clone(),
			keep_alive: self.keep_alive.as_secs().min(u16::MAX as u64) as u16,
			clean_session: self.clean_session,
			will: self.will.clone(),
			credentials: self.credentials.clone(),
		}
	}
}

/// Builder for [`Options`].
#[derive(Debug)]
pub struct OptionsBuilder {
	servers: Vec<String>,
	dial_timeout: Duration,
	keep_alive: Duration,
	keep_alive_factor: f64,
	clean_session: bool,
	client_id: String,
	credentials: Option<Credentials>,
	will: Option<Will>,
	send_queue: usize,
	recv_queue: usize,
	backoff: Backoff,
	#[cfg(feature = "tls")]
	tls: Option<TlsOptions>,
}

impl Default for OptionsBuilder {
	fn default() -> Self {
		Self {
			servers: Vec::new(),
			dial_timeout: DEFAULT_DIAL_TIMEOUT,
			keep_alive: DEFAULT_KEEP_ALIVE,
			keep_alive_factor: 1.5,
			clean_session: false,
			client_id: String::new(),
			credentials: None,
			will: None,
			send_queue: DEFAULT_QUEUE_CAPACITY,
			recv_queue: DEFAULT_QUEUE_CAPACITY,
			backoff: Backoff::default(),
			#[cfg(feature = "tls")]
			tls: None,
		}
	}
}

impl OptionsBuilder {
	/// Adds a server as a `host:port` address.
	pub fn server(mut self, server: impl Into<String>) -> Self {
		self.servers.push(server.into());
		self
	}

	/// Replaces the server list.
	pub fn servers<S: Into<String>>(mut self, servers: impl IntoIterator<Item = S>) -> Self {
		self.servers = servers.into_iter().map(Into::into).collect();
		self
	}

	pub fn dial_timeout(mut self, timeout: Duration) -> Self {
		self.dial_timeout = timeout;
		self
	}

	/// Sets the keepalive interval and the dead-connection factor.
	///
	/// A factor of 1 or below is replaced with the default 1.2.
	pub fn keep_alive(mut self, interval: Duration, factor: f64) -> Self {
		self.keep_alive = interval;
		self.keep_alive_factor = if factor > 1.0 {
			factor
		} else {
			DEFAULT_KEEP_ALIVE_FACTOR
		};
		self
	}

	pub fn clean_session(mut self, clean_session: bool) -> Self {
		self.clean_session = clean_session;
		self
	}

	pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
		self.client_id = client_id.into();
		self
	}

	/// Sets the username and optional password.
	pub fn credentials(mut self, credentials: impl Into<Credentials>) -> Self {
		self.credentials = Some(credentials.into());
		self
	}

	pub fn will(mut self, will: Will) -> Self {
		self.will = Some(will);
		self
	}

	/// Capacity of the shared outbound queue, clamped to `1..=1024`.
	pub fn send_queue(mut self, capacity: usize) -> Self {
		self.send_queue = capacity.clamp(1, MAX_QUEUE_CAPACITY);
		self
	}

	/// Capacity of the shared inbound publish queue, clamped to `1..=1024`.
	pub fn recv_queue(mut self, capacity: usize) -> Self {
		self.recv_queue = capacity.clamp(1, MAX_QUEUE_CAPACITY);
		self
	}

	pub fn backoff(mut self, backoff: Backoff) -> Self {
		self.backoff = backoff;
		self
	}

	#[cfg(feature = "tls")]
	pub fn tls(mut self, tls: TlsOptions) -> Self {
		self.tls = Some(tls);
		self
	}

	/// Finishes the options, reading and validating TLS material.
	pub fn build(self) -> Result<Options, OptionsError> {
		if self.client_id.len() > u16::MAX as usize {
			return Err(OptionsError::ClientIdTooLong);
		}

		#[cfg(feature = "tls")]
		let tls = match self.tls {
			Some(tls) => Some(TlsConfig {
				config: crate::transport::configure_tls(&tls)?,
				server_name: tls.server_name,
			}),
			None => None,
		};

		Ok(Options {
			servers: self.servers,
			dial_timeout: self.dial_timeout,
			keep_alive: self.keep_alive,
			keep_alive_factor: self.keep_alive_factor,
			clean_session: self.clean_session,
			client_id: self.client_id,
			credentials: self.credentials,
			will: self.will,
			send_queue: self.send_queue,
			recv_queue: self.recv_queue,
			backoff: self.backoff,
			#[cfg(feature = "tls")]
			tls,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::Options;
	use std::time::Duration;

	#[test]
	fn queue_capacities_clamp() {
		let options = Options::builder()
			.send_queue(0)
			.recv_queue(1_000_000)
			.build()
			.unwrap();
		assert_eq!(options.send_queue(), 1);
		assert_eq!(options.recv_queue(), 1024);

		let options = Options::builder()
			.send_queue(64)
			.recv_queue(1024)
			.build()
			.unwrap();
		assert_eq!(options.send_queue(), 64);
		assert_eq!(options.recv_queue(), 1024);
	}

	#[test]
	fn defaults() {
		let options = Options::builder().build().unwrap();
		assert_eq!(options.send_queue(), 128);
		assert_eq!(options.recv_queue(), 128);
		assert_eq!(options.dial_timeout(), Duration::from_secs(20));
		assert_eq!(options.keep_alive(), Duration::from_secs(120));
		assert_eq!(options.backoff().first, Duration::from_secs(1));
		assert_eq!(options.backoff().max, Duration::from_secs(120));
		assert_eq!(options.backoff().factor, 1.5);
	}

	#[test]
	fn keep_alive_factor_below_one_takes_default() {
		let options = Options::builder()
			.keep_alive(Duration::from_secs(30), 0.5)
			.build()
			.unwrap();
		assert_eq!(options.keep_alive_factor(), 1.2);

		let options = Options::builder()
			.keep_alive(Duration::from_secs(30), 2.0)
			.build()
			.unwrap();
		assert_eq!(options.keep_alive_factor(), 2.0);
	}

	#[test]
	fn connect_packet_reflects_options() {
		let options = Options::builder()
			.client_id("fleet-7")
			.clean_session(true)
			.keep_alive(Duration::from_secs(30), 1.5)
			.credentials(("user", "pass"))
			.build()
			.unwrap();

		let connect = options.connect_packet();
		assert_eq!(connect.client_id, "fleet-7");
		assert_eq!(connect.keep_alive, 30);
		assert!(connect.clean_session);
		assert_eq!(connect.credentials.unwrap().username, "user");
	}
}
