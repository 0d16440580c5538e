use crate::packet::{DecodeError, EncodeError};
use thiserror::Error;

/// Errors surfaced by client operations and connection handlers.
#[derive(Debug, Error)]
pub enum Error {
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	/// The peer sent a malformed or unexpected packet.
	#[error("bad packet: {0}")]
	BadPacket(#[from] DecodeError),

	#[error("encode error: {0}")]
	Encode(#[from] EncodeError),

	/// Dial or ConnAck wait exceeded the configured dial timeout, or a
	/// keepalive probe went unanswered.
	#[error("timed out")]
	Timeout,

	/// The peer closed the transport mid-frame.
	#[error("connection reset by peer")]
	ConnectionReset,

	/// The connection was torn down while a flow was still in flight.
	#[error("connection closed")]
	ConnectionClosed,

	/// The client has been destroyed or has no live connection.
	#[error("client is shut down")]
	ClientClosed,

	/// A connection to this server already exists.
	#[error("already connected to this server")]
	AlreadyConnected,

	#[error(transparent)]
	InvalidTopic(#[from] crate::InvalidTopic),

	#[error(transparent)]
	InvalidFilter(#[from] crate::InvalidFilter),
}
