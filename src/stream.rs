//! Buffered, framed packet I/O over one half of a transport.

use crate::{
	packet::{DecodeError, Packet},
	Error,
};
use bytes::BytesMut;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Decodes packets from an [`AsyncRead`] half, or encodes packets onto an
/// [`AsyncWrite`] half through an internal scratch buffer.
#[derive(Debug)]
pub(crate) struct PacketStream<T> {
	stream: T,
	buffer: BytesMut,
}

impl<T> PacketStream<T> {
	pub fn new(stream: T) -> Self {
		Self {
			stream,
			buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
		}
	}

	fn parse_buffered(&mut self) -> Result<Option<Packet>, DecodeError> {
		let mut cursor = Cursor::new(&self.buffer[..]);
		match Packet::check(&mut cursor) {
			Ok(extent) => {
				let frame = self.buffer.split_to(extent);
				let packet = Packet::decode(&mut Cursor::new(&frame[..]))?;
				Ok(Some(packet))
			}
			Err(DecodeError::Incomplete) => Ok(None),
			Err(error) => Err(error),
		}
	}
}

impl<T: AsyncRead + Unpin> PacketStream<T> {
	/// Reads one packet from the stream. `Ok(None)` means the peer shut the
	/// connection down cleanly on a frame boundary.
	pub async fn read_packet(&mut self) -> Result<Option<Packet>, Error> {
		loop {
			if let Some(packet) = self.parse_buffered()? {
				return Ok(Some(packet));
			}

			if 0 == self.stream.read_buf(&mut self.buffer).await? {
				if self.buffer.is_empty() {
					return Ok(None);
				}
				return Err(Error::ConnectionReset);
			}
		}
	}
}

impl<T: AsyncWrite + Unpin> PacketStream<T> {
	/// Encodes `packet` into the scratch buffer and writes it out whole.
	pub async fn write_packet(&mut self, packet: &Packet) -> Result<(), Error> {
		self.buffer.clear();
		packet.encode(&mut self.buffer)?;
		tracing::trace!(packet = ?packet.packet_type(), len = self.buffer.len(), "writing to stream");

		self.stream.write_all(&self.buffer).await?;
		self.stream.flush().await?;
		Ok(())
	}

	/// Flushes and shuts down the write side of the transport.
	pub async fn shutdown(&mut self) -> Result<(), Error> {
		self.stream.shutdown().await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::PacketStream;
	use crate::{packet::Packet, Error, PacketId};

	#[tokio::test]
	async fn reads_packets_split_across_writes() {
		let (client, server) = tokio::io::duplex(64);
		let mut reader = PacketStream::new(client);

		tokio::spawn(async move {
			use tokio::io::AsyncWriteExt;
			let mut server = server;
			// A PubAck frame delivered one byte at a time.
			for byte in [0x40u8, 0x02, 0x00, 0x07] {
				server.write_all(&[byte]).await.unwrap();
				server.flush().await.unwrap();
			}
		});

		let packet = reader.read_packet().await.unwrap().unwrap();
		assert_eq!(packet.id(), PacketId::new(7));
	}

	#[tokio::test]
	async fn clean_shutdown_yields_none() {
		let (client, server) = tokio::io::duplex(64);
		drop(server);

		let mut reader = PacketStream::new(client);
		assert!(reader.read_packet().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn mid_frame_shutdown_is_reset() {
		let (client, server) = tokio::io::duplex(64);

		{
			use tokio::io::AsyncWriteExt;
			let mut server = server;
			server.write_all(&[0x40, 0x02, 0x00]).await.unwrap();
			// Dropped here, mid-frame.
		}

		let mut reader = PacketStream::new(client);
		assert!(matches!(
			reader.read_packet().await,
			Err(Error::ConnectionReset)
		));
	}

	#[tokio::test]
	async fn write_then_read_round_trips() {
		let (client, server) = tokio::io::duplex(256);
		let mut writer = PacketStream::new(client);
		let mut reader = PacketStream::new(server);

		writer.write_packet(&Packet::PingReq).await.unwrap();
		let packet = reader.read_packet().await.unwrap().unwrap();
		assert_eq!(packet, Packet::PingReq);
	}
}
