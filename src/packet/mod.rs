//! MQTT 3.1.1 control-packet codec.
//!
//! Every packet is a one-byte fixed header (4-bit type, 4-bit flags), a
//! variable-length remaining-length field and a body of exactly that many
//! bytes. [`Packet::check`] scans a buffer for one complete frame,
//! [`Packet::decode`] parses it and [`Packet::encode`] writes one out.

mod connect;
mod publish;
mod subscribe;
pub(crate) mod wire;

pub use connect::{return_code, ConnAck, Connect, Credentials, Will};
pub use publish::{PubAck, PubComp, PubRec, PubRel, Publish};
pub use subscribe::{SubAck, Subscribe, SubscribeFailed, UnsubAck, Unsubscribe};

use crate::PacketId;
use bytes::BufMut;
use std::io;
use thiserror::Error;

pub(crate) const CONNECT: u8 = 0x10;
pub(crate) const CONNACK: u8 = 0x20;
pub(crate) const PUBLISH: u8 = 0x30;
pub(crate) const PUBACK: u8 = 0x40;
pub(crate) const PUBREC: u8 = 0x50;
pub(crate) const PUBREL: u8 = 0x60;
pub(crate) const PUBCOMP: u8 = 0x70;
pub(crate) const SUBSCRIBE: u8 = 0x80;
pub(crate) const SUBACK: u8 = 0x90;
pub(crate) const UNSUBSCRIBE: u8 = 0xa0;
pub(crate) const UNSUBACK: u8 = 0xb0;
pub(crate) const PINGREQ: u8 = 0xc0;
pub(crate) const PINGRESP: u8 = 0xd0;
pub(crate) const DISCONNECT: u8 = 0xe0;

/// Decoding failure. Everything except [`Incomplete`] means the peer sent a
/// malformed packet and the connection should be torn down.
///
/// [`Incomplete`]: DecodeError::Incomplete
#[derive(Debug, Error)]
pub enum DecodeError {
	#[error("need more bytes to decode a packet")]
	Incomplete,
	#[error("invalid fixed header")]
	InvalidHeader,
	#[error("remaining length exceeds 4 bytes")]
	MalformedLength,
	#[error("packet identifier must be non-zero")]
	ZeroPacketId,
	#[error(transparent)]
	InvalidQoS(#[from] crate::InvalidQoS),
	#[error(transparent)]
	InvalidTopic(#[from] crate::InvalidTopic),
	#[error(transparent)]
	InvalidFilter(#[from] crate::InvalidFilter),
	#[error("invalid utf-8 in string: {0}")]
	Utf8(#[from] std::str::Utf8Error),
	#[error("malformed packet: {0}")]
	Malformed(&'static str),
}

/// Encoding failure.
#[derive(Debug, Error)]
pub enum EncodeError {
	#[error("packet body exceeds maximum remaining length (268,435,455 bytes)")]
	BodyTooLarge,
	#[error("string exceeds maximum MQTT string length (65,535 bytes)")]
	StringTooLong,
	#[error("publish with QoS above AtMostOnce requires a packet identifier")]
	MissingPacketId,
}

/// An MQTT 3.1.1 control packet.
#[derive(Debug, PartialEq)]
pub enum Packet {
	Connect(Box<Connect>),
	ConnAck(ConnAck),
	Publish(Publish),
	PubAck(PubAck),
	PubRec(PubRec),
	PubRel(PubRel),
	PubComp(PubComp),
	Subscribe(Subscribe),
	SubAck(SubAck),
	Unsubscribe(Unsubscribe),
	UnsubAck(UnsubAck),
	PingReq,
	PingResp,
	Disconnect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
	Connect,
	ConnAck,
	Publish,
	PubAck,
	PubRec,
	PubRel,
	PubComp,
	Subscribe,
	SubAck,
	Unsubscribe,
	UnsubAck,
	PingReq,
	PingResp,
	Disconnect,
}

impl Packet {
	/// Checks whether `src` holds one complete packet. On success returns
	/// the total frame length in bytes; [`DecodeError::Incomplete`] means
	/// more data is needed.
	pub fn check(src: &mut io::Cursor<&[u8]>) -> Result<usize, DecodeError> {
		let header = wire::take_u8(src)?;
		if header & 0xf0 == 0 || header & 0xf0 == 0xf0 {
			return Err(DecodeError::InvalidHeader);
		}

		let length = wire::take_var(src)?;
		wire::take_slice(src, length)?;
		Ok(src.position() as usize)
	}

	/// Decodes exactly one packet from `src`.
	pub fn decode(src: &mut io::Cursor<&[u8]>) -> Result<Self, DecodeError> {
		let header = wire::take_u8(src)?;
		let length = wire::take_var(src)?;
		let body = wire::take_slice(src, length)?;
		let mut body = io::Cursor::new(body);

		let packet = match (header & 0xf0, header & 0x0f) {
			(CONNECT, 0x00) => Connect::parse(&mut body)?.into(),
			(CONNACK, 0x00) => ConnAck::parse(&mut body)?.into(),
			(PUBLISH, flags) => Publish::parse(&mut body, flags)?.into(),
			(PUBACK, 0x00) => PubAck::parse(&mut body)?.into(),
			(PUBREC, 0x00) => PubRec::parse(&mut body)?.into(),
			(PUBREL, 0x02) => PubRel::parse(&mut body)?.into(),
			(PUBCOMP, 0x00) => PubComp::parse(&mut body)?.into(),
			(SUBSCRIBE, 0x02) => Subscribe::parse(&mut body)?.into(),
			(SUBACK, 0x00) => SubAck::parse(&mut body)?.into(),
			(UNSUBSCRIBE, 0x02) => Unsubscribe::parse(&mut body)?.into(),
			(UNSUBACK, 0x00) => UnsubAck::parse(&mut body)?.into(),
			(PINGREQ, 0x00) => Self::PingReq,
			(PINGRESP, 0x00) => Self::PingResp,
			(DISCONNECT, 0x00) => Self::Disconnect,
			_ => return Err(DecodeError::InvalidHeader),
		};

		match &packet {
			Self::PingReq | Self::PingResp | Self::Disconnect if length != 0 => {
				return Err(DecodeError::Malformed("packet must have length 0"));
			}
			_ => {}
		}

		if wire::remaining(&body) != 0 {
			return Err(DecodeError::Malformed("trailing bytes after packet body"));
		}

		Ok(packet)
	}

	/// Encodes the packet into `dst`.
	pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), EncodeError> {
		match self {
			Self::Connect(connect) => connect.encode(dst),
			Self::ConnAck(connack) => connack.encode(dst),
			Self::Publish(publish) => publish.encode(dst),
			Self::PubAck(puback) => puback.encode(dst),
			Self::PubRec(pubrec) => pubrec.encode(dst),
			Self::PubRel(pubrel) => pubrel.encode(dst),
			Self::PubComp(pubcomp) => pubcomp.encode(dst),
			Self::Subscribe(subscribe) => subscribe.encode(dst),
			Self::SubAck(suback) => suback.encode(dst),
			Self::Unsubscribe(unsubscribe) => unsubscribe.encode(dst),
			Self::UnsubAck(unsuback) => unsuback.encode(dst),
			Self::PingReq => encode_empty(dst, PINGREQ),
			Self::PingResp => encode_empty(dst, PINGRESP),
			Self::Disconnect => encode_empty(dst, DISCONNECT),
		}
	}

	#[inline]
	pub fn packet_type(&self) -> PacketType {
		match self {
			Self::Connect(_) => PacketType::Connect,
			Self::ConnAck(_) => PacketType::ConnAck,
			Self::Publish(_) => PacketType::Publish,
			Self::PubAck(_) => PacketType::PubAck,
			Self::PubRec(_) => PacketType::PubRec,
			Self::PubRel(_) => PacketType::PubRel,
			Self::PubComp(_) => PacketType::PubComp,
			Self::Subscribe(_) => PacketType::Subscribe,
			Self::SubAck(_) => PacketType::SubAck,
			Self::Unsubscribe(_) => PacketType::Unsubscribe,
			Self::UnsubAck(_) => PacketType::UnsubAck,
			Self::PingReq => PacketType::PingReq,
			Self::PingResp => PacketType::PingResp,
			Self::Disconnect => PacketType::Disconnect,
		}
	}

	/// Returns the packet identifier correlating a QoS or subscription flow,
	/// if the packet carries one.
	pub fn id(&self) -> Option<PacketId> {
		match self {
			Self::Publish(publish) => publish.id,
			Self::PubAck(PubAck { id })
			| Self::PubRec(PubRec { id })
			| Self::PubRel(PubRel { id })
			| Self::PubComp(PubComp { id })
			| Self::UnsubAck(UnsubAck { id }) => Some(*id),
			Self::Subscribe(Subscribe { id, .. })
			| Self::SubAck(SubAck { id, .. })
			| Self::Unsubscribe(Unsubscribe { id, .. }) => Some(*id),
			_ => None,
		}
	}
}

fn encode_empty(dst: &mut impl BufMut, header: u8) -> Result<(), EncodeError> {
	wire::put_u8(dst, header);
	wire::put_var(dst, 0)?;
	Ok(())
}

/// Generates an acknowledgment packet that carries only a packet identifier.
macro_rules! id_packet {
	($name:tt, $variant:expr, $header:literal) => {
		#[derive(Debug, PartialEq, Eq)]
		pub struct $name {
			pub id: crate::PacketId,
		}

		impl $name {
			pub(crate) fn parse(
				src: &mut std::io::Cursor<&[u8]>,
			) -> Result<Self, crate::packet::DecodeError> {
				if crate::packet::wire::remaining(src) != 2 {
					return Err(crate::packet::DecodeError::Malformed(
						"packet must have length 2",
					));
				}
				let id = crate::packet::wire::take_id(src)?;
				Ok(Self { id })
			}

			pub(crate) fn encode(
				&self,
				dst: &mut impl bytes::BufMut,
			) -> Result<(), crate::packet::EncodeError> {
				let Self { id } = self;
				crate::packet::wire::put_u8(dst, $header);
				crate::packet::wire::put_var(dst, 2)?;
				crate::packet::wire::put_u16(dst, id.get());
				Ok(())
			}
		}

		impl From<$name> for crate::packet::Packet {
			#[inline]
			fn from(value: $name) -> crate::packet::Packet {
				$variant(value)
			}
		}
	};
}
pub(crate) use id_packet;

impl From<Connect> for Packet {
	#[inline]
	fn from(value: Connect) -> Self {
		Self::Connect(value.into())
	}
}

impl From<ConnAck> for Packet {
	#[inline]
	fn from(value: ConnAck) -> Self {
		Self::ConnAck(value)
	}
}

impl From<Publish> for Packet {
	#[inline]
	fn from(value: Publish) -> Self {
		Self::Publish(value)
	}
}

impl From<Subscribe> for Packet {
	#[inline]
	fn from(value: Subscribe) -> Self {
		Self::Subscribe(value)
	}
}

impl From<SubAck> for Packet {
	#[inline]
	fn from(value: SubAck) -> Self {
		Self::SubAck(value)
	}
}

impl From<Unsubscribe> for Packet {
	#[inline]
	fn from(value: Unsubscribe) -> Self {
		Self::Unsubscribe(value)
	}
}

#[cfg(test)]
mod tests {
	use super::{DecodeError, Packet};
	use std::io::Cursor;

	fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
		Packet::decode(&mut Cursor::new(bytes))
	}

	#[test]
	fn check_reports_frame_length() {
		let bytes = [0xd0, 0x00, 0xc0, 0x00];
		let mut cursor = Cursor::new(&bytes[..]);
		assert_eq!(Packet::check(&mut cursor).unwrap(), 2);
	}

	#[test]
	fn check_rejects_reserved_types() {
		for header in [0x00, 0xf0] {
			let bytes = [header, 0x00];
			let mut cursor = Cursor::new(&bytes[..]);
			assert!(matches!(
				Packet::check(&mut cursor),
				Err(DecodeError::InvalidHeader)
			));
		}
	}

	#[test]
	fn rejects_remaining_length_over_four_bytes() {
		let bytes = [0x30, 0x80, 0x80, 0x80, 0x80, 0x01];
		let mut cursor = Cursor::new(&bytes[..]);
		assert!(matches!(
			Packet::check(&mut cursor),
			Err(DecodeError::MalformedLength)
		));
	}

	#[test]
	fn rejects_invalid_reserved_flags() {
		// PubRel must carry flags 0x02.
		assert!(matches!(
			decode(&[0x60, 0x02, 0x00, 0x07]),
			Err(DecodeError::InvalidHeader)
		));
		// Subscribe must carry flags 0x02.
		assert!(matches!(
			decode(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x01, b'y', 0x00]),
			Err(DecodeError::InvalidHeader)
		));
	}

	#[test]
	fn rejects_truncated_body() {
		assert!(matches!(
			decode(&[0x40, 0x02, 0x00]),
			Err(DecodeError::Incomplete)
		));
	}

	#[test]
	fn rejects_nonempty_singletons() {
		assert!(matches!(
			decode(&[0xc0, 0x01, 0x00]),
			Err(DecodeError::Malformed(_))
		));
	}

	#[test]
	fn decodes_singletons() {
		assert_eq!(decode(&[0xc0, 0x00]).unwrap(), Packet::PingReq);
		assert_eq!(decode(&[0xd0, 0x00]).unwrap(), Packet::PingResp);
		assert_eq!(decode(&[0xe0, 0x00]).unwrap(), Packet::Disconnect);
	}
}
