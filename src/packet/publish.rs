use super::{id_packet, wire, DecodeError, EncodeError, Packet, PUBLISH};
use crate::{PacketId, QoS, TopicBuf};
use bytes::{BufMut, Bytes};
use std::io;

const RETAIN_FLAG: u8 = 0x01;
const QOS_MASK: u8 = 0x06;
const DUPLICATE_FLAG: u8 = 0x08;

/// Publish packet.
///
/// `id` is `Some` exactly when `qos` is above [`QoS::AtMostOnce`]; encoding
/// enforces this invariant.
#[derive(Debug, PartialEq)]
pub struct Publish {
	pub topic: TopicBuf,
	pub payload: Bytes,
	pub qos: QoS,
	pub retain: bool,
	pub duplicate: bool,
	pub id: Option<PacketId>,
}

impl Publish {
	pub(crate) fn parse(src: &mut io::Cursor<&[u8]>, flags: u8) -> Result<Self, DecodeError> {
		let retain = flags & RETAIN_FLAG != 0;
		let duplicate = flags & DUPLICATE_FLAG != 0;
		let qos: QoS = ((flags & QOS_MASK) >> 1).try_into()?;

		let topic = TopicBuf::new(wire::take_str(src)?)?;

		let id = match qos {
			QoS::AtMostOnce => {
				if duplicate {
					return Err(DecodeError::Malformed(
						"duplicate flag must be 0 for QoS AtMostOnce",
					));
				}
				None
			}
			QoS::AtLeastOnce | QoS::ExactlyOnce => Some(wire::take_id(src)?),
		};

		let remaining = wire::remaining(src);
		let payload = Bytes::copy_from_slice(wire::take_slice(src, remaining)?);

		Ok(Self {
			topic,
			payload,
			qos,
			retain,
			duplicate,
			id,
		})
	}

	pub(crate) fn encode(&self, dst: &mut impl BufMut) -> Result<(), EncodeError> {
		let mut flags = (self.qos as u8) << 1;
		if self.retain {
			flags |= RETAIN_FLAG;
		}
		if self.duplicate && self.qos != QoS::AtMostOnce {
			flags |= DUPLICATE_FLAG;
		}

		wire::put_u8(dst, PUBLISH | flags);

		let id = match self.qos {
			QoS::AtMostOnce => None,
			QoS::AtLeastOnce | QoS::ExactlyOnce => {
				Some(self.id.ok_or(EncodeError::MissingPacketId)?)
			}
		};

		let id_len = if id.is_some() { 2 } else { 0 };
		wire::put_var(dst, 2 + self.topic.len() + id_len + self.payload.len())?;
		wire::put_str(dst, self.topic.as_str())?;
		if let Some(id) = id {
			wire::put_u16(dst, id.get());
		}
		wire::put_slice(dst, &self.payload);

		Ok(())
	}
}

id_packet!(PubAck, Packet::PubAck, 0x40);
id_packet!(PubRec, Packet::PubRec, 0x50);
id_packet!(PubRel, Packet::PubRel, 0x62);
id_packet!(PubComp, Packet::PubComp, 0x70);

#[cfg(test)]
mod tests {
	use super::{PubAck, PubRel, Publish};
	use crate::{packet::Packet, PacketId, QoS, TopicBuf};
	use bytes::{Bytes, BytesMut};
	use std::io::Cursor;

	fn encode(packet: &Packet) -> BytesMut {
		let mut buffer = BytesMut::new();
		packet.encode(&mut buffer).unwrap();
		buffer
	}

	#[test]
	fn qos0_publish_wire_bytes() {
		let publish = Packet::from(Publish {
			topic: TopicBuf::new("a/b").unwrap(),
			payload: Bytes::from_static(&[0x01]),
			qos: QoS::AtMostOnce,
			retain: false,
			duplicate: false,
			id: None,
		});

		assert_eq!(
			&encode(&publish)[..],
			[0x30, 0x06, 0x00, 0x03, b'a', b'/', b'b', 0x01]
		);
	}

	#[test]
	fn qos1_publish_wire_bytes() {
		let publish = Packet::from(Publish {
			topic: TopicBuf::new("t").unwrap(),
			payload: Bytes::new(),
			qos: QoS::AtLeastOnce,
			retain: false,
			duplicate: false,
			id: PacketId::new(1),
		});

		assert_eq!(&encode(&publish)[..], [0x32, 0x05, 0x00, 0x01, b't', 0x00, 0x01]);
	}

	#[test]
	fn pubrel_wire_bytes() {
		let pubrel = Packet::from(PubRel {
			id: PacketId::new(7).unwrap(),
		});
		assert_eq!(&encode(&pubrel)[..], [0x62, 0x02, 0x00, 0x07]);
	}

	#[test]
	fn qos2_publish_round_trips() {
		let publish = Packet::from(Publish {
			topic: TopicBuf::new("x/y").unwrap(),
			payload: Bytes::from_static(b"payload"),
			qos: QoS::ExactlyOnce,
			retain: true,
			duplicate: true,
			id: PacketId::new(0x1234),
		});

		let buffer = encode(&publish);
		let decoded = Packet::decode(&mut Cursor::new(&buffer[..])).unwrap();
		assert_eq!(decoded, publish);
	}

	#[test]
	fn qos1_requires_packet_id() {
		let publish = Packet::from(Publish {
			topic: TopicBuf::new("t").unwrap(),
			payload: Bytes::new(),
			qos: QoS::AtLeastOnce,
			retain: false,
			duplicate: false,
			id: None,
		});

		assert!(publish.encode(&mut BytesMut::new()).is_err());
	}

	#[test]
	fn rejects_zero_packet_id() {
		// QoS 1 publish carrying packet id 0.
		let bytes = [0x32, 0x05, 0x00, 0x01, b't', 0x00, 0x00];
		assert!(Packet::decode(&mut Cursor::new(&bytes[..])).is_err());
	}

	#[test]
	fn rejects_qos_three() {
		let bytes = [0x36, 0x05, 0x00, 0x01, b't', 0x00, 0x01];
		assert!(Packet::decode(&mut Cursor::new(&bytes[..])).is_err());
	}

	#[test]
	fn puback_round_trips() {
		let puback = Packet::from(PubAck {
			id: PacketId::new(1).unwrap(),
		});
		let buffer = encode(&puback);
		assert_eq!(&buffer[..], [0x40, 0x02, 0x00, 0x01]);
		assert_eq!(
			Packet::decode(&mut Cursor::new(&buffer[..])).unwrap(),
			puback
		);
	}
}
