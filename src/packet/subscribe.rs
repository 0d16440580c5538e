use super::{id_packet, wire, DecodeError, EncodeError, Packet, SUBACK, SUBSCRIBE, UNSUBSCRIBE};
use crate::{FilterBuf, PacketId, QoS};
use bytes::BufMut;
use std::io;

/// Per-filter failure code (0x80) in a SubAck payload.
#[derive(Debug, PartialEq, Eq)]
pub struct SubscribeFailed;

const SUBSCRIBE_FAILURE: u8 = 0x80;

/// Subscribe packet: a packet identifier and one or more
/// (filter, requested QoS) pairs.
#[derive(Debug, PartialEq)]
pub struct Subscribe {
	pub id: PacketId,
	pub filters: Vec<(FilterBuf, QoS)>,
}

/// SubAck packet: one return code per requested filter, in request order.
#[derive(Debug, PartialEq)]
pub struct SubAck {
	pub id: PacketId,
	pub result: Vec<Result<QoS, SubscribeFailed>>,
}

/// Unsubscribe packet.
#[derive(Debug, PartialEq)]
pub struct Unsubscribe {
	pub id: PacketId,
	pub filters: Vec<FilterBuf>,
}

id_packet!(UnsubAck, Packet::UnsubAck, 0xb0);

impl Subscribe {
	pub(crate) fn parse(src: &mut io::Cursor<&[u8]>) -> Result<Self, DecodeError> {
		let id = wire::take_id(src)?;

		let mut filters = Vec::new();
		while wire::remaining(src) > 0 {
			let filter = FilterBuf::new(wire::take_str(src)?)?;
			let qos: QoS = wire::take_u8(src)?.try_into()?;
			filters.push((filter, qos));
		}

		if filters.is_empty() {
			return Err(DecodeError::Malformed(
				"Subscribe must contain at least one filter",
			));
		}

		Ok(Self { id, filters })
	}

	pub(crate) fn encode(&self, dst: &mut impl BufMut) -> Result<(), EncodeError> {
		let Self { id, filters } = self;
		wire::put_u8(dst, SUBSCRIBE | 0x02);

		let len = 2 + filters
			.iter()
			.fold(0, |acc, (filter, _)| acc + 3 + filter.len());
		wire::put_var(dst, len)?;

		wire::put_u16(dst, id.get());
		for (filter, qos) in filters {
			wire::put_str(dst, filter.as_str())?;
			wire::put_u8(dst, *qos as u8);
		}

		Ok(())
	}
}

impl SubAck {
	pub(crate) fn parse(src: &mut io::Cursor<&[u8]>) -> Result<Self, DecodeError> {
		let id = wire::take_id(src)?;

		let mut result = Vec::new();
		while wire::remaining(src) > 0 {
			let code = wire::take_u8(src)?;
			let entry = match code.try_into() {
				Ok(qos) => Ok(qos),
				Err(_) if code == SUBSCRIBE_FAILURE => Err(SubscribeFailed),
				Err(_) => {
					return Err(DecodeError::Malformed("invalid return code in SubAck"));
				}
			};
			result.push(entry);
		}

		if result.is_empty() {
			return Err(DecodeError::Malformed(
				"SubAck must contain at least one return code",
			));
		}

		Ok(Self { id, result })
	}

	pub(crate) fn encode(&self, dst: &mut impl BufMut) -> Result<(), EncodeError> {
		let Self { id, result } = self;
		wire::put_u8(dst, SUBACK);
		wire::put_var(dst, 2 + result.len())?;
		wire::put_u16(dst, id.get());
		for entry in result {
			wire::put_u8(
				dst,
				entry
					.as_ref()
					.map(|qos| *qos as u8)
					.unwrap_or(SUBSCRIBE_FAILURE),
			);
		}
		Ok(())
	}
}

impl Unsubscribe {
	pub(crate) fn parse(src: &mut io::Cursor<&[u8]>) -> Result<Self, DecodeError> {
		let id = wire::take_id(src)?;

		let mut filters = Vec::new();
		while wire::remaining(src) > 0 {
			filters.push(FilterBuf::new(wire::take_str(src)?)?);
		}

		if filters.is_empty() {
			return Err(DecodeError::Malformed(
				"Unsubscribe must contain at least one filter",
			));
		}

		Ok(Self { id, filters })
	}

	pub(crate) fn encode(&self, dst: &mut impl BufMut) -> Result<(), EncodeError> {
		let Self { id, filters } = self;
		wire::put_u8(dst, UNSUBSCRIBE | 0x02);

		let len = 2 + filters.iter().fold(0, |acc, filter| acc + 2 + filter.len());
		wire::put_var(dst, len)?;

		wire::put_u16(dst, id.get());
		for filter in filters {
			wire::put_str(dst, filter.as_str())?;
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::{SubAck, Subscribe, SubscribeFailed, Unsubscribe};
	use crate::{packet::Packet, FilterBuf, PacketId, QoS};
	use bytes::BytesMut;
	use std::io::Cursor;

	fn encode(packet: &Packet) -> BytesMut {
		let mut buffer = BytesMut::new();
		packet.encode(&mut buffer).unwrap();
		buffer
	}

	#[test]
	fn subscribe_wire_bytes() {
		let subscribe = Packet::from(Subscribe {
			id: PacketId::new(1).unwrap(),
			filters: vec![
				(FilterBuf::new("x/#").unwrap(), QoS::AtLeastOnce),
				(FilterBuf::new("y").unwrap(), QoS::ExactlyOnce),
			],
		});

		assert_eq!(
			&encode(&subscribe)[..],
			[
				0x82, 0x0c, 0x00, 0x01, 0x00, 0x03, b'x', b'/', b'#', 0x01, 0x00, 0x01, b'y',
				0x02
			]
		);
	}

	#[test]
	fn subscribe_round_trips() {
		let subscribe = Packet::from(Subscribe {
			id: PacketId::new(42).unwrap(),
			filters: vec![(FilterBuf::new("a/+/c").unwrap(), QoS::AtMostOnce)],
		});

		let buffer = encode(&subscribe);
		assert_eq!(
			Packet::decode(&mut Cursor::new(&buffer[..])).unwrap(),
			subscribe
		);
	}

	#[test]
	fn suback_round_trips() {
		let suback = Packet::from(SubAck {
			id: PacketId::new(1).unwrap(),
			result: vec![Ok(QoS::AtLeastOnce), Ok(QoS::ExactlyOnce), Err(SubscribeFailed)],
		});

		let buffer = encode(&suback);
		assert_eq!(&buffer[..], [0x90, 0x05, 0x00, 0x01, 0x01, 0x02, 0x80]);
		assert_eq!(
			Packet::decode(&mut Cursor::new(&buffer[..])).unwrap(),
			suback
		);
	}

	#[test]
	fn suback_rejects_unknown_return_code() {
		let bytes = [0x90, 0x03, 0x00, 0x01, 0x42];
		assert!(Packet::decode(&mut Cursor::new(&bytes[..])).is_err());
	}

	#[test]
	fn unsubscribe_round_trips() {
		let unsubscribe = Packet::from(Unsubscribe {
			id: PacketId::new(9).unwrap(),
			filters: vec![FilterBuf::new("x/#").unwrap(), FilterBuf::new("y").unwrap()],
		});

		let buffer = encode(&unsubscribe);
		assert_eq!(
			Packet::decode(&mut Cursor::new(&buffer[..])).unwrap(),
			unsubscribe
		);
	}

	#[test]
	fn subscribe_rejects_empty_filter_list() {
		let bytes = [0x82, 0x02, 0x00, 0x01];
		assert!(Packet::decode(&mut Cursor::new(&bytes[..])).is_err());
	}
}
