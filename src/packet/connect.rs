use super::{wire, DecodeError, EncodeError, CONNACK, CONNECT};
use crate::{QoS, TopicBuf};
use bytes::{BufMut, Bytes};
use std::io;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

const CLEAN_SESSION_FLAG: u8 = 0x02;
const WILL_FLAG: u8 = 0x04;
const WILL_QOS_SHIFT: u8 = 3;
const WILL_RETAIN_FLAG: u8 = 0x20;
const PASSWORD_FLAG: u8 = 0x40;
const USERNAME_FLAG: u8 = 0x80;

/// ConnAck return codes.
pub mod return_code {
	pub const ACCEPTED: u8 = 0;
	pub const UNACCEPTABLE_PROTOCOL: u8 = 1;
	pub const IDENTIFIER_REJECTED: u8 = 2;
	pub const SERVER_UNAVAILABLE: u8 = 3;
	pub const BAD_USER_OR_PASSWORD: u8 = 4;
	pub const NOT_AUTHORIZED: u8 = 5;
}

/// Client credentials.
///
/// A password cannot be set without a username.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
	pub username: String,
	pub password: Option<String>,
}

impl From<&str> for Credentials {
	#[inline]
	fn from(username: &str) -> Self {
		Self {
			username: username.into(),
			password: None,
		}
	}
}

impl From<(&str, &str)> for Credentials {
	#[inline]
	fn from((username, password): (&str, &str)) -> Self {
		Self {
			username: username.into(),
			password: Some(password.into()),
		}
	}
}

/// Will message.
///
/// Set by the client at connect time; the broker publishes it on the will
/// topic if the client disconnects ungracefully.
#[derive(Clone, Debug, PartialEq)]
pub struct Will {
	pub topic: TopicBuf,
	pub payload: Bytes,
	pub qos: QoS,
	pub retain: bool,
}

/// Connect packet.
///
/// The protocol name and level are fixed at "MQTT" level 4; anything else is
/// rejected at decode.
#[derive(Debug, PartialEq, Default)]
pub struct Connect {
	pub client_id: String,
	pub keep_alive: u16,
	pub clean_session: bool,
	pub will: Option<Will>,
	pub credentials: Option<Credentials>,
}

/// ConnAck packet.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnAck {
	pub session_present: bool,
	pub code: u8,
}

impl Connect {
	pub(crate) fn parse(src: &mut io::Cursor<&[u8]>) -> Result<Self, DecodeError> {
		if wire::take_str(src)? != PROTOCOL_NAME {
			return Err(DecodeError::Malformed("invalid protocol name"));
		}

		if wire::take_u8(src)? != PROTOCOL_LEVEL {
			return Err(DecodeError::Malformed("unsupported protocol level"));
		}

		let flags = wire::take_u8(src)?;
		if flags & 0x01 != 0 {
			return Err(DecodeError::Malformed("reserved connect flag must be 0"));
		}

		let keep_alive = wire::take_u16(src)?;
		let client_id = wire::take_str(src)?.to_string();
		let clean_session = flags & CLEAN_SESSION_FLAG != 0;

		let will = if flags & WILL_FLAG != 0 {
			let topic = TopicBuf::new(wire::take_str(src)?)?;
			let len = wire::take_u16(src)? as usize;
			let payload = Bytes::copy_from_slice(wire::take_slice(src, len)?);
			let qos: QoS = ((flags >> WILL_QOS_SHIFT) & 0x03).try_into()?;
			let retain = flags & WILL_RETAIN_FLAG != 0;

			Some(Will {
				topic,
				payload,
				qos,
				retain,
			})
		} else {
			None
		};

		let credentials = if flags & USERNAME_FLAG != 0 {
			let username = wire::take_str(src)?.to_string();
			let password = if flags & PASSWORD_FLAG != 0 {
				Some(wire::take_str(src)?.to_string())
			} else {
				None
			};
			Some(Credentials { username, password })
		} else if flags & PASSWORD_FLAG != 0 {
			return Err(DecodeError::Malformed("password flag requires username"));
		} else {
			None
		};

		Ok(Self {
			client_id,
			keep_alive,
			clean_session,
			will,
			credentials,
		})
	}

	pub(crate) fn encode(&self, dst: &mut impl BufMut) -> Result<(), EncodeError> {
		wire::put_u8(dst, CONNECT);
		wire::put_var(dst, self.body_len())?;

		wire::put_str(dst, PROTOCOL_NAME)?;
		wire::put_u8(dst, PROTOCOL_LEVEL);
		wire::put_u8(dst, self.flags());
		wire::put_u16(dst, self.keep_alive);
		wire::put_str(dst, &self.client_id)?;

		if let Some(will) = &self.will {
			wire::put_str(dst, will.topic.as_str())?;
			wire::put_bytes(dst, &will.payload)?;
		}

		if let Some(credentials) = &self.credentials {
			wire::put_str(dst, &credentials.username)?;
			if let Some(password) = &credentials.password {
				wire::put_str(dst, password)?;
			}
		}

		Ok(())
	}

	fn body_len(&self) -> usize {
		// Protocol name, level, flags and keep-alive.
		let mut len = (2 + PROTOCOL_NAME.len()) + 4 + (2 + self.client_id.len());

		if let Some(will) = &self.will {
			len += 2 + will.topic.len() + 2 + will.payload.len();
		}

		if let Some(credentials) = &self.credentials {
			len += 2 + credentials.username.len();
			if let Some(password) = &credentials.password {
				len += 2 + password.len();
			}
		}

		len
	}

	fn flags(&self) -> u8 {
		let mut flags = 0;

		if self.clean_session {
			flags |= CLEAN_SESSION_FLAG;
		}

		if let Some(will) = &self.will {
			flags |= WILL_FLAG;
			flags |= (will.qos as u8) << WILL_QOS_SHIFT;
			if will.retain {
				flags |= WILL_RETAIN_FLAG;
			}
		}

		if let Some(credentials) = &self.credentials {
			flags |= USERNAME_FLAG;
			if credentials.password.is_some() {
				flags |= PASSWORD_FLAG;
			}
		}

		flags
	}
}

impl ConnAck {
	pub(crate) fn parse(src: &mut io::Cursor<&[u8]>) -> Result<Self, DecodeError> {
		if wire::remaining(src) != 2 {
			return Err(DecodeError::Malformed("ConnAck must have length 2"));
		}

		let flags = wire::take_u8(src)?;
		if flags & 0xfe != 0 {
			return Err(DecodeError::Malformed(
				"upper 7 bits of ConnAck flags must be 0",
			));
		}

		let code = wire::take_u8(src)?;

		Ok(Self {
			session_present: flags & 0x01 != 0,
			code,
		})
	}

	pub(crate) fn encode(&self, dst: &mut impl BufMut) -> Result<(), EncodeError> {
		let Self {
			session_present,
			code,
		} = self;
		wire::put_u8(dst, CONNACK);
		wire::put_var(dst, 2)?;
		wire::put_u8(dst, u8::from(*session_present));
		wire::put_u8(dst, *code);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::{return_code, ConnAck, Connect, Credentials, Will};
	use crate::{packet::Packet, QoS, TopicBuf};
	use bytes::{Bytes, BytesMut};
	use std::io::Cursor;

	fn round_trip(packet: Packet) -> Packet {
		let mut buffer = BytesMut::new();
		packet.encode(&mut buffer).unwrap();
		Packet::decode(&mut Cursor::new(&buffer[..])).unwrap()
	}

	#[test]
	fn connect_round_trips() {
		let connect = Connect {
			client_id: "fleet-1".into(),
			keep_alive: 60,
			clean_session: true,
			will: Some(Will {
				topic: TopicBuf::new("status/fleet-1").unwrap(),
				payload: Bytes::from_static(b"offline"),
				qos: QoS::AtLeastOnce,
				retain: true,
			}),
			credentials: Some(Credentials::from(("user", "secret"))),
		};

		let decoded = round_trip(connect.into());
		let Packet::Connect(decoded) = decoded else {
			panic!("expected Connect, got {decoded:?}");
		};

		assert_eq!(decoded.client_id, "fleet-1");
		assert_eq!(decoded.keep_alive, 60);
		assert!(decoded.clean_session);
		let will = decoded.will.unwrap();
		assert_eq!(will.qos, QoS::AtLeastOnce);
		assert!(will.retain);
		assert_eq!(&will.payload[..], b"offline");
		let credentials = decoded.credentials.unwrap();
		assert_eq!(credentials.username, "user");
		assert_eq!(credentials.password.as_deref(), Some("secret"));
	}

	#[test]
	fn connect_header_bytes() {
		let connect = Connect {
			client_id: "c".into(),
			keep_alive: 10,
			clean_session: true,
			..Default::default()
		};

		let mut buffer = BytesMut::new();
		Packet::from(connect).encode(&mut buffer).unwrap();

		// Fixed header, length 13, "MQTT", level 4, clean session, keep
		// alive 10, client id "c".
		assert_eq!(
			&buffer[..],
			[
				0x10, 0x0d, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x0a, 0x00,
				0x01, b'c'
			]
		);
	}

	#[test]
	fn connack_round_trips() {
		let decoded = round_trip(
			ConnAck {
				session_present: true,
				code: return_code::NOT_AUTHORIZED,
			}
			.into(),
		);
		assert_eq!(
			decoded,
			Packet::ConnAck(ConnAck {
				session_present: true,
				code: 5
			})
		);
	}

	#[test]
	fn connack_rejects_reserved_flag_bits() {
		assert!(Packet::decode(&mut Cursor::new(&[0x20, 0x02, 0x02, 0x00][..])).is_err());
	}
}
