//! # mqtt-fleet
//!
//! A multi-server MQTT 3.1.1 client.
//!
//! One [`Client`] dials every configured broker concurrently and feeds them
//! all from a single bounded outbound queue, so a publish goes out via
//! whichever connected server picks it up first. Inbound publishes from all
//! connections are funnelled through a pluggable [`TopicRouter`]; QoS 1 and
//! 2 flows are correlated by packet identifiers drawn from a shared
//! allocator.
//!
//! ```no_run
//! # tokio_test::block_on(async {
//! use mqtt_fleet::{Client, Message, Options, QoS, TopicBuf};
//! use std::sync::Arc;
//!
//! let options = Options::builder()
//! 	.server("localhost:1883")
//! 	.client_id("fleet-example")
//! 	.clean_session(true)
//! 	.build()
//! 	.unwrap();
//!
//! let client = Client::new(options);
//! client.connect(Arc::new(|server, code, error| {
//! 	println!("{server}: code {code}, error {error:?}");
//! }));
//!
//! let message = Message::new(
//! 	TopicBuf::new("a/b").unwrap(),
//! 	&b"hello"[..],
//! 	QoS::AtLeastOnce,
//! );
//! client.publish(None, [message]).await.unwrap();
//!
//! client.destroy(false).await;
//! client.wait().await;
//! # })
//! ```

mod backoff;
mod client;
mod error;
mod filter;
mod id_alloc;
mod options;
mod qos;
mod router;
mod stream;
mod topic;
mod transport;

pub mod packet;

pub use self::{
	backoff::{Backoff, HoldOff},
	client::{Client, ConnHandler, Message, PubHandler, UnsubHandler},
	error::Error,
	filter::{Filter, FilterBuf, InvalidFilter},
	id_alloc::IdAllocator,
	options::{Options, OptionsBuilder, OptionsError},
	qos::{InvalidQoS, QoS},
	router::{SubHandler, TextRouter, TopicRouter},
	topic::{InvalidTopic, Topic, TopicBuf},
};

#[cfg(feature = "tls")]
pub use self::options::TlsOptions;

/// Identifier correlating a multi-step QoS or subscription flow. Zero is
/// reserved on the wire and unrepresentable here.
pub type PacketId = core::num::NonZeroU16;
