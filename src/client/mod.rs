//! The client coordinator: fan-out over every configured server.
//!
//! One [`Client`] drives any number of broker connections. Outbound packets
//! go through a single bounded queue that every connection's send pump
//! drains, so a publish is delivered via whichever connected server picks it
//! up first. Inbound publishes from all connections funnel into a second
//! bounded queue drained by the router dispatcher.

mod conn;

use crate::{
	id_alloc::IdAllocator,
	options::Options,
	packet::{Packet, Publish, Subscribe, Unsubscribe},
	router::{SubHandler, TextRouter, TopicRouter},
	Error, FilterBuf, PacketId, QoS, Topic, TopicBuf,
};
use bytes::Bytes;
use conn::Connection;
use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::Instrument;

/// Invoked once per configured server when its connection attempt resolves:
/// `(server, return_code, error)`. The return code is non-zero when the
/// broker rejected the handshake; the error is `Some` on transport or
/// timeout failure.
pub type ConnHandler = Arc<dyn Fn(&str, u8, Option<Error>) + Send + Sync>;

/// Invoked when a publish flow completes: immediately after enqueue for
/// QoS 0, on the terminal acknowledgment for QoS 1 and 2.
pub type PubHandler = Arc<dyn Fn(&Topic, Option<Error>) + Send + Sync>;

/// Invoked when an unsubscribe flow completes.
pub type UnsubHandler = Arc<dyn Fn(&[FilterBuf], Option<Error>) + Send + Sync>;

/// An application message to publish.
#[derive(Debug)]
pub struct Message {
	pub topic: TopicBuf,
	pub payload: Bytes,
	pub qos: QoS,
	pub retain: bool,
}

impl Message {
	pub fn new(topic: TopicBuf, payload: impl Into<Bytes>, qos: QoS) -> Self {
		Self {
			topic,
			payload: payload.into(),
			qos,
			retain: false,
		}
	}

	pub fn retain(mut self) -> Self {
		self.retain = true;
		self
	}
}

/// An in-flight flow, keyed by its packet identifier until the terminal
/// acknowledgment arrives.
pub(crate) enum Flow {
	Publish {
		topic: TopicBuf,
		handler: Option<PubHandler>,
	},
	Subscribe {
		filters: Vec<FilterBuf>,
	},
	Unsubscribe {
		filters: Vec<FilterBuf>,
		handler: Option<UnsubHandler>,
	},
}

/// A multi-server MQTT 3.1.1 client.
///
/// Cheap to clone; all clones drive the same connections.
#[derive(Clone)]
pub struct Client {
	shared: Arc<Shared>,
}

pub(crate) struct Shared {
	options: Options,
	router: Arc<dyn TopicRouter>,
	out_tx: mpsc::Sender<Packet>,
	out_rx: AsyncMutex<mpsc::Receiver<Packet>>,
	in_tx: Mutex<Option<mpsc::Sender<Publish>>>,
	in_rx: Mutex<Option<mpsc::Receiver<Publish>>>,
	conns: Mutex<HashMap<String, Arc<Connection>>>,
	alloc: IdAllocator,
	pending: Mutex<HashMap<PacketId, Flow>>,
	span: tracing::Span,
}

impl Client {
	/// Creates a client with the default [`TextRouter`].
	pub fn new(options: Options) -> Self {
		Self::with_router(options, Arc::new(TextRouter::new()))
	}

	/// Creates a client dispatching inbound publishes through `router`.
	pub fn with_router(options: Options, router: Arc<dyn TopicRouter>) -> Self {
		let (out_tx, out_rx) = mpsc::channel(options.send_queue());
		let (in_tx, in_rx) = mpsc::channel(options.recv_queue());
		let span = tracing::info_span!("mqtt_client", client_id = %options.client_id());

		Self {
			shared: Arc::new(Shared {
				options,
				router,
				out_tx,
				out_rx: AsyncMutex::new(out_rx),
				in_tx: Mutex::new(Some(in_tx)),
				in_rx: Mutex::new(Some(in_rx)),
				conns: Mutex::new(HashMap::new()),
				alloc: IdAllocator::new(),
				pending: Mutex::new(HashMap::new()),
				span,
			}),
		}
	}

	/// Begins dialing every configured server concurrently; non-blocking.
	///
	/// `handler` is invoked once per server as each attempt resolves. The
	/// first call also starts the router dispatcher draining the inbound
	/// publish queue.
	pub fn connect(&self, handler: ConnHandler) {
		let dispatcher_rx = self.shared.in_rx.lock().unwrap().take();
		if let Some(mut rx) = dispatcher_rx {
			let router = Arc::clone(&self.shared.router);
			let span = self.shared.span.clone();
			tokio::spawn(
				async move {
					while let Some(publish) = rx.recv().await {
						router.dispatch(&publish);
					}
					tracing::debug!("router dispatcher stopped");
				}
				.instrument(span),
			);
		}

		for server in self.shared.options.servers() {
			conn::spawn(
				server.clone(),
				Arc::downgrade(&self.shared),
				Arc::clone(&handler),
			);
		}
	}

	/// Publishes messages via any connected server.
	///
	/// QoS 1 and 2 messages are assigned a packet identifier, which is
	/// released when the terminal acknowledgment (PubAck, PubComp) arrives;
	/// `handler` fires at that point. A full outbound queue backpressures
	/// the caller.
	pub async fn publish(
		&self,
		handler: Option<PubHandler>,
		messages: impl IntoIterator<Item = Message>,
	) -> Result<(), Error> {
		for message in messages {
			let Message {
				topic,
				payload,
				qos,
				retain,
			} = message;

			let id = match qos {
				QoS::AtMostOnce => None,
				QoS::AtLeastOnce | QoS::ExactlyOnce => Some(self.shared.alloc.next_id().await),
			};

			if let Some(id) = id {
				self.shared.pending.lock().unwrap().insert(
					id,
					Flow::Publish {
						topic: topic.clone(),
						handler: handler.clone(),
					},
				);
			}

			let notify = (qos == QoS::AtMostOnce)
				.then(|| handler.clone())
				.flatten()
				.map(|handler| (handler, topic.clone()));

			let packet = Publish {
				topic,
				payload,
				qos,
				retain,
				duplicate: false,
				id,
			};

			if let Err(error) = self.shared.enqueue(packet.into()).await {
				if let Some(id) = id {
					self.shared.take_flow(id);
				}
				return Err(error);
			}

			if let Some((handler, topic)) = notify {
				handler(&topic, None);
			}
		}

		Ok(())
	}

	/// Subscribes to topic filters, routing matching inbound publishes to
	/// `handler`.
	///
	/// The filters are registered with the router up front; the Subscribe
	/// packet's identifier is released when the SubAck arrives, and filters
	/// the broker refused are deregistered again at that point.
	pub async fn subscribe(
		&self,
		handler: SubHandler,
		filters: impl IntoIterator<Item = (FilterBuf, QoS)>,
	) -> Result<(), Error> {
		let filters: Vec<(FilterBuf, QoS)> = filters.into_iter().collect();
		if filters.is_empty() {
			return Ok(());
		}

		for (filter, _) in &filters {
			self.shared.router.handle(filter.clone(), Arc::clone(&handler));
		}

		let id = self.shared.alloc.next_id().await;
		self.shared.pending.lock().unwrap().insert(
			id,
			Flow::Subscribe {
				filters: filters.iter().map(|(filter, _)| filter.clone()).collect(),
			},
		);

		tracing::debug!(?id, count = filters.len(), "subscribing");
		let packet = Subscribe { id, filters };
		if let Err(error) = self.shared.enqueue(packet.into()).await {
			self.shared.take_flow(id);
			return Err(error);
		}

		Ok(())
	}

	/// Unsubscribes topic filters, removing their handlers from the router.
	///
	/// `handler` fires when the UnsubAck arrives.
	pub async fn unsubscribe(
		&self,
		handler: Option<UnsubHandler>,
		filters: impl IntoIterator<Item = FilterBuf>,
	) -> Result<(), Error> {
		let filters: Vec<FilterBuf> = filters.into_iter().collect();
		if filters.is_empty() {
			return Ok(());
		}

		for filter in &filters {
			self.shared.router.remove(filter);
		}

		let id = self.shared.alloc.next_id().await;
		self.shared.pending.lock().unwrap().insert(
			id,
			Flow::Unsubscribe {
				filters: filters.clone(),
				handler,
			},
		);

		tracing::debug!(?id, count = filters.len(), "unsubscribing");
		let packet = Unsubscribe { id, filters };
		if let Err(error) = self.shared.enqueue(packet.into()).await {
			self.shared.take_flow(id);
			return Err(error);
		}

		Ok(())
	}

	/// Blocks until every current connection's workers have finished.
	pub async fn wait(&self) {
		let conns: Vec<Arc<Connection>> =
			self.shared.conns.lock().unwrap().values().cloned().collect();
		for conn in conns {
			conn.wait().await;
		}
	}

	/// Tears down every connection.
	///
	/// With `force` the transports are closed immediately; otherwise a
	/// Disconnect packet is enqueued per connection and each send pump exits
	/// after writing one. Either way the inbound publish queue is closed,
	/// stopping the router dispatcher once live connections drain.
	pub async fn destroy(&self, force: bool) {
		// Closing the inbound queue must happen exactly once.
		drop(self.shared.in_tx.lock().unwrap().take());

		let conns: Vec<Arc<Connection>> =
			self.shared.conns.lock().unwrap().values().cloned().collect();
		for conn in conns {
			conn.close(force).await;
		}

		if self.shared.conns.lock().unwrap().is_empty() {
			self.shared.release_pending();
		}
	}
}

impl Shared {
	pub(crate) fn options(&self) -> &Options {
		&self.options
	}

	pub(crate) fn span(&self) -> &tracing::Span {
		&self.span
	}

	pub(crate) fn router(&self) -> &Arc<dyn TopicRouter> {
		&self.router
	}

	/// Enqueues a packet on the shared outbound queue, backpressuring the
	/// caller when it is full.
	pub(crate) async fn enqueue(&self, packet: Packet) -> Result<(), Error> {
		self.out_tx
			.send(packet)
			.await
			.map_err(|_| Error::ClientClosed)
	}

	/// Receives the next outbound packet on behalf of one send pump.
	pub(crate) async fn next_outbound(&self) -> Option<Packet> {
		let mut rx = self.out_rx.lock().await;
		rx.recv().await
	}

	/// Delivers an inbound publish to the router dispatcher's queue.
	pub(crate) async fn deliver(&self, publish: Publish) -> Result<(), Error> {
		let tx = self
			.in_tx
			.lock()
			.unwrap()
			.as_ref()
			.cloned()
			.ok_or(Error::ClientClosed)?;
		tx.send(publish).await.map_err(|_| Error::ClientClosed)
	}

	/// Registers an established connection. Fails if the server already has
	/// one.
	pub(crate) fn register(&self, server: &str, conn: Arc<Connection>) -> bool {
		let mut conns = self.conns.lock().unwrap();
		if conns.contains_key(server) {
			return false;
		}
		conns.insert(server.to_string(), conn);
		true
	}

	pub(crate) fn connected(&self, server: &str) -> bool {
		self.conns.lock().unwrap().contains_key(server)
	}

	/// Removes a connection from the map; when it was the last one, drains
	/// the pending-flow table so every in-flight identifier is released.
	pub(crate) fn deregister(&self, server: &str) {
		let emptied = {
			let mut conns = self.conns.lock().unwrap();
			conns.remove(server).is_some() && conns.is_empty()
		};
		if emptied {
			self.release_pending();
		}
	}

	/// Removes a flow and releases its packet identifier.
	pub(crate) fn take_flow(&self, id: PacketId) -> Option<Flow> {
		let flow = self.pending.lock().unwrap().remove(&id);
		self.alloc.free(id);
		flow
	}

	/// Mass release: fails every in-flight flow and frees its identifier.
	pub(crate) fn release_pending(&self) {
		let flows: Vec<(PacketId, Flow)> = self.pending.lock().unwrap().drain().collect();
		if flows.is_empty() {
			return;
		}

		tracing::debug!(count = flows.len(), "releasing in-flight flows");
		for (id, flow) in flows {
			self.alloc.free(id);
			match flow {
				Flow::Publish {
					topic,
					handler: Some(handler),
				} => handler(&topic, Some(Error::ConnectionClosed)),
				Flow::Unsubscribe {
					filters,
					handler: Some(handler),
				} => handler(&filters, Some(Error::ConnectionClosed)),
				_ => {}
			}
		}
	}

	#[cfg(test)]
	pub(crate) fn allocator(&self) -> &IdAllocator {
		&self.alloc
	}
}

#[cfg(test)]
impl Client {
	pub(crate) fn shared(&self) -> &Shared {
		&self.shared
	}
}
