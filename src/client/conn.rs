//! Per-server connection worker.
//!
//! A worker dials one broker, performs the Connect/ConnAck handshake, then
//! runs three pumps: the send pump draining the client's shared outbound
//! queue onto the transport, the receive pump decoding inbound packets, and
//! the keepalive supervisor probing broker liveness. The worker task itself
//! advances the QoS state machine over packets the receive pump hands it.

use super::{ConnHandler, Flow, Shared};
use crate::{
	packet::{
		return_code, DecodeError, Packet, PubAck, PubComp, PubRec, PubRel, SubAck, UnsubAck,
	},
	stream::PacketStream,
	transport::{self, Transport},
	Error, QoS,
};
use std::{
	ops::ControlFlow::{self, Break, Continue},
	sync::{Arc, Weak},
	time::Duration,
};
use tokio::{
	io::{self, ReadHalf, WriteHalf},
	sync::{mpsc, watch},
	task::JoinHandle,
	time,
};
use tracing::Instrument;

/// One live (or establishing) broker connection.
///
/// Holds only a non-owning reference back to the client internals; the
/// client map owns the connection, and dropping the client lets every pump
/// wind down on its next queue access.
pub(crate) struct Connection {
	server: String,
	parent: Weak<Shared>,
	shutdown: watch::Sender<bool>,
	workers: watch::Sender<usize>,
}

/// Decrements the connection's worker counter when a pump finishes.
struct WorkerGuard(watch::Sender<usize>);

impl Drop for WorkerGuard {
	fn drop(&mut self) {
		self.0.send_modify(|count| *count -= 1);
	}
}

impl Connection {
	fn new(server: String, parent: Weak<Shared>) -> Self {
		let (shutdown, _) = watch::channel(false);
		let (workers, _) = watch::channel(0usize);
		Self {
			server,
			parent,
			shutdown,
			workers,
		}
	}

	fn add_worker(&self) -> WorkerGuard {
		self.workers.send_modify(|count| *count += 1);
		WorkerGuard(self.workers.clone())
	}

	/// Signals every pump to stop without draining anything.
	fn force_close(&self) {
		self.shutdown.send_replace(true);
	}

	/// Receives the next outbound packet from the client's shared queue.
	async fn next_outbound(&self) -> Option<Packet> {
		let shared = self.parent.upgrade()?;
		shared.next_outbound().await
	}

	/// Enqueues a packet on the shared outbound queue, giving up if the
	/// connection shuts down while backpressured. Returns `false` when the
	/// packet could not be enqueued.
	async fn enqueue(&self, shared: &Shared, packet: Packet) -> bool {
		let mut shutdown = self.shutdown.subscribe();
		tokio::select! {
			result = shared.enqueue(packet) => result.is_ok(),
			_ = shutdown.wait_for(|closed| *closed) => false,
		}
	}

	/// Tears the connection down. Graceful close enqueues a Disconnect and
	/// lets the send pump exit after writing it; forced close stops the
	/// pumps directly.
	pub(crate) async fn close(&self, force: bool) {
		tracing::debug!(server = %self.server, force, "closing connection");
		if force {
			self.force_close();
			return;
		}

		match self.parent.upgrade() {
			Some(shared) => {
				if shared.enqueue(Packet::Disconnect).await.is_err() {
					self.force_close();
				}
			}
			None => self.force_close(),
		}
	}

	/// Blocks until the connection's worker counter drains to zero.
	pub(crate) async fn wait(&self) {
		let mut workers = self.workers.subscribe();
		// Cannot fail: the sender is owned by self.
		let _ = workers.wait_for(|count| *count == 0).await;
	}
}

/// Spawns the dial-and-supervise task for one server.
pub(crate) fn spawn(server: String, parent: Weak<Shared>, handler: ConnHandler) -> JoinHandle<()> {
	let span = match parent.upgrade() {
		Some(shared) => tracing::info_span!(parent: shared.span(), "conn", server = %server),
		None => tracing::Span::none(),
	};
	tokio::spawn(supervise(server, parent, handler).instrument(span))
}

async fn supervise(server: String, parent: Weak<Shared>, handler: ConnHandler) {
	let Some(shared) = parent.upgrade() else {
		return;
	};

	if shared.connected(&server) {
		tracing::warn!("connection attempt to an already connected server");
		handler(&server, 0, Some(Error::AlreadyConnected));
		return;
	}

	let transport = match transport::dial(&server, shared.options()).await {
		Ok(transport) => transport,
		Err(error) => {
			tracing::error!(%error, "dial failed");
			handler(&server, 0, Some(error));
			return;
		}
	};
	tracing::debug!("transport connected");

	let conn = Arc::new(Connection::new(server.clone(), parent.clone()));
	let (read_half, write_half) = io::split(transport);
	let (packet_tx, mut packet_rx) = mpsc::channel(shared.options().recv_queue());
	let (keepalive_tx, keepalive_rx) = mpsc::channel(1);

	tokio::spawn(
		recv_pump(
			Arc::clone(&conn),
			read_half,
			packet_tx,
			keepalive_tx,
			conn.add_worker(),
		)
		.in_current_span(),
	);

	// The Connect packet goes straight onto the transport; routed through
	// the shared queue it could be picked up by another server's pump.
	let mut writer = PacketStream::new(write_half);
	let connect = shared.options().connect_packet();
	if let Err(error) = writer.write_packet(&connect.into()).await {
		conn.force_close();
		handler(&server, 0, Some(error));
		return;
	}

	let first = tokio::select! {
		packet = packet_rx.recv() => packet,
		_ = time::sleep(shared.options().dial_timeout()) => {
			tracing::error!("timed out waiting for ConnAck");
			conn.force_close();
			handler(&server, 0, Some(Error::Timeout));
			return;
		}
	};

	match first {
		Some(Packet::ConnAck(connack)) if connack.code == return_code::ACCEPTED => {
			tracing::info!(
				session_present = connack.session_present,
				"connection established"
			);
		}
		Some(Packet::ConnAck(connack)) => {
			tracing::error!(code = connack.code, "broker rejected connection");
			conn.force_close();
			handler(&server, connack.code, None);
			return;
		}
		Some(packet) => {
			tracing::error!(packet = ?packet.packet_type(), "expected ConnAck during handshake");
			conn.force_close();
			handler(
				&server,
				0,
				Some(Error::BadPacket(DecodeError::Malformed(
					"expected ConnAck during handshake",
				))),
			);
			return;
		}
		None => {
			tracing::error!("connection closed during handshake");
			conn.force_close();
			handler(&server, 0, Some(Error::ConnectionReset));
			return;
		}
	}

	let _supervise_guard = conn.add_worker();
	tokio::spawn(send_pump(Arc::clone(&conn), writer, conn.add_worker()).in_current_span());

	let keep_alive = shared.options().keep_alive();
	if !keep_alive.is_zero() {
		let deadline = keep_alive.mul_f64(shared.options().keep_alive_factor());
		tokio::spawn(
			keepalive_supervisor(
				Arc::clone(&conn),
				keepalive_rx,
				keep_alive,
				deadline,
				conn.add_worker(),
			)
			.in_current_span(),
		);
	}

	if !shared.register(&server, Arc::clone(&conn)) {
		tracing::warn!("server was registered concurrently, dropping duplicate");
		conn.force_close();
		handler(&server, 0, Some(Error::AlreadyConnected));
		return;
	}
	handler(&server, 0, None);
	drop(shared);

	// Steady state: drive the QoS state machine over inbound packets until
	// the receive pump closes the channel.
	let mut shutdown = conn.shutdown.subscribe();
	loop {
		let packet = tokio::select! {
			packet = packet_rx.recv() => match packet {
				Some(packet) => packet,
				None => break,
			},
			_ = shutdown.wait_for(|closed| *closed) => break,
		};
		if handle_inbound(&conn, packet).await.is_break() {
			break;
		}
	}

	tracing::debug!("connection finished");
	conn.force_close();
	if let Some(shared) = parent.upgrade() {
		shared.deregister(&server);
	}
}

/// Inbound dispatcher: one step of the per-connection state machine.
async fn handle_inbound(conn: &Arc<Connection>, packet: Packet) -> ControlFlow<()> {
	let Some(shared) = conn.parent.upgrade() else {
		return Break(());
	};

	match packet {
		Packet::Publish(publish) => {
			let qos = publish.qos;
			let id = publish.id;
			tracing::debug!(topic = %publish.topic, ?qos, "publish received");

			if let Err(error) = shared.deliver(publish).await {
				tracing::warn!(%error, "dropping inbound publish");
			}

			let ack = match (qos, id) {
				(QoS::AtLeastOnce, Some(id)) => Some(Packet::from(PubAck { id })),
				(QoS::ExactlyOnce, Some(id)) => Some(Packet::from(PubRec { id })),
				_ => None,
			};
			if let Some(ack) = ack {
				if !conn.enqueue(&shared, ack).await {
					return Break(());
				}
			}
		}
		Packet::PubAck(PubAck { id }) => {
			finish_publish(&shared, id);
		}
		Packet::PubRec(PubRec { id }) => {
			tracing::debug!(?id, "PubRec received");
			if !conn.enqueue(&shared, PubRel { id }.into()).await {
				return Break(());
			}
		}
		Packet::PubRel(PubRel { id }) => {
			if !conn.enqueue(&shared, PubComp { id }.into()).await {
				return Break(());
			}
		}
		Packet::PubComp(PubComp { id }) => {
			finish_publish(&shared, id);
		}
		Packet::SubAck(SubAck { id, result }) => match shared.take_flow(id) {
			Some(Flow::Subscribe { filters }) => {
				if result.len() != filters.len() {
					tracing::warn!(
						?id,
						"SubAck return codes do not match the requested filters"
					);
				}
				for (filter, entry) in filters.iter().zip(&result) {
					match entry {
						Ok(qos) => tracing::debug!(%filter, ?qos, "subscribed"),
						Err(_) => {
							tracing::warn!(%filter, "subscription refused by broker");
							shared.router().remove(filter);
						}
					}
				}
			}
			Some(_) => tracing::warn!(?id, "SubAck for a non-subscribe flow"),
			None => tracing::warn!(?id, "unsolicited SubAck"),
		},
		Packet::UnsubAck(UnsubAck { id }) => match shared.take_flow(id) {
			Some(Flow::Unsubscribe { filters, handler }) => {
				tracing::debug!(?id, "unsubscribed");
				if let Some(handler) = handler {
					handler(&filters, None);
				}
			}
			Some(_) => tracing::warn!(?id, "UnsubAck for a non-unsubscribe flow"),
			None => tracing::warn!(?id, "unsolicited UnsubAck"),
		},
		// PingResp is routed to the keepalive supervisor by the receive
		// pump.
		Packet::PingResp => {}
		other => {
			tracing::debug!(packet = ?other.packet_type(), "discarding unexpected packet");
		}
	}

	Continue(())
}

fn finish_publish(shared: &Shared, id: crate::PacketId) {
	match shared.take_flow(id) {
		Some(Flow::Publish { topic, handler }) => {
			tracing::debug!(?id, "publish acknowledged");
			if let Some(handler) = handler {
				handler(&topic, None);
			}
		}
		Some(_) => tracing::warn!(?id, "publish acknowledgment for a non-publish flow"),
		None => tracing::warn!(?id, "unsolicited publish acknowledgment"),
	}
}

/// Drains the shared outbound queue onto the transport. Exits after writing
/// a Disconnect, on write failure, or on shutdown.
async fn send_pump(
	conn: Arc<Connection>,
	mut writer: PacketStream<WriteHalf<Transport>>,
	_guard: WorkerGuard,
) {
	let mut shutdown = conn.shutdown.subscribe();
	loop {
		let packet = tokio::select! {
			packet = conn.next_outbound() => match packet {
				Some(packet) => packet,
				None => break,
			},
			_ = shutdown.wait_for(|closed| *closed) => break,
		};

		if let Err(error) = writer.write_packet(&packet).await {
			tracing::error!(%error, "write failed, closing connection");
			conn.force_close();
			break;
		}

		if matches!(packet, Packet::Disconnect) {
			tracing::debug!("Disconnect written, send pump exiting");
			let _ = writer.shutdown().await;
			break;
		}
	}
}

/// Decodes packets off the transport. PingResp goes to the keepalive
/// supervisor, everything else to the worker's inbound channel. Dropping
/// both senders on exit is what signals teardown to the rest of the
/// connection.
async fn recv_pump(
	conn: Arc<Connection>,
	read_half: ReadHalf<Transport>,
	packet_tx: mpsc::Sender<Packet>,
	keepalive_tx: mpsc::Sender<()>,
	_guard: WorkerGuard,
) {
	let mut reader = PacketStream::new(read_half);
	let mut shutdown = conn.shutdown.subscribe();
	loop {
		tokio::select! {
			result = reader.read_packet() => match result {
				Ok(Some(Packet::PingResp)) => {
					tracing::trace!("keepalive response received");
					let _ = keepalive_tx.try_send(());
				}
				Ok(Some(packet)) => {
					tracing::trace!(packet = ?packet.packet_type(), "read from stream");
					if packet_tx.send(packet).await.is_err() {
						break;
					}
				}
				Ok(None) => {
					tracing::warn!("connection closed by server");
					break;
				}
				Err(error) => {
					tracing::error!(%error, "connection broken");
					break;
				}
			},
			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					break;
				}
			}
		}
	}
}

/// Probes broker liveness every keepalive interval. A probe not answered
/// within `deadline` force-closes the connection; closure of the signal
/// channel means the receive pump is gone and the supervisor exits.
async fn keepalive_supervisor(
	conn: Arc<Connection>,
	mut signal: mpsc::Receiver<()>,
	interval: Duration,
	deadline: Duration,
	_guard: WorkerGuard,
) {
	tracing::debug!(?interval, "keepalive supervisor started");
	let mut shutdown = conn.shutdown.subscribe();
	loop {
		tokio::select! {
			_ = time::sleep(interval) => {}
			_ = shutdown.wait_for(|closed| *closed) => return,
		}

		let Some(shared) = conn.parent.upgrade() else {
			return;
		};
		if !conn.enqueue(&shared, Packet::PingReq).await {
			return;
		}
		drop(shared);

		tokio::select! {
			response = signal.recv() => {
				if response.is_none() {
					// Receive pump exited and closed the channel.
					return;
				}
			}
			_ = time::sleep(deadline) => {
				tracing::error!("no response to keepalive probe, closing connection");
				conn.force_close();
				return;
			}
			_ = shutdown.wait_for(|closed| *closed) => return,
		}
	}
}
