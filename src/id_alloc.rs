//! Packet-identifier pool shared by every flow of a client.

use crate::PacketId;
use std::sync::Mutex;
use tokio::sync::Notify;

const ID_SPACE: usize = 1 << 16;
const WORDS: usize = ID_SPACE / 64;

/// Allocates 16-bit packet identifiers.
///
/// [`next_id`] hands out the smallest unused identifier at or above the
/// previously issued one, wrapping past 65,535 and skipping the reserved
/// value 0. At most one in-flight flow holds a given identifier; [`free`]
/// returns it to the pool on terminal acknowledgment. When every identifier
/// is in use the caller is parked until one is freed.
///
/// [`next_id`]: IdAllocator::next_id
/// [`free`]: IdAllocator::free
#[derive(Debug)]
pub struct IdAllocator {
	state: Mutex<Bitmap>,
	freed: Notify,
}

#[derive(Debug)]
struct Bitmap {
	words: Vec<u64>,
	last: u16,
	in_use: usize,
}

impl Bitmap {
	fn new() -> Self {
		let mut words = vec![0u64; WORDS];
		// Identifier 0 is reserved and never issued.
		words[0] = 1;
		Self {
			words,
			last: 0,
			in_use: 0,
		}
	}

	#[inline]
	fn is_set(&self, id: u16) -> bool {
		self.words[id as usize / 64] & (1 << (id % 64)) != 0
	}

	#[inline]
	fn set(&mut self, id: u16) {
		self.words[id as usize / 64] |= 1 << (id % 64);
	}

	#[inline]
	fn clear(&mut self, id: u16) {
		self.words[id as usize / 64] &= !(1 << (id % 64));
	}

	fn take_next(&mut self) -> Option<PacketId> {
		if self.in_use == ID_SPACE - 1 {
			return None;
		}

		let mut candidate = self.last;
		loop {
			candidate = candidate.wrapping_add(1);
			if candidate == 0 {
				candidate = 1;
			}

			if !self.is_set(candidate) {
				self.set(candidate);
				self.last = candidate;
				self.in_use += 1;
				// The saturation check above guarantees a free slot.
				return Some(PacketId::new(candidate).unwrap());
			}
		}
	}
}

impl IdAllocator {
	pub fn new() -> Self {
		Self {
			state: Mutex::new(Bitmap::new()),
			freed: Notify::new(),
		}
	}

	/// Returns the next free packet identifier, waiting for a [`free`] if
	/// the pool is saturated.
	///
	/// [`free`]: IdAllocator::free
	pub async fn next_id(&self) -> PacketId {
		loop {
			if let Some(id) = self.state.lock().unwrap().take_next() {
				return id;
			}
			self.freed.notified().await;
		}
	}

	/// Reinstates `id` into the pool. Freeing an identifier that was never
	/// issued is a no-op.
	pub fn free(&self, id: PacketId) {
		let mut state = self.state.lock().unwrap();
		if state.is_set(id.get()) {
			state.clear(id.get());
			state.in_use -= 1;
			drop(state);
			self.freed.notify_one();
		}
	}
}

impl Default for IdAllocator {
	fn default() -> Self {
		Self::new()
	}
}
