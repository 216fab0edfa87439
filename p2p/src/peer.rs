// Copyright 2020 The Grove Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A connected peer: its advertised heads, what it is known to have seen,
//! and a bounded outbound queue serviced by a per-peer relay thread so
//! gossip producers never block on a slow connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lru_cache::LruCache;

use crate::core::hash::Hashed;
use crate::core::{Difficulty, FastBlock, Fruit, Hash, SnailBlock, Transaction};
use crate::types::{Error, PeerInfo, PeerTransport};
use crate::util::{Condvar, Mutex, RateCounter};

/// How many block/tx/vote hashes we remember seeing per peer.
const MAX_KNOWN: usize = 8192;

/// Outbound queue cap. Overflow drops the oldest queued item.
const MAX_QUEUE: usize = 128;

/// How long the relay thread sleeps when there is nothing to send.
const RELAY_IDLE_WAIT: Duration = Duration::from_millis(100);

enum Outbound {
	FastBlock(Box<FastBlock>),
	SnailBlock(Box<SnailBlock>, Difficulty),
	Transactions(Vec<Transaction>),
	Fruits(Vec<Fruit>),
	FastHashes(Vec<(Hash, u64)>),
	SnailHashes(Vec<(Hash, u64)>),
}

struct Outbox {
	queue: Mutex<VecDeque<Outbound>>,
	signal: Condvar,
	stop: AtomicBool,
	dropped: AtomicU64,
}

/// A single connected peer.
pub struct Peer {
	/// Who the peer is and what it advertises.
	pub info: PeerInfo,
	transport: Arc<dyn PeerTransport>,
	connected: AtomicBool,
	banned: AtomicBool,
	known_blocks: Mutex<LruCache<Hash, ()>>,
	known_txs: Mutex<LruCache<Hash, ()>>,
	known_signs: Mutex<LruCache<Hash, ()>>,
	outbox: Arc<Outbox>,
	relay: Mutex<Option<thread::JoinHandle<()>>>,
	sent: Mutex<RateCounter>,
	received: Mutex<RateCounter>,
}

impl Peer {
	/// Wrap a handshaked connection into a peer record. The relay thread is
	/// started by the registry on registration.
	pub fn new(info: PeerInfo, transport: Arc<dyn PeerTransport>) -> Peer {
		Peer {
			info,
			transport,
			connected: AtomicBool::new(true),
			banned: AtomicBool::new(false),
			known_blocks: Mutex::new(LruCache::new(MAX_KNOWN)),
			known_txs: Mutex::new(LruCache::new(MAX_KNOWN)),
			known_signs: Mutex::new(LruCache::new(MAX_KNOWN)),
			outbox: Arc::new(Outbox {
				queue: Mutex::new(VecDeque::new()),
				signal: Condvar::new(),
				stop: AtomicBool::new(false),
				dropped: AtomicU64::new(0),
			}),
			relay: Mutex::new(None),
			sent: Mutex::new(RateCounter::new()),
			received: Mutex::new(RateCounter::new()),
		}
	}

	/// The peer identifier.
	pub fn id(&self) -> String {
		self.info.id.clone()
	}

	/// Direct access to the request surface of this peer's connection.
	pub fn transport(&self) -> Arc<dyn PeerTransport> {
		self.transport.clone()
	}

	/// Whether the connection is still considered live.
	pub fn is_connected(&self) -> bool {
		self.connected.load(Ordering::Relaxed)
	}

	/// Whether the peer has been banned.
	pub fn is_banned(&self) -> bool {
		self.banned.load(Ordering::Relaxed)
	}

	/// Mark the peer banned. It stays in the registry until cleaned so the
	/// ban survives a reconnection race.
	pub fn set_banned(&self) {
		self.banned.store(true, Ordering::Relaxed);
	}

	/// Number of gossip items dropped because the peer could not keep up.
	pub fn dropped_count(&self) -> u64 {
		self.outbox.dropped.load(Ordering::Relaxed)
	}

	/// Note inbound traffic from this peer, for rate diagnostics.
	pub fn note_received(&self, bytes: u64) {
		self.received.lock().inc(bytes);
	}

	/// (sent, received) item counts over the last minute.
	pub fn traffic_per_min(&self) -> (u64, u64) {
		(
			self.sent.lock().count_per_min(),
			self.received.lock().count_per_min(),
		)
	}

	/// Whether the peer is known to have seen this block hash.
	pub fn knows_block(&self, h: &Hash) -> bool {
		self.known_blocks.lock().contains_key(h)
	}

	/// Remember that the peer has seen this block hash.
	pub fn mark_block(&self, h: Hash) {
		self.known_blocks.lock().insert(h, ());
	}

	/// Whether the peer is known to have seen this transaction hash.
	pub fn knows_tx(&self, h: &Hash) -> bool {
		self.known_txs.lock().contains_key(h)
	}

	/// Remember that the peer has seen this transaction hash.
	pub fn mark_tx(&self, h: Hash) {
		self.known_txs.lock().insert(h, ());
	}

	/// Whether the peer is known to have seen this vote hash.
	pub fn knows_sign(&self, h: &Hash) -> bool {
		self.known_signs.lock().contains_key(h)
	}

	/// Remember that the peer has seen this vote hash.
	pub fn mark_sign(&self, h: Hash) {
		self.known_signs.lock().insert(h, ());
	}

	/// Queue a full fast block for relay, unless the peer already has it.
	/// Returns whether the block was queued.
	pub fn send_fast_block(&self, block: &FastBlock) -> bool {
		let h = block.hash();
		if self.knows_block(&h) {
			return false;
		}
		self.mark_block(h);
		self.push(Outbound::FastBlock(Box::new(block.clone())));
		true
	}

	/// Queue a full snail block for relay, unless the peer already has it.
	pub fn send_snail_block(&self, block: &SnailBlock, td: Difficulty) -> bool {
		let h = block.hash();
		if self.knows_block(&h) {
			return false;
		}
		self.mark_block(h);
		self.push(Outbound::SnailBlock(Box::new(block.clone()), td));
		true
	}

	/// Queue transactions the peer has not seen yet. Returns how many were
	/// actually queued.
	pub fn send_transactions(&self, txs: &[Transaction]) -> usize {
		let unseen = txs
			.iter()
			.filter(|tx| !self.knows_tx(&tx.hash()))
			.cloned()
			.collect::<Vec<_>>();
		if unseen.is_empty() {
			return 0;
		}
		for tx in &unseen {
			self.mark_tx(tx.hash());
		}
		let count = unseen.len();
		self.push(Outbound::Transactions(unseen));
		count
	}

	/// Queue fruits for relay.
	pub fn send_fruits(&self, fruits: Vec<Fruit>) -> usize {
		let count = fruits.len();
		if count > 0 {
			self.push(Outbound::Fruits(fruits));
		}
		count
	}

	/// Queue a fast block announcement.
	pub fn announce_fast_blocks(&self, hashes: Vec<(Hash, u64)>) {
		let unseen = hashes
			.into_iter()
			.filter(|(h, _)| !self.knows_block(h))
			.collect::<Vec<_>>();
		if !unseen.is_empty() {
			self.push(Outbound::FastHashes(unseen));
		}
	}

	/// Queue a snail block announcement.
	pub fn announce_snail_blocks(&self, hashes: Vec<(Hash, u64)>) {
		let unseen = hashes
			.into_iter()
			.filter(|(h, _)| !self.knows_block(h))
			.collect::<Vec<_>>();
		if !unseen.is_empty() {
			self.push(Outbound::SnailHashes(unseen));
		}
	}

	fn push(&self, item: Outbound) {
		let mut queue = self.outbox.queue.lock();
		if queue.len() >= MAX_QUEUE {
			// producers never block on a slow peer
			queue.pop_front();
			self.outbox.dropped.fetch_add(1, Ordering::Relaxed);
		}
		queue.push_back(item);
		self.sent.lock().inc(1);
		self.outbox.signal.notify_one();
	}

	/// Start the relay thread servicing the outbound queue. Called once by
	/// the registry on registration.
	pub(crate) fn start_relay(&self) {
		let outbox = self.outbox.clone();
		let transport = self.transport.clone();
		let id = self.info.id.clone();
		let handle = thread::Builder::new()
			.name(format!("peer_relay_{}", id))
			.spawn(move || run_relay(outbox, transport, id))
			.expect("failed to spawn peer relay");
		*self.relay.lock() = Some(handle);
	}

	/// Signal the relay thread to stop and wait for it to drain.
	pub fn stop(&self) {
		self.connected.store(false, Ordering::Relaxed);
		self.outbox.stop.store(true, Ordering::Relaxed);
		self.outbox.signal.notify_one();
		if let Some(handle) = self.relay.lock().take() {
			let _ = handle.join();
		}
	}
}

fn run_relay(outbox: Arc<Outbox>, transport: Arc<dyn PeerTransport>, id: String) {
	loop {
		let item = {
			let mut queue = outbox.queue.lock();
			match queue.pop_front() {
				Some(item) => Some(item),
				None => {
					if outbox.stop.load(Ordering::Relaxed) {
						break;
					}
					outbox.signal.wait_for(&mut queue, RELAY_IDLE_WAIT);
					None
				}
			}
		};

		if let Some(item) = item {
			let res = match item {
				Outbound::FastBlock(b) => transport.send_fast_block(&b),
				Outbound::SnailBlock(b, td) => transport.send_snail_block(&b, td),
				Outbound::Transactions(txs) => transport.send_transactions(&txs),
				Outbound::Fruits(fruits) => transport.send_fruits(&fruits),
				Outbound::FastHashes(hashes) => transport.announce_fast_blocks(&hashes),
				Outbound::SnailHashes(hashes) => transport.announce_snail_blocks(&hashes),
			};
			if let Err(e) = res {
				debug!("relay to {} failed: {:?}", id, e);
			}
		}

		if outbox.stop.load(Ordering::Relaxed) && outbox.queue.lock().is_empty() {
			break;
		}
	}
	trace!("peer {} relay drained and stopped", id);
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::msg::{CallTag, PROTOCOL_V2};
	use crate::types::{Capabilities, PeerInfo};
	use std::sync::atomic::AtomicUsize;

	struct CountingTransport {
		sent: AtomicUsize,
	}

	impl PeerTransport for CountingTransport {
		fn request_fast_headers_by_hash(
			&self,
			_: Hash,
			_: u64,
			_: u64,
			_: bool,
			_: CallTag,
		) -> Result<(), Error> {
			Ok(())
		}
		fn request_fast_headers_by_number(
			&self,
			_: u64,
			_: u64,
			_: u64,
			_: bool,
			_: CallTag,
		) -> Result<(), Error> {
			Ok(())
		}
		fn request_fast_bodies(&self, _: Vec<Hash>, _: CallTag) -> Result<(), Error> {
			Ok(())
		}
		fn request_receipts(&self, _: Vec<Hash>) -> Result<(), Error> {
			Ok(())
		}
		fn request_node_data(&self, _: Vec<Hash>) -> Result<(), Error> {
			Ok(())
		}
		fn request_snail_headers_by_hash(
			&self,
			_: Hash,
			_: u64,
			_: u64,
			_: bool,
		) -> Result<(), Error> {
			Ok(())
		}
		fn request_snail_headers_by_number(
			&self,
			_: u64,
			_: u64,
			_: u64,
			_: bool,
		) -> Result<(), Error> {
			Ok(())
		}
		fn request_snail_bodies(&self, _: Vec<Hash>) -> Result<(), Error> {
			Ok(())
		}
		fn send_fast_block(&self, _: &FastBlock) -> Result<(), Error> {
			self.sent.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
		fn send_snail_block(&self, _: &SnailBlock, _: Difficulty) -> Result<(), Error> {
			Ok(())
		}
		fn send_transactions(&self, _: &[Transaction]) -> Result<(), Error> {
			Ok(())
		}
		fn send_fruits(&self, _: &[Fruit]) -> Result<(), Error> {
			Ok(())
		}
		fn announce_fast_blocks(&self, _: &[(Hash, u64)]) -> Result<(), Error> {
			self.sent.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
		fn announce_snail_blocks(&self, _: &[(Hash, u64)]) -> Result<(), Error> {
			Ok(())
		}
	}

	fn test_peer() -> Peer {
		let info = PeerInfo::new(
			"p".to_string(),
			"grove-test".to_string(),
			PROTOCOL_V2,
			Capabilities::FULL_NODE,
			Difficulty::zero(),
			Hash::default(),
			Hash::default(),
			0,
		);
		Peer::new(
			info,
			Arc::new(CountingTransport {
				sent: AtomicUsize::new(0),
			}),
		)
	}

	#[test]
	fn overflow_drops_oldest_without_blocking() {
		let peer = test_peer();
		// relay not started: everything stays queued
		for i in 0..(MAX_QUEUE + 10) as u64 {
			peer.announce_fast_blocks(vec![(Hash::from_vec(&[i as u8, 1]), i)]);
		}
		assert_eq!(peer.dropped_count(), 10);
	}

	#[test]
	fn known_blocks_are_not_resent() {
		let peer = test_peer();
		let block = FastBlock::default();
		assert!(peer.send_fast_block(&block));
		// the second send is suppressed by the tracking cache
		assert!(!peer.send_fast_block(&block));
	}

	#[test]
	fn stop_joins_relay() {
		let peer = test_peer();
		peer.start_relay();
		peer.announce_fast_blocks(vec![(Hash::from_vec(&[1]), 1)]);
		peer.stop();
		assert!(!peer.is_connected());
	}
}
