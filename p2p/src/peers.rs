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

//! The registry of connected peers: registration, best-peer selection and
//! gossip fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::core::{Difficulty, FastBlock, Fruit, Hash, SnailBlock, Transaction};
use crate::peer::Peer;
use crate::types::Error;
use crate::util::RwLock;

/// All the peers we are currently connected to, keyed by peer id.
pub struct Peers {
	peers: RwLock<HashMap<String, Arc<Peer>>>,
	closed: AtomicBool,
}

impl Peers {
	/// An empty, open registry.
	pub fn new() -> Peers {
		Peers {
			peers: RwLock::new(HashMap::new()),
			closed: AtomicBool::new(false),
		}
	}

	/// Adds the peer to the registry and starts its relay thread. Fails if
	/// the id is already present, the peer was banned, or the registry shut
	/// down.
	pub fn register(&self, peer: Peer) -> Result<Arc<Peer>, Error> {
		if self.closed.load(Ordering::Relaxed) {
			return Err(Error::Closed);
		}
		if peer.is_banned() {
			return Err(Error::SuspendedPeer);
		}
		let id = peer.id();
		let mut peers = self.peers.write();
		if peers.contains_key(&id) {
			return Err(Error::AlreadyRegistered);
		}
		debug!("saving newly connected peer {}", id);
		let peer = Arc::new(peer);
		peer.start_relay();
		peers.insert(id, peer.clone());
		Ok(peer)
	}

	/// Removes the peer, signalling its relay thread and draining its
	/// outbound queue.
	pub fn unregister(&self, id: &str) -> Result<Arc<Peer>, Error> {
		let removed = self.peers.write().remove(id);
		match removed {
			Some(peer) => {
				peer.stop();
				Ok(peer)
			}
			None => Err(Error::NotRegistered),
		}
	}

	/// Get a connected peer by id.
	pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
		self.peers.read().get(id).cloned()
	}

	/// Whether the given id is currently registered.
	pub fn is_known(&self, id: &str) -> bool {
		self.peers.read().contains_key(id)
	}

	/// All currently connected peers.
	pub fn connected_peers(&self) -> Vec<Arc<Peer>> {
		self.peers.read().values().cloned().collect()
	}

	/// Number of peers we're currently connected to.
	pub fn peer_count(&self) -> usize {
		self.peers.read().len()
	}

	/// Returns the single peer advertising the most worked snail branch,
	/// picked at random among ties. None if the registry is empty.
	pub fn best_peer(&self) -> Option<Arc<Peer>> {
		let peers = self.connected_peers();
		let max_td = peers
			.iter()
			.map(|p| p.info.total_difficulty())
			.max()?;

		let mut best = peers
			.into_iter()
			.filter(|p| p.info.total_difficulty() == max_td)
			.collect::<Vec<_>>();
		best.shuffle(&mut thread_rng());
		best.into_iter().next()
	}

	/// Peers not yet known to have the given block.
	pub fn peers_without_block(&self, h: &Hash) -> Vec<Arc<Peer>> {
		self.connected_peers()
			.into_iter()
			.filter(|p| !p.knows_block(h))
			.collect()
	}

	/// Peers not yet known to have the given transaction.
	pub fn peers_without_tx(&self, h: &Hash) -> Vec<Arc<Peer>> {
		self.connected_peers()
			.into_iter()
			.filter(|p| !p.knows_tx(h))
			.collect()
	}

	/// Peers not yet known to have the given vote.
	pub fn peers_without_sign(&self, h: &Hash) -> Vec<Arc<Peer>> {
		self.connected_peers()
			.into_iter()
			.filter(|p| !p.knows_sign(h))
			.collect()
	}

	/// Relays the provided fast block to peers that do not have it yet.
	pub fn broadcast_fast_block(&self, block: &FastBlock) {
		let mut count = 0;
		for peer in self.peers_without_block(&block.hash()) {
			if peer.send_fast_block(block) {
				count += 1;
			}
		}
		debug!(
			"broadcast fast block {} at {} to {} peers",
			block.hash(),
			block.number(),
			count
		);
	}

	/// Relays the provided snail block to peers that do not have it yet.
	pub fn broadcast_snail_block(&self, block: &SnailBlock, td: Difficulty) {
		let mut count = 0;
		for peer in self.peers_without_block(&block.hash()) {
			if peer.send_snail_block(block, td) {
				count += 1;
			}
		}
		debug!(
			"broadcast snail block {} at {} to {} peers",
			block.hash(),
			block.number(),
			count
		);
	}

	/// Announce a freshly accepted fast block by hash to peers missing it.
	pub fn announce_fast_block(&self, h: Hash, number: u64) {
		for peer in self.peers_without_block(&h) {
			peer.announce_fast_blocks(vec![(h, number)]);
		}
	}

	/// Announce a freshly accepted snail block by hash to peers missing it.
	pub fn announce_snail_block(&self, h: Hash, number: u64) {
		for peer in self.peers_without_block(&h) {
			peer.announce_snail_blocks(vec![(h, number)]);
		}
	}

	/// Relays the provided transactions to peers missing them.
	pub fn broadcast_transactions(&self, txs: &[Transaction]) {
		for peer in self.connected_peers() {
			peer.send_transactions(txs);
		}
	}

	/// Relays the provided fruits to all connected peers.
	pub fn broadcast_fruits(&self, fruits: &[Fruit]) {
		for peer in self.connected_peers() {
			peer.send_fruits(fruits.to_vec());
		}
	}

	/// Bans a peer: marks it and unregisters it so its relay drains.
	pub fn ban_peer(&self, id: &str) {
		if let Some(peer) = self.get(id) {
			debug!("banning peer {}", id);
			peer.set_banned();
			let _ = self.unregister(id);
		}
	}

	/// Shut the registry down: no further registrations, all relay threads
	/// signalled and joined.
	pub fn close(&self) {
		self.closed.store(true, Ordering::Relaxed);
		let peers = {
			let mut map = self.peers.write();
			map.drain().map(|(_, p)| p).collect::<Vec<_>>()
		};
		for peer in peers {
			peer.stop();
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::core::hash::Hashed;
	use crate::msg::CallTag;
	use crate::types::{Capabilities, PeerInfo, PeerTransport};

	struct NullTransport;

	impl PeerTransport for NullTransport {
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
			Ok(())
		}
		fn announce_snail_blocks(&self, _: &[(Hash, u64)]) -> Result<(), Error> {
			Ok(())
		}
	}

	fn test_peer(id: &str, td: u64) -> Peer {
		let info = PeerInfo::new(
			id.to_string(),
			"grove-test".to_string(),
			crate::msg::PROTOCOL_V2,
			Capabilities::FULL_NODE,
			Difficulty::from_num(td),
			Hash::default(),
			Hash::default(),
			0,
		);
		Peer::new(info, Arc::new(NullTransport))
	}

	#[test]
	fn register_unregister() {
		let peers = Peers::new();
		peers.register(test_peer("a", 1)).unwrap();
		match peers.register(test_peer("a", 1)) {
			Err(Error::AlreadyRegistered) => (),
			other => panic!("expected AlreadyRegistered, got {:?}", other.map(|_| ())),
		}
		assert_eq!(peers.peer_count(), 1);

		peers.unregister("a").unwrap();
		match peers.unregister("a") {
			Err(Error::NotRegistered) => (),
			other => panic!("expected NotRegistered, got {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn closed_registry_rejects() {
		let peers = Peers::new();
		peers.close();
		match peers.register(test_peer("a", 1)) {
			Err(Error::Closed) => (),
			other => panic!("expected Closed, got {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn best_peer_is_highest_td() {
		let peers = Peers::new();
		assert!(peers.best_peer().is_none());
		peers.register(test_peer("low", 10)).unwrap();
		peers.register(test_peer("high", 1000)).unwrap();
		peers.register(test_peer("mid", 100)).unwrap();
		assert_eq!(peers.best_peer().unwrap().id(), "high");
		peers.close();
	}

	#[test]
	fn fan_out_skips_peers_with_block() {
		let peers = Peers::new();
		let a = peers.register(test_peer("a", 1)).unwrap();
		peers.register(test_peer("b", 1)).unwrap();

		let h = b"some block"[..].hash();
		a.mark_block(h);
		let without = peers.peers_without_block(&h);
		assert_eq!(without.len(), 1);
		assert_eq!(without[0].id(), "b");
		peers.close();
	}
}
