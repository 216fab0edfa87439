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

//! Shared p2p types: error kinds, peer capabilities, the peer record and
//! the transport abstraction request issuing goes through.

use std::sync::Arc;

use chrono::prelude::{DateTime, Utc};

use crate::core::{Difficulty, FastBlock, Fruit, Hash, SnailBlock, Transaction};
use crate::msg::CallTag;
use crate::util::RwLock;

/// Maximum number of block headers a peer should ever send in one response.
pub const MAX_BLOCK_HEADERS: u64 = 512;

/// Maximum number of peer addresses a peer should ever send.
pub const MAX_PEER_ADDRS: u32 = 256;

/// Errors the p2p layer surfaces. Each handshake failure is its own kind so
/// callers can apply a distinct drop/ban policy per kind.
#[derive(Debug)]
pub enum Error {
	/// The remote never sent a status message.
	NoStatusMsg,
	/// The remote speaks a protocol version we don't.
	ProtocolVersionMismatch {
		/// our version
		us: u32,
		/// their version
		peer: u32,
	},
	/// The remote lives on a different network.
	NetworkIdMismatch {
		/// our network
		us: u64,
		/// their network
		peer: u64,
	},
	/// The remote grew from a different genesis.
	GenesisBlockMismatch {
		/// our genesis
		us: Hash,
		/// their genesis
		peer: Hash,
	},
	/// A message exceeded the protocol size cap.
	MsgTooLarge,
	/// A message failed to decode.
	Decode,
	/// A message carried a code outside the protocol table.
	InvalidMsgCode(u8),
	/// The peer was previously suspended and may not rejoin yet.
	SuspendedPeer,
	/// The peer id is already present in the registry.
	AlreadyRegistered,
	/// The peer id is not present in the registry.
	NotRegistered,
	/// The registry has been shut down.
	Closed,
	/// The peer is banned.
	Banned,
	/// A request or send did not complete in time.
	Timeout,
	/// The underlying connection failed to carry a message.
	Send(String),
}

bitflags! {
	/// Options for what type of interaction a peer supports
	#[derive(Serialize, Deserialize)]
	pub struct Capabilities: u32 {
		/// We don't know (yet) what the peer can do.
		const UNKNOWN = 0b0000_0000;
		/// Can provide full history of fast and snail headers and blocks.
		const FULL_HIST = 0b0000_0001;
		/// Can provide receipts and state data for some recent-enough pivot.
		const STATE_HIST = 0b0000_0010;
		/// Can provide a list of healthy peers
		const PEER_LIST = 0b0000_0100;
		/// All of the above.
		const FULL_NODE = Self::FULL_HIST.bits
			| Self::STATE_HIST.bits
			| Self::PEER_LIST.bits;
	}
}

/// The part of the peer information that changes with every announcement
/// or ping exchange.
#[derive(Debug, Clone)]
pub struct PeerLiveInfo {
	/// Total difficulty of the peer's snail chain.
	pub total_difficulty: Difficulty,
	/// The peer's snail head hash.
	pub head_hash: Hash,
	/// The peer's fast head hash.
	pub fast_head: Hash,
	/// The peer's fast head height.
	pub fast_height: u64,
	/// When we last heard from the peer.
	pub last_seen: DateTime<Utc>,
}

/// General information about a connected peer that's useful to other modules.
#[derive(Clone)]
pub struct PeerInfo {
	/// Opaque stable identifier of the peer.
	pub id: String,
	/// Advertised software identification.
	pub user_agent: String,
	/// Negotiated protocol version.
	pub version: u32,
	/// Advertised capabilities.
	pub capabilities: Capabilities,
	/// The mutable head data, updated as the peer advertises progress.
	pub live_info: Arc<RwLock<PeerLiveInfo>>,
}

impl PeerInfo {
	/// Build the info for a freshly handshaked peer.
	pub fn new(
		id: String,
		user_agent: String,
		version: u32,
		capabilities: Capabilities,
		total_difficulty: Difficulty,
		head_hash: Hash,
		fast_head: Hash,
		fast_height: u64,
	) -> PeerInfo {
		PeerInfo {
			id,
			user_agent,
			version,
			capabilities,
			live_info: Arc::new(RwLock::new(PeerLiveInfo {
				total_difficulty,
				head_hash,
				fast_head,
				fast_height,
				last_seen: Utc::now(),
			})),
		}
	}

	/// The peer's advertised snail total difficulty.
	pub fn total_difficulty(&self) -> Difficulty {
		self.live_info.read().total_difficulty
	}

	/// The peer's advertised snail head hash.
	pub fn head_hash(&self) -> Hash {
		self.live_info.read().head_hash
	}

	/// The peer's advertised fast head (hash, height).
	pub fn fast_head(&self) -> (Hash, u64) {
		let live = self.live_info.read();
		(live.fast_head, live.fast_height)
	}

	/// Record a newly advertised pair of heads.
	pub fn update(
		&self,
		head_hash: Hash,
		total_difficulty: Difficulty,
		fast_head: Hash,
		fast_height: u64,
	) {
		let mut live = self.live_info.write();
		live.head_hash = head_hash;
		live.total_difficulty = total_difficulty;
		live.fast_head = fast_head;
		live.fast_height = fast_height;
		live.last_seen = Utc::now();
	}
}

/// The request surface a connected peer exposes. Implemented by the real
/// transport and by test mocks; everything the sync engine sends travels
/// through this trait.
pub trait PeerTransport: Send + Sync {
	/// Request a range of fast headers starting from a hash.
	fn request_fast_headers_by_hash(
		&self,
		origin: Hash,
		amount: u64,
		skip: u64,
		reverse: bool,
		tag: CallTag,
	) -> Result<(), Error>;

	/// Request a range of fast headers starting from a height.
	fn request_fast_headers_by_number(
		&self,
		origin: u64,
		amount: u64,
		skip: u64,
		reverse: bool,
		tag: CallTag,
	) -> Result<(), Error>;

	/// Request the bodies of the given fast blocks.
	fn request_fast_bodies(&self, hashes: Vec<Hash>, tag: CallTag) -> Result<(), Error>;

	/// Request the receipts of the given fast blocks.
	fn request_receipts(&self, hashes: Vec<Hash>) -> Result<(), Error>;

	/// Request raw state trie nodes by hash.
	fn request_node_data(&self, hashes: Vec<Hash>) -> Result<(), Error>;

	/// Request a range of snail headers starting from a hash.
	fn request_snail_headers_by_hash(
		&self,
		origin: Hash,
		amount: u64,
		skip: u64,
		reverse: bool,
	) -> Result<(), Error>;

	/// Request a range of snail headers starting from a height.
	fn request_snail_headers_by_number(
		&self,
		origin: u64,
		amount: u64,
		skip: u64,
		reverse: bool,
	) -> Result<(), Error>;

	/// Request the bodies of the given snail blocks.
	fn request_snail_bodies(&self, hashes: Vec<Hash>) -> Result<(), Error>;

	/// Relay a full fast block.
	fn send_fast_block(&self, block: &FastBlock) -> Result<(), Error>;

	/// Relay a full snail block along with its total difficulty.
	fn send_snail_block(&self, block: &SnailBlock, td: Difficulty) -> Result<(), Error>;

	/// Relay a batch of transactions.
	fn send_transactions(&self, txs: &[Transaction]) -> Result<(), Error>;

	/// Relay a batch of fruits.
	fn send_fruits(&self, fruits: &[Fruit]) -> Result<(), Error>;

	/// Announce fast blocks by hash and number.
	fn announce_fast_blocks(&self, hashes: &[(Hash, u64)]) -> Result<(), Error>;

	/// Announce snail blocks by hash and number.
	fn announce_snail_blocks(&self, hashes: &[(Hash, u64)]) -> Result<(), Error>;
}
