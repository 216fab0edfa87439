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

//! Routing of inbound data packets to whoever asked for them. Requests
//! carry a call tag that responders echo, so a header response lands at
//! either the downloader or the block fetcher without guesswork. Delivery
//! never blocks the transport: packets nobody wants, or that arrive while
//! intake is full, are counted and dropped.

use std::sync::Arc;

use grove_p2p::CallTag;

use crate::core::{FastBody, FastHeader, Hash, Receipt, SnailBody, SnailHeader};
use crate::fast::FastDownloader;
use crate::fetcher::Fetcher;
use crate::snail::SnailDownloader;
use crate::types::MeterSink;

/// An inbound data packet from the transport, one variant per response
/// message.
pub enum Packet {
	/// Fast headers answering a tagged request.
	FastHeaders {
		/// Delivering peer.
		peer: String,
		/// The headers.
		headers: Vec<FastHeader>,
		/// Who asked.
		tag: CallTag,
	},
	/// Fast bodies answering a tagged request.
	FastBodies {
		/// Delivering peer.
		peer: String,
		/// The bodies.
		bodies: Vec<FastBody>,
		/// Who asked.
		tag: CallTag,
	},
	/// Snail headers; only the downloader requests these.
	SnailHeaders {
		/// Delivering peer.
		peer: String,
		/// The headers.
		headers: Vec<SnailHeader>,
	},
	/// Snail bodies; only the downloader requests these.
	SnailBodies {
		/// Delivering peer.
		peer: String,
		/// The bodies.
		bodies: Vec<SnailBody>,
	},
	/// Receipt sets for fast blocks.
	Receipts {
		/// Delivering peer.
		peer: String,
		/// One receipt list per requested block.
		receipts: Vec<Vec<Receipt>>,
	},
	/// Raw state trie nodes.
	NodeData {
		/// Delivering peer.
		peer: String,
		/// The node blobs.
		data: Vec<Vec<u8>>,
	},
}

impl Packet {
	/// The peer the packet came from.
	pub fn peer_id(&self) -> &str {
		match self {
			Packet::FastHeaders { peer, .. }
			| Packet::FastBodies { peer, .. }
			| Packet::SnailHeaders { peer, .. }
			| Packet::SnailBodies { peer, .. }
			| Packet::Receipts { peer, .. }
			| Packet::NodeData { peer, .. } => peer,
		}
	}

	/// Number of items carried.
	pub fn items(&self) -> usize {
		match self {
			Packet::FastHeaders { headers, .. } => headers.len(),
			Packet::FastBodies { bodies, .. } => bodies.len(),
			Packet::SnailHeaders { headers, .. } => headers.len(),
			Packet::SnailBodies { bodies, .. } => bodies.len(),
			Packet::Receipts { receipts, .. } => receipts.len(),
			Packet::NodeData { data, .. } => data.len(),
		}
	}

	/// A terse description for logs.
	pub fn stats(&self) -> String {
		let kind = match self {
			Packet::FastHeaders { .. } => "fast headers",
			Packet::FastBodies { .. } => "fast bodies",
			Packet::SnailHeaders { .. } => "snail headers",
			Packet::SnailBodies { .. } => "snail bodies",
			Packet::Receipts { .. } => "receipts",
			Packet::NodeData { .. } => "node data",
		};
		format!("{}: {}", kind, self.items())
	}
}

/// Routes inbound packets into the downloaders and the fetcher.
pub struct Dispatcher {
	fast: Arc<FastDownloader>,
	snail: Arc<SnailDownloader>,
	fetcher: Arc<Fetcher>,
	meter: Arc<dyn MeterSink>,
}

impl Dispatcher {
	/// Wire the dispatcher to its consumers.
	pub fn new(
		fast: Arc<FastDownloader>,
		snail: Arc<SnailDownloader>,
		fetcher: Arc<Fetcher>,
		meter: Arc<dyn MeterSink>,
	) -> Dispatcher {
		Dispatcher {
			fast,
			snail,
			fetcher,
			meter,
		}
	}

	/// Route one packet. Never blocks; unwanted packets are dropped.
	pub fn dispatch(&self, packet: Packet) {
		trace!("dispatch from {}: {}", packet.peer_id(), packet.stats());
		match packet {
			Packet::FastHeaders { peer, headers, tag } => {
				self.deliver_fast_headers(&peer, headers, tag)
			}
			Packet::FastBodies { peer, bodies, tag } => {
				self.deliver_fast_bodies(&peer, bodies, tag)
			}
			Packet::SnailHeaders { peer, headers } => {
				self.deliver_snail_headers(&peer, headers)
			}
			Packet::SnailBodies { peer, bodies } => self.deliver_snail_bodies(&peer, bodies),
			Packet::Receipts { peer, receipts } => self.deliver_receipts(&peer, receipts),
			Packet::NodeData { peer, data } => self.deliver_node_data(&peer, data),
		}
	}

	/// Fast headers, routed by the echoed call tag.
	pub fn deliver_fast_headers(&self, peer: &str, headers: Vec<FastHeader>, tag: CallTag) {
		match tag {
			CallTag::Downloader => {
				if self.fast.deliver_headers(peer, headers).is_err() {
					self.meter.inc("dispatch.fast_headers.stale", 1);
				}
			}
			CallTag::Fetcher => self.fetcher.deliver_headers(peer, headers),
		}
	}

	/// Fast bodies, routed by the echoed call tag.
	pub fn deliver_fast_bodies(&self, peer: &str, bodies: Vec<FastBody>, tag: CallTag) {
		match tag {
			CallTag::Downloader => {
				if self.fast.deliver_bodies(peer, bodies).is_err() {
					self.meter.inc("dispatch.fast_bodies.stale", 1);
				}
			}
			CallTag::Fetcher => self.fetcher.deliver_bodies(peer, bodies),
		}
	}

	/// Snail headers always belong to the snail downloader.
	pub fn deliver_snail_headers(&self, peer: &str, headers: Vec<SnailHeader>) {
		if self.snail.deliver_headers(peer, headers).is_err() {
			self.meter.inc("dispatch.snail_headers.stale", 1);
		}
	}

	/// Snail bodies always belong to the snail downloader.
	pub fn deliver_snail_bodies(&self, peer: &str, bodies: Vec<SnailBody>) {
		if self.snail.deliver_bodies(peer, bodies).is_err() {
			self.meter.inc("dispatch.snail_bodies.stale", 1);
		}
	}

	/// Receipts always belong to the fast downloader.
	pub fn deliver_receipts(&self, peer: &str, receipts: Vec<Vec<Receipt>>) {
		if self.fast.deliver_receipts(peer, receipts).is_err() {
			self.meter.inc("dispatch.receipts.stale", 1);
		}
	}

	/// State trie nodes always belong to the fast downloader.
	pub fn deliver_node_data(&self, peer: &str, data: Vec<Vec<u8>>) {
		if self.fast.deliver_node_data(peer, data).is_err() {
			self.meter.inc("dispatch.node_data.stale", 1);
		}
	}

	/// Block announcements feed the fetcher.
	pub fn announce_fast_hashes(&self, peer: &str, hashes: Vec<(Hash, u64)>) {
		for (hash, number) in hashes {
			self.fetcher.announce(peer, hash, number);
		}
	}

	/// A full gossiped block feeds the fetcher.
	pub fn inject_fast_block(&self, peer: &str, block: crate::core::FastBlock) {
		self.fetcher.inject(peer, block);
	}
}
