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

//! The download queue of one chain: scheduled headers waiting for their
//! bodies (and receipts in pivoted modes), per-peer reservations, and the
//! strictly height-ordered stream of completed blocks handed to insertion.
//! The bounded size of this queue is the backpressure of the whole
//! pipeline: scheduling blocks while it is full.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::core::fast::receipts_root;
use crate::core::{FastBody, FastHeader, FruitHashVersion, Hash, Hashed, Receipt, SnailBody,
	SnailHeader};
use crate::error::{Error, ErrorKind};
use crate::util::{Condvar, Mutex, RwLock};

/// What makes the two chains schedulable by the same queue: headers with
/// hashes, numbers and parents, bodies checkable against header
/// commitments, and optionally receipts.
pub trait ChainFlavor: Send + Sync + 'static {
	/// Header type of the chain.
	type Header: Clone + Send + Sync + 'static;
	/// Body type of the chain.
	type Body: Clone + Send + Sync + 'static;
	/// Receipt set type of the chain, `()` where not applicable.
	type Receipts: Clone + Send + Sync + 'static;

	/// Hash of a header.
	fn hash(&self, header: &Self::Header) -> Hash;
	/// Height of a header.
	fn number(&self, header: &Self::Header) -> u64;
	/// Parent hash of a header.
	fn parent(&self, header: &Self::Header) -> Hash;
	/// The locally reconstructible body for headers committing to an empty
	/// payload, None when a network fetch is needed.
	fn empty_body(&self, header: &Self::Header) -> Option<Self::Body>;
	/// Whether a delivered body satisfies the header commitments.
	fn body_matches(&self, header: &Self::Header, body: &Self::Body) -> bool;
	/// Whether a delivered receipt set satisfies the header commitment.
	fn receipts_match(&self, header: &Self::Header, receipts: &Self::Receipts) -> bool;
}

/// The fast chain flavor: transaction bodies, receipts in pivoted modes.
#[derive(Clone, Copy)]
pub struct FastFlavor;

impl ChainFlavor for FastFlavor {
	type Header = FastHeader;
	type Body = FastBody;
	type Receipts = Vec<Receipt>;

	fn hash(&self, header: &FastHeader) -> Hash {
		header.hash()
	}
	fn number(&self, header: &FastHeader) -> u64 {
		header.number
	}
	fn parent(&self, header: &FastHeader) -> Hash {
		header.parent_hash
	}
	fn empty_body(&self, header: &FastHeader) -> Option<FastBody> {
		if header.has_empty_body() {
			Some(FastBody::empty())
		} else {
			None
		}
	}
	fn body_matches(&self, header: &FastHeader, body: &FastBody) -> bool {
		body.matches(header)
	}
	fn receipts_match(&self, header: &FastHeader, receipts: &Vec<Receipt>) -> bool {
		receipts_root(receipts) == header.receipt_root
	}
}

/// The snail chain flavor: fruit bodies, commitment rules depending on the
/// negotiated protocol era, never any receipts.
#[derive(Clone)]
pub struct SnailFlavor {
	/// Which fruit hashing rules the delivering network speaks. Shared with
	/// the downloader, which pins it per sync cycle.
	pub version: Arc<RwLock<FruitHashVersion>>,
}

impl SnailFlavor {
	/// A flavor starting out on the post-upgrade rules.
	pub fn new() -> SnailFlavor {
		SnailFlavor {
			version: Arc::new(RwLock::new(FruitHashVersion::Tip5)),
		}
	}
}

impl ChainFlavor for SnailFlavor {
	type Header = SnailHeader;
	type Body = SnailBody;
	type Receipts = ();

	fn hash(&self, header: &SnailHeader) -> Hash {
		header.hash()
	}
	fn number(&self, header: &SnailHeader) -> u64 {
		header.number
	}
	fn parent(&self, header: &SnailHeader) -> Hash {
		header.parent_hash
	}
	fn empty_body(&self, header: &SnailHeader) -> Option<SnailBody> {
		if header.fruit_root == *crate::core::hash::EMPTY_ROOT {
			Some(SnailBody::default())
		} else {
			None
		}
	}
	fn body_matches(&self, header: &SnailHeader, body: &SnailBody) -> bool {
		body.matches(header, *self.version.read())
	}
	fn receipts_match(&self, _header: &SnailHeader, _receipts: &()) -> bool {
		true
	}
}

/// A block fully assembled by the queue, ready for insertion.
pub struct FetchResult<F: ChainFlavor> {
	/// The header.
	pub header: F::Header,
	/// The matching body.
	pub body: F::Body,
	/// The matching receipts, when the cycle fetches them.
	pub receipts: Option<F::Receipts>,
}

struct Entry<F: ChainFlavor> {
	header: F::Header,
	body: Option<F::Body>,
	receipts: Option<F::Receipts>,
	need_receipts: bool,
}

impl<F: ChainFlavor> Entry<F> {
	fn complete(&self) -> bool {
		self.body.is_some() && (!self.need_receipts || self.receipts.is_some())
	}
}

struct Inner<F: ChainFlavor> {
	// all scheduled entries not yet handed to insertion, by height
	pending: BTreeMap<u64, Entry<F>>,
	by_hash: HashMap<Hash, u64>,
	// heights whose body/receipts still need requesting
	body_queue: BTreeSet<u64>,
	receipt_queue: BTreeSet<u64>,
	// at most one outstanding reservation per peer and kind
	body_reserved: HashMap<String, Vec<u64>>,
	receipt_reserved: HashMap<String, Vec<u64>>,
	// height and parent hash the next scheduled header must match
	next_schedule: u64,
	last_hash: Hash,
	// height of the next block handed to insertion
	next_result: u64,
	fetch_receipts: bool,
	scheduling_done: bool,
	closed: bool,
}

/// The download queue of one chain.
pub struct Queue<F: ChainFlavor> {
	flavor: F,
	cache_limit: usize,
	inner: Mutex<Inner<F>>,
	// signalled when room frees up for scheduling
	room: Condvar,
	// signalled when a result may have completed
	ready: Condvar,
}

impl<F: ChainFlavor> Queue<F> {
	/// An idle queue; `reset` readies it for a cycle.
	pub fn new(flavor: F, cache_limit: usize) -> Queue<F> {
		Queue {
			flavor,
			cache_limit,
			inner: Mutex::new(Inner {
				pending: BTreeMap::new(),
				by_hash: HashMap::new(),
				body_queue: BTreeSet::new(),
				receipt_queue: BTreeSet::new(),
				body_reserved: HashMap::new(),
				receipt_reserved: HashMap::new(),
				next_schedule: 0,
				last_hash: Hash::default(),
				next_result: 0,
				fetch_receipts: false,
				scheduling_done: false,
				closed: false,
			}),
			room: Condvar::new(),
			ready: Condvar::new(),
		}
	}

	/// Ready the queue for a new cycle scheduling headers from `next` whose
	/// first parent is `parent_hash`.
	pub fn reset(&self, next: u64, parent_hash: Hash, fetch_receipts: bool) {
		let mut inner = self.inner.lock();
		inner.pending.clear();
		inner.by_hash.clear();
		inner.body_queue.clear();
		inner.receipt_queue.clear();
		inner.body_reserved.clear();
		inner.receipt_reserved.clear();
		inner.next_schedule = next;
		inner.last_hash = parent_hash;
		inner.next_result = next;
		inner.fetch_receipts = fetch_receipts;
		inner.scheduling_done = false;
		inner.closed = false;
	}

	/// Close the queue: unblock every waiter, refuse further work.
	pub fn close(&self) {
		let mut inner = self.inner.lock();
		inner.closed = true;
		// entries are dropped so the queue reports idle right away
		inner.pending.clear();
		inner.by_hash.clear();
		inner.body_queue.clear();
		inner.receipt_queue.clear();
		inner.body_reserved.clear();
		inner.receipt_reserved.clear();
		self.room.notify_all();
		self.ready.notify_all();
	}

	/// Whether the queue has been closed.
	pub fn is_closed(&self) -> bool {
		self.inner.lock().closed
	}

	/// Note that no further headers will be scheduled this cycle.
	pub fn finish_scheduling(&self) {
		let mut inner = self.inner.lock();
		inner.scheduling_done = true;
		self.ready.notify_all();
	}

	/// True when no entry is pending and no reservation is outstanding.
	pub fn idle(&self) -> bool {
		let inner = self.inner.lock();
		inner.pending.is_empty()
			&& inner.body_reserved.is_empty()
			&& inner.receipt_reserved.is_empty()
	}

	/// True when scheduling is finished and everything scheduled has been
	/// handed to insertion.
	pub fn drained(&self) -> bool {
		let inner = self.inner.lock();
		(inner.scheduling_done || inner.closed) && inner.pending.is_empty()
	}

	/// Number of entries currently scheduled.
	pub fn pending_count(&self) -> usize {
		self.inner.lock().pending.len()
	}

	/// True when no more body work will ever appear: scheduling finished,
	/// the fetch pool is empty and nothing is reserved.
	pub fn body_work_done(&self) -> bool {
		let inner = self.inner.lock();
		(inner.scheduling_done || inner.closed)
			&& inner.body_queue.is_empty()
			&& inner.body_reserved.is_empty()
	}

	/// True when no more receipt work will ever appear.
	pub fn receipt_work_done(&self) -> bool {
		let inner = self.inner.lock();
		(inner.scheduling_done || inner.closed)
			&& inner.receipt_queue.is_empty()
			&& inner.receipt_reserved.is_empty()
	}

	/// Schedule a batch of headers extending the already scheduled prefix.
	/// Rejects gaps, duplicates and broken parent links. Blocks while the
	/// queue is at capacity; the wait aborts when the queue closes.
	pub fn schedule(&self, headers: Vec<F::Header>) -> Result<usize, Error> {
		let mut inner = self.inner.lock();
		let mut scheduled = 0;
		for header in headers {
			// backpressure: wait for room entry by entry
			while inner.pending.len() >= self.cache_limit && !inner.closed {
				self.room.wait_for(&mut inner, Duration::from_millis(250));
			}
			if inner.closed {
				return Err(ErrorKind::CancelHeaderProcessing.into());
			}

			let number = self.flavor.number(&header);
			let hash = self.flavor.hash(&header);
			if number != inner.next_schedule {
				debug!(
					"queue: header {} out of order, expected {}",
					number, inner.next_schedule
				);
				return Err(ErrorKind::InvalidChain.into());
			}
			if self.flavor.parent(&header) != inner.last_hash {
				debug!("queue: header {} does not link to scheduled parent", number);
				return Err(ErrorKind::InvalidChain.into());
			}

			let body = self.flavor.empty_body(&header);
			let need_fetch = body.is_none();
			let need_receipts = inner.fetch_receipts;
			inner.pending.insert(
				number,
				Entry {
					header,
					body,
					receipts: None,
					need_receipts,
				},
			);
			inner.by_hash.insert(hash, number);
			if need_fetch {
				inner.body_queue.insert(number);
			}
			if need_receipts {
				inner.receipt_queue.insert(number);
			}
			inner.next_schedule = number + 1;
			inner.last_hash = hash;
			scheduled += 1;

			// an empty body may complete the entry immediately
			if !need_fetch && !need_receipts {
				self.ready.notify_all();
			}
		}
		Ok(scheduled)
	}

	/// Reserve up to `count` of the oldest unreserved bodies for a peer.
	/// Returns the headers to request, empty if nothing is reservable or
	/// the peer already holds a body reservation.
	pub fn reserve_bodies(&self, peer: &str, count: u64) -> Vec<F::Header> {
		let mut inner = self.inner.lock();
		if inner.closed || inner.body_reserved.contains_key(peer) {
			return vec![];
		}
		let numbers = inner
			.body_queue
			.iter()
			.take(count as usize)
			.cloned()
			.collect::<Vec<_>>();
		if numbers.is_empty() {
			return vec![];
		}
		for n in &numbers {
			inner.body_queue.remove(n);
		}
		let headers = numbers
			.iter()
			.map(|n| inner.pending[n].header.clone())
			.collect();
		inner.body_reserved.insert(peer.to_string(), numbers);
		headers
	}

	/// Reserve up to `count` of the oldest unreserved receipt sets.
	pub fn reserve_receipts(&self, peer: &str, count: u64) -> Vec<F::Header> {
		let mut inner = self.inner.lock();
		if inner.closed || inner.receipt_reserved.contains_key(peer) {
			return vec![];
		}
		let numbers = inner
			.receipt_queue
			.iter()
			.take(count as usize)
			.cloned()
			.collect::<Vec<_>>();
		if numbers.is_empty() {
			return vec![];
		}
		for n in &numbers {
			inner.receipt_queue.remove(n);
		}
		let headers = numbers
			.iter()
			.map(|n| inner.pending[n].header.clone())
			.collect();
		inner.receipt_reserved.insert(peer.to_string(), numbers);
		headers
	}

	/// Revoke the body reservation of a peer, returning its entries to the
	/// pool. Returns how many entries were re-pooled.
	pub fn cancel_bodies(&self, peer: &str) -> usize {
		let mut inner = self.inner.lock();
		match inner.body_reserved.remove(peer) {
			Some(numbers) => {
				let mut count = 0;
				for n in numbers {
					// only re-pool entries still waiting for a body
					if inner.pending.get(&n).map(|e| e.body.is_none()).unwrap_or(false) {
						inner.body_queue.insert(n);
						count += 1;
					}
				}
				count
			}
			None => 0,
		}
	}

	/// Revoke the receipt reservation of a peer.
	pub fn cancel_receipts(&self, peer: &str) -> usize {
		let mut inner = self.inner.lock();
		match inner.receipt_reserved.remove(peer) {
			Some(numbers) => {
				let mut count = 0;
				for n in numbers {
					if inner
						.pending
						.get(&n)
						.map(|e| e.receipts.is_none())
						.unwrap_or(false)
					{
						inner.receipt_queue.insert(n);
						count += 1;
					}
				}
				count
			}
			None => 0,
		}
	}

	/// Accept a body delivery from a peer, matching items against its
	/// reservation in order. Headers the delivery does not cover return to
	/// the pool. A non-empty delivery matching nothing is an invalid body;
	/// a delivery without a reservation is stale.
	pub fn deliver_bodies(&self, peer: &str, bodies: Vec<F::Body>) -> Result<usize, Error> {
		let mut inner = self.inner.lock();
		if inner.closed {
			return Err(ErrorKind::NoSyncActive.into());
		}
		let numbers = match inner.body_reserved.remove(peer) {
			Some(numbers) => numbers,
			// no reservation: the delivery is stale, not an offence
			None => return Err(ErrorKind::NoSyncActive.into()),
		};

		let mut accepted = 0;
		let mut items = bodies.iter().peekable();
		for n in &numbers {
			let filled = match inner.pending.get_mut(n) {
				Some(entry) => match items.peek() {
					Some(item) if self.flavor.body_matches(&entry.header, item) => {
						entry.body = Some((*item).clone());
						items.next();
						true
					}
					_ => false,
				},
				None => false,
			};
			if filled {
				accepted += 1;
			} else if inner
				.pending
				.get(n)
				.map(|e| e.body.is_none())
				.unwrap_or(false)
			{
				// undelivered or mismatched, back to the pool
				inner.body_queue.insert(*n);
			}
		}

		if accepted > 0 {
			self.ready.notify_all();
			Ok(accepted)
		} else if bodies.is_empty() {
			// peer had nothing for us
			Ok(0)
		} else {
			Err(ErrorKind::InvalidBody.into())
		}
	}

	/// Accept a receipt delivery from a peer. Same matching discipline as
	/// bodies.
	pub fn deliver_receipts(
		&self,
		peer: &str,
		receipts: Vec<F::Receipts>,
	) -> Result<usize, Error> {
		let mut inner = self.inner.lock();
		if inner.closed {
			return Err(ErrorKind::NoSyncActive.into());
		}
		let numbers = match inner.receipt_reserved.remove(peer) {
			Some(numbers) => numbers,
			None => return Err(ErrorKind::NoSyncActive.into()),
		};

		let mut accepted = 0;
		let mut items = receipts.iter().peekable();
		for n in &numbers {
			let filled = match inner.pending.get_mut(n) {
				Some(entry) => match items.peek() {
					Some(item) if self.flavor.receipts_match(&entry.header, item) => {
						entry.receipts = Some((*item).clone());
						items.next();
						true
					}
					_ => false,
				},
				None => false,
			};
			if filled {
				accepted += 1;
			} else if inner
				.pending
				.get(n)
				.map(|e| e.receipts.is_none())
				.unwrap_or(false)
			{
				inner.receipt_queue.insert(*n);
			}
		}

		if accepted > 0 {
			self.ready.notify_all();
			Ok(accepted)
		} else if receipts.is_empty() {
			Ok(0)
		} else {
			Err(ErrorKind::InvalidReceipt.into())
		}
	}

	/// Pop up to `max` completed blocks in strict height order, waiting up
	/// to `wait` for the first one. Empty when nothing completed in time or
	/// the queue closed.
	pub fn results(&self, max: usize, wait: Duration) -> Vec<FetchResult<F>> {
		let mut inner = self.inner.lock();
		let next = inner.next_result;
		let first_ready = inner
			.pending
			.get(&next)
			.map(|e| e.complete())
			.unwrap_or(false);
		if !first_ready && !inner.closed {
			self.ready.wait_for(&mut inner, wait);
		}

		let mut out = Vec::new();
		while out.len() < max {
			let n = inner.next_result;
			let done = inner.pending.get(&n).map(|e| e.complete()).unwrap_or(false);
			if !done {
				break;
			}
			let entry = inner.pending.remove(&n).unwrap();
			inner.by_hash.remove(&self.flavor.hash(&entry.header));
			inner.next_result = n + 1;
			out.push(FetchResult {
				header: entry.header,
				body: entry.body.unwrap(),
				receipts: entry.receipts,
			});
		}
		if !out.is_empty() {
			self.room.notify_all();
		}
		out
	}
}
