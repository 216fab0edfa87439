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

//! The fast-chain downloader. One sync cycle negotiates the common
//! ancestor with the chosen peer, pulls the header skeleton and fills it,
//! streams bodies (and receipts and state in pivoted modes) through the
//! download queue, and inserts completed blocks in strict height order.
//! Every blocking wait doubles as a cancellation point.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

use chrono::prelude::Utc;
use chrono::Duration;

use grove_p2p as p2p;
use grove_p2p::CallTag;

use crate::core::{FastBlock, FastBody, FastHeader, Hash, Hashed, Receipt};
use crate::error::{Error, ErrorKind};
use crate::peer::{FetchKind, PeerSet, SyncPeer};
use crate::queue::{FastFlavor, Queue};
use crate::types::{
	DownloadConfig, FastChainRead, FastSyncGate, MeterSink, StateSink, SyncMode, SyncState,
	SyncStatus,
};
use crate::util::{Mutex, RwLock};

/// Capacity of each delivery channel. Full channels drop the packet rather
/// than block the dispatcher.
const DELIVERY_CHANNEL_CAP: usize = 64;

/// Deadline on header requests issued to the sync peer.
const HEADER_REQUEST_DEADLINE: i64 = 5;

/// Completed blocks pulled per insertion round.
const MAX_RESULT_CHUNK: usize = 256;

/// Headers whose insertion can be unwound when a cycle fails mid-batch.
const ROLLBACK_KEEP: usize = 2048;

pub(crate) struct HeaderPack {
	pub peer: String,
	pub headers: Vec<FastHeader>,
}

pub(crate) struct BodyPack {
	pub peer: String,
	pub bodies: Vec<FastBody>,
}

pub(crate) struct ReceiptPack {
	pub peer: String,
	pub receipts: Vec<Vec<Receipt>>,
}

pub(crate) struct StatePack {
	pub peer: String,
	pub data: Vec<Vec<u8>>,
}

/// Broadcast-on-cancel flag every worker polls in its wait loops.
pub(crate) struct CancelToken {
	flag: AtomicBool,
}

impl CancelToken {
	pub fn new() -> CancelToken {
		CancelToken {
			flag: AtomicBool::new(false),
		}
	}

	pub fn cancel(&self) {
		self.flag.store(true, Ordering::SeqCst);
	}

	pub fn cancelled(&self) -> bool {
		self.flag.load(Ordering::SeqCst)
	}
}

#[derive(Clone)]
struct SyncTarget {
	peer_id: String,
	head_hash: Hash,
	fast_height: u64,
	mode: SyncMode,
}

/// The fast-chain downloader.
pub struct FastDownloader {
	config: DownloadConfig,
	chain: Arc<dyn FastChainRead>,
	state: Arc<dyn StateSink>,
	sync_state: Arc<SyncState>,
	meter: Arc<dyn MeterSink>,

	queue: Arc<Queue<FastFlavor>>,
	peers: Arc<PeerSet>,

	synchronising: AtomicBool,
	cancel: RwLock<Arc<CancelToken>>,

	header_tx: Mutex<Option<SyncSender<HeaderPack>>>,
	body_tx: Mutex<Option<SyncSender<BodyPack>>>,
	receipt_tx: Mutex<Option<SyncSender<ReceiptPack>>>,
	state_tx: Mutex<Option<SyncSender<StatePack>>>,
	// peers we currently await a header response from; everything else is
	// discarded before it can touch the delivery channel
	expecting_headers: Arc<Mutex<HashSet<String>>>,

	pivot_header: RwLock<Option<FastHeader>>,
	target: RwLock<Option<SyncTarget>>,

	// headers inserted by the running cycle, newest last, for rollback
	inserted: Arc<Mutex<VecDeque<Hash>>>,

	start_height: AtomicU64,
	current_height: Arc<AtomicU64>,
	highest_height: AtomicU64,
}

impl FastDownloader {
	/// Build a downloader over the given collaborators.
	pub fn new(
		config: DownloadConfig,
		chain: Arc<dyn FastChainRead>,
		state: Arc<dyn StateSink>,
		sync_state: Arc<SyncState>,
		meter: Arc<dyn MeterSink>,
	) -> FastDownloader {
		let queue = Arc::new(Queue::new(FastFlavor, config.block_cache_items));
		FastDownloader {
			config,
			chain,
			state,
			sync_state,
			meter,
			queue,
			peers: Arc::new(PeerSet::new()),
			synchronising: AtomicBool::new(false),
			cancel: RwLock::new(Arc::new(CancelToken::new())),
			header_tx: Mutex::new(None),
			body_tx: Mutex::new(None),
			receipt_tx: Mutex::new(None),
			state_tx: Mutex::new(None),
			expecting_headers: Arc::new(Mutex::new(HashSet::new())),
			pivot_header: RwLock::new(None),
			target: RwLock::new(None),
			inserted: Arc::new(Mutex::new(VecDeque::new())),
			start_height: AtomicU64::new(0),
			current_height: Arc::new(AtomicU64::new(0)),
			highest_height: AtomicU64::new(0),
		}
	}

	/// The peers this downloader requests from.
	pub fn peer_set(&self) -> Arc<PeerSet> {
		self.peers.clone()
	}

	/// Track a registry peer for downloading.
	pub fn register_peer(&self, peer: Arc<p2p::Peer>) {
		self.peers.register(peer);
	}

	/// Stop tracking a peer.
	pub fn unregister_peer(&self, id: &str) {
		self.peers.unregister(id);
	}

	/// Whether a cycle is running right now.
	pub fn is_syncing(&self) -> bool {
		self.synchronising.load(Ordering::SeqCst)
	}

	/// Whether the download queue is fully drained and unreserved.
	pub fn queue_idle(&self) -> bool {
		self.queue.idle()
	}

	/// Remember the sync target so gate-triggered cycles know what to run.
	pub fn set_sync_target(
		&self,
		peer_id: &str,
		head_hash: Hash,
		fast_height: u64,
		mode: SyncMode,
	) {
		*self.target.write() = Some(SyncTarget {
			peer_id: peer_id.to_string(),
			head_hash,
			fast_height,
			mode,
		});
	}

	/// Cancel the running cycle, if any. Workers exit and the queue drains
	/// within one watchdog tick.
	pub fn cancel(&self) {
		self.cancel.read().cancel();
		self.queue.close();
	}

	/// Bring the local fast chain up to the advertised head of `peer_id`.
	/// Single-flight: a second call while running returns `Busy`.
	pub fn synchronise(
		&self,
		peer_id: &str,
		head_hash: Hash,
		fast_height: u64,
		mode: SyncMode,
	) -> Result<(), Error> {
		if self.synchronising.compare_and_swap(false, true, Ordering::SeqCst) {
			return Err(ErrorKind::Busy.into());
		}
		info!(
			"fast sync: starting against {} (height {}, mode {:?})",
			peer_id, fast_height, mode
		);

		let result = self.run_cycle(peer_id, head_hash, fast_height, mode);
		self.teardown(&result);
		self.synchronising.store(false, Ordering::SeqCst);

		match &result {
			Ok(()) => info!("fast sync: done at {}", self.chain.head().height),
			Err(e) if e.kind().is_cancel() => debug!("fast sync: cancelled"),
			Err(e) => warn!("fast sync: failed: {}", e),
		}
		result
	}

	/// (starting, current, highest) fast heights of the current/last cycle.
	pub fn progress(&self) -> (u64, u64, u64) {
		(
			self.start_height.load(Ordering::Relaxed),
			self.current_height.load(Ordering::Relaxed),
			self.highest_height.load(Ordering::Relaxed),
		)
	}

	// ---- delivery intake (called by the dispatcher) ----

	/// Route an inbound header response into the running cycle. Packets
	/// from peers we are not waiting on are discarded outright.
	pub fn deliver_headers(&self, peer: &str, headers: Vec<FastHeader>) -> Result<(), Error> {
		if !self.expecting_headers.lock().contains(peer) {
			self.meter.inc("sync.fast.headers.stale", 1);
			return Err(ErrorKind::NoSyncActive.into());
		}
		let guard = self.header_tx.lock();
		match guard.as_ref() {
			Some(tx) => {
				if let Err(TrySendError::Full(_)) = tx.try_send(HeaderPack {
					peer: peer.to_string(),
					headers,
				}) {
					self.meter.inc("sync.fast.headers.drop", 1);
				}
				Ok(())
			}
			None => Err(ErrorKind::NoSyncActive.into()),
		}
	}

	/// Route an inbound body response into the running cycle.
	pub fn deliver_bodies(&self, peer: &str, bodies: Vec<FastBody>) -> Result<(), Error> {
		let guard = self.body_tx.lock();
		match guard.as_ref() {
			Some(tx) => {
				if let Err(TrySendError::Full(_)) = tx.try_send(BodyPack {
					peer: peer.to_string(),
					bodies,
				}) {
					self.meter.inc("sync.fast.bodies.drop", 1);
				}
				Ok(())
			}
			None => Err(ErrorKind::NoSyncActive.into()),
		}
	}

	/// Route an inbound receipt response into the running cycle.
	pub fn deliver_receipts(
		&self,
		peer: &str,
		receipts: Vec<Vec<Receipt>>,
	) -> Result<(), Error> {
		let guard = self.receipt_tx.lock();
		match guard.as_ref() {
			Some(tx) => {
				if let Err(TrySendError::Full(_)) = tx.try_send(ReceiptPack {
					peer: peer.to_string(),
					receipts,
				}) {
					self.meter.inc("sync.fast.receipts.drop", 1);
				}
				Ok(())
			}
			None => Err(ErrorKind::NoSyncActive.into()),
		}
	}

	/// Route inbound state trie nodes into the running cycle.
	pub fn deliver_node_data(&self, peer: &str, data: Vec<Vec<u8>>) -> Result<(), Error> {
		let guard = self.state_tx.lock();
		match guard.as_ref() {
			Some(tx) => {
				if let Err(TrySendError::Full(_)) = tx.try_send(StatePack {
					peer: peer.to_string(),
					data,
				}) {
					self.meter.inc("sync.fast.state.drop", 1);
				}
				Ok(())
			}
			None => Err(ErrorKind::NoSyncActive.into()),
		}
	}

	// ---- cycle internals ----

	fn tick(&self) -> std::time::Duration {
		self.config.fs_header_cont_check
	}

	fn run_cycle(
		&self,
		peer_id: &str,
		head_hash: Hash,
		fast_height: u64,
		mode: SyncMode,
	) -> Result<(), Error> {
		let peer = self
			.peers
			.peer(peer_id)
			.ok_or_else(|| Error::from(ErrorKind::UnknownPeer))?;

		let token = Arc::new(CancelToken::new());
		*self.cancel.write() = token.clone();
		self.inserted.lock().clear();
		self.peers.reset_all();

		let (header_tx, header_rx) = mpsc::sync_channel(DELIVERY_CHANNEL_CAP);
		let (body_tx, body_rx) = mpsc::sync_channel(DELIVERY_CHANNEL_CAP);
		let (receipt_tx, receipt_rx) = mpsc::sync_channel(DELIVERY_CHANNEL_CAP);
		let (state_tx, state_rx) = mpsc::sync_channel(DELIVERY_CHANNEL_CAP);
		*self.header_tx.lock() = Some(header_tx);
		*self.body_tx.lock() = Some(body_tx);
		*self.receipt_tx.lock() = Some(receipt_tx);
		*self.state_tx.lock() = Some(state_tx);

		// learn the exact remote head, then negotiate where we diverge
		self.sync_state.update(SyncStatus::AncestorSearch);
		let ancestor_ctx = self.worker_ctx(&token);
		let remote_head = ancestor_ctx.fetch_header_by_hash(&peer, head_hash, &header_rx)?;
		let remote_height = remote_head.number.max(fast_height);
		let origin = ancestor_ctx.find_ancestor(&peer, remote_height, &header_rx)?;

		self.start_height.store(origin, Ordering::Relaxed);
		self.current_height
			.store(self.chain.head().height.min(remote_height), Ordering::Relaxed);
		self.highest_height.store(remote_height, Ordering::Relaxed);

		if origin >= remote_height {
			// nothing to do, the peer has nothing we lack
			return Ok(());
		}

		let pivot = match (mode.pivoted(), self.pivot_header.read().as_ref()) {
			(true, Some(header)) => header.number,
			_ => 0,
		};
		let fetch_receipts = mode.pivoted() && origin < pivot;

		let origin_hash = self
			.chain
			.hash_by_number(origin)
			.ok_or_else(|| Error::from(ErrorKind::InvalidAncestor))?;
		self.queue.reset(origin + 1, origin_hash, fetch_receipts);

		// the concurrent stage: skeleton/fill, bodies, receipts, state and
		// the two processors, all joined on first error
		let (done_tx, done_rx) = mpsc::channel::<Result<(), Error>>();
		let (proc_tx, proc_rx) = mpsc::sync_channel::<Vec<FastHeader>>(4);
		let mut workers = 0;

		{
			let d = self.worker_ctx(&token);
			let peer = peer.clone();
			let done = done_tx.clone();
			workers += 1;
			thread::Builder::new()
				.name("fast_header_fetch".to_string())
				.spawn(move || {
					let res =
						d.fetch_headers(&peer, origin, remote_height, header_rx, proc_tx);
					let _ = done.send(res);
				})
				.expect("spawn header fetch");
		}
		{
			let d = self.worker_ctx(&token);
			let done = done_tx.clone();
			workers += 1;
			thread::Builder::new()
				.name("fast_header_proc".to_string())
				.spawn(move || {
					let res =
						d.process_headers(origin, origin_hash, proc_rx, mode, remote_height);
					let _ = done.send(res);
				})
				.expect("spawn header proc");
		}
		{
			let d = self.worker_ctx(&token);
			let done = done_tx.clone();
			workers += 1;
			thread::Builder::new()
				.name("fast_body_fetch".to_string())
				.spawn(move || {
					let res = d.fetch_bodies(body_rx);
					let _ = done.send(res);
				})
				.expect("spawn body fetch");
		}
		if fetch_receipts {
			let d = self.worker_ctx(&token);
			let done = done_tx.clone();
			workers += 1;
			thread::Builder::new()
				.name("fast_receipt_fetch".to_string())
				.spawn(move || {
					let res = d.fetch_receipts(receipt_rx);
					let _ = done.send(res);
				})
				.expect("spawn receipt fetch");
		}
		if mode.pivoted() {
			if let Some(pivot_header) = self.pivot_header.read().clone() {
				let d = self.worker_ctx(&token);
				let done = done_tx.clone();
				workers += 1;
				thread::Builder::new()
					.name("fast_state_fetch".to_string())
					.spawn(move || {
						let res = d.fetch_state(pivot_header.state_root, state_rx);
						let _ = done.send(res);
					})
					.expect("spawn state fetch");
			}
		}
		{
			let d = self.worker_ctx(&token);
			let done = done_tx.clone();
			workers += 1;
			thread::Builder::new()
				.name("fast_content_proc".to_string())
				.spawn(move || {
					let res = d.process_content(mode, pivot, remote_height);
					let _ = done.send(res);
				})
				.expect("spawn content proc");
		}
		drop(done_tx);

		let mut result: Result<(), Error> = Ok(());
		for _ in 0..workers {
			match done_rx.recv() {
				Ok(Ok(())) => (),
				Ok(Err(e)) => {
					// the first real failure is the root cause; cancels are
					// usually just the fallout of tearing the stage down
					let keep = match &result {
						Ok(()) => true,
						Err(prev) => prev.kind().is_cancel() && !e.kind().is_cancel(),
					};
					if keep {
						result = Err(e);
					}
					token.cancel();
					self.queue.close();
				}
				Err(_) => break,
			}
		}
		result
	}

	/// A cheap clone of everything the worker threads need.
	fn worker_ctx(&self, token: &Arc<CancelToken>) -> WorkerCtx {
		WorkerCtx {
			config: self.config.clone(),
			chain: self.chain.clone(),
			state: self.state.clone(),
			sync_state: self.sync_state.clone(),
			queue: self.queue.clone(),
			peers: self.peers.clone(),
			token: token.clone(),
			expecting: self.expecting_headers.clone(),
			inserted: self.inserted.clone(),
			current_height: self.current_height.clone(),
		}
	}

	fn teardown(&self, result: &Result<(), Error>) {
		// stop intake first so late packets are stale, then drain workers
		*self.header_tx.lock() = None;
		*self.body_tx.lock() = None;
		*self.receipt_tx.lock() = None;
		*self.state_tx.lock() = None;
		self.expecting_headers.lock().clear();
		self.cancel.read().cancel();
		self.queue.close();
		self.peers.reset_all();

		if let Err(e) = result {
			let kind = e.kind();
			if !kind.is_cancel() && kind != ErrorKind::Busy {
				self.rollback();
			}
			self.sync_state.set_sync_error(kind);
		}
	}

	fn rollback(&self) {
		let hashes = {
			let mut inserted = self.inserted.lock();
			let mut hashes = inserted.drain(..).collect::<Vec<_>>();
			hashes.reverse(); // newest first
			hashes
		};
		if !hashes.is_empty() {
			warn!("fast sync: rolling back {} headers", hashes.len());
			self.chain.rollback_headers(&hashes);
			let head = self.chain.head().height;
			self.current_height.store(head, Ordering::Relaxed);
		}
	}

	/// Fetch a single header at the given height from a peer, outside any
	/// running cycle. The coordinator uses this to pin the pivot.
	pub fn fetch_header_at(&self, peer_id: &str, number: u64) -> Result<FastHeader, Error> {
		if self.is_syncing() {
			return Err(ErrorKind::Busy.into());
		}
		let peer = self
			.peers
			.peer(peer_id)
			.ok_or_else(|| Error::from(ErrorKind::UnknownPeer))?;
		let token = Arc::new(CancelToken::new());
		let (tx, rx) = mpsc::sync_channel(DELIVERY_CHANNEL_CAP);
		*self.header_tx.lock() = Some(tx);

		let ctx = self.worker_ctx(&token);
		let res = ctx
			.request_headers_by_number(&peer, &rx, number, 1, 0)
			.and_then(|headers| {
				headers
					.into_iter()
					.next()
					.ok_or_else(|| Error::from(ErrorKind::EmptyHeaderSet))
			});

		*self.header_tx.lock() = None;
		self.expecting_headers.lock().clear();
		res
	}

	// ---- gate surface ----

	fn wait_for_height(&self, height: u64) -> Result<(), Error> {
		let deadline = Utc::now() + Duration::seconds(30);
		loop {
			if self.chain.head().height >= height {
				return Ok(());
			}
			if !self.is_syncing() {
				return Err(ErrorKind::NoSyncActive.into());
			}
			if self.cancel.read().cancelled() {
				return Err(ErrorKind::CancelBlockFetch.into());
			}
			if Utc::now() > deadline {
				return Err(ErrorKind::Timeout.into());
			}
			thread::sleep(self.tick());
		}
	}
}

impl FastSyncGate for FastDownloader {
	fn set_pivot(&self, header: FastHeader) {
		debug!("fast sync: pivot set to {}", header.number);
		*self.pivot_header.write() = Some(header);
	}

	fn pivot_height(&self) -> Option<u64> {
		self.pivot_header.read().as_ref().map(|h| h.number)
	}

	fn fetch_height(&self, peer_id: &str, height: u64) -> Result<(), Error> {
		if self.chain.head().height >= height {
			return Ok(());
		}
		if self.is_syncing() {
			return self.wait_for_height(height);
		}
		let target = match self.target.read().clone() {
			Some(target) => target,
			None => return Err(ErrorKind::NoSyncActive.into()),
		};
		let peer = if self.peers.peer(peer_id).is_some() {
			peer_id.to_string()
		} else {
			target.peer_id.clone()
		};
		self.synchronise(&peer, target.head_hash, target.fast_height, target.mode)?;
		if self.chain.head().height >= height {
			Ok(())
		} else {
			Err(ErrorKind::StallingPeer.into())
		}
	}

	fn progress(&self) -> (u64, u64, u64) {
		self.progress()
	}
}

/// What the worker threads of one cycle carry around.
struct WorkerCtx {
	config: DownloadConfig,
	chain: Arc<dyn FastChainRead>,
	state: Arc<dyn StateSink>,
	sync_state: Arc<SyncState>,
	queue: Arc<Queue<FastFlavor>>,
	peers: Arc<PeerSet>,
	token: Arc<CancelToken>,
	expecting: Arc<Mutex<HashSet<String>>>,
	inserted: Arc<Mutex<VecDeque<Hash>>>,
	current_height: Arc<AtomicU64>,
}

/// Reject gapped and shifted deliveries: the batch must start exactly at
/// `start`, link to `prev_hash` and chain internally.
fn validate_linked(headers: &[FastHeader], start: u64, prev_hash: Hash) -> Result<(), Error> {
	let mut expected = start;
	let mut parent = prev_hash;
	for header in headers {
		if header.number != expected || header.parent_hash != parent {
			return Err(ErrorKind::InvalidChain.into());
		}
		expected += 1;
		parent = header.hash();
	}
	Ok(())
}

impl WorkerCtx {
	fn tick(&self) -> std::time::Duration {
		self.config.fs_header_cont_check
	}

	fn cancelled(&self) -> bool {
		self.token.cancelled()
	}

	// ---- header requesting against a single peer ----

	fn await_headers(
		&self,
		peer: &SyncPeer,
		rx: &Receiver<HeaderPack>,
	) -> Result<Vec<FastHeader>, Error> {
		let deadline = Utc::now() + Duration::seconds(HEADER_REQUEST_DEADLINE);
		loop {
			if self.cancelled() {
				self.expecting.lock().remove(&peer.id());
				return Err(ErrorKind::CancelHeaderFetch.into());
			}
			if Utc::now() > deadline {
				self.expecting.lock().remove(&peer.id());
				return Err(ErrorKind::Timeout.into());
			}
			match rx.recv_timeout(self.tick()) {
				Ok(pack) => {
					if pack.peer == peer.id() {
						self.expecting.lock().remove(&peer.id());
						return Ok(pack.headers);
					}
					// stale or hostile, drop and keep waiting
				}
				Err(RecvTimeoutError::Timeout) => (),
				Err(RecvTimeoutError::Disconnected) => {
					return Err(ErrorKind::CancelHeaderFetch.into());
				}
			}
		}
	}

	fn request_headers_by_number(
		&self,
		peer: &SyncPeer,
		rx: &Receiver<HeaderPack>,
		origin: u64,
		amount: u64,
		skip: u64,
	) -> Result<Vec<FastHeader>, Error> {
		self.expecting.lock().insert(peer.id());
		peer.peer
			.transport()
			.request_fast_headers_by_number(origin, amount, skip, false, CallTag::Downloader)?;
		self.await_headers(peer, rx)
	}

	fn fetch_header_by_hash(
		&self,
		peer: &SyncPeer,
		hash: Hash,
		rx: &Receiver<HeaderPack>,
	) -> Result<FastHeader, Error> {
		self.expecting.lock().insert(peer.id());
		peer.peer.transport().request_fast_headers_by_hash(
			hash,
			1,
			0,
			false,
			CallTag::Downloader,
		)?;
		let headers = self.await_headers(peer, rx)?;
		match headers.into_iter().next() {
			Some(header) => Ok(header),
			// a peer advertising a head it cannot produce is stalling us
			None => Err(ErrorKind::StallingPeer.into()),
		}
	}

	/// Negotiate the highest block number both sides agree on.
	fn find_ancestor(
		&self,
		peer: &SyncPeer,
		remote_height: u64,
		rx: &Receiver<HeaderPack>,
	) -> Result<u64, Error> {
		let local_height = self.chain.header_head().height;
		let head = local_height.min(remote_height);
		let floor: i64 = local_height as i64 - self.config.max_fork_ancestry as i64;

		// hash-based short-circuit around the presumed ancestor, unless the
		// fork window leaves no overlap to probe
		let span_start = {
			let lowest = (floor + 1).max(0) as u64;
			lowest.max(head.saturating_sub(self.config.max_header_fetch - 1))
		};
		if span_start <= head {
			let amount = head - span_start + 1;
			let headers =
				self.request_headers_by_number(peer, rx, span_start, amount, 0)?;
			if headers.is_empty() {
				return Err(ErrorKind::EmptyHeaderSet.into());
			}
			for header in headers.iter().rev() {
				if header.number < span_start || header.number > head {
					debug!("fast sync: ancestor probe out of range: {}", header.number);
					return Err(ErrorKind::BadPeer.into());
				}
				if self.chain.hash_by_number(header.number) == Some(header.hash()) {
					let ancestor = header.number;
					if (ancestor as i64) < floor {
						return Err(ErrorKind::InvalidAncestor.into());
					}
					debug!("fast sync: common ancestor at {} (span probe)", ancestor);
					return Ok(ancestor);
				}
			}
		}

		// no luck nearby: binary search the whole range. Genesis is shared
		// by handshake, so the low end always matches; ties go to the
		// higher end, full divergence fails the search.
		let mut lo: u64 = 0;
		let mut hi: u64 = head;
		while lo < hi {
			let check = (lo + hi + 1) / 2;
			let headers = self.request_headers_by_number(peer, rx, check, 1, 0)?;
			let header = match headers.into_iter().next() {
				Some(h) => h,
				None => return Err(ErrorKind::EmptyHeaderSet.into()),
			};
			if header.number != check {
				debug!(
					"fast sync: ancestor probe answered {} for {}",
					header.number, check
				);
				return Err(ErrorKind::BadPeer.into());
			}
			if self.chain.hash_by_number(check) == Some(header.hash()) {
				lo = check;
			} else {
				hi = check - 1;
			}
		}
		if (lo as i64) < floor {
			return Err(ErrorKind::InvalidAncestor.into());
		}
		debug!("fast sync: common ancestor at {} (binary search)", lo);
		Ok(lo)
	}

	// ---- skeleton-driven header download ----

	fn fetch_headers(
		&self,
		peer: &Arc<SyncPeer>,
		origin: u64,
		target: u64,
		rx: Receiver<HeaderPack>,
		proc_tx: SyncSender<Vec<FastHeader>>,
	) -> Result<(), Error> {
		let mhf = self.config.max_header_fetch;
		let mut from = origin + 1;
		let mut prev_hash = self
			.chain
			.hash_by_number(origin)
			.ok_or_else(|| Error::from(ErrorKind::InvalidAncestor))?;

		while from <= target {
			if self.cancelled() {
				return Err(ErrorKind::CancelHeaderFetch.into());
			}
			let remaining = target - from + 1;
			let headers = if remaining > mhf {
				// strided skeleton from the sync peer, gaps filled by
				// whoever is idle
				let joints = (remaining / mhf).min(self.config.max_skeleton_size);
				let skeleton = self.request_headers_by_number(
					peer,
					&rx,
					from + mhf - 1,
					joints,
					mhf - 1,
				)?;
				if skeleton.is_empty() {
					return Err(ErrorKind::EmptyHeaderSet.into());
				}
				for (i, joint) in skeleton.iter().enumerate() {
					if joint.number != from + (i as u64 + 1) * mhf - 1 {
						debug!(
							"fast sync: skeleton joint {} at wrong height {}",
							i, joint.number
						);
						return Err(ErrorKind::BadPeer.into());
					}
				}
				self.fill_skeleton(from, prev_hash, &skeleton, &rx)?
			} else {
				let batch = self.request_headers_by_number(peer, &rx, from, remaining, 0)?;
				if batch.is_empty() {
					return Err(ErrorKind::EmptyHeaderSet.into());
				}
				batch
			};

			validate_linked(&headers, from, prev_hash)?;
			prev_hash = headers.last().unwrap().hash();
			from += headers.len() as u64;
			self.send_to_proc(&proc_tx, headers)?;
		}
		Ok(())
	}

	/// Download the chunks between skeleton joints from all idle peers,
	/// validating every chunk against its joints.
	fn fill_skeleton(
		&self,
		from: u64,
		prev_hash: Hash,
		skeleton: &[FastHeader],
		rx: &Receiver<HeaderPack>,
	) -> Result<Vec<FastHeader>, Error> {
		let mhf = self.config.max_header_fetch;
		let mut chunks: Vec<Option<Vec<FastHeader>>> = vec![None; skeleton.len()];
		let mut tasks: VecDeque<usize> = (0..skeleton.len()).collect();
		let mut in_flight: HashMap<String, usize> = HashMap::new();
		let mut stall_ticks = 0u32;

		loop {
			if self.cancelled() {
				return Err(ErrorKind::CancelHeaderFetch.into());
			}

			// hand fill tasks to idle peers
			while !tasks.is_empty() {
				let candidate = self
					.peers
					.idle_peers(FetchKind::Headers)
					.into_iter()
					.find(|p| !in_flight.contains_key(&p.id()));
				let p = match candidate {
					Some(p) => p,
					None => break,
				};
				if !p.try_begin(FetchKind::Headers) {
					continue;
				}
				let task = tasks.pop_front().unwrap();
				let start = from + task as u64 * mhf;
				self.expecting.lock().insert(p.id());
				match p.peer.transport().request_fast_headers_by_number(
					start,
					mhf,
					0,
					false,
					CallTag::Downloader,
				) {
					Ok(()) => {
						in_flight.insert(p.id(), task);
					}
					Err(e) => {
						debug!("fast sync: fill request to {} failed: {:?}", p.id(), e);
						self.expecting.lock().remove(&p.id());
						p.abort(FetchKind::Headers);
						self.peers.unregister(&p.id());
						tasks.push_front(task);
					}
				}
			}

			if chunks.iter().all(|c| c.is_some()) {
				break;
			}

			match rx.recv_timeout(self.tick()) {
				Ok(pack) => {
					let task = match in_flight.remove(&pack.peer) {
						Some(task) => task,
						None => continue, // stale
					};
					self.expecting.lock().remove(&pack.peer);
					stall_ticks = 0;

					let start = from + task as u64 * mhf;
					let want_prev = if task == 0 {
						prev_hash
					} else {
						skeleton[task - 1].hash()
					};
					let valid = pack.headers.len() as u64 == mhf
						&& validate_linked(&pack.headers, start, want_prev).is_ok()
						&& pack.headers.last().unwrap().hash() == skeleton[task].hash();

					if let Some(p) = self.peers.peer(&pack.peer) {
						if valid {
							p.set_idle(FetchKind::Headers, pack.headers.len());
						} else {
							p.abort(FetchKind::Headers);
							p.note_drop();
						}
					}
					if valid {
						chunks[task] = Some(pack.headers);
					} else {
						debug!("fast sync: bad skeleton fill from {}", pack.peer);
						self.peers.unregister(&pack.peer);
						tasks.push_back(task);
					}
				}
				Err(RecvTimeoutError::Timeout) => {
					// revoke overdue fills and put the ranges back up
					let overdue = in_flight
						.keys()
						.filter(|id| {
							self.peers
								.peer(id)
								.map(|p| p.expired(FetchKind::Headers))
								.unwrap_or(true)
						})
						.cloned()
						.collect::<Vec<_>>();
					for id in overdue {
						if let Some(task) = in_flight.remove(&id) {
							tasks.push_back(task);
							self.expecting.lock().remove(&id);
							if let Some(p) = self.peers.peer(&id) {
								p.abort(FetchKind::Headers);
								p.note_drop();
							}
						}
					}
					if in_flight.is_empty() && !tasks.is_empty() {
						stall_ticks += 1;
						if stall_ticks > 20 {
							return Err(ErrorKind::PeersUnavailable.into());
						}
					}
				}
				Err(RecvTimeoutError::Disconnected) => {
					return Err(ErrorKind::CancelHeaderFetch.into());
				}
			}
		}

		Ok(chunks.into_iter().map(|c| c.unwrap()).flatten().collect())
	}

	fn send_to_proc(
		&self,
		tx: &SyncSender<Vec<FastHeader>>,
		headers: Vec<FastHeader>,
	) -> Result<(), Error> {
		let mut item = headers;
		loop {
			if self.cancelled() {
				return Err(ErrorKind::CancelHeaderFetch.into());
			}
			match tx.try_send(item) {
				Ok(()) => return Ok(()),
				Err(TrySendError::Full(back)) => {
					item = back;
					thread::sleep(self.tick());
				}
				Err(TrySendError::Disconnected(_)) => {
					return Err(ErrorKind::CancelHeaderFetch.into());
				}
			}
		}
	}

	// ---- header processing and scheduling ----

	fn process_headers(
		&self,
		origin: u64,
		origin_hash: Hash,
		rx: Receiver<Vec<FastHeader>>,
		mode: SyncMode,
		target: u64,
	) -> Result<(), Error> {
		let light = mode == SyncMode::LightSync;
		let mut expected = origin + 1;
		let mut last_hash = origin_hash;

		loop {
			if self.cancelled() {
				self.queue.finish_scheduling();
				return Err(ErrorKind::CancelHeaderProcessing.into());
			}
			let headers = match rx.recv_timeout(self.tick()) {
				Ok(headers) => headers,
				Err(RecvTimeoutError::Timeout) => continue,
				// the fetcher is done, nothing more to schedule
				Err(RecvTimeoutError::Disconnected) => break,
			};
			if headers.is_empty() {
				continue;
			}

			validate_linked(&headers, expected, last_hash)?;
			let hashes = headers.iter().map(|h| h.hash()).collect::<Vec<_>>();

			self.chain.insert_headers(headers.clone())?;
			{
				let mut inserted = self.inserted.lock();
				for h in &hashes {
					inserted.push_back(*h);
					if inserted.len() > ROLLBACK_KEEP {
						inserted.pop_front();
					}
				}
			}

			expected += headers.len() as u64;
			last_hash = *hashes.last().unwrap();

			if light {
				// headers are all a light node wants
				self.current_height.store(expected - 1, Ordering::Relaxed);
			} else {
				self.queue.schedule(headers)?;
			}
			self.sync_state.update(SyncStatus::HeaderSync {
				current_height: expected - 1,
				highest_height: target,
			});
		}
		self.queue.finish_scheduling();
		Ok(())
	}

	// ---- content download ----

	fn accept_bodies(&self, pack: BodyPack) -> Result<(), Error> {
		match self.queue.deliver_bodies(&pack.peer, pack.bodies) {
			Ok(n) => {
				if let Some(p) = self.peers.peer(&pack.peer) {
					p.set_idle(FetchKind::Bodies, n);
				}
				Ok(())
			}
			Err(e) => {
				if e.kind() == ErrorKind::NoSyncActive {
					// stale delivery, nobody asked
					return Ok(());
				}
				if let Some(p) = self.peers.peer(&pack.peer) {
					p.set_idle(FetchKind::Bodies, 0);
					p.note_drop();
				}
				Err(e)
			}
		}
	}

	fn fetch_bodies(&self, rx: Receiver<BodyPack>) -> Result<(), Error> {
		loop {
			if self.cancelled() {
				return Err(ErrorKind::CancelBodyFetch.into());
			}

			match rx.recv_timeout(self.tick()) {
				Ok(pack) => self.accept_bodies(pack)?,
				Err(RecvTimeoutError::Timeout) => (),
				Err(RecvTimeoutError::Disconnected) => {
					return Err(ErrorKind::CancelBodyFetch.into());
				}
			}
			while let Ok(pack) = rx.try_recv() {
				self.accept_bodies(pack)?;
			}

			// revoke reservations of peers past their adaptive budget
			for p in self.peers.all() {
				if p.expired(FetchKind::Bodies) {
					debug!("fast sync: body request to {} timed out", p.id());
					self.queue.cancel_bodies(&p.id());
					p.abort(FetchKind::Bodies);
					p.note_drop();
				}
			}

			// put every idle peer to work on the oldest pending entries
			for p in self.peers.idle_peers(FetchKind::Bodies) {
				let cap = p.capacity(FetchKind::Bodies, self.config.max_body_fetch);
				let headers = self.queue.reserve_bodies(&p.id(), cap);
				if headers.is_empty() {
					continue;
				}
				if !p.try_begin(FetchKind::Bodies) {
					self.queue.cancel_bodies(&p.id());
					continue;
				}
				let hashes = headers.iter().map(|h| h.hash()).collect::<Vec<_>>();
				if let Err(e) = p
					.peer
					.transport()
					.request_fast_bodies(hashes, CallTag::Downloader)
				{
					debug!("fast sync: body request to {} failed: {:?}", p.id(), e);
					self.queue.cancel_bodies(&p.id());
					p.abort(FetchKind::Bodies);
				}
			}

			if self.queue.body_work_done() {
				return Ok(());
			}
			if self.queue.is_closed() {
				return Err(ErrorKind::CancelBodyFetch.into());
			}
		}
	}

	fn accept_receipts(&self, pack: ReceiptPack) -> Result<(), Error> {
		match self.queue.deliver_receipts(&pack.peer, pack.receipts) {
			Ok(n) => {
				if let Some(p) = self.peers.peer(&pack.peer) {
					p.set_idle(FetchKind::Receipts, n);
				}
				Ok(())
			}
			Err(e) => {
				if e.kind() == ErrorKind::NoSyncActive {
					return Ok(());
				}
				if let Some(p) = self.peers.peer(&pack.peer) {
					p.set_idle(FetchKind::Receipts, 0);
					p.note_drop();
				}
				Err(e)
			}
		}
	}

	fn fetch_receipts(&self, rx: Receiver<ReceiptPack>) -> Result<(), Error> {
		loop {
			if self.cancelled() {
				return Err(ErrorKind::CancelReceiptFetch.into());
			}

			match rx.recv_timeout(self.tick()) {
				Ok(pack) => self.accept_receipts(pack)?,
				Err(RecvTimeoutError::Timeout) => (),
				Err(RecvTimeoutError::Disconnected) => {
					return Err(ErrorKind::CancelReceiptFetch.into());
				}
			}
			while let Ok(pack) = rx.try_recv() {
				self.accept_receipts(pack)?;
			}

			for p in self.peers.all() {
				if p.expired(FetchKind::Receipts) {
					debug!("fast sync: receipt request to {} timed out", p.id());
					self.queue.cancel_receipts(&p.id());
					p.abort(FetchKind::Receipts);
					p.note_drop();
				}
			}

			for p in self.peers.idle_peers(FetchKind::Receipts) {
				let cap = p.capacity(FetchKind::Receipts, self.config.max_receipt_fetch);
				let headers = self.queue.reserve_receipts(&p.id(), cap);
				if headers.is_empty() {
					continue;
				}
				if !p.try_begin(FetchKind::Receipts) {
					self.queue.cancel_receipts(&p.id());
					continue;
				}
				let hashes = headers.iter().map(|h| h.hash()).collect::<Vec<_>>();
				if let Err(e) = p.peer.transport().request_receipts(hashes) {
					debug!("fast sync: receipt request to {} failed: {:?}", p.id(), e);
					self.queue.cancel_receipts(&p.id());
					p.abort(FetchKind::Receipts);
				}
			}

			if self.queue.receipt_work_done() {
				return Ok(());
			}
			if self.queue.is_closed() {
				return Err(ErrorKind::CancelReceiptFetch.into());
			}
		}
	}

	fn fetch_state(&self, root: Hash, rx: Receiver<StatePack>) -> Result<(), Error> {
		loop {
			if self.cancelled() {
				return Err(ErrorKind::CancelBlockFetch.into());
			}
			if self.state.is_complete(&root) {
				return Ok(());
			}
			self.sync_state.update(SyncStatus::StateSync);

			match rx.recv_timeout(self.tick()) {
				Ok(pack) => match self.state.inject_node_data(pack.data) {
					Ok(n) => {
						if let Some(p) = self.peers.peer(&pack.peer) {
							p.set_idle(FetchKind::State, n);
						}
					}
					Err(e) => {
						debug!("fast sync: bad state data from {}: {}", pack.peer, e);
						if let Some(p) = self.peers.peer(&pack.peer) {
							p.abort(FetchKind::State);
							p.note_drop();
						}
						self.peers.unregister(&pack.peer);
					}
				},
				Err(RecvTimeoutError::Timeout) => (),
				Err(RecvTimeoutError::Disconnected) => {
					return Err(ErrorKind::CancelBlockFetch.into());
				}
			}

			for p in self.peers.all() {
				if p.expired(FetchKind::State) {
					p.abort(FetchKind::State);
					p.note_drop();
				}
			}

			let missing = self
				.state
				.missing(&root, self.config.max_state_fetch as usize * 4);
			if missing.is_empty() {
				continue;
			}
			let mut offset = 0;
			for p in self.peers.idle_peers(FetchKind::State) {
				if offset >= missing.len() {
					break;
				}
				let end = (offset + self.config.max_state_fetch as usize).min(missing.len());
				if !p.try_begin(FetchKind::State) {
					continue;
				}
				let chunk = missing[offset..end].to_vec();
				offset = end;
				if let Err(e) = p.peer.transport().request_node_data(chunk) {
					debug!("fast sync: state request to {} failed: {:?}", p.id(), e);
					p.abort(FetchKind::State);
				}
			}
		}
	}

	// ---- ordered insertion ----

	fn process_content(&self, mode: SyncMode, pivot: u64, target: u64) -> Result<(), Error> {
		loop {
			let results = self.queue.results(MAX_RESULT_CHUNK, self.tick());
			if results.is_empty() {
				if self.cancelled() || self.queue.is_closed() {
					return Err(ErrorKind::CancelContentProcessing.into());
				}
				if self.queue.drained() {
					return Ok(());
				}
				continue;
			}

			let last = results.last().map(|r| r.header.number).unwrap_or(0);
			match mode {
				SyncMode::LightSync => (),
				SyncMode::FullSync => {
					let blocks = results
						.into_iter()
						.map(|r| FastBlock::new(r.header, r.body))
						.collect::<Vec<_>>();
					self.chain.insert_blocks(blocks)?;
				}
				SyncMode::FastSync | SyncMode::SnapshotSync => {
					let mut receipted = Vec::new();
					let mut executed = Vec::new();
					for r in results {
						let number = r.header.number;
						let block = FastBlock::new(r.header, r.body);
						if number <= pivot {
							receipted.push((block, r.receipts.unwrap_or_default()));
						} else {
							executed.push(block);
						}
					}
					if !receipted.is_empty() {
						self.chain.insert_receipted_blocks(receipted)?;
					}
					if !executed.is_empty() {
						self.chain.insert_blocks(executed)?;
					}
				}
			}

			self.current_height.store(last, Ordering::Relaxed);
			self.sync_state.update(SyncStatus::BodySync {
				current_height: last,
				highest_height: target,
			});
		}
	}
}
