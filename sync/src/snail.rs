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

//! The snail-chain downloader: the fast pipeline run over fruit-carrying
//! blocks. Three things set it apart: fork preference goes by cumulative
//! difficulty instead of height, fruit commitments are protocol-versioned,
//! and insertion never runs ahead of the fast chain it references. The
//! latter is enforced through the pivot contract with the fast downloader.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

use chrono::prelude::Utc;
use chrono::Duration;

use grove_p2p as p2p;

use crate::core::{FruitHashVersion, Hash, Hashed, SnailBlock, SnailBody, SnailHeader};
use crate::error::{Error, ErrorKind};
use crate::peer::{FetchKind, PeerSet, SyncPeer};
use crate::queue::{Queue, SnailFlavor};
use crate::types::{
	DownloadConfig, FastSyncGate, MeterSink, SnailChainRead, SyncState, SyncStatus,
};
use crate::util::{Mutex, RwLock};

/// Capacity of each delivery channel.
const DELIVERY_CHANNEL_CAP: usize = 64;

/// Deadline on header requests issued to the sync peer.
const HEADER_REQUEST_DEADLINE: i64 = 5;

/// Completed blocks pulled per insertion round.
const MAX_RESULT_CHUNK: usize = 64;

/// Headers whose insertion can be unwound when a cycle fails mid-batch.
const ROLLBACK_KEEP: usize = 2048;

pub(crate) struct SnailHeaderPack {
	pub peer: String,
	pub headers: Vec<SnailHeader>,
}

pub(crate) struct SnailBodyPack {
	pub peer: String,
	pub bodies: Vec<SnailBody>,
}

use crate::fast::CancelToken;

/// The snail-chain downloader.
pub struct SnailDownloader {
	config: DownloadConfig,
	chain: Arc<dyn SnailChainRead>,
	gate: Arc<dyn FastSyncGate>,
	sync_state: Arc<SyncState>,
	meter: Arc<dyn MeterSink>,

	flavor: SnailFlavor,
	queue: Arc<Queue<SnailFlavor>>,
	peers: Arc<PeerSet>,

	synchronising: AtomicBool,
	cancel: RwLock<Arc<CancelToken>>,

	header_tx: Mutex<Option<SyncSender<SnailHeaderPack>>>,
	body_tx: Mutex<Option<SyncSender<SnailBodyPack>>>,
	expecting_headers: Arc<Mutex<HashSet<String>>>,

	inserted: Arc<Mutex<VecDeque<Hash>>>,

	start_height: AtomicU64,
	current_height: Arc<AtomicU64>,
	highest_height: AtomicU64,
}

impl SnailDownloader {
	/// Build a downloader over the given collaborators. The gate is the
	/// fast downloader, reduced to the pivot contract.
	pub fn new(
		config: DownloadConfig,
		chain: Arc<dyn SnailChainRead>,
		gate: Arc<dyn FastSyncGate>,
		sync_state: Arc<SyncState>,
		meter: Arc<dyn MeterSink>,
	) -> SnailDownloader {
		let flavor = SnailFlavor::new();
		let queue = Arc::new(Queue::new(flavor.clone(), config.block_cache_items));
		SnailDownloader {
			config,
			chain,
			gate,
			sync_state,
			meter,
			flavor,
			queue,
			peers: Arc::new(PeerSet::new()),
			synchronising: AtomicBool::new(false),
			cancel: RwLock::new(Arc::new(CancelToken::new())),
			header_tx: Mutex::new(None),
			body_tx: Mutex::new(None),
			expecting_headers: Arc::new(Mutex::new(HashSet::new())),
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

	/// Cancel the running cycle, if any.
	pub fn cancel(&self) {
		self.cancel.read().cancel();
		self.queue.close();
	}

	/// (starting, current, highest) snail heights of the current/last cycle.
	pub fn progress(&self) -> (u64, u64, u64) {
		(
			self.start_height.load(Ordering::Relaxed),
			self.current_height.load(Ordering::Relaxed),
			self.highest_height.load(Ordering::Relaxed),
		)
	}

	/// Bring the local snail chain up to the advertised head of `peer_id`,
	/// pulling the fast chain along through the pivot contract. The remote
	/// fast height bounds how far fruits may reference.
	pub fn synchronise(
		&self,
		peer_id: &str,
		head_hash: Hash,
		remote_fast_height: u64,
	) -> Result<(), Error> {
		if self.synchronising.compare_and_swap(false, true, Ordering::SeqCst) {
			return Err(ErrorKind::Busy.into());
		}
		info!("snail sync: starting against {}", peer_id);
		// the rollback window only ever covers the cycle being started
		self.inserted.lock().clear();

		// the fast chain leads: reach the referenced heights first
		let result = self
			.gate
			.fetch_height(peer_id, remote_fast_height)
			.and_then(|_| self.run_cycle(peer_id, head_hash));
		self.teardown(&result);
		self.synchronising.store(false, Ordering::SeqCst);

		match &result {
			Ok(()) => info!("snail sync: done at {}", self.chain.head().height),
			Err(e) if e.kind().is_cancel() => debug!("snail sync: cancelled"),
			Err(e) => warn!("snail sync: failed: {}", e),
		}
		result
	}

	// ---- delivery intake (called by the dispatcher) ----

	/// Route an inbound snail header response into the running cycle.
	pub fn deliver_headers(&self, peer: &str, headers: Vec<SnailHeader>) -> Result<(), Error> {
		if !self.expecting_headers.lock().contains(peer) {
			self.meter.inc("sync.snail.headers.stale", 1);
			return Err(ErrorKind::NoSyncActive.into());
		}
		let guard = self.header_tx.lock();
		match guard.as_ref() {
			Some(tx) => {
				if let Err(TrySendError::Full(_)) = tx.try_send(SnailHeaderPack {
					peer: peer.to_string(),
					headers,
				}) {
					self.meter.inc("sync.snail.headers.drop", 1);
				}
				Ok(())
			}
			None => Err(ErrorKind::NoSyncActive.into()),
		}
	}

	/// Route an inbound snail body response into the running cycle.
	pub fn deliver_bodies(&self, peer: &str, bodies: Vec<SnailBody>) -> Result<(), Error> {
		let guard = self.body_tx.lock();
		match guard.as_ref() {
			Some(tx) => {
				if let Err(TrySendError::Full(_)) = tx.try_send(SnailBodyPack {
					peer: peer.to_string(),
					bodies,
				}) {
					self.meter.inc("sync.snail.bodies.drop", 1);
				}
				Ok(())
			}
			None => Err(ErrorKind::NoSyncActive.into()),
		}
	}

	// ---- cycle internals ----

	fn run_cycle(&self, peer_id: &str, head_hash: Hash) -> Result<(), Error> {
		let peer = self
			.peers
			.peer(peer_id)
			.ok_or_else(|| Error::from(ErrorKind::UnknownPeer))?;

		// fruit commitment rules follow the negotiated protocol version
		let version = if peer.peer.info.version >= p2p::PROTOCOL_V2 {
			FruitHashVersion::Tip5
		} else {
			FruitHashVersion::PreTip5
		};
		*self.flavor.version.write() = version;

		let token = Arc::new(CancelToken::new());
		*self.cancel.write() = token.clone();
		self.inserted.lock().clear();
		self.peers.reset_all();

		let (header_tx, header_rx) = mpsc::sync_channel(DELIVERY_CHANNEL_CAP);
		let (body_tx, body_rx) = mpsc::sync_channel(DELIVERY_CHANNEL_CAP);
		*self.header_tx.lock() = Some(header_tx);
		*self.body_tx.lock() = Some(body_tx);

		self.sync_state.update(SyncStatus::AncestorSearch);
		let ctx = self.worker_ctx(&token);
		let remote_head = ctx.fetch_header_by_hash(&peer, head_hash, &header_rx)?;
		let remote_height = remote_head.number;
		let origin = ctx.find_ancestor(&peer, remote_height, &header_rx)?;

		self.start_height.store(origin, Ordering::Relaxed);
		self.current_height
			.store(self.chain.head().height.min(remote_height), Ordering::Relaxed);
		self.highest_height.store(remote_height, Ordering::Relaxed);

		if origin >= remote_height {
			return Ok(());
		}

		let origin_hash = self
			.chain
			.hash_by_number(origin)
			.ok_or_else(|| Error::from(ErrorKind::InvalidAncestor))?;
		self.queue.reset(origin + 1, origin_hash, false);

		let (done_tx, done_rx) = mpsc::channel::<Result<(), Error>>();
		let (proc_tx, proc_rx) = mpsc::sync_channel::<Vec<SnailHeader>>(4);
		let mut workers = 0;

		{
			let d = self.worker_ctx(&token);
			let peer = peer.clone();
			let done = done_tx.clone();
			workers += 1;
			thread::Builder::new()
				.name("snail_header_fetch".to_string())
				.spawn(move || {
					let res =
						d.fetch_headers(&peer, origin, remote_height, header_rx, proc_tx);
					let _ = done.send(res);
				})
				.expect("spawn snail header fetch");
		}
		{
			let d = self.worker_ctx(&token);
			let done = done_tx.clone();
			workers += 1;
			thread::Builder::new()
				.name("snail_header_proc".to_string())
				.spawn(move || {
					let res = d.process_headers(origin, origin_hash, proc_rx, remote_height);
					let _ = done.send(res);
				})
				.expect("spawn snail header proc");
		}
		{
			let d = self.worker_ctx(&token);
			let done = done_tx.clone();
			workers += 1;
			thread::Builder::new()
				.name("snail_body_fetch".to_string())
				.spawn(move || {
					let res = d.fetch_bodies(body_rx);
					let _ = done.send(res);
				})
				.expect("spawn snail body fetch");
		}
		{
			let d = self.worker_ctx(&token);
			let done = done_tx.clone();
			let master = peer_id.to_string();
			workers += 1;
			thread::Builder::new()
				.name("snail_content_proc".to_string())
				.spawn(move || {
					let res = d.process_content(&master, remote_height);
					let _ = done.send(res);
				})
				.expect("spawn snail content proc");
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

	fn worker_ctx(&self, token: &Arc<CancelToken>) -> SnailWorkerCtx {
		SnailWorkerCtx {
			config: self.config.clone(),
			chain: self.chain.clone(),
			gate: self.gate.clone(),
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
		*self.header_tx.lock() = None;
		*self.body_tx.lock() = None;
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
			hashes.reverse();
			hashes
		};
		if !hashes.is_empty() {
			warn!("snail sync: rolling back {} headers", hashes.len());
			self.chain.rollback_headers(&hashes);
			let head = self.chain.head().height;
			self.current_height.store(head, Ordering::Relaxed);
		}
	}
}

fn validate_linked(headers: &[SnailHeader], start: u64, prev_hash: Hash) -> Result<(), Error> {
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

struct SnailWorkerCtx {
	config: DownloadConfig,
	chain: Arc<dyn SnailChainRead>,
	gate: Arc<dyn FastSyncGate>,
	sync_state: Arc<SyncState>,
	queue: Arc<Queue<SnailFlavor>>,
	peers: Arc<PeerSet>,
	token: Arc<CancelToken>,
	expecting: Arc<Mutex<HashSet<String>>>,
	inserted: Arc<Mutex<VecDeque<Hash>>>,
	current_height: Arc<AtomicU64>,
}

impl SnailWorkerCtx {
	fn tick(&self) -> std::time::Duration {
		self.config.fs_header_cont_check
	}

	fn cancelled(&self) -> bool {
		self.token.cancelled()
	}

	fn await_headers(
		&self,
		peer: &SyncPeer,
		rx: &Receiver<SnailHeaderPack>,
	) -> Result<Vec<SnailHeader>, Error> {
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
		rx: &Receiver<SnailHeaderPack>,
		origin: u64,
		amount: u64,
		skip: u64,
	) -> Result<Vec<SnailHeader>, Error> {
		self.expecting.lock().insert(peer.id());
		peer.peer
			.transport()
			.request_snail_headers_by_number(origin, amount, skip, false)?;
		self.await_headers(peer, rx)
	}

	fn fetch_header_by_hash(
		&self,
		peer: &SyncPeer,
		hash: Hash,
		rx: &Receiver<SnailHeaderPack>,
	) -> Result<SnailHeader, Error> {
		self.expecting.lock().insert(peer.id());
		peer.peer
			.transport()
			.request_snail_headers_by_hash(hash, 1, 0, false)?;
		let headers = self.await_headers(peer, rx)?;
		match headers.into_iter().next() {
			Some(header) => Ok(header),
			None => Err(ErrorKind::StallingPeer.into()),
		}
	}

	/// Negotiate the highest snail number both sides agree on. A heavier
	/// but shorter remote chain is acceptable as long as the divergence
	/// stays inside the fork window; beyond it the peer is rejected even
	/// if it carries more work.
	fn find_ancestor(
		&self,
		peer: &SyncPeer,
		remote_height: u64,
		rx: &Receiver<SnailHeaderPack>,
	) -> Result<u64, Error> {
		let local_height = self.chain.header_head().height;
		let head = local_height.min(remote_height);
		let floor: i64 = local_height as i64 - self.config.max_fork_ancestry as i64;

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
					debug!(
						"snail sync: ancestor probe out of range: {}",
						header.number
					);
					return Err(ErrorKind::BadPeer.into());
				}
				if self.chain.hash_by_number(header.number) == Some(header.hash()) {
					let ancestor = header.number;
					if (ancestor as i64) < floor {
						return Err(ErrorKind::InvalidAncestor.into());
					}
					debug!("snail sync: common ancestor at {} (span probe)", ancestor);
					return Ok(ancestor);
				}
			}
		}

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
		debug!("snail sync: common ancestor at {} (binary search)", lo);
		Ok(lo)
	}

	fn fetch_headers(
		&self,
		peer: &Arc<SyncPeer>,
		origin: u64,
		target: u64,
		rx: Receiver<SnailHeaderPack>,
		proc_tx: SyncSender<Vec<SnailHeader>>,
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

	fn fill_skeleton(
		&self,
		from: u64,
		prev_hash: Hash,
		skeleton: &[SnailHeader],
		rx: &Receiver<SnailHeaderPack>,
	) -> Result<Vec<SnailHeader>, Error> {
		let mhf = self.config.max_header_fetch;
		let mut chunks: Vec<Option<Vec<SnailHeader>>> = vec![None; skeleton.len()];
		let mut tasks: VecDeque<usize> = (0..skeleton.len()).collect();
		let mut in_flight: HashMap<String, usize> = HashMap::new();
		let mut stall_ticks = 0u32;

		loop {
			if self.cancelled() {
				return Err(ErrorKind::CancelHeaderFetch.into());
			}

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
				match p
					.peer
					.transport()
					.request_snail_headers_by_number(start, mhf, 0, false)
				{
					Ok(()) => {
						in_flight.insert(p.id(), task);
					}
					Err(e) => {
						debug!("snail sync: fill request to {} failed: {:?}", p.id(), e);
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
						None => continue,
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
						debug!("snail sync: bad skeleton fill from {}", pack.peer);
						self.peers.unregister(&pack.peer);
						tasks.push_back(task);
					}
				}
				Err(RecvTimeoutError::Timeout) => {
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
		tx: &SyncSender<Vec<SnailHeader>>,
		headers: Vec<SnailHeader>,
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

	fn process_headers(
		&self,
		origin: u64,
		origin_hash: Hash,
		rx: Receiver<Vec<SnailHeader>>,
		target: u64,
	) -> Result<(), Error> {
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

			self.queue.schedule(headers)?;
			self.sync_state.update(SyncStatus::SnailSync {
				current_height: expected - 1,
				highest_height: target,
			});
		}
		self.queue.finish_scheduling();
		Ok(())
	}

	fn accept_bodies(&self, pack: SnailBodyPack) -> Result<(), Error> {
		match self.queue.deliver_bodies(&pack.peer, pack.bodies) {
			Ok(n) => {
				if let Some(p) = self.peers.peer(&pack.peer) {
					p.set_idle(FetchKind::Bodies, n);
				}
				Ok(())
			}
			Err(e) => {
				if e.kind() == ErrorKind::NoSyncActive {
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

	fn fetch_bodies(&self, rx: Receiver<SnailBodyPack>) -> Result<(), Error> {
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

			for p in self.peers.all() {
				if p.expired(FetchKind::Bodies) {
					debug!("snail sync: body request to {} timed out", p.id());
					self.queue.cancel_bodies(&p.id());
					p.abort(FetchKind::Bodies);
					p.note_drop();
				}
			}

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
				if let Err(e) = p.peer.transport().request_snail_bodies(hashes) {
					debug!("snail sync: body request to {} failed: {:?}", p.id(), e);
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

	fn process_content(&self, master: &str, target: u64) -> Result<(), Error> {
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

			let mut blocks = Vec::with_capacity(results.len());
			for r in results {
				let max_fast = r.body.max_fast_number();
				// never run ahead of the executed fast chain
				if let Some(pivot) = self.gate.pivot_height() {
					if max_fast > pivot {
						debug!(
							"snail sync: block {} references fast {} beyond pivot {}, \
							 stopping here",
							r.header.number, max_fast, pivot
						);
						if !blocks.is_empty() {
							self.insert(blocks)?;
						}
						return self.drain_rest();
					}
				}
				if max_fast > 0 {
					self.gate.fetch_height(master, max_fast)?;
				}
				blocks.push(SnailBlock::new(r.header, r.body));
			}

			let last = blocks.last().map(|b| b.number()).unwrap_or(0);
			self.insert(blocks)?;
			self.current_height.store(last, Ordering::Relaxed);
			self.sync_state.update(SyncStatus::SnailSync {
				current_height: last,
				highest_height: target,
			});
		}
	}

	fn insert(&self, blocks: Vec<SnailBlock>) -> Result<(), Error> {
		self.chain.insert_blocks(blocks)
	}

	/// Consume and discard everything still in the queue so the other
	/// workers of the cycle can wind down normally.
	fn drain_rest(&self) -> Result<(), Error> {
		loop {
			if self.cancelled() || self.queue.is_closed() {
				return Ok(());
			}
			let dropped = self.queue.results(MAX_RESULT_CHUNK, self.tick());
			if dropped.is_empty() && self.queue.drained() {
				return Ok(());
			}
		}
	}
}
