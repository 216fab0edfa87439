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

//! The announcement-driven fast block fetcher. It races the downloader for
//! freshly gossiped blocks: an announced hash graduates through header and
//! body retrieval into a queue of assembled candidates, and a candidate is
//! only handed to the chain once enough distinct committee members vouch
//! for it. Competing blocks at the same height are allowed to race until
//! one reaches agreement.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

use chrono::prelude::{DateTime, Utc};
use chrono::Duration;

use rand::seq::SliceRandom;
use rand::thread_rng;

use grove_p2p as p2p;
use grove_p2p::CallTag;

use crate::core::committee::{MemberId, VoteResult};
use crate::core::{FastBlock, FastBody, FastHeader, Hash, Hashed};
use crate::error::{Error, ErrorKind};
use crate::types::{CommitteeVerifier, FastChainRead, FetcherConfig, MeterSink, SyncState};
use crate::util::Mutex;

/// Capacity of the command channel feeding the fetcher loop.
const COMMAND_CHANNEL_CAP: usize = 256;

enum Command {
	Announce {
		peer: String,
		hash: Hash,
		number: u64,
	},
	Headers {
		peer: String,
		headers: Vec<FastHeader>,
	},
	Bodies {
		peer: String,
		bodies: Vec<FastBody>,
	},
	Inject {
		peer: String,
		block: Box<FastBlock>,
	},
	Quit,
}

#[derive(Clone)]
struct Announce {
	peer: String,
	hash: Hash,
	number: u64,
	time: DateTime<Utc>,
}

struct Candidate {
	peer: String,
	block: FastBlock,
}

/// The public handle: hands work to the loop thread without ever blocking
/// the caller.
pub struct Fetcher {
	cmd: SyncSender<Command>,
	handle: Mutex<Option<thread::JoinHandle<()>>>,
	meter: Arc<dyn MeterSink>,
	hash_limit: usize,
	// mirrors of the loop state for observers and DoS accounting
	announce_counts: Arc<Mutex<HashMap<String, usize>>>,
	queued_total: Arc<AtomicUsize>,
}

impl Fetcher {
	/// Start the fetcher loop over the given collaborators.
	pub fn new(
		config: FetcherConfig,
		chain: Arc<dyn FastChainRead>,
		verifier: Arc<dyn CommitteeVerifier>,
		peers: Arc<p2p::Peers>,
		sync_state: Arc<SyncState>,
		meter: Arc<dyn MeterSink>,
	) -> Fetcher {
		let (cmd_tx, cmd_rx) = mpsc::sync_channel(COMMAND_CHANNEL_CAP);
		let announce_counts = Arc::new(Mutex::new(HashMap::new()));
		let queued_total = Arc::new(AtomicUsize::new(0));
		let hash_limit = config.hash_limit;

		let mut state = FetchLoop {
			config,
			chain,
			verifier,
			peers,
			sync_state,
			announce_counts: announce_counts.clone(),
			queued_total: queued_total.clone(),
			announced: HashMap::new(),
			fetching: HashMap::new(),
			fetched: HashMap::new(),
			completing: HashMap::new(),
			queued: HashMap::new(),
			queued_by_height: BTreeMap::new(),
			queued_per_peer: HashMap::new(),
		};
		let handle = thread::Builder::new()
			.name("block_fetcher".to_string())
			.spawn(move || state.run(cmd_rx))
			.expect("spawn block fetcher");

		Fetcher {
			cmd: cmd_tx,
			handle: Mutex::new(Some(handle)),
			meter,
			hash_limit,
			announce_counts,
			queued_total,
		}
	}

	fn send(&self, command: Command) {
		if let Err(TrySendError::Full(_)) = self.cmd.try_send(command) {
			self.meter.inc("fetcher.command.drop", 1);
		}
	}

	/// A peer announced a block hash it believes we miss.
	pub fn announce(&self, peer: &str, hash: Hash, number: u64) {
		// DoS cap enforced before the command ever queues
		let over = self
			.announce_counts
			.lock()
			.get(peer)
			.map(|c| *c >= self.hash_limit)
			.unwrap_or(false);
		if over {
			self.meter.inc("fetcher.announce.dos", 1);
			return;
		}
		self.send(Command::Announce {
			peer: peer.to_string(),
			hash,
			number,
		});
	}

	/// Route a header response tagged for the fetcher.
	pub fn deliver_headers(&self, peer: &str, headers: Vec<FastHeader>) {
		self.send(Command::Headers {
			peer: peer.to_string(),
			headers,
		});
	}

	/// Route a body response tagged for the fetcher.
	pub fn deliver_bodies(&self, peer: &str, bodies: Vec<FastBody>) {
		self.send(Command::Bodies {
			peer: peer.to_string(),
			bodies,
		});
	}

	/// A peer gossiped an entire block.
	pub fn inject(&self, peer: &str, block: FastBlock) {
		self.send(Command::Inject {
			peer: peer.to_string(),
			block: Box::new(block),
		});
	}

	/// Live announces attributed to the given peer.
	pub fn announce_count(&self, peer: &str) -> usize {
		self.announce_counts.lock().get(peer).cloned().unwrap_or(0)
	}

	/// Blocks currently queued for agreement or insertion.
	pub fn queued_count(&self) -> usize {
		self.queued_total.load(Ordering::Relaxed)
	}

	/// Stop the loop thread and wait for it.
	pub fn stop(&self) {
		let _ = self.cmd.try_send(Command::Quit);
		if let Some(handle) = self.handle.lock().take() {
			let _ = handle.join();
		}
	}
}

impl Drop for Fetcher {
	fn drop(&mut self) {
		let _ = self.cmd.try_send(Command::Quit);
	}
}

struct FetchLoop {
	config: FetcherConfig,
	chain: Arc<dyn FastChainRead>,
	verifier: Arc<dyn CommitteeVerifier>,
	peers: Arc<p2p::Peers>,
	sync_state: Arc<SyncState>,
	announce_counts: Arc<Mutex<HashMap<String, usize>>>,
	queued_total: Arc<AtomicUsize>,

	// hash lifecycle tables
	announced: HashMap<Hash, Vec<Announce>>,
	fetching: HashMap<Hash, Announce>,
	fetched: HashMap<Hash, (Announce, FastHeader)>,
	completing: HashMap<Hash, (Announce, FastHeader)>,
	queued: HashMap<Hash, Candidate>,
	queued_by_height: BTreeMap<u64, Vec<Hash>>,
	queued_per_peer: HashMap<String, usize>,
}

impl FetchLoop {
	fn run(&mut self, rx: mpsc::Receiver<Command>) {
		loop {
			match rx.recv_timeout(self.config.gather_slack) {
				Ok(Command::Quit) => break,
				Ok(command) => self.handle(command),
				Err(RecvTimeoutError::Timeout) => (),
				Err(RecvTimeoutError::Disconnected) => break,
			}
			// drain whatever piled up before running the timers
			loop {
				match rx.try_recv() {
					Ok(Command::Quit) => return,
					Ok(command) => self.handle(command),
					Err(_) => break,
				}
			}
			self.schedule_fetches();
			self.expire();
			self.advance_queue();
		}
		debug!("block fetcher stopped");
	}

	fn handle(&mut self, command: Command) {
		match command {
			Command::Announce { peer, hash, number } => self.on_announce(peer, hash, number),
			Command::Headers { peer, headers } => self.on_headers(peer, headers),
			Command::Bodies { peer, bodies } => self.on_bodies(peer, bodies),
			Command::Inject { peer, block } => self.on_inject(peer, *block),
			Command::Quit => (),
		}
	}

	// ---- intake ----

	fn on_announce(&mut self, peer: String, hash: Hash, number: u64) {
		let head = self.chain.head().height;
		// too old or too far ahead to be credible
		if number <= head || number > head + self.config.block_limit as u64 {
			trace!("fetcher: discarding announce {} at {}", hash, number);
			return;
		}
		if self.chain.has_block(&hash)
			|| self.queued.contains_key(&hash)
			|| self.fetching.contains_key(&hash)
			|| self.fetched.contains_key(&hash)
			|| self.completing.contains_key(&hash)
		{
			return;
		}
		let count = {
			let mut counts = self.announce_counts.lock();
			let count = counts.entry(peer.clone()).or_insert(0);
			if *count >= self.config.hash_limit {
				debug!("fetcher: peer {} exceeded its announce allowance", peer);
				return;
			}
			*count += 1;
			*count
		};
		trace!("fetcher: {} announces {} ({} live)", peer, hash, count);
		self.announced.entry(hash).or_insert_with(Vec::new).push(Announce {
			peer,
			hash,
			number,
			time: Utc::now(),
		});
	}

	fn on_headers(&mut self, peer: String, headers: Vec<FastHeader>) {
		for header in headers {
			let hash = header.hash();
			let announce = match self.fetching.get(&hash) {
				Some(announce) if announce.peer == peer => announce.clone(),
				_ => continue, // unsolicited, ignore
			};
			if header.number != announce.number {
				// announced one height, delivered another
				debug!(
					"fetcher: {} announced {} at {} but delivered {}",
					peer, hash, announce.number, header.number
				);
				self.forget_hash(&hash);
				self.peers.ban_peer(&peer);
				continue;
			}
			self.fetching.remove(&hash);
			if self.chain.has_block(&hash) {
				self.release_announce(&announce);
				continue;
			}
			if header.has_empty_body() {
				// nothing further to download
				let block = FastBlock::new(header, FastBody::empty());
				self.release_announce(&announce);
				self.enqueue(announce.peer.clone(), block);
			} else {
				self.fetched.insert(hash, (announce, header));
			}
		}
	}

	fn on_bodies(&mut self, peer: String, bodies: Vec<FastBody>) {
		let had_candidates = self
			.completing
			.values()
			.any(|(announce, _)| announce.peer == peer);
		let delivered = bodies.len();
		let mut matched = 0;
		for body in bodies {
			let matching = self
				.completing
				.iter()
				.filter(|(_, (announce, _))| announce.peer == peer)
				.find(|(_, (_, header))| body.matches(header))
				.map(|(hash, _)| *hash);
			if let Some(hash) = matching {
				matched += 1;
				let (announce, header) = self.completing.remove(&hash).unwrap();
				self.release_announce(&announce);
				let block = FastBlock::new(header, body);
				self.enqueue(peer.clone(), block);
			}
		}
		if had_candidates && delivered > 0 && matched == 0 {
			// the peer owed us bodies and delivered garbage
			debug!("fetcher: {} delivered unusable bodies", peer);
			self.peers.ban_peer(&peer);
		}
	}

	fn on_inject(&mut self, peer: String, block: FastBlock) {
		let head = self.chain.head().height;
		let number = block.number();
		if number <= head || number > head + self.config.block_limit as u64 {
			return;
		}
		let hash = block.hash();
		if self.chain.has_block(&hash) || self.queued.contains_key(&hash) {
			return;
		}
		self.forget_hash(&hash);
		self.enqueue(peer, block);
	}

	// ---- timers ----

	fn schedule_fetches(&mut self) {
		let now = Utc::now();
		let arrive = Duration::from_std(self.config.arrive_timeout).unwrap();
		let slack = Duration::from_std(self.config.gather_slack).unwrap();

		// announced -> fetching once the grace period passed
		let due = self
			.announced
			.iter()
			.filter(|(_, announces)| {
				announces
					.first()
					.map(|a| now.signed_duration_since(a.time) > arrive)
					.unwrap_or(false)
			})
			.map(|(hash, _)| *hash)
			.collect::<Vec<_>>();
		for hash in due {
			let mut announces = self.announced.remove(&hash).unwrap();
			announces.shuffle(&mut thread_rng());
			let chosen = announces[0].clone();
			for dropped in announces.into_iter().skip(1) {
				self.release_announce(&dropped);
			}
			match self.peers.get(&chosen.peer) {
				Some(peer) => {
					trace!("fetcher: requesting header {} from {}", hash, chosen.peer);
					let res = peer.transport().request_fast_headers_by_hash(
						hash,
						1,
						0,
						false,
						CallTag::Fetcher,
					);
					match res {
						Ok(()) => {
							let mut chosen = chosen;
							chosen.time = now;
							self.fetching.insert(hash, chosen);
						}
						Err(_) => self.release_announce(&chosen),
					}
				}
				None => self.release_announce(&chosen),
			}
		}

		// fetched -> completing, batched per peer after a little slack
		let due = self
			.fetched
			.iter()
			.filter(|(_, (announce, _))| now.signed_duration_since(announce.time) > slack)
			.map(|(hash, _)| *hash)
			.collect::<Vec<_>>();
		let mut batches: HashMap<String, Vec<Hash>> = HashMap::new();
		for hash in due {
			let (announce, header) = self.fetched.remove(&hash).unwrap();
			batches
				.entry(announce.peer.clone())
				.or_insert_with(Vec::new)
				.push(hash);
			let mut announce = announce;
			announce.time = now;
			self.completing.insert(hash, (announce, header));
		}
		for (peer_id, hashes) in batches {
			match self.peers.get(&peer_id) {
				Some(peer) => {
					trace!(
						"fetcher: requesting {} bodies from {}",
						hashes.len(),
						peer_id
					);
					if peer
						.transport()
						.request_fast_bodies(hashes.clone(), CallTag::Fetcher)
						.is_err()
					{
						for hash in hashes {
							self.forget_hash(&hash);
						}
					}
				}
				None => {
					for hash in hashes {
						self.forget_hash(&hash);
					}
				}
			}
		}
	}

	fn expire(&mut self) {
		let now = Utc::now();
		let budget = Duration::from_std(self.config.fetch_timeout).unwrap();

		let overdue = self
			.fetching
			.iter()
			.filter(|(_, a)| now.signed_duration_since(a.time) > budget)
			.map(|(hash, _)| *hash)
			.collect::<Vec<_>>();
		for hash in overdue {
			debug!("fetcher: header request for {} expired", hash);
			self.forget_hash(&hash);
		}

		let overdue = self
			.completing
			.iter()
			.filter(|(_, (a, _))| now.signed_duration_since(a.time) > budget)
			.map(|(hash, _)| *hash)
			.collect::<Vec<_>>();
		for hash in overdue {
			debug!("fetcher: body request for {} expired", hash);
			self.forget_hash(&hash);
		}
	}

	// ---- agreement and insertion ----

	fn advance_queue(&mut self) {
		// drop anything below the chain head, it lost the race
		let head = self.chain.head().height;
		let stale = self
			.queued_by_height
			.range(..=head)
			.map(|(n, _)| *n)
			.collect::<Vec<_>>();
		for number in stale {
			self.forget_height(number);
		}

		// the downloader owns insertion while a sync cycle runs
		if self.sync_state.is_syncing() {
			return;
		}

		let next = head + 1;
		let hashes = match self.queued_by_height.get(&next) {
			Some(hashes) => hashes.clone(),
			None => return,
		};
		for hash in hashes {
			let (peer, block) = match self.queued.get(&hash) {
				Some(c) => (c.peer.clone(), c.block.clone()),
				None => continue,
			};
			match self.agreement_reached(&block) {
				Ok(true) => {
					let number = block.number();
					info!(
						"fetcher: inserting agreed block {} at {}",
						block.hash(),
						number
					);
					match self.chain.insert_blocks(vec![block.clone()]) {
						Ok(()) => {
							// the race at this height is decided
							self.forget_height(number);
							self.peers.announce_fast_block(block.hash(), number);
						}
						Err(e) => {
							debug!("fetcher: agreed block failed import: {}", e);
							self.forget_hash(&hash);
							self.peers.ban_peer(&peer);
						}
					}
					return;
				}
				Ok(false) => (), // keep waiting for votes
				Err(_) => {
					// mismatching or unverifiable votes condemn the sender
					debug!("fetcher: bad votes on {} from {}", hash, peer);
					self.forget_hash(&hash);
					self.peers.ban_peer(&peer);
				}
			}
		}
	}

	/// Count distinct agreeing committee members over the block's votes.
	fn agreement_reached(&self, block: &FastBlock) -> Result<bool, Error> {
		let hash = block.hash();
		let committee = self.verifier.committee_at(block.number());
		let threshold = committee.agreement_threshold();

		let mut agreed: HashSet<MemberId> = HashSet::new();
		for sign in &block.body.signs {
			if sign.fast_hash != hash {
				return Err(ErrorKind::BadPeer.into());
			}
			if sign.result != VoteResult::Agree {
				continue;
			}
			if !committee.has_member(sign.member) {
				continue;
			}
			if !self.verifier.verify_sign(sign)? {
				return Err(ErrorKind::BadPeer.into());
			}
			agreed.insert(sign.member);
		}
		Ok(agreed.len() >= threshold)
	}

	// ---- table upkeep ----

	fn enqueue(&mut self, peer: String, block: FastBlock) {
		let hash = block.hash();
		if self.queued.contains_key(&hash) {
			return;
		}
		let per_peer = self.queued_per_peer.entry(peer.clone()).or_insert(0);
		if *per_peer >= self.config.block_limit {
			debug!("fetcher: peer {} exceeded its queue allowance", peer);
			return;
		}
		*per_peer += 1;
		self.queued_by_height
			.entry(block.number())
			.or_insert_with(Vec::new)
			.push(hash);
		self.queued.insert(hash, Candidate { peer, block });
		self.queued_total.store(self.queued.len(), Ordering::Relaxed);
	}

	fn release_announce(&mut self, announce: &Announce) {
		let mut counts = self.announce_counts.lock();
		if let Some(count) = counts.get_mut(&announce.peer) {
			*count = count.saturating_sub(1);
			if *count == 0 {
				counts.remove(&announce.peer);
			}
		}
	}

	fn forget_hash(&mut self, hash: &Hash) {
		if let Some(announces) = self.announced.remove(hash) {
			for announce in announces {
				self.release_announce(&announce);
			}
		}
		if let Some(announce) = self.fetching.remove(hash) {
			self.release_announce(&announce);
		}
		if let Some((announce, _)) = self.fetched.remove(hash) {
			self.release_announce(&announce);
		}
		if let Some((announce, _)) = self.completing.remove(hash) {
			self.release_announce(&announce);
		}
		if let Some(candidate) = self.queued.remove(hash) {
			if let Some(count) = self.queued_per_peer.get_mut(&candidate.peer) {
				*count = count.saturating_sub(1);
			}
			let number = candidate.block.number();
			if let Some(hashes) = self.queued_by_height.get_mut(&number) {
				hashes.retain(|h| h != hash);
				if hashes.is_empty() {
					self.queued_by_height.remove(&number);
				}
			}
		}
		self.queued_total.store(self.queued.len(), Ordering::Relaxed);
	}

	fn forget_height(&mut self, number: u64) {
		if let Some(hashes) = self.queued_by_height.remove(&number) {
			for hash in hashes {
				if let Some(candidate) = self.queued.remove(&hash) {
					if let Some(count) = self.queued_per_peer.get_mut(&candidate.peer) {
						*count = count.saturating_sub(1);
					}
				}
			}
		}
		self.queued_total.store(self.queued.len(), Ordering::Relaxed);
	}
}
