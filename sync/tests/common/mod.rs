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

//! Shared harness for the sync integration tests: in-memory chains, a
//! deterministic dual-chain builder, and scripted remote peers that answer
//! requests straight through the dispatcher.

// each test binary exercises a different corner of the harness
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use grove_p2p as p2p;
use grove_sync as sync;
use grove_util::{Mutex, OneTime, RwLock};

use grove_core::committee::{Committee, CommitteeMember, CommitteeSign, VoteResult};
use grove_core::genesis::{genesis_fast, genesis_snail};
use grove_core::hash::Hashed;
use grove_core::{
	Difficulty, FastBlock, FastBody, FastHeader, Fruit, FruitHashVersion, Hash, Receipt,
	SnailBlock, SnailBody, SnailHeader, Transaction,
};
use grove_p2p::{CallTag, Capabilities, PeerInfo, PeerTransport};
use grove_sync::types::null_meter;
use grove_sync::{
	CommitteeVerifier, Dispatcher, DownloadConfig, Error, FastChainRead, FastDownloader,
	FastTip, Fetcher, FetcherConfig, SnailChainRead, SnailDownloader, SnailTip, StateSink,
	SyncCoordinator, SyncMode, SyncState,
};

// ---------------------------------------------------------------- chains

struct FastInner {
	headers: HashMap<Hash, FastHeader>,
	blocks: HashMap<Hash, FastBlock>,
	receipts: HashMap<Hash, Vec<Receipt>>,
	canon: Vec<Hash>,
	header_canon: Vec<Hash>,
}

/// An in-memory fast chain with longest-chain reorgs.
pub struct TestFastChain {
	inner: Mutex<FastInner>,
}

impl TestFastChain {
	pub fn new() -> TestFastChain {
		let genesis = genesis_fast();
		let h = genesis.hash();
		let mut headers = HashMap::new();
		headers.insert(h, genesis.header.clone());
		let mut blocks = HashMap::new();
		blocks.insert(h, genesis);
		TestFastChain {
			inner: Mutex::new(FastInner {
				headers,
				blocks,
				receipts: HashMap::new(),
				canon: vec![h],
				header_canon: vec![h],
			}),
		}
	}

	/// Number of stored blocks, genesis included.
	pub fn block_count(&self) -> usize {
		self.inner.lock().blocks.len()
	}

	/// Length of the chain ending in the given block, genesis included.
	/// Zero if the walk does not reach genesis.
	pub fn fork_len(&self, tip: &Hash) -> usize {
		let inner = self.inner.lock();
		let mut len = 0;
		let mut at = *tip;
		loop {
			let header = match inner.headers.get(&at) {
				Some(h) => h,
				None => return 0,
			};
			len += 1;
			if header.number == 0 {
				return len;
			}
			at = header.parent_hash;
		}
	}

	fn try_adopt(inner: &mut FastInner, tip: Hash) {
		// adopt the fork ending in `tip` if it is longer than the canon
		let number = match inner.headers.get(&tip) {
			Some(h) => h.number,
			None => return,
		};
		if (number as usize) < inner.canon.len() {
			return;
		}
		let mut walk = Vec::with_capacity(number as usize + 1);
		let mut at = tip;
		loop {
			let header = match inner.headers.get(&at) {
				Some(h) => h.clone(),
				None => return, // incomplete fork, keep the old canon
			};
			if !inner.blocks.contains_key(&at) {
				return;
			}
			walk.push(at);
			if header.number == 0 {
				break;
			}
			at = header.parent_hash;
		}
		walk.reverse();
		inner.canon = walk.clone();
		if inner.header_canon.len() < inner.canon.len() {
			inner.header_canon = walk;
		}
	}
}

impl FastChainRead for TestFastChain {
	fn head(&self) -> FastTip {
		let inner = self.inner.lock();
		let hash = *inner.canon.last().unwrap();
		FastTip {
			height: (inner.canon.len() - 1) as u64,
			hash,
		}
	}

	fn header_head(&self) -> FastTip {
		let inner = self.inner.lock();
		let hash = *inner.header_canon.last().unwrap();
		FastTip {
			height: (inner.header_canon.len() - 1) as u64,
			hash,
		}
	}

	fn genesis_hash(&self) -> Hash {
		self.inner.lock().canon[0]
	}

	fn header_by_hash(&self, h: &Hash) -> Option<FastHeader> {
		self.inner.lock().headers.get(h).cloned()
	}

	fn header_by_number(&self, number: u64) -> Option<FastHeader> {
		let inner = self.inner.lock();
		let hash = inner.header_canon.get(number as usize)?;
		inner.headers.get(hash).cloned()
	}

	fn hash_by_number(&self, number: u64) -> Option<Hash> {
		self.inner.lock().header_canon.get(number as usize).cloned()
	}

	fn has_header(&self, h: &Hash) -> bool {
		self.inner.lock().headers.contains_key(h)
	}

	fn has_block(&self, h: &Hash) -> bool {
		self.inner.lock().blocks.contains_key(h)
	}

	fn insert_headers(&self, headers: Vec<FastHeader>) -> Result<(), Error> {
		let mut inner = self.inner.lock();
		for header in headers {
			let hash = header.hash();
			if inner.headers.contains_key(&hash) {
				continue; // idempotent
			}
			if !inner.headers.contains_key(&header.parent_hash) {
				return Err(sync::ErrorKind::InvalidChain.into());
			}
			// extend the canonical header chain when it links on
			if header.number as usize == inner.header_canon.len()
				&& *inner.header_canon.last().unwrap() == header.parent_hash
			{
				inner.header_canon.push(hash);
			}
			inner.headers.insert(hash, header);
		}
		Ok(())
	}

	fn insert_blocks(&self, blocks: Vec<FastBlock>) -> Result<(), Error> {
		let mut inner = self.inner.lock();
		for block in blocks {
			let hash = block.hash();
			if inner.blocks.contains_key(&hash) {
				continue;
			}
			if !inner.blocks.contains_key(&block.header.parent_hash) {
				return Err(sync::ErrorKind::InvalidBlock.into());
			}
			if !block.body.matches(&block.header) {
				return Err(sync::ErrorKind::InvalidBody.into());
			}
			inner.headers.insert(hash, block.header.clone());
			inner.blocks.insert(hash, block);
			TestFastChain::try_adopt(&mut inner, hash);
		}
		Ok(())
	}

	fn insert_receipted_blocks(
		&self,
		blocks: Vec<(FastBlock, Vec<Receipt>)>,
	) -> Result<(), Error> {
		let mut inner = self.inner.lock();
		for (block, receipts) in blocks {
			let hash = block.hash();
			inner.receipts.insert(hash, receipts);
			if !inner.blocks.contains_key(&block.header.parent_hash) {
				return Err(sync::ErrorKind::InvalidBlock.into());
			}
			inner.headers.insert(hash, block.header.clone());
			inner.blocks.insert(hash, block);
			TestFastChain::try_adopt(&mut inner, hash);
		}
		Ok(())
	}

	fn rollback_headers(&self, hashes: &[Hash]) {
		let mut inner = self.inner.lock();
		for h in hashes {
			if inner.header_canon.last() == Some(h) {
				inner.header_canon.pop();
			}
			if inner.canon.last() == Some(h) {
				inner.canon.pop();
			}
			inner.headers.remove(h);
			inner.blocks.remove(h);
		}
	}
}

struct SnailInner {
	headers: HashMap<Hash, SnailHeader>,
	blocks: HashMap<Hash, SnailBlock>,
	tds: HashMap<Hash, Difficulty>,
	canon: Vec<Hash>,
	header_canon: Vec<Hash>,
}

/// An in-memory snail chain with heaviest-chain reorgs.
pub struct TestSnailChain {
	inner: Mutex<SnailInner>,
}

impl TestSnailChain {
	pub fn new() -> TestSnailChain {
		let genesis = genesis_snail();
		let h = genesis.hash();
		let td = genesis.header.difficulty;
		let mut headers = HashMap::new();
		headers.insert(h, genesis.header.clone());
		let mut blocks = HashMap::new();
		blocks.insert(h, genesis);
		let mut tds = HashMap::new();
		tds.insert(h, td);
		TestSnailChain {
			inner: Mutex::new(SnailInner {
				headers,
				blocks,
				tds,
				canon: vec![h],
				header_canon: vec![h],
			}),
		}
	}

	pub fn block_count(&self) -> usize {
		self.inner.lock().blocks.len()
	}

	fn try_adopt(inner: &mut SnailInner, tip: Hash) {
		let tip_td = match inner.tds.get(&tip) {
			Some(td) => *td,
			None => return,
		};
		let canon_tip = *inner.canon.last().unwrap();
		let canon_td = inner.tds[&canon_tip];
		if tip_td <= canon_td {
			return;
		}
		let mut walk = Vec::new();
		let mut at = tip;
		loop {
			let header = match inner.headers.get(&at) {
				Some(h) => h.clone(),
				None => return,
			};
			if !inner.blocks.contains_key(&at) {
				return;
			}
			walk.push(at);
			if header.number == 0 {
				break;
			}
			at = header.parent_hash;
		}
		walk.reverse();
		inner.canon = walk.clone();
		inner.header_canon = walk;
	}
}

impl SnailChainRead for TestSnailChain {
	fn head(&self) -> SnailTip {
		let inner = self.inner.lock();
		let hash = *inner.canon.last().unwrap();
		SnailTip {
			height: (inner.canon.len() - 1) as u64,
			hash,
			total_difficulty: inner.tds[&hash],
		}
	}

	fn header_head(&self) -> SnailTip {
		let inner = self.inner.lock();
		let hash = *inner.header_canon.last().unwrap();
		SnailTip {
			height: (inner.header_canon.len() - 1) as u64,
			hash,
			total_difficulty: inner.tds.get(&hash).cloned().unwrap_or(Difficulty::zero()),
		}
	}

	fn genesis_hash(&self) -> Hash {
		self.inner.lock().canon[0]
	}

	fn header_by_hash(&self, h: &Hash) -> Option<SnailHeader> {
		self.inner.lock().headers.get(h).cloned()
	}

	fn header_by_number(&self, number: u64) -> Option<SnailHeader> {
		let inner = self.inner.lock();
		let hash = inner.header_canon.get(number as usize)?;
		inner.headers.get(hash).cloned()
	}

	fn hash_by_number(&self, number: u64) -> Option<Hash> {
		self.inner.lock().header_canon.get(number as usize).cloned()
	}

	fn has_header(&self, h: &Hash) -> bool {
		self.inner.lock().headers.contains_key(h)
	}

	fn has_block(&self, h: &Hash) -> bool {
		self.inner.lock().blocks.contains_key(h)
	}

	fn td_by_hash(&self, h: &Hash) -> Option<Difficulty> {
		self.inner.lock().tds.get(h).cloned()
	}

	fn insert_headers(&self, headers: Vec<SnailHeader>) -> Result<(), Error> {
		let mut inner = self.inner.lock();
		for header in headers {
			let hash = header.hash();
			if inner.headers.contains_key(&hash) {
				continue;
			}
			let parent_td = match inner.tds.get(&header.parent_hash) {
				Some(td) => *td,
				None => return Err(sync::ErrorKind::InvalidChain.into()),
			};
			if header.number as usize == inner.header_canon.len()
				&& *inner.header_canon.last().unwrap() == header.parent_hash
			{
				inner.header_canon.push(hash);
			}
			inner.tds.insert(hash, parent_td + header.difficulty);
			inner.headers.insert(hash, header);
		}
		Ok(())
	}

	fn insert_blocks(&self, blocks: Vec<SnailBlock>) -> Result<(), Error> {
		let mut inner = self.inner.lock();
		for block in blocks {
			let hash = block.hash();
			if inner.blocks.contains_key(&hash) {
				continue;
			}
			let parent_td = match inner.tds.get(&block.header.parent_hash) {
				Some(td) => *td,
				None => return Err(sync::ErrorKind::InvalidBlock.into()),
			};
			if !block.body.matches(&block.header, FruitHashVersion::Tip5) {
				return Err(sync::ErrorKind::InvalidBody.into());
			}
			inner.tds.insert(hash, parent_td + block.header.difficulty);
			inner.headers.insert(hash, block.header.clone());
			inner.blocks.insert(hash, block);
			TestSnailChain::try_adopt(&mut inner, hash);
		}
		Ok(())
	}

	fn rollback_headers(&self, hashes: &[Hash]) {
		let mut inner = self.inner.lock();
		for h in hashes {
			if inner.header_canon.last() == Some(h) {
				inner.header_canon.pop();
			}
			if inner.canon.last() == Some(h) {
				inner.canon.pop();
			}
			inner.headers.remove(h);
			inner.blocks.remove(h);
		}
	}
}

// ------------------------------------------------------------- builders

/// Build `n` fast blocks on top of `parent`. Blocks whose number is a
/// multiple of `empty_every` (when non-zero) carry an empty body and can
/// be reconstructed without a network fetch.
pub fn make_fast_chain(
	parent: &FastBlock,
	n: usize,
	seed: u8,
	empty_every: usize,
) -> Vec<FastBlock> {
	let mut blocks = Vec::with_capacity(n);
	let mut parent_hash = parent.hash();
	let mut number = parent.number();
	for _ in 0..n {
		number += 1;
		let empty = empty_every > 0 && number as usize % empty_every == 0;
		let body = if empty {
			FastBody::empty()
		} else {
			let mut body = FastBody::empty();
			body.transactions
				.push(Transaction::new(number, vec![seed, 0x33, number as u8]));
			body
		};
		let mut header = FastHeader::default();
		header.parent_hash = parent_hash;
		header.number = number;
		header.tx_root = body.tx_root();
		header.switch_root = body.switch_root();
		let block = FastBlock::new(header, body);
		parent_hash = block.hash();
		blocks.push(block);
	}
	blocks
}

/// Bundle fast blocks into snail blocks, `per_block` fruits each, with
/// the given per-block difficulty.
pub fn make_snail_chain(
	parent: &SnailBlock,
	fast_blocks: &[FastBlock],
	per_block: usize,
	difficulty: u64,
) -> Vec<SnailBlock> {
	let mut blocks = Vec::new();
	let mut parent_hash = parent.hash();
	let mut number = parent.number();
	for chunk in fast_blocks.chunks(per_block) {
		number += 1;
		let fruits = chunk
			.iter()
			.map(|fb| Fruit {
				fast_hash: fb.hash(),
				fast_number: fb.number(),
				difficulty: Difficulty::min(),
				signs: vec![],
			})
			.collect::<Vec<_>>();
		let body = SnailBody {
			fruits,
			signs: vec![],
		};
		let mut header = SnailHeader::default();
		header.parent_hash = parent_hash;
		header.number = number;
		header.difficulty = Difficulty::from_num(difficulty);
		header.fruit_root = body.fruit_root(FruitHashVersion::Tip5);
		let block = SnailBlock::new(header, body);
		parent_hash = block.hash();
		blocks.push(block);
	}
	blocks
}

/// A committee of `n` members whose "signatures" are a deterministic byte
/// pattern the test verifier can check.
pub fn make_committee(n: u64) -> Committee {
	Committee {
		start_height: 0,
		members: (0..n)
			.map(|id| CommitteeMember {
				id,
				pubkey: Hash::from_vec(&[id as u8; 32]),
			})
			.collect(),
	}
}

/// Forge a valid vote of `member` over the given block.
pub fn make_vote(member: u64, block: &FastBlock) -> CommitteeSign {
	let hash = block.hash();
	let mut sign = vec![member as u8];
	sign.extend_from_slice(&hash.0[..4]);
	CommitteeSign {
		fast_height: block.number(),
		fast_hash: hash,
		result: VoteResult::Agree,
		member,
		sign,
	}
}

/// Committee verifier accepting exactly the votes `make_vote` produces.
pub struct TestVerifier {
	committee: Committee,
}

impl TestVerifier {
	pub fn new(committee: Committee) -> TestVerifier {
		TestVerifier { committee }
	}
}

impl CommitteeVerifier for TestVerifier {
	fn committee_at(&self, _fast_height: u64) -> Committee {
		self.committee.clone()
	}

	fn verify_sign(&self, sign: &CommitteeSign) -> Result<bool, Error> {
		if sign.sign.len() != 5 {
			return Err(sync::ErrorKind::BadPeer.into());
		}
		let ok = sign.sign[0] == sign.member as u8 && sign.sign[1..5] == sign.fast_hash.0[..4];
		Ok(ok)
	}
}

/// A state sink that is complete from the start; pivoted-sync tests swap
/// in their own.
pub struct CompleteState;

impl StateSink for CompleteState {
	fn inject_node_data(&self, data: Vec<Vec<u8>>) -> Result<usize, Error> {
		Ok(data.len())
	}
	fn missing(&self, _root: &Hash, _max: usize) -> Vec<Hash> {
		vec![]
	}
	fn is_complete(&self, _root: &Hash) -> bool {
		true
	}
}

// --------------------------------------------------------- remote peers

/// The chain data a scripted remote peer serves, possibly doctored.
pub struct Remote {
	pub fast: RwLock<HashMap<u64, FastBlock>>,
	pub fast_by_hash: RwLock<HashMap<Hash, u64>>,
	pub snail: RwLock<HashMap<u64, SnailBlock>>,
	pub snail_by_hash: RwLock<HashMap<Hash, u64>>,
	pub fast_height: u64,
	pub snail_height: u64,
	pub td: Difficulty,
	pub fast_head: Hash,
	pub snail_head: Hash,
	/// Hashes asked for across all fast body requests.
	pub body_requests: AtomicUsize,
}

impl Remote {
	/// A remote serving the given chains (genesis included implicitly).
	pub fn new(fast_blocks: &[FastBlock], snail_blocks: &[SnailBlock]) -> Remote {
		let mut fast = HashMap::new();
		let mut fast_by_hash = HashMap::new();
		let genesis = genesis_fast();
		fast_by_hash.insert(genesis.hash(), 0);
		fast.insert(0, genesis);
		for b in fast_blocks {
			fast_by_hash.insert(b.hash(), b.number());
			fast.insert(b.number(), b.clone());
		}

		let mut snail = HashMap::new();
		let mut snail_by_hash = HashMap::new();
		let sgenesis = genesis_snail();
		let mut td = sgenesis.header.difficulty;
		snail_by_hash.insert(sgenesis.hash(), 0);
		snail.insert(0, sgenesis.clone());
		for b in snail_blocks {
			td += b.header.difficulty;
			snail_by_hash.insert(b.hash(), b.number());
			snail.insert(b.number(), b.clone());
		}

		let fast_head = fast_blocks.last().map(|b| b.hash()).unwrap_or(
			fast[&0].hash(),
		);
		let snail_head = snail_blocks
			.last()
			.map(|b| b.hash())
			.unwrap_or(sgenesis.hash());
		Remote {
			fast: RwLock::new(fast),
			fast_by_hash: RwLock::new(fast_by_hash),
			snail: RwLock::new(snail),
			snail_by_hash: RwLock::new(snail_by_hash),
			fast_height: fast_blocks.last().map(|b| b.number()).unwrap_or(0),
			snail_height: snail_blocks.last().map(|b| b.number()).unwrap_or(0),
			td,
			fast_head,
			snail_head,
			body_requests: AtomicUsize::new(0),
		}
	}

	/// Remove a fast header+block from what the remote will serve,
	/// leaving a hole.
	pub fn drop_fast(&self, number: u64) {
		if let Some(block) = self.fast.write().remove(&number) {
			self.fast_by_hash.write().remove(&block.hash());
		}
	}

	fn fast_headers(&self, origin: u64, amount: u64, skip: u64, reverse: bool) -> Vec<FastHeader> {
		let fast = self.fast.read();
		let mut headers = Vec::new();
		let mut at = origin as i64;
		let step = (skip + 1) as i64;
		while headers.len() < amount as usize && at >= 0 {
			match fast.get(&(at as u64)) {
				Some(b) => headers.push(b.header.clone()),
				None => (), // a hole: skip silently, like a doctored node
			}
			at += if reverse { -step } else { step };
			if !reverse && at as u64 > self.fast_height + 1 {
				break;
			}
		}
		headers
	}

	fn snail_headers(
		&self,
		origin: u64,
		amount: u64,
		skip: u64,
		reverse: bool,
	) -> Vec<SnailHeader> {
		let snail = self.snail.read();
		let mut headers = Vec::new();
		let mut at = origin as i64;
		let step = (skip + 1) as i64;
		while headers.len() < amount as usize && at >= 0 {
			match snail.get(&(at as u64)) {
				Some(b) => headers.push(b.header.clone()),
				None => (),
			}
			at += if reverse { -step } else { step };
			if !reverse && at as u64 > self.snail_height + 1 {
				break;
			}
		}
		headers
	}
}

/// Transport of a scripted peer: every request is answered synchronously
/// through the dispatcher, like a remote with zero latency.
pub struct TestTransport {
	pub id: String,
	pub remote: Arc<Remote>,
	pub dispatcher: OneTime<Arc<Dispatcher>>,
	/// When set, requests vanish into the void (a stalling peer).
	pub mute: bool,
}

impl TestTransport {
	fn dispatch(&self) -> Option<Arc<Dispatcher>> {
		if self.mute || !self.dispatcher.is_init() {
			return None;
		}
		Some(self.dispatcher.borrow())
	}
}

impl PeerTransport for TestTransport {
	fn request_fast_headers_by_hash(
		&self,
		origin: Hash,
		amount: u64,
		skip: u64,
		reverse: bool,
		tag: CallTag,
	) -> Result<(), p2p::Error> {
		if let Some(d) = self.dispatch() {
			let number = self.remote.fast_by_hash.read().get(&origin).cloned();
			let headers = match number {
				Some(n) => self.remote.fast_headers(n, amount, skip, reverse),
				None => vec![],
			};
			d.deliver_fast_headers(&self.id, headers, tag);
		}
		Ok(())
	}

	fn request_fast_headers_by_number(
		&self,
		origin: u64,
		amount: u64,
		skip: u64,
		reverse: bool,
		tag: CallTag,
	) -> Result<(), p2p::Error> {
		if let Some(d) = self.dispatch() {
			let headers = self.remote.fast_headers(origin, amount, skip, reverse);
			d.deliver_fast_headers(&self.id, headers, tag);
		}
		Ok(())
	}

	fn request_fast_bodies(&self, hashes: Vec<Hash>, tag: CallTag) -> Result<(), p2p::Error> {
		self.remote
			.body_requests
			.fetch_add(hashes.len(), Ordering::SeqCst);
		if let Some(d) = self.dispatch() {
			let by_hash = self.remote.fast_by_hash.read();
			let fast = self.remote.fast.read();
			let bodies = hashes
				.iter()
				.filter_map(|h| by_hash.get(h).and_then(|n| fast.get(n)))
				.map(|b| b.body.clone())
				.collect();
			d.deliver_fast_bodies(&self.id, bodies, tag);
		}
		Ok(())
	}

	fn request_receipts(&self, hashes: Vec<Hash>) -> Result<(), p2p::Error> {
		if let Some(d) = self.dispatch() {
			// test chains commit to empty receipt lists
			let receipts = hashes.iter().map(|_| vec![]).collect();
			d.deliver_receipts(&self.id, receipts);
		}
		Ok(())
	}

	fn request_node_data(&self, hashes: Vec<Hash>) -> Result<(), p2p::Error> {
		if let Some(d) = self.dispatch() {
			let data = hashes.iter().map(|h| h.to_vec()).collect();
			d.deliver_node_data(&self.id, data);
		}
		Ok(())
	}

	fn request_snail_headers_by_hash(
		&self,
		origin: Hash,
		amount: u64,
		skip: u64,
		reverse: bool,
	) -> Result<(), p2p::Error> {
		if let Some(d) = self.dispatch() {
			let number = self.remote.snail_by_hash.read().get(&origin).cloned();
			let headers = match number {
				Some(n) => self.remote.snail_headers(n, amount, skip, reverse),
				None => vec![],
			};
			d.deliver_snail_headers(&self.id, headers);
		}
		Ok(())
	}

	fn request_snail_headers_by_number(
		&self,
		origin: u64,
		amount: u64,
		skip: u64,
		reverse: bool,
	) -> Result<(), p2p::Error> {
		if let Some(d) = self.dispatch() {
			let headers = self.remote.snail_headers(origin, amount, skip, reverse);
			d.deliver_snail_headers(&self.id, headers);
		}
		Ok(())
	}

	fn request_snail_bodies(&self, hashes: Vec<Hash>) -> Result<(), p2p::Error> {
		if let Some(d) = self.dispatch() {
			let by_hash = self.remote.snail_by_hash.read();
			let snail = self.remote.snail.read();
			let bodies = hashes
				.iter()
				.filter_map(|h| by_hash.get(h).and_then(|n| snail.get(n)))
				.map(|b| b.body.clone())
				.collect();
			d.deliver_snail_bodies(&self.id, bodies);
		}
		Ok(())
	}

	fn send_fast_block(&self, _: &FastBlock) -> Result<(), p2p::Error> {
		Ok(())
	}
	fn send_snail_block(&self, _: &SnailBlock, _: Difficulty) -> Result<(), p2p::Error> {
		Ok(())
	}
	fn send_transactions(&self, _: &[Transaction]) -> Result<(), p2p::Error> {
		Ok(())
	}
	fn send_fruits(&self, _: &[Fruit]) -> Result<(), p2p::Error> {
		Ok(())
	}
	fn announce_fast_blocks(&self, _: &[(Hash, u64)]) -> Result<(), p2p::Error> {
		Ok(())
	}
	fn announce_snail_blocks(&self, _: &[(Hash, u64)]) -> Result<(), p2p::Error> {
		Ok(())
	}
}

// --------------------------------------------------------------- tester

/// Tunables used by the integration tests: a small cache so backpressure
/// actually triggers, and fast watchdog ticks.
pub fn test_config() -> DownloadConfig {
	DownloadConfig {
		block_cache_items: 25,
		fs_header_cont_check: Duration::from_millis(50),
		..Default::default()
	}
}

pub fn test_fetcher_config() -> FetcherConfig {
	FetcherConfig {
		arrive_timeout: Duration::from_millis(20),
		gather_slack: Duration::from_millis(10),
		fetch_timeout: Duration::from_millis(500),
		..Default::default()
	}
}

/// The full engine wired over in-memory chains and scripted peers.
pub struct Tester {
	pub fast_chain: Arc<TestFastChain>,
	pub snail_chain: Arc<TestSnailChain>,
	pub peers: Arc<p2p::Peers>,
	pub fast: Arc<FastDownloader>,
	pub snail: Arc<SnailDownloader>,
	pub fetcher: Arc<Fetcher>,
	pub dispatcher: Arc<Dispatcher>,
	pub coordinator: Arc<SyncCoordinator>,
	pub sync_state: Arc<SyncState>,
	pub remotes: Mutex<HashMap<String, Arc<Remote>>>,
}

impl Tester {
	pub fn new() -> Tester {
		Tester::with_configs(test_config(), test_fetcher_config(), 4)
	}

	pub fn with_configs(
		config: DownloadConfig,
		fetcher_config: FetcherConfig,
		committee_size: u64,
	) -> Tester {
		let fast_chain = Arc::new(TestFastChain::new());
		let snail_chain = Arc::new(TestSnailChain::new());
		let peers = Arc::new(p2p::Peers::new());
		let sync_state = Arc::new(SyncState::new());
		let meter = null_meter();

		let fast = Arc::new(FastDownloader::new(
			config.clone(),
			fast_chain.clone(),
			Arc::new(CompleteState),
			sync_state.clone(),
			meter.clone(),
		));
		let snail = Arc::new(SnailDownloader::new(
			config.clone(),
			snail_chain.clone(),
			fast.clone(),
			sync_state.clone(),
			meter.clone(),
		));
		let verifier = Arc::new(TestVerifier::new(make_committee(committee_size)));
		let fetcher = Arc::new(Fetcher::new(
			fetcher_config,
			fast_chain.clone(),
			verifier,
			peers.clone(),
			sync_state.clone(),
			meter.clone(),
		));
		let dispatcher = Arc::new(Dispatcher::new(
			fast.clone(),
			snail.clone(),
			fetcher.clone(),
			meter.clone(),
		));
		let coordinator = SyncCoordinator::new(
			config,
			peers.clone(),
			fast.clone(),
			snail.clone(),
			fast_chain.clone(),
			snail_chain.clone(),
			sync_state.clone(),
			false,
		);

		Tester {
			fast_chain,
			snail_chain,
			peers,
			fast,
			snail,
			fetcher,
			dispatcher,
			coordinator,
			sync_state,
			remotes: Mutex::new(HashMap::new()),
		}
	}

	/// Register a scripted peer serving the given chains. Returns its
	/// remote so tests can doctor or observe it.
	pub fn new_peer(
		&self,
		id: &str,
		fast_blocks: &[FastBlock],
		snail_blocks: &[SnailBlock],
	) -> Arc<Remote> {
		self.new_peer_opts(id, fast_blocks, snail_blocks, None, false)
	}

	/// Register a scripted peer with an overridden advertised difficulty
	/// and/or muted transport.
	pub fn new_peer_opts(
		&self,
		id: &str,
		fast_blocks: &[FastBlock],
		snail_blocks: &[SnailBlock],
		td_override: Option<u64>,
		mute: bool,
	) -> Arc<Remote> {
		let remote = Arc::new(Remote::new(fast_blocks, snail_blocks));
		let td = td_override
			.map(Difficulty::from_num)
			.unwrap_or(remote.td);
		let transport = TestTransport {
			id: id.to_string(),
			remote: remote.clone(),
			dispatcher: {
				let cell = OneTime::new();
				cell.init(self.dispatcher.clone());
				cell
			},
			mute,
		};
		let info = PeerInfo::new(
			id.to_string(),
			"grove-test".to_string(),
			p2p::PROTOCOL_V2,
			Capabilities::FULL_NODE,
			td,
			remote.snail_head,
			remote.fast_head,
			remote.fast_height,
		);
		let peer = self
			.peers
			.register(p2p::Peer::new(info, Arc::new(transport)))
			.expect("register test peer");
		self.fast.register_peer(peer.clone());
		self.snail.register_peer(peer);
		self.remotes.lock().insert(id.to_string(), remote.clone());
		remote
	}

	/// Drop a peer from every layer.
	pub fn drop_peer(&self, id: &str) {
		self.fast.unregister_peer(id);
		self.snail.unregister_peer(id);
		let _ = self.peers.unregister(id);
	}

	/// Run a full dual sync against the given peer, the way the
	/// coordinator would.
	pub fn sync_dual(&self, id: &str) -> Result<(), Error> {
		let peer = self
			.peers
			.get(id)
			.ok_or_else(|| Error::from(sync::ErrorKind::UnknownPeer))?;
		let (fast_head, fast_height) = peer.info.fast_head();
		let head = peer.info.head_hash();
		self.fast
			.set_sync_target(id, fast_head, fast_height, SyncMode::FullSync);
		self.snail.synchronise(id, head, fast_height)
	}

	/// Run a fast-only sync against the given peer.
	pub fn sync_fast(&self, id: &str, mode: SyncMode) -> Result<(), Error> {
		let peer = self
			.peers
			.get(id)
			.ok_or_else(|| Error::from(sync::ErrorKind::UnknownPeer))?;
		let (fast_head, fast_height) = peer.info.fast_head();
		self.fast.set_sync_target(id, fast_head, fast_height, mode);
		self.fast.synchronise(id, fast_head, fast_height, mode)
	}
}

/// Poll until the condition holds or the timeout passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
	let start = std::time::Instant::now();
	while start.elapsed() < timeout {
		if cond() {
			return true;
		}
		std::thread::sleep(Duration::from_millis(10));
	}
	cond()
}
