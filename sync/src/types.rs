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

//! Shared sync types: modes and tunables, the observable sync status, the
//! event feed, and the traits through which the engine talks to its
//! collaborators (local chains, state store, committee engine, metrics).

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use crate::core::{
	Committee, CommitteeSign, FastBlock, FastHeader, Hash, Receipt, SnailBlock, SnailHeader,
};
use crate::core::Difficulty;
use crate::error::{Error, ErrorKind};
use crate::util::{Mutex, RwLock};

/// How a node brings the fast chain up to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
	/// Execute every transaction from genesis forward.
	FullSync,
	/// Receive state at a pivot, execute from there on.
	FastSync,
	/// Receive a state snapshot, execute from there on.
	SnapshotSync,
	/// Headers only.
	LightSync,
}

impl SyncMode {
	/// Whether this mode downloads receipts and state instead of executing
	/// the full history.
	pub fn pivoted(self) -> bool {
		match self {
			SyncMode::FastSync | SyncMode::SnapshotSync => true,
			_ => false,
		}
	}
}

/// Tunables of both downloaders. No hidden defaults: everything the engine
/// keys its behavior on is a field here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
	/// Maximum fork depth we accept a reorganization across.
	pub max_fork_ancestry: u64,
	/// Cap on headers scheduled for content download at any instant.
	pub block_cache_items: usize,
	/// Number of blocks at the head executed fully in pivoted modes.
	pub fs_min_full_blocks: u64,
	/// Watchdog tick of all fetch loops.
	pub fs_header_cont_check: Duration,
	/// Headers per header request.
	pub max_header_fetch: u64,
	/// Skeleton joints per skeleton request.
	pub max_skeleton_size: u64,
	/// Bodies per body request.
	pub max_body_fetch: u64,
	/// Receipt sets per receipt request.
	pub max_receipt_fetch: u64,
	/// Trie nodes per state request.
	pub max_state_fetch: u64,
}

impl Default for DownloadConfig {
	fn default() -> DownloadConfig {
		DownloadConfig {
			max_fork_ancestry: 10_000,
			block_cache_items: 8192,
			fs_min_full_blocks: 64,
			fs_header_cont_check: Duration::from_millis(500),
			max_header_fetch: 192,
			max_skeleton_size: 128,
			max_body_fetch: 128,
			max_receipt_fetch: 256,
			max_state_fetch: 384,
		}
	}
}

/// Tunables of the announcement-driven block fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetcherConfig {
	/// Maximum live announces a single peer may have in flight.
	pub hash_limit: usize,
	/// Maximum blocks queued for insertion from a single peer.
	pub block_limit: usize,
	/// Grace period before an announced hash is actively fetched.
	pub arrive_timeout: Duration,
	/// Deadline on header/body requests issued by the fetcher.
	pub fetch_timeout: Duration,
	/// Slack allowed to accumulate body requests into one batch.
	pub gather_slack: Duration,
}

impl Default for FetcherConfig {
	fn default() -> FetcherConfig {
		FetcherConfig {
			hash_limit: 512,
			block_limit: 512,
			arrive_timeout: Duration::from_millis(500),
			fetch_timeout: Duration::from_secs(5),
			gather_slack: Duration::from_millis(100),
		}
	}
}

/// Coarse phase the sync engine is in, for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
	/// Starting up, nothing decided yet.
	Initial,
	/// Caught up, following gossip.
	NoSync,
	/// Negotiating the common ancestor with the sync peer.
	AncestorSearch,
	/// Downloading headers.
	HeaderSync {
		/// our header height
		current_height: u64,
		/// apparent height of the network
		highest_height: u64,
	},
	/// Downloading bodies and receipts.
	BodySync {
		/// our block height
		current_height: u64,
		/// apparent height of the network
		highest_height: u64,
	},
	/// Downloading state at the pivot.
	StateSync,
	/// Downloading the snail chain.
	SnailSync {
		/// our snail height
		current_height: u64,
		/// apparent snail height of the network
		highest_height: u64,
	},
}

/// Current sync state, shared between the coordinator, both downloaders and
/// anyone who wants to display progress.
pub struct SyncState {
	current: RwLock<SyncStatus>,
	sync_error: RwLock<Option<ErrorKind>>,
}

impl SyncState {
	/// A new state, in its initial phase.
	pub fn new() -> SyncState {
		SyncState {
			current: RwLock::new(SyncStatus::Initial),
			sync_error: RwLock::new(None),
		}
	}

	/// Whether the node is syncing right now.
	pub fn is_syncing(&self) -> bool {
		match *self.current.read() {
			SyncStatus::NoSync | SyncStatus::Initial => false,
			_ => true,
		}
	}

	/// Current status.
	pub fn status(&self) -> SyncStatus {
		*self.current.read()
	}

	/// Move to a new status.
	pub fn update(&self, new_status: SyncStatus) {
		if self.status() == new_status {
			return;
		}
		debug!("sync_state: {:?} -> {:?}", self.status(), new_status);
		*self.current.write() = new_status;
	}

	/// Record an error condition for observers.
	pub fn set_sync_error(&self, kind: ErrorKind) {
		*self.sync_error.write() = Some(kind);
	}

	/// The last recorded error, if any.
	pub fn sync_error(&self) -> Option<ErrorKind> {
		self.sync_error.read().clone()
	}

	/// Clear the recorded error.
	pub fn clear_sync_error(&self) {
		*self.sync_error.write() = None;
	}
}

/// Lifecycle events of one sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
	/// A sync run began.
	Started,
	/// A sync run finished successfully.
	Done,
	/// A sync run failed.
	Failed(ErrorKind),
}

/// A small subscriber feed for sync lifecycle events.
pub struct SyncEvents {
	subscribers: Mutex<Vec<mpsc::Sender<SyncEvent>>>,
}

impl SyncEvents {
	/// A feed without subscribers.
	pub fn new() -> SyncEvents {
		SyncEvents {
			subscribers: Mutex::new(vec![]),
		}
	}

	/// Subscribe to future events.
	pub fn subscribe(&self) -> mpsc::Receiver<SyncEvent> {
		let (tx, rx) = mpsc::channel();
		self.subscribers.lock().push(tx);
		rx
	}

	/// Post an event to all live subscribers, pruning dead ones.
	pub fn post(&self, event: SyncEvent) {
		let mut subs = self.subscribers.lock();
		subs.retain(|tx| tx.send(event.clone()).is_ok());
	}
}

/// A snapshot of how far along the node is, on both chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
	/// Fast height the current run started from.
	pub starting_fast_block: u64,
	/// Fast height reached so far.
	pub current_fast_block: u64,
	/// Fast height of the sync target.
	pub highest_fast_block: u64,
	/// Snail height the current run started from.
	pub starting_snail_block: u64,
	/// Snail height reached so far.
	pub current_snail_block: u64,
	/// Snail height of the sync target.
	pub highest_snail_block: u64,
}

/// The tip of the fast chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastTip {
	/// Height of the tip.
	pub height: u64,
	/// Hash of the tip block.
	pub hash: Hash,
}

/// The tip of the snail chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnailTip {
	/// Height of the tip.
	pub height: u64,
	/// Hash of the tip block.
	pub hash: Hash,
	/// Cumulative work up to and including the tip.
	pub total_difficulty: Difficulty,
}

/// Injected sink for engine counters. The real node wires a metrics
/// registry; tests and light embedders use the null sink.
pub trait MeterSink: Send + Sync {
	/// Bump a named counter.
	fn inc(&self, name: &'static str, n: u64);
}

/// A meter sink that drops everything.
pub struct NullMeter;

impl MeterSink for NullMeter {
	fn inc(&self, _name: &'static str, _n: u64) {}
}

/// Shared handle: a null meter to default to.
pub fn null_meter() -> Arc<dyn MeterSink> {
	Arc::new(NullMeter)
}

/// Access to the locally stored fast chain, implemented by the chain
/// component and by in-memory chains in tests.
pub trait FastChainRead: Send + Sync {
	/// Tip of the fully imported fast chain.
	fn head(&self) -> FastTip;
	/// Tip of the header chain, possibly ahead of the block head.
	fn header_head(&self) -> FastTip;
	/// Hash of the fast genesis block.
	fn genesis_hash(&self) -> Hash;
	/// Header by hash, canonical or not.
	fn header_by_hash(&self, h: &Hash) -> Option<FastHeader>;
	/// Canonical header at the given height.
	fn header_by_number(&self, number: u64) -> Option<FastHeader>;
	/// Canonical hash at the given height.
	fn hash_by_number(&self, number: u64) -> Option<Hash>;
	/// Whether the header is known locally.
	fn has_header(&self, h: &Hash) -> bool;
	/// Whether the full block is known locally.
	fn has_block(&self, h: &Hash) -> bool;

	/// Extend the header chain. Headers are contiguous and pre-linked;
	/// known headers are skipped silently.
	fn insert_headers(&self, headers: Vec<FastHeader>) -> Result<(), Error>;
	/// Import full blocks, executing them. Blocks arrive in strictly
	/// increasing height order.
	fn insert_blocks(&self, blocks: Vec<FastBlock>) -> Result<(), Error>;
	/// Import blocks below the pivot together with their receipts, without
	/// execution.
	fn insert_receipted_blocks(
		&self,
		blocks: Vec<(FastBlock, Vec<Receipt>)>,
	) -> Result<(), Error>;
	/// Unwind the given headers (newest first) after a failed batch.
	fn rollback_headers(&self, hashes: &[Hash]);
}

/// Access to the locally stored snail chain.
pub trait SnailChainRead: Send + Sync {
	/// Tip of the fully imported snail chain.
	fn head(&self) -> SnailTip;
	/// Tip of the snail header chain.
	fn header_head(&self) -> SnailTip;
	/// Hash of the snail genesis block.
	fn genesis_hash(&self) -> Hash;
	/// Header by hash, canonical or not.
	fn header_by_hash(&self, h: &Hash) -> Option<SnailHeader>;
	/// Canonical header at the given height.
	fn header_by_number(&self, number: u64) -> Option<SnailHeader>;
	/// Canonical hash at the given height.
	fn hash_by_number(&self, number: u64) -> Option<Hash>;
	/// Whether the header is known locally.
	fn has_header(&self, h: &Hash) -> bool;
	/// Whether the full block is known locally.
	fn has_block(&self, h: &Hash) -> bool;
	/// Cumulative work up to the given block.
	fn td_by_hash(&self, h: &Hash) -> Option<Difficulty>;

	/// Extend the snail header chain.
	fn insert_headers(&self, headers: Vec<SnailHeader>) -> Result<(), Error>;
	/// Import full snail blocks in strictly increasing height order.
	fn insert_blocks(&self, blocks: Vec<SnailBlock>) -> Result<(), Error>;
	/// Unwind the given headers (newest first) after a failed batch.
	fn rollback_headers(&self, hashes: &[Hash]);
}

/// Where downloaded state trie nodes go during a pivoted sync. Owned by the
/// storage layer.
pub trait StateSink: Send + Sync {
	/// Inject raw trie nodes, returning how many were useful.
	fn inject_node_data(&self, data: Vec<Vec<u8>>) -> Result<usize, Error>;
	/// Hashes of up to `max` nodes still missing under the given root.
	fn missing(&self, root: &Hash, max: usize) -> Vec<Hash>;
	/// Whether the state under the given root is complete locally.
	fn is_complete(&self, root: &Hash) -> bool;
}

/// The committee engine surface the sync engine needs: who is responsible
/// at a height, and whether a vote checks out cryptographically.
pub trait CommitteeVerifier: Send + Sync {
	/// The committee responsible for the given fast height.
	fn committee_at(&self, fast_height: u64) -> Committee;
	/// Verify one vote. `Ok(false)` means a well-formed but invalid
	/// signature; `Err` means the vote is malformed.
	fn verify_sign(&self, sign: &CommitteeSign) -> Result<bool, Error>;
}

/// The pivot contract between the snail downloader and the fast downloader.
/// The coordinator owns both ends; the snail side only sees this trait.
pub trait FastSyncGate: Send + Sync {
	/// Install the pivot header for the coming cycle.
	fn set_pivot(&self, header: FastHeader);
	/// The installed pivot height, if any.
	fn pivot_height(&self) -> Option<u64>;
	/// Make sure the local fast chain reaches the given height, syncing
	/// against the given peer if it does not yet.
	fn fetch_height(&self, peer_id: &str, height: u64) -> Result<(), Error>;
	/// (starting, current, highest) fast heights of the running cycle.
	fn progress(&self) -> (u64, u64, u64);
}
