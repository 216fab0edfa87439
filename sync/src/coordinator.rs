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

//! The node-level sync scheduler. Decides, against the best advertised
//! peer, whether anything needs downloading and in which shape: fast-only
//! when we already carry the heaviest snail chain, or a dual sync through
//! the snail downloader otherwise. One decision runs at a time; failures
//! apply the peer-drop policy and surface as events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use grove_p2p as p2p;

use crate::error::{Error, ErrorKind};
use crate::fast::FastDownloader;
use crate::snail::SnailDownloader;
use crate::types::{
	DownloadConfig, FastChainRead, FastSyncGate, Progress, SnailChainRead, SyncEvent,
	SyncEvents, SyncMode, SyncState, SyncStatus,
};
use crate::util::Mutex;

/// How often the coordinator re-evaluates even without new peers.
const FORCE_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// The per-node sync scheduler, owning both downloaders.
pub struct SyncCoordinator {
	config: DownloadConfig,
	peers: Arc<p2p::Peers>,
	fast: Arc<FastDownloader>,
	snail: Arc<SnailDownloader>,
	fast_chain: Arc<dyn FastChainRead>,
	snail_chain: Arc<dyn SnailChainRead>,
	sync_state: Arc<SyncState>,
	events: SyncEvents,

	// node operator's preference for pivoted sync
	fast_sync: AtomicBool,
	// single-flight lock over the whole decision procedure
	syncing: AtomicBool,
	fast_synced: AtomicBool,
	snail_synced: AtomicBool,

	stop: Arc<AtomicBool>,
	ticker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SyncCoordinator {
	/// Wire the coordinator over its downloaders and chains. `fast_sync`
	/// is the operator's wish to run a pivoted sync when starting out.
	pub fn new(
		config: DownloadConfig,
		peers: Arc<p2p::Peers>,
		fast: Arc<FastDownloader>,
		snail: Arc<SnailDownloader>,
		fast_chain: Arc<dyn FastChainRead>,
		snail_chain: Arc<dyn SnailChainRead>,
		sync_state: Arc<SyncState>,
		fast_sync: bool,
	) -> Arc<SyncCoordinator> {
		Arc::new(SyncCoordinator {
			config,
			peers,
			fast,
			snail,
			fast_chain,
			snail_chain,
			sync_state,
			events: SyncEvents::new(),
			fast_sync: AtomicBool::new(fast_sync),
			syncing: AtomicBool::new(false),
			fast_synced: AtomicBool::new(false),
			snail_synced: AtomicBool::new(false),
			stop: Arc::new(AtomicBool::new(false)),
			ticker: Mutex::new(None),
		})
	}

	/// Start the periodic re-evaluation driver.
	pub fn start(self: &Arc<SyncCoordinator>) {
		let me = self.clone();
		let stop = self.stop.clone();
		let handle = thread::Builder::new()
			.name("sync_coordinator".to_string())
			.spawn(move || {
				while !stop.load(Ordering::Relaxed) {
					thread::sleep(FORCE_SYNC_INTERVAL);
					if stop.load(Ordering::Relaxed) {
						break;
					}
					me.try_sync();
				}
			})
			.expect("spawn sync coordinator");
		*self.ticker.lock() = Some(handle);
	}

	/// Stop the driver and cancel any running cycle.
	pub fn stop(&self) {
		self.stop.store(true, Ordering::Relaxed);
		self.fast.cancel();
		self.snail.cancel();
		if let Some(handle) = self.ticker.lock().take() {
			let _ = handle.join();
		}
	}

	/// Subscribe to sync lifecycle events.
	pub fn subscribe(&self) -> mpsc::Receiver<SyncEvent> {
		self.events.subscribe()
	}

	/// A fresh peer finished its handshake: track it and reconsider.
	pub fn on_peer_connected(&self, peer: Arc<p2p::Peer>) {
		self.fast.register_peer(peer.clone());
		self.snail.register_peer(peer);
		self.try_sync();
	}

	/// A peer went away.
	pub fn on_peer_disconnected(&self, id: &str) {
		self.fast.unregister_peer(id);
		self.snail.unregister_peer(id);
	}

	/// Whether both chains have completed a sync at least once.
	pub fn is_synced(&self) -> (bool, bool) {
		(
			self.fast_synced.load(Ordering::Relaxed),
			self.snail_synced.load(Ordering::Relaxed),
		)
	}

	/// Kick a sync evaluation, swallowing the busy case.
	pub fn try_sync(&self) {
		match self.synchronise() {
			Ok(()) => (),
			Err(e) if e.kind() == ErrorKind::Busy => (),
			Err(e) if e.kind() == ErrorKind::NoPeers => (),
			Err(e) => debug!("sync attempt failed: {}", e),
		}
	}

	/// Run one full sync decision against the current best peer.
	pub fn synchronise(&self) -> Result<(), Error> {
		if self.syncing.compare_and_swap(false, true, Ordering::SeqCst) {
			return Err(ErrorKind::Busy.into());
		}
		let result = self.sync_once();
		self.syncing.store(false, Ordering::SeqCst);
		result
	}

	fn sync_once(&self) -> Result<(), Error> {
		let best = match self.peers.best_peer() {
			Some(best) => best,
			None => return Err(ErrorKind::NoPeers.into()),
		};
		let peer_id = best.id();
		let td_local = self.snail_chain.head().total_difficulty;
		let td_remote = best.info.total_difficulty();
		let head_remote = best.info.head_hash();
		let (fast_head, fast_height) = best.info.fast_head();
		let fast_local = self.fast_chain.head().height;

		if td_remote <= td_local {
			// we already carry the heaviest snail chain; only the fast
			// chain may lag behind
			if fast_height > fast_local {
				debug!(
					"sync: fast-only against {} ({} -> {})",
					peer_id, fast_local, fast_height
				);
				self.events.post(SyncEvent::Started);
				self.fast
					.set_sync_target(&peer_id, fast_head, fast_height, SyncMode::FullSync);
				let res = self
					.fast
					.synchronise(&peer_id, fast_head, fast_height, SyncMode::FullSync);
				self.finish(&peer_id, res)?;
				self.fast_synced.store(true, Ordering::Relaxed);
				self.snail_synced.store(true, Ordering::Relaxed);
				self.announce_heads();
			}
			self.sync_state.update(SyncStatus::NoSync);
			return Ok(());
		}

		// pick the mode: full execution unless the operator asked for a
		// pivoted sync, or we are recovering a node whose fast chain has
		// blocks while the snail chain never left genesis
		let snail_local = self.snail_chain.head().height;
		let mode = if self.fast_sync.load(Ordering::Relaxed) {
			SyncMode::FastSync
		} else if fast_local > 0 && snail_local == 0 {
			SyncMode::FastSync
		} else {
			SyncMode::FullSync
		};

		self.events.post(SyncEvent::Started);

		if mode.pivoted() {
			let pivot_number = fast_height.saturating_sub(self.config.fs_min_full_blocks);
			let pivot = self.fast.fetch_header_at(&peer_id, pivot_number);
			match pivot {
				Ok(header) => self.fast.set_pivot(header),
				Err(e) => {
					self.finish(&peer_id, Err(e))?;
					return Ok(());
				}
			}
		}

		debug!(
			"sync: dual sync against {} (mode {:?}, fast {} -> {})",
			peer_id, mode, fast_local, fast_height
		);
		self.fast
			.set_sync_target(&peer_id, fast_head, fast_height, mode);
		let res = self.snail.synchronise(&peer_id, head_remote, fast_height);
		self.finish(&peer_id, res)?;

		self.fast_synced.store(true, Ordering::Relaxed);
		self.snail_synced.store(true, Ordering::Relaxed);
		self.sync_state.update(SyncStatus::NoSync);
		self.announce_heads();
		Ok(())
	}

	/// Close out a sync run: event posting and the peer-drop policy.
	fn finish(&self, peer_id: &str, res: Result<(), Error>) -> Result<(), Error> {
		match res {
			Ok(()) => {
				self.events.post(SyncEvent::Done);
				Ok(())
			}
			Err(e) => {
				let kind = e.kind();
				if kind.is_cancel() {
					// cancelled from the outside; no event, no drop
					return Err(e);
				}
				self.apply_drop_policy(peer_id, &kind);
				self.events.post(SyncEvent::Failed(kind));
				Err(e)
			}
		}
	}

	/// Apply the drop column of the error taxonomy to the peer a sync ran
	/// against.
	pub fn apply_drop_policy(&self, peer_id: &str, kind: &ErrorKind) {
		if kind.drops_peer() {
			info!("sync: dropping peer {} after {:?}", peer_id, kind);
			self.on_peer_disconnected(peer_id);
			let _ = self.peers.unregister(peer_id);
		}
	}

	/// Announce our new heads to everyone who has not seen them.
	fn announce_heads(&self) {
		let fast = self.fast_chain.head();
		self.peers.announce_fast_block(fast.hash, fast.height);
		let snail = self.snail_chain.head();
		self.peers.announce_snail_block(snail.hash, snail.height);
	}

	/// A snapshot of sync progress over both chains.
	pub fn progress(&self) -> Progress {
		let (fast_start, fast_current, fast_highest) = self.fast.progress();
		let (snail_start, snail_current, snail_highest) = self.snail.progress();
		Progress {
			starting_fast_block: fast_start,
			current_fast_block: fast_current,
			highest_fast_block: fast_highest,
			starting_snail_block: snail_start,
			current_snail_block: snail_current,
			highest_snail_block: snail_highest,
		}
	}
}
