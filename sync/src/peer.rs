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

//! Per-peer request pacing for a downloader. Each peer tracks, per request
//! kind, whether it has a request in flight, how fast it has been serving
//! us, and a round-trip estimate that feeds adaptive timeouts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::prelude::{DateTime, Utc};
use chrono::Duration;

use grove_p2p as p2p;

use crate::util::{Mutex, RwLock};

/// Weight of a new measurement on the rolling throughput/RTT estimates.
const MEASUREMENT_IMPACT: f64 = 0.1;

/// Floor on adaptive request deadlines.
const RTT_MIN: i64 = 500;

/// Ceiling on adaptive request deadlines.
const RTT_MAX: i64 = 10_000;

/// The kinds of requests a downloader paces independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
	/// Header range requests.
	Headers,
	/// Body requests.
	Bodies,
	/// Receipt requests.
	Receipts,
	/// State trie node requests.
	State,
}

const KINDS: usize = 4;

fn kind_index(kind: FetchKind) -> usize {
	match kind {
		FetchKind::Headers => 0,
		FetchKind::Bodies => 1,
		FetchKind::Receipts => 2,
		FetchKind::State => 3,
	}
}

#[derive(Clone)]
struct Pacing {
	// items per second the peer has been delivering, per kind
	throughput: [f64; KINDS],
	// when the outstanding request of each kind was issued
	started: [Option<DateTime<Utc>>; KINDS],
	// rolling round-trip estimate
	rtt: Duration,
}

/// A peer as seen by one downloader.
pub struct SyncPeer {
	/// The underlying registry record.
	pub peer: Arc<p2p::Peer>,
	idle: [AtomicBool; KINDS],
	pacing: Mutex<Pacing>,
	drops: AtomicU64,
}

impl SyncPeer {
	/// Track a registry peer for downloading.
	pub fn new(peer: Arc<p2p::Peer>) -> SyncPeer {
		SyncPeer {
			peer,
			idle: [
				AtomicBool::new(true),
				AtomicBool::new(true),
				AtomicBool::new(true),
				AtomicBool::new(true),
			],
			pacing: Mutex::new(Pacing {
				throughput: [1.0; KINDS],
				started: [None; KINDS],
				rtt: Duration::seconds(3),
			}),
			drops: AtomicU64::new(0),
		}
	}

	/// The peer identifier.
	pub fn id(&self) -> String {
		self.peer.id()
	}

	/// Forget all in-flight markers, e.g. between sync cycles.
	pub fn reset(&self) {
		for flag in &self.idle {
			flag.store(true, Ordering::Relaxed);
		}
		let mut pacing = self.pacing.lock();
		pacing.started = [None; KINDS];
	}

	/// Whether the peer has no outstanding request of this kind.
	pub fn is_idle(&self, kind: FetchKind) -> bool {
		self.idle[kind_index(kind)].load(Ordering::Relaxed)
	}

	/// Try to claim the peer for a request of this kind. Returns false if a
	/// request is already in flight: at most one per (peer, kind).
	pub fn try_begin(&self, kind: FetchKind) -> bool {
		let claimed = self.idle[kind_index(kind)]
			.compare_and_swap(true, false, Ordering::SeqCst);
		if claimed {
			self.pacing.lock().started[kind_index(kind)] = Some(Utc::now());
		}
		claimed
	}

	/// Mark the request of this kind answered with `delivered` useful items,
	/// folding the measurement into the throughput and RTT estimates.
	pub fn set_idle(&self, kind: FetchKind, delivered: usize) {
		let idx = kind_index(kind);
		{
			let mut pacing = self.pacing.lock();
			if let Some(started) = pacing.started[idx].take() {
				let elapsed = Utc::now().signed_duration_since(started);
				let elapsed_s =
					(elapsed.num_milliseconds().max(1) as f64) / 1000.0;
				let measured = delivered as f64 / elapsed_s;
				pacing.throughput[idx] = (1.0 - MEASUREMENT_IMPACT)
					* pacing.throughput[idx]
					+ MEASUREMENT_IMPACT * measured;
				let mixed = (1.0 - MEASUREMENT_IMPACT)
					* (pacing.rtt.num_milliseconds() as f64)
					+ MEASUREMENT_IMPACT * (elapsed.num_milliseconds() as f64);
				pacing.rtt = Duration::milliseconds(
					(mixed as i64).max(RTT_MIN).min(RTT_MAX),
				);
			}
		}
		self.idle[idx].store(true, Ordering::SeqCst);
	}

	/// Give up on the outstanding request of this kind without folding in a
	/// measurement, e.g. after a timeout.
	pub fn abort(&self, kind: FetchKind) {
		let idx = kind_index(kind);
		self.pacing.lock().started[idx] = None;
		self.idle[idx].store(true, Ordering::SeqCst);
	}

	/// How many items to ask this peer for so the answer lands in about one
	/// target round trip, clamped to the per-request protocol cap.
	pub fn capacity(&self, kind: FetchKind, max_fetch: u64) -> u64 {
		let pacing = self.pacing.lock();
		let per_rtt = pacing.throughput[kind_index(kind)]
			* (pacing.rtt.num_milliseconds() as f64)
			/ 1000.0;
		(per_rtt.ceil() as u64).max(1).min(max_fetch)
	}

	/// The adaptive deadline of this peer: twice its round-trip estimate,
	/// clamped between the global floor and ceiling.
	pub fn timeout(&self) -> Duration {
		let rtt = self.pacing.lock().rtt;
		Duration::milliseconds(
			(rtt.num_milliseconds() * 2).max(RTT_MIN).min(RTT_MAX),
		)
	}

	/// Whether the outstanding request of this kind has exceeded the peer's
	/// deadline.
	pub fn expired(&self, kind: FetchKind) -> bool {
		let deadline = self.timeout();
		let pacing = self.pacing.lock();
		match pacing.started[kind_index(kind)] {
			Some(started) => Utc::now().signed_duration_since(started) > deadline,
			None => false,
		}
	}

	/// Bump and read the per-peer drop counter.
	pub fn note_drop(&self) -> u64 {
		self.drops.fetch_add(1, Ordering::Relaxed) + 1
	}

	/// Read the per-peer drop counter.
	pub fn drop_count(&self) -> u64 {
		self.drops.load(Ordering::Relaxed)
	}
}

/// The peers one downloader is willing to request from. Registration tracks
/// the registry; per-cycle pacing state lives here.
pub struct PeerSet {
	peers: RwLock<HashMap<String, Arc<SyncPeer>>>,
}

impl PeerSet {
	/// An empty set.
	pub fn new() -> PeerSet {
		PeerSet {
			peers: RwLock::new(HashMap::new()),
		}
	}

	/// Start tracking a registry peer. Re-registration resets its pacing.
	pub fn register(&self, peer: Arc<p2p::Peer>) -> Arc<SyncPeer> {
		let sp = Arc::new(SyncPeer::new(peer));
		self.peers.write().insert(sp.id(), sp.clone());
		sp
	}

	/// Stop tracking the given peer.
	pub fn unregister(&self, id: &str) -> Option<Arc<SyncPeer>> {
		self.peers.write().remove(id)
	}

	/// Look a peer up by id.
	pub fn peer(&self, id: &str) -> Option<Arc<SyncPeer>> {
		self.peers.read().get(id).cloned()
	}

	/// All tracked peers.
	pub fn all(&self) -> Vec<Arc<SyncPeer>> {
		self.peers.read().values().cloned().collect()
	}

	/// Number of tracked peers.
	pub fn len(&self) -> usize {
		self.peers.read().len()
	}

	/// Peers with no outstanding request of the given kind, fastest first
	/// so capacity lands where it is best used.
	pub fn idle_peers(&self, kind: FetchKind) -> Vec<Arc<SyncPeer>> {
		let mut idle = self
			.all()
			.into_iter()
			.filter(|p| p.is_idle(kind) && p.peer.is_connected())
			.collect::<Vec<_>>();
		idle.sort_by(|a, b| {
			let ta = a.pacing.lock().throughput[kind_index(kind)];
			let tb = b.pacing.lock().throughput[kind_index(kind)];
			tb.partial_cmp(&ta).unwrap_or(std::cmp::Ordering::Equal)
		});
		idle
	}

	/// Forget all per-cycle state on every peer.
	pub fn reset_all(&self) {
		for peer in self.all() {
			peer.reset();
		}
	}
}
