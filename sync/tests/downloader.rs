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

//! End-to-end downloader scenarios over scripted peers.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use grove_core::genesis::{genesis_fast, genesis_snail};
use grove_core::Hash;
use grove_sync::{ErrorKind, FastChainRead, SnailChainRead, SyncMode};
use grove_util::init_test_logger;

#[test]
fn canonical_sync() {
	init_test_logger();
	let tester = Tester::new();
	let fast = make_fast_chain(&genesis_fast(), 10, 1, 0);
	let snail = make_snail_chain(&genesis_snail(), &fast, 5, 1);
	tester.new_peer("peer", &fast, &snail);

	tester.sync_dual("peer").unwrap();

	// both chains caught up with the peer, genesis included in the counts
	assert_eq!(tester.fast_chain.block_count(), 11);
	assert_eq!(tester.fast_chain.head().height, 10);
	assert_eq!(tester.snail_chain.head().height, 2);
	// a well-behaved peer stays registered
	assert!(tester.peers.is_known("peer"));
}

#[test]
fn canonical_sync_via_coordinator() {
	init_test_logger();
	let tester = Tester::new();
	let fast = make_fast_chain(&genesis_fast(), 10, 1, 0);
	let snail = make_snail_chain(&genesis_snail(), &fast, 5, 1);
	tester.new_peer("peer", &fast, &snail);

	tester.coordinator.synchronise().unwrap();

	assert_eq!(tester.fast_chain.head().height, 10);
	assert_eq!(tester.snail_chain.head().height, 2);
	let (fast_done, snail_done) = tester.coordinator.is_synced();
	assert!(fast_done && snail_done);
}

#[test]
fn resync_is_a_noop() {
	init_test_logger();
	let tester = Tester::new();
	let fast = make_fast_chain(&genesis_fast(), 10, 1, 0);
	let snail = make_snail_chain(&genesis_snail(), &fast, 5, 1);
	tester.new_peer("peer", &fast, &snail);

	tester.sync_dual("peer").unwrap();
	let head_before = tester.fast_chain.head();

	// nothing new to download; the second run ends where the first did
	tester.sync_dual("peer").unwrap();
	assert_eq!(tester.fast_chain.head(), head_before);
	assert_eq!(tester.fast_chain.block_count(), 11);
}

#[test]
fn forked_sync() {
	init_test_logger();
	let tester = Tester::new();
	let common_part = make_fast_chain(&genesis_fast(), 8, 1, 0);
	let mut chain_a = common_part.clone();
	chain_a.extend(make_fast_chain(chain_a.last().unwrap(), 8, 0xaa, 0));
	let mut chain_b = common_part.clone();
	chain_b.extend(make_fast_chain(chain_b.last().unwrap(), 4, 0xbb, 0));

	tester.new_peer("peer-a", &chain_a, &[]);
	tester.new_peer("peer-b", &chain_b, &[]);

	tester.sync_fast("peer-a", SyncMode::FullSync).unwrap();
	assert_eq!(tester.fast_chain.block_count(), 17);

	tester.sync_fast("peer-b", SyncMode::FullSync).unwrap();
	// both forks are held locally now
	let tip_a = chain_a.last().unwrap().hash();
	let tip_b = chain_b.last().unwrap().hash();
	assert_eq!(tester.fast_chain.fork_len(&tip_a), 17);
	assert_eq!(tester.fast_chain.fork_len(&tip_b), 13);
	// the longer fork stays canonical
	assert_eq!(tester.fast_chain.head().hash, tip_a);
}

#[test]
fn heavy_fork_wins_over_longer() {
	init_test_logger();
	let tester = Tester::new();
	let fast = make_fast_chain(&genesis_fast(), 10, 1, 0);

	// peer A: long but light snail chain; peer B: short and heavy
	let snail_a = make_snail_chain(&genesis_snail(), &fast[..8], 1, 1);
	let snail_b = make_snail_chain(&genesis_snail(), &fast[..4], 1, 10);

	tester.new_peer("peer-a", &fast, &snail_a);
	tester.sync_dual("peer-a").unwrap();
	assert_eq!(tester.snail_chain.head().height, 8);

	tester.new_peer("peer-b", &fast, &snail_b);
	tester.sync_dual("peer-b").unwrap();

	// the heavier fork took over despite being shorter
	let head = tester.snail_chain.head();
	assert_eq!(head.height, 4);
	assert_eq!(head.hash, snail_b.last().unwrap().hash());
	// lighter 8-block fork totalled 9 including genesis
	assert!(head.total_difficulty > grove_core::Difficulty::from_num(9));
}

#[test]
fn heavy_fork_beyond_window_rejected() {
	init_test_logger();
	let mut config = test_config();
	config.max_fork_ancestry = 4;
	let tester = Tester::with_configs(config, test_fetcher_config(), 4);

	let fast = make_fast_chain(&genesis_fast(), 10, 1, 0);
	let snail_a = make_snail_chain(&genesis_snail(), &fast[..8], 1, 1);
	let snail_b = make_snail_chain(&genesis_snail(), &fast[..4], 1, 10);

	tester.new_peer("peer-a", &fast, &snail_a);
	tester.sync_dual("peer-a").unwrap();

	// B forks at genesis, eight blocks behind our head: outside the window
	tester.new_peer("peer-b", &fast, &snail_b);
	let err = tester.sync_dual("peer-b").unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidAncestor);
	// the heavier-but-too-deep fork was not adopted
	assert_eq!(tester.snail_chain.head().height, 8);
}

#[test]
fn gapped_header_attack() {
	init_test_logger();
	let tester = Tester::new();
	let fast = make_fast_chain(&genesis_fast(), 10, 1, 0);

	let remote = tester.new_peer("attack", &fast, &[]);
	remote.drop_fast(5);

	let err = tester.sync_fast("attack", SyncMode::FullSync).unwrap_err();
	match err.kind() {
		ErrorKind::InvalidChain | ErrorKind::BadPeer | ErrorKind::Timeout => (),
		other => panic!("unexpected error kind {:?}", other),
	}

	// a clean peer afterwards brings us up regardless
	tester.new_peer("valid", &fast, &[]);
	tester.sync_fast("valid", SyncMode::FullSync).unwrap();
	assert_eq!(tester.fast_chain.head().height, 10);
}

#[test]
fn shifted_header_attack() {
	init_test_logger();
	let tester = Tester::new();
	let fast = make_fast_chain(&genesis_fast(), 10, 1, 0);

	let remote = tester.new_peer("attack", &fast, &[]);
	remote.drop_fast(9);

	assert!(tester.sync_fast("attack", SyncMode::FullSync).is_err());

	tester.new_peer("valid", &fast, &[]);
	tester.sync_fast("valid", SyncMode::FullSync).unwrap();
	assert_eq!(tester.fast_chain.head().height, 10);
}

#[test]
fn high_td_starvation() {
	init_test_logger();
	let tester = Tester::new();
	// the peer advertises an enormous difficulty but owns nothing
	tester.new_peer_opts("attack", &[], &[], Some(10_000_000_000_000), false);

	let bogus_head = Hash::from_vec(&[9u8; 32]);
	let err = tester
		.snail
		.synchronise("attack", bogus_head, 0)
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::StallingPeer);
}

#[test]
fn cancellation_drains_queue() {
	init_test_logger();
	let tester = Arc::new(Tester::new());
	let fast = make_fast_chain(&genesis_fast(), 200, 1, 0);
	tester.new_peer("peer", &fast, &[]);

	let t = tester.clone();
	let handle = thread::spawn(move || {
		let _ = t.sync_fast("peer", SyncMode::FullSync);
	});
	thread::sleep(Duration::from_millis(5));
	tester.fast.cancel();
	handle.join().unwrap();

	// the queue must be drained within one watchdog tick
	assert!(wait_for(Duration::from_millis(60), || tester
		.fast
		.queue_idle()));
}

#[test]
fn empty_body_short_circuit() {
	init_test_logger();
	let tester = Tester::new();
	// every 4th block is empty: 10 of the 40 need no body download
	let fast = make_fast_chain(&genesis_fast(), 40, 1, 4);
	let remote = tester.new_peer("peer", &fast, &[]);

	tester.sync_fast("peer", SyncMode::FullSync).unwrap();

	assert_eq!(tester.fast_chain.head().height, 40);
	assert_eq!(remote.body_requests.load(Ordering::SeqCst), 30);
}

#[test]
fn skeleton_sync_long_chain() {
	init_test_logger();
	let mut config = test_config();
	config.block_cache_items = 64;
	config.max_header_fetch = 16;
	config.max_skeleton_size = 4;
	let tester = Tester::with_configs(config, test_fetcher_config(), 4);

	let fast = make_fast_chain(&genesis_fast(), 150, 1, 0);
	tester.new_peer("peer", &fast, &[]);

	tester.sync_fast("peer", SyncMode::FullSync).unwrap();
	assert_eq!(tester.fast_chain.head().height, 150);
	assert_eq!(tester.fast_chain.block_count(), 151);
}

#[test]
fn progress_reporting() {
	init_test_logger();
	let tester = Tester::new();
	let fast = make_fast_chain(&genesis_fast(), 20, 1, 0);

	assert_eq!(tester.fast.progress(), (0, 0, 0));

	// a peer knowing only half the chain
	tester.new_peer("half", &fast[..10], &[]);
	tester.sync_fast("half", SyncMode::FullSync).unwrap();
	assert_eq!(tester.fast.progress(), (0, 10, 10));

	// then one knowing all of it
	tester.new_peer("full", &fast, &[]);
	tester.sync_fast("full", SyncMode::FullSync).unwrap();
	assert_eq!(tester.fast.progress(), (10, 20, 20));
}

#[test]
fn busy_while_syncing() {
	init_test_logger();
	let tester = Arc::new(Tester::new());
	let fast = make_fast_chain(&genesis_fast(), 300, 1, 0);
	tester.new_peer("peer", &fast, &[]);

	let t = tester.clone();
	let handle = thread::spawn(move || t.sync_fast("peer", SyncMode::FullSync));

	// while the long sync runs, a second call bounces
	thread::sleep(Duration::from_millis(10));
	match tester.sync_fast("peer", SyncMode::FullSync) {
		Err(e) => assert_eq!(e.kind(), ErrorKind::Busy),
		// the first run was already done; the rerun is a cheap no-op
		Ok(()) => (),
	}
	handle.join().unwrap().unwrap();
	assert_eq!(tester.fast_chain.head().height, 300);
}

#[test]
fn pivoted_sync_uses_receipts() {
	init_test_logger();
	let tester = Tester::new();
	let fast = make_fast_chain(&genesis_fast(), 80, 1, 0);
	tester.new_peer("peer", &fast, &[]);

	// pivot pinned the way the coordinator does it
	let pivot = tester.fast.fetch_header_at("peer", 80 - 64).unwrap();
	use grove_sync::FastSyncGate;
	tester.fast.set_pivot(pivot);

	tester.sync_fast("peer", SyncMode::FastSync).unwrap();
	assert_eq!(tester.fast_chain.head().height, 80);
}
