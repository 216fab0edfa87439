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

//! Delivery-routing behavior under hostile input.

mod common;

use std::sync::Arc;
use std::thread;

use common::*;
use grove_core::genesis::genesis_fast;
use grove_core::FastHeader;
use grove_p2p::CallTag;
use grove_sync::{FastChainRead, Packet, SyncMode};
use grove_util::init_test_logger;

#[test]
fn unrequested_header_flood_does_not_stall_sync() {
	init_test_logger();
	let tester = Arc::new(Tester::new());
	let fast = make_fast_chain(&genesis_fast(), 20, 1, 0);
	tester.new_peer("good", &fast, &[]);
	tester.new_peer("rogue", &[], &[]);

	// hammer the dispatcher with unsolicited header batches while the
	// legitimate sync runs
	let flood = {
		let t = tester.clone();
		thread::spawn(move || {
			let junk = make_fast_chain(&genesis_fast(), 8, 0x66, 0)
				.into_iter()
				.map(|b| b.header)
				.collect::<Vec<FastHeader>>();
			for _ in 0..500 {
				t.dispatcher
					.deliver_fast_headers("rogue", junk.clone(), CallTag::Downloader);
			}
		})
	};

	let sync = {
		let t = tester.clone();
		thread::spawn(move || t.sync_fast("good", SyncMode::FullSync))
	};

	// all 500 floods complete without blocking on anything
	flood.join().unwrap();
	sync.join().unwrap().unwrap();
	assert_eq!(tester.fast_chain.head().height, 20);
}

#[test]
fn stale_deliveries_are_discarded() {
	init_test_logger();
	let tester = Tester::new();
	let fast = make_fast_chain(&genesis_fast(), 4, 1, 0);
	tester.new_peer("peer", &fast, &[]);

	// nothing is syncing: every delivery is stale and simply vanishes
	let headers = fast.iter().map(|b| b.header.clone()).collect::<Vec<_>>();
	let bodies = fast.iter().map(|b| b.body.clone()).collect::<Vec<_>>();
	tester
		.dispatcher
		.deliver_fast_headers("peer", headers, CallTag::Downloader);
	tester
		.dispatcher
		.deliver_fast_bodies("peer", bodies, CallTag::Downloader);
	tester.dispatcher.deliver_receipts("peer", vec![vec![]]);
	tester
		.dispatcher
		.deliver_node_data("peer", vec![vec![1, 2, 3]]);

	assert_eq!(tester.fast_chain.head().height, 0);
	assert!(tester.fast.queue_idle());
}

#[test]
fn packet_accessors() {
	let fast = make_fast_chain(&genesis_fast(), 3, 1, 0);
	let packet = Packet::FastHeaders {
		peer: "someone".to_string(),
		headers: fast.iter().map(|b| b.header.clone()).collect(),
		tag: CallTag::Downloader,
	};
	assert_eq!(packet.peer_id(), "someone");
	assert_eq!(packet.items(), 3);
	assert_eq!(packet.stats(), "fast headers: 3");
}

#[test]
fn dispatch_routes_by_variant() {
	init_test_logger();
	let tester = Tester::new();
	let fast = make_fast_chain(&genesis_fast(), 3, 1, 0);
	tester.new_peer("peer", &fast, &[]);

	// routed dispatch of a stale packet must be as harmless as the
	// fine-grained calls
	tester.dispatcher.dispatch(Packet::FastBodies {
		peer: "peer".to_string(),
		bodies: fast.iter().map(|b| b.body.clone()).collect(),
		tag: CallTag::Downloader,
	});
	assert!(tester.fast.queue_idle());
}
