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

//! The peer-drop policy, kind by kind.

mod common;

use common::*;
use grove_sync::ErrorKind;
use grove_util::init_test_logger;

#[test]
fn drop_policy_per_error_kind() {
	init_test_logger();

	let cases: Vec<(ErrorKind, bool)> = vec![
		(ErrorKind::Busy, false),
		(ErrorKind::UnknownPeer, false),
		(ErrorKind::BadPeer, true),
		(ErrorKind::StallingPeer, true),
		(ErrorKind::NoPeers, false),
		(ErrorKind::Timeout, true),
		(ErrorKind::EmptyHeaderSet, true),
		(ErrorKind::PeersUnavailable, true),
		(ErrorKind::InvalidAncestor, true),
		(ErrorKind::InvalidChain, true),
		(ErrorKind::InvalidBlock, false),
		(ErrorKind::InvalidBody, false),
		(ErrorKind::InvalidReceipt, false),
		(ErrorKind::CancelBlockFetch, false),
		(ErrorKind::CancelHeaderFetch, false),
		(ErrorKind::CancelBodyFetch, false),
		(ErrorKind::CancelReceiptFetch, false),
		(ErrorKind::CancelHeaderProcessing, false),
		(ErrorKind::CancelContentProcessing, false),
		(ErrorKind::NoSyncActive, false),
	];

	for (kind, dropped) in cases {
		let tester = Tester::new();
		tester.new_peer("peer", &[], &[]);
		assert!(tester.peers.is_known("peer"));

		tester.coordinator.apply_drop_policy("peer", &kind);
		assert_eq!(
			!tester.peers.is_known("peer"),
			dropped,
			"kind {:?} should {}drop the peer",
			kind,
			if dropped { "" } else { "not " }
		);
	}
}

#[test]
fn failed_sync_drops_the_sync_peer() {
	init_test_logger();
	let tester = Tester::new();
	let fast = make_fast_chain(&grove_core::genesis::genesis_fast(), 10, 1, 0);
	let remote = tester.new_peer("attack", &fast, &[]);
	remote.drop_fast(5);

	assert!(tester
		.sync_fast("attack", grove_sync::SyncMode::FullSync)
		.is_err());
	// direct downloader calls leave the policy to the caller
	assert!(tester.peers.is_known("attack"));

	tester
		.coordinator
		.apply_drop_policy("attack", &ErrorKind::InvalidChain);
	assert!(!tester.peers.is_known("attack"));
}
