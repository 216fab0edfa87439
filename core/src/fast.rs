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

//! Fast-chain blocks: high-throughput executable blocks carrying
//! transactions, committee votes and committee change records.

use chrono::prelude::{DateTime, TimeZone, Utc};

use crate::committee::{CommitteeSign, CommitteeSwitch};
use crate::hash::{items_root, Hash, HashWriter, Hashed, EMPTY_ROOT, ZERO_HASH};
use crate::transaction::Transaction;

/// Fixed-size metadata of a fast block. Fast-chain fork choice works on
/// height plus committee agreement, so no difficulty lives here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastHeader {
	/// Hash of the block at number - 1.
	pub parent_hash: Hash,
	/// Height of this block.
	pub number: u64,
	/// Commitment to the transactions in the body.
	pub tx_root: Hash,
	/// Commitment to the committee change records in the body.
	pub switch_root: Hash,
	/// Commitment to the execution receipts of this block.
	pub receipt_root: Hash,
	/// Commitment to the post-execution state.
	pub state_root: Hash,
	/// Commitment to the committee responsible for this height.
	pub committee_hash: Hash,
	/// Commitment to the votes bundled with the body.
	pub sign_root: Hash,
	/// Timestamp the block was proposed at.
	pub time: DateTime<Utc>,
}

impl Default for FastHeader {
	fn default() -> FastHeader {
		FastHeader {
			parent_hash: ZERO_HASH,
			number: 0,
			tx_root: *EMPTY_ROOT,
			switch_root: *EMPTY_ROOT,
			receipt_root: *EMPTY_ROOT,
			state_root: ZERO_HASH,
			committee_hash: ZERO_HASH,
			sign_root: *EMPTY_ROOT,
			time: Utc.timestamp(0, 0),
		}
	}
}

impl Hashed for FastHeader {
	fn write_hashable(&self, writer: &mut HashWriter) {
		writer.write_hash(&self.parent_hash);
		writer.write_u64(self.number);
		writer.write_hash(&self.tx_root);
		writer.write_hash(&self.switch_root);
		writer.write_hash(&self.receipt_root);
		writer.write_hash(&self.state_root);
		writer.write_hash(&self.committee_hash);
		// sign_root deliberately left out: the vote set attached to a block
		// grows while it propagates, the block hash must not move with it
		writer.write_i64(self.time.timestamp());
	}
}

impl FastHeader {
	/// Whether the header commits to an empty body, in which case the body
	/// can be reconstructed locally without a network request.
	pub fn has_empty_body(&self) -> bool {
		self.tx_root == *EMPTY_ROOT && self.switch_root == *EMPTY_ROOT
	}
}

/// The variable-size payload of a fast block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FastBody {
	/// Executable transactions.
	pub transactions: Vec<Transaction>,
	/// Committee votes accumulated for this block.
	pub signs: Vec<CommitteeSign>,
	/// Committee membership changes effective in this block.
	pub switches: Vec<CommitteeSwitch>,
}

impl FastBody {
	/// An empty body, the local reconstruction for empty-commitment headers.
	pub fn empty() -> FastBody {
		FastBody::default()
	}

	/// Commitment to the transactions.
	pub fn tx_root(&self) -> Hash {
		items_root(&self.transactions)
	}

	/// Commitment to the committee change records.
	pub fn switch_root(&self) -> Hash {
		items_root(&self.switches)
	}

	/// Commitment to the votes.
	pub fn sign_root(&self) -> Hash {
		items_root(&self.signs)
	}

	/// Whether this body matches the commitments of the given header. The
	/// vote set is excluded: it legitimately differs between copies of the
	/// same block.
	pub fn matches(&self, header: &FastHeader) -> bool {
		self.tx_root() == header.tx_root && self.switch_root() == header.switch_root
	}
}

/// A full fast block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FastBlock {
	/// The header.
	pub header: FastHeader,
	/// The body.
	pub body: FastBody,
}

impl FastBlock {
	/// Assemble a block from its parts.
	pub fn new(header: FastHeader, body: FastBody) -> FastBlock {
		FastBlock { header, body }
	}

	/// The block hash (the header hash).
	pub fn hash(&self) -> Hash {
		self.header.hash()
	}

	/// The block height.
	pub fn number(&self) -> u64 {
		self.header.number
	}
}

/// Execution output of a single transaction, only transferred in fast-sync
/// mode where blocks below the pivot are not executed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
	/// Hash of the transaction this receipt belongs to.
	pub tx_hash: Hash,
	/// Whether execution succeeded.
	pub success: bool,
	/// Gas consumed by the execution.
	pub gas_used: u64,
}

impl Hashed for Receipt {
	fn write_hashable(&self, writer: &mut HashWriter) {
		writer.write_hash(&self.tx_hash);
		writer.write_u8(self.success as u8);
		writer.write_u64(self.gas_used);
	}
}

/// Commitment over the ordered receipts of one block.
pub fn receipts_root(receipts: &[Receipt]) -> Hash {
	items_root(receipts)
}
