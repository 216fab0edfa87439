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

//! Committee records carried inside fast blocks: votes over fast block
//! hashes and membership change records. Verification of the underlying
//! signature scheme is delegated to the consensus engine; this module only
//! defines the data and the agreement arithmetic.

use crate::hash::{items_root, Hash, HashWriter, Hashed};

/// Identifier of a committee member, stable across committee epochs.
pub type MemberId = u64;

/// A member of the BFT committee at some fast-chain height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitteeMember {
	/// Stable member identifier.
	pub id: MemberId,
	/// Commitment to the member public key.
	pub pubkey: Hash,
}

impl Hashed for CommitteeMember {
	fn write_hashable(&self, writer: &mut HashWriter) {
		writer.write_u64(self.id);
		writer.write_hash(&self.pubkey);
	}
}

/// Outcome a committee member voted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteResult {
	/// The member vouches for the block.
	Agree,
	/// The member votes against the block.
	Against,
}

/// A committee member's vote over a fast block hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitteeSign {
	/// Height of the fast block voted on.
	pub fast_height: u64,
	/// Hash of the fast block voted on.
	pub fast_hash: Hash,
	/// The vote.
	pub result: VoteResult,
	/// Who signed.
	pub member: MemberId,
	/// Opaque signature bytes, checked by the consensus engine.
	pub sign: Vec<u8>,
}

impl Hashed for CommitteeSign {
	fn write_hashable(&self, writer: &mut HashWriter) {
		writer.write_u64(self.fast_height);
		writer.write_hash(&self.fast_hash);
		writer.write_u8(match self.result {
			VoteResult::Agree => 1,
			VoteResult::Against => 0,
		});
		writer.write_u64(self.member);
		writer.write_bytes(&self.sign);
	}
}

/// A committee membership change record, effective at a fast height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitteeSwitch {
	/// Fast height at which the change takes effect.
	pub fast_height: u64,
	/// Members joining.
	pub joins: Vec<CommitteeMember>,
	/// Identifiers of members leaving.
	pub leaves: Vec<MemberId>,
}

impl Hashed for CommitteeSwitch {
	fn write_hashable(&self, writer: &mut HashWriter) {
		writer.write_u64(self.fast_height);
		writer.write_u64(self.joins.len() as u64);
		for m in &self.joins {
			m.write_hashable(writer);
		}
		writer.write_u64(self.leaves.len() as u64);
		for id in &self.leaves {
			writer.write_u64(*id);
		}
	}
}

/// The committee in effect over a range of fast heights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committee {
	/// First fast height this committee is responsible for.
	pub start_height: u64,
	/// The member set.
	pub members: Vec<CommitteeMember>,
}

impl Committee {
	/// Number of distinct agreeing members required to accept a block:
	/// ceil(size * 2/3) + 1.
	pub fn agreement_threshold(&self) -> usize {
		let n = self.members.len();
		(n * 2 + 2) / 3 + 1
	}

	/// Whether the given id belongs to this committee.
	pub fn has_member(&self, id: MemberId) -> bool {
		self.members.iter().any(|m| m.id == id)
	}

	/// Commitment to this committee's member set.
	pub fn hash(&self) -> Hash {
		items_root(&self.members)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn committee_of(n: usize) -> Committee {
		Committee {
			start_height: 0,
			members: (0..n as u64)
				.map(|id| CommitteeMember {
					id,
					pubkey: Hash::default(),
				})
				.collect(),
		}
	}

	#[test]
	fn agreement_threshold() {
		// ceil(n * 2/3) + 1
		assert_eq!(committee_of(1).agreement_threshold(), 2);
		assert_eq!(committee_of(3).agreement_threshold(), 3);
		assert_eq!(committee_of(4).agreement_threshold(), 4);
		assert_eq!(committee_of(9).agreement_threshold(), 7);
		assert_eq!(committee_of(10).agreement_threshold(), 8);
	}
}
