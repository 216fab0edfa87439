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

//! Snail-chain blocks: low-rate blocks that embed fruits, compact
//! confirmations referencing fast blocks by hash. Cumulative work lives
//! here, so snail fork preference is difficulty-based.

use chrono::prelude::{DateTime, TimeZone, Utc};

use crate::committee::CommitteeSign;
use crate::difficulty::Difficulty;
use crate::hash::{hashes_root, items_root, Hash, HashWriter, Hashed, EMPTY_ROOT, ZERO_HASH};

/// Which fruit commitment rules apply. The TIP5 upgrade moved the attached
/// votes out of the per-fruit hash so a fruit keeps its identity while its
/// vote set grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FruitHashVersion {
	/// Original rules: votes are part of the fruit commitment.
	PreTip5,
	/// Post-upgrade rules: votes excluded from the fruit commitment.
	Tip5,
}

/// Fixed-size metadata of a snail block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnailHeader {
	/// Hash of the snail block at number - 1.
	pub parent_hash: Hash,
	/// Height of this snail block.
	pub number: u64,
	/// Commitment to the fruits in the body.
	pub fruit_root: Hash,
	/// Commitment to the votes bundled with the body.
	pub sign_root: Hash,
	/// Work contributed by this block.
	pub difficulty: Difficulty,
	/// Work target an individual fruit had to meet.
	pub fruit_difficulty: Difficulty,
	/// Timestamp the block was mined at.
	pub time: DateTime<Utc>,
}

impl Default for SnailHeader {
	fn default() -> SnailHeader {
		SnailHeader {
			parent_hash: ZERO_HASH,
			number: 0,
			fruit_root: *EMPTY_ROOT,
			sign_root: *EMPTY_ROOT,
			difficulty: Difficulty::min(),
			fruit_difficulty: Difficulty::min(),
			time: Utc.timestamp(0, 0),
		}
	}
}

impl Hashed for SnailHeader {
	fn write_hashable(&self, writer: &mut HashWriter) {
		writer.write_hash(&self.parent_hash);
		writer.write_u64(self.number);
		writer.write_hash(&self.fruit_root);
		self.difficulty.write_hashable(writer);
		self.fruit_difficulty.write_hashable(writer);
		writer.write_i64(self.time.timestamp());
	}
}

/// A compact confirmation of a fast block, mined into a snail block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fruit {
	/// Hash of the fast block this fruit confirms.
	pub fast_hash: Hash,
	/// Height of the fast block this fruit confirms.
	pub fast_number: u64,
	/// Work carried by this fruit.
	pub difficulty: Difficulty,
	/// Committee votes over the referenced fast block.
	pub signs: Vec<CommitteeSign>,
}

impl Fruit {
	/// The fruit commitment under the given hashing rules.
	pub fn hash_with(&self, version: FruitHashVersion) -> Hash {
		let mut writer = HashWriter::new();
		writer.write_hash(&self.fast_hash);
		writer.write_u64(self.fast_number);
		self.difficulty.write_hashable(&mut writer);
		if version == FruitHashVersion::PreTip5 {
			writer.write_hash(&items_root(&self.signs));
		}
		writer.finish()
	}
}

/// The variable-size payload of a snail block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnailBody {
	/// The fruits mined into this block, ordered by referenced fast number.
	pub fruits: Vec<Fruit>,
	/// Committee votes bundled at the block level.
	pub signs: Vec<CommitteeSign>,
}

impl SnailBody {
	/// Commitment to the fruit set under the given hashing rules.
	pub fn fruit_root(&self, version: FruitHashVersion) -> Hash {
		let hashes = self
			.fruits
			.iter()
			.map(|f| f.hash_with(version))
			.collect::<Vec<_>>();
		hashes_root(&hashes)
	}

	/// Commitment to the votes.
	pub fn sign_root(&self) -> Hash {
		items_root(&self.signs)
	}

	/// Whether this body matches the fruit commitment of the given header
	/// under the given hashing rules.
	pub fn matches(&self, header: &SnailHeader, version: FruitHashVersion) -> bool {
		self.fruit_root(version) == header.fruit_root
	}

	/// The highest fast-chain height referenced by any fruit in this body,
	/// zero when the body carries no fruit. The snail downloader compares
	/// this against the fast pivot before letting the block through.
	pub fn max_fast_number(&self) -> u64 {
		self.fruits.iter().map(|f| f.fast_number).max().unwrap_or(0)
	}
}

/// A full snail block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnailBlock {
	/// The header.
	pub header: SnailHeader,
	/// The body.
	pub body: SnailBody,
}

impl SnailBlock {
	/// Assemble a block from its parts.
	pub fn new(header: SnailHeader, body: SnailBody) -> SnailBlock {
		SnailBlock { header, body }
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
