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

//! Cumulative work carried by the snail chain. Peer selection and snail fork
//! preference compare these values; fast-chain forks do not use them.

use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::hash::{HashWriter, Hashed};

/// The total difficulty of a chain (or the difficulty contribution of a
/// single block or fruit), expressed as an amount of work.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Eq, Ord, Hash, Default)]
pub struct Difficulty {
	num: u64,
}

impl Difficulty {
	/// Difficulty of zero, total difficulty of an empty chain.
	pub fn zero() -> Difficulty {
		Difficulty { num: 0 }
	}

	/// Difficulty of one, the minimum difficulty of a mined block.
	pub fn min() -> Difficulty {
		Difficulty { num: 1 }
	}

	/// Convert a `u64` into a `Difficulty`
	pub fn from_num(num: u64) -> Difficulty {
		Difficulty { num }
	}

	/// Converts the difficulty into a u64
	pub fn to_num(self) -> u64 {
		self.num
	}
}

impl fmt::Display for Difficulty {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.num)
	}
}

impl Add<Difficulty> for Difficulty {
	type Output = Difficulty;
	fn add(self, other: Difficulty) -> Difficulty {
		Difficulty {
			num: self.num.saturating_add(other.num),
		}
	}
}

impl AddAssign for Difficulty {
	fn add_assign(&mut self, other: Difficulty) {
		self.num = self.num.saturating_add(other.num);
	}
}

impl Sub<Difficulty> for Difficulty {
	type Output = Difficulty;
	fn sub(self, other: Difficulty) -> Difficulty {
		Difficulty {
			num: self.num.saturating_sub(other.num),
		}
	}
}

impl Sum for Difficulty {
	fn sum<I: Iterator<Item = Difficulty>>(iter: I) -> Difficulty {
		iter.fold(Difficulty::zero(), |a, b| a + b)
	}
}

impl Hashed for Difficulty {
	fn write_hashable(&self, writer: &mut HashWriter) {
		writer.write_u64(self.num);
	}
}

impl Serialize for Difficulty {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(self.num)
	}
}

impl<'de> Deserialize<'de> for Difficulty {
	fn deserialize<D>(deserializer: D) -> Result<Difficulty, D::Error>
	where
		D: Deserializer<'de>,
	{
		let num = u64::deserialize(deserializer)?;
		Ok(Difficulty { num })
	}
}
