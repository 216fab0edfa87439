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

//! The primitive types of the grove dual-chain: hashes, difficulty,
//! fast-chain blocks (transactions plus committee records) and snail-chain
//! blocks (fruits). Execution, signing and the wire codec live elsewhere;
//! this crate only defines the data and its commitments.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![warn(missing_docs)]

#[macro_use]
extern crate lazy_static;

use grove_util as util;

pub mod committee;
pub mod difficulty;
pub mod fast;
pub mod genesis;
pub mod hash;
pub mod snail;
pub mod transaction;

pub use crate::committee::{Committee, CommitteeMember, CommitteeSign, CommitteeSwitch};
pub use crate::difficulty::Difficulty;
pub use crate::fast::{FastBlock, FastBody, FastHeader, Receipt};
pub use crate::hash::{Hash, Hashed, ZERO_HASH};
pub use crate::snail::{Fruit, FruitHashVersion, SnailBlock, SnailBody, SnailHeader};
pub use crate::transaction::Transaction;
