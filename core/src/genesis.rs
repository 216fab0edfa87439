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

//! Definition of the genesis blocks of both chains. All nodes agree on
//! these; ancestor search bottoms out here.

use chrono::prelude::{TimeZone, Utc};

use crate::difficulty::Difficulty;
use crate::fast::{FastBlock, FastBody, FastHeader};
use crate::snail::{SnailBlock, SnailBody, SnailHeader};

/// The genesis block of the fast chain.
pub fn genesis_fast() -> FastBlock {
	FastBlock {
		header: FastHeader {
			time: Utc.ymd(2020, 3, 1).and_hms(0, 0, 0),
			..Default::default()
		},
		body: FastBody::empty(),
	}
}

/// The genesis block of the snail chain.
pub fn genesis_snail() -> SnailBlock {
	SnailBlock {
		header: SnailHeader {
			time: Utc.ymd(2020, 3, 1).and_hms(0, 0, 0),
			difficulty: Difficulty::min(),
			fruit_difficulty: Difficulty::min(),
			..Default::default()
		},
		body: SnailBody::default(),
	}
}
