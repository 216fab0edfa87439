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

//! The grove synchronization engine. Two cooperating downloaders bring the
//! fast and snail chains up to the network: the fast downloader assembles
//! headers, bodies, receipts and state into validated blocks; the snail
//! downloader runs the same pipeline over fruit-carrying blocks and never
//! outruns the fast chain it references. A coordinator owns both and picks
//! what to sync against whom, while an announcement-driven fetcher races
//! the downloaders for freshly gossiped blocks.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

use grove_core as core;
use grove_util as util;

pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod fast;
pub mod fetcher;
pub mod peer;
pub mod queue;
pub mod snail;
pub mod types;

pub use crate::coordinator::SyncCoordinator;
pub use crate::dispatch::{Dispatcher, Packet};
pub use crate::error::{Error, ErrorKind};
pub use crate::fast::FastDownloader;
pub use crate::fetcher::Fetcher;
pub use crate::queue::{ChainFlavor, FastFlavor, Queue, SnailFlavor};
pub use crate::snail::SnailDownloader;
pub use crate::types::{
	CommitteeVerifier, DownloadConfig, FastChainRead, FastSyncGate, FastTip, FetcherConfig,
	MeterSink, NullMeter, Progress, SnailChainRead, SnailTip, StateSink, SyncEvent, SyncEvents,
	SyncMode, SyncState, SyncStatus,
};
