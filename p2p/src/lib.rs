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

//! Networking types for the grove node: the wire message vocabulary, the
//! per-peer record with its outbound gossip queue, and the registry of
//! connected peers. The transport itself (framing, encryption, handshakes
//! on the socket) is a separate concern behind the `PeerTransport` trait.

#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]
#![warn(missing_docs)]

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate enum_primitive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

use grove_core as core;
use grove_util as util;

pub mod msg;
mod peer;
mod peers;
pub mod types;

pub use crate::msg::{
	CallTag, GetBlockBodies, GetBlockHeaders, HashOrNumber, NewBlockHash, Status, Type,
	HANDSHAKE_TIMEOUT, PROTOCOL_MAX_MSG_SIZE, PROTOCOL_V1, PROTOCOL_V2,
};
pub use crate::peer::Peer;
pub use crate::peers::Peers;
pub use crate::types::{Capabilities, Error, PeerInfo, PeerLiveInfo, PeerTransport};
