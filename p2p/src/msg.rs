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

//! Message types that transit over the network. The codec that frames and
//! serializes them is owned by the transport layer; this module pins down
//! the message codes and payload shapes both sides must agree on.

use std::time::Duration;

use enum_primitive::FromPrimitive;

use crate::core::{Difficulty, Hash};

/// First protocol version.
pub const PROTOCOL_V1: u32 = 1;
/// Second protocol version, adds gc/commit heights to the status payload.
pub const PROTOCOL_V2: u32 = 2;

/// Maximum size of any message on the wire.
pub const PROTOCOL_MAX_MSG_SIZE: u64 = 10 * 1024 * 1024;

/// How long the handshake may take before the connection is given up on.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

enum_from_primitive! {
	/// Codes for each message transiting over the network. Requests and
	/// their responses come in pairs; the unused codes 0x08 and 0x14 are
	/// reserved. Status is the handshake; NewFastBlockHashes and
	/// NewSnailBlockHashes announce, the rest request or carry data.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	#[allow(missing_docs)]
	pub enum Type {
		Status = 0x00,
		NewFastBlockHashes = 0x01,
		Tx = 0x02,
		GetFastBlockHeaders = 0x03,
		FastBlockHeaders = 0x04,
		GetFastBlockBodies = 0x05,
		FastBlockBodies = 0x06,
		NewFastBlock = 0x07,
		NewFruit = 0x09,
		GetSnailBlockHeaders = 0x0a,
		SnailBlockHeaders = 0x0b,
		GetSnailBlockBodies = 0x0c,
		SnailBlockBodies = 0x0d,
		NewSnailBlock = 0x0e,
		GetNodeData = 0x0f,
		NodeData = 0x10,
		GetReceipts = 0x11,
		Receipts = 0x12,
		NewSnailBlockHashes = 0x13,
		TbftNodeInfoHash = 0x15,
		GetTbftNodeInfo = 0x16,
	}
}

impl Type {
	/// Parse a wire code, `None` for codes we do not speak.
	pub fn from_code(code: u8) -> Option<Type> {
		Type::from_u8(code)
	}
}

/// Requests carry a small tag that the responder echoes back, so the
/// response can be routed to whoever asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTag {
	/// The downloader asked.
	Downloader = 1,
	/// The block fetcher asked.
	Fetcher = 2,
}

/// Handshake payload advertised by both sides on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
	/// Protocol version spoken by the sender.
	pub version: u32,
	/// Network the sender lives on.
	pub network_id: u64,
	/// Total difficulty of the sender's snail chain.
	pub total_difficulty: Difficulty,
	/// Height of the sender's fast head.
	pub fast_height: u64,
	/// Hash of the sender's snail head.
	pub head: Hash,
	/// Hash of the sender's genesis snail block.
	pub genesis: Hash,
	/// Hash of the sender's fast head.
	pub fast_head: Hash,
	/// Garbage-collection horizon, protocol v2 and up.
	pub gc_height: Option<u64>,
	/// Committee commit horizon, protocol v2 and up.
	pub commit_height: Option<u64>,
}

/// Announcement of a block the sender believes we do not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBlockHash {
	/// Hash of the announced block.
	pub hash: Hash,
	/// Advertised height of the announced block.
	pub number: u64,
}

/// Where a header request starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
	/// Start from the block with this hash.
	Hash(Hash),
	/// Start from the block at this height.
	Number(u64),
}

/// A header range request, shared by both chains.
#[derive(Debug, Clone, Copy)]
pub struct GetBlockHeaders {
	/// Block to start from.
	pub origin: HashOrNumber,
	/// Maximum number of headers wanted.
	pub amount: u64,
	/// Blocks to skip between consecutive headers.
	pub skip: u64,
	/// Walk towards genesis rather than away from it.
	pub reverse: bool,
	/// Who asked.
	pub tag: CallTag,
}

/// A body request, shared by both chains.
#[derive(Debug, Clone)]
pub struct GetBlockBodies {
	/// Hashes of the blocks whose bodies are wanted.
	pub hashes: Vec<Hash>,
	/// Who asked.
	pub tag: CallTag,
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn codes_round_trip() {
		assert_eq!(Type::from_code(0x00), Some(Type::Status));
		assert_eq!(Type::from_code(0x0e), Some(Type::NewSnailBlock));
		assert_eq!(Type::from_code(0x16), Some(Type::GetTbftNodeInfo));
		// the two gaps in the table are not valid codes
		assert_eq!(Type::from_code(0x08), None);
		assert_eq!(Type::from_code(0x14), None);
		assert_eq!(Type::from_code(0x42), None);
	}
}
