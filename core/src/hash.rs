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

//! Hash Function
//!
//! Primary hash function used in the protocol
//!

use std::cmp::min;
use std::{fmt, ops};

use blake2_rfc::blake2b::Blake2b;
use byteorder::{BigEndian, WriteBytesExt};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::util;

/// A hash to uniquely (or close enough) identify one of the main blockchain
/// constructs. Used pervasively for blocks, transactions and fruits.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord, Hash, Default)]
pub struct Hash(pub [u8; 32]);

/// The hash of value zero, conventionally standing in for "no hash".
pub const ZERO_HASH: Hash = Hash([0; 32]);

impl fmt::Debug for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let hash_hex = self.to_hex();
		const NUM_SHOW: usize = 12;

		write!(f, "{}", &hash_hex[..NUM_SHOW])
	}
}

impl fmt::Display for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

impl Hash {
	/// Size of a hash in bytes.
	pub const LEN: usize = 32;

	/// Builds a Hash from a byte vector. If the vector is too short, it will be
	/// completed by zeroes. If it's too long, it will be truncated.
	pub fn from_vec(v: &[u8]) -> Hash {
		let mut h = [0; Hash::LEN];
		let copy_size = min(v.len(), Hash::LEN);
		h[..copy_size].copy_from_slice(&v[..copy_size]);
		Hash(h)
	}

	/// Converts the hash to a byte vector
	pub fn to_vec(&self) -> Vec<u8> {
		self.0.to_vec()
	}

	/// Convert a hash to hex string format.
	pub fn to_hex(&self) -> String {
		util::to_hex(self.to_vec())
	}

	/// Convert hex string back to hash.
	pub fn from_hex(hex: &str) -> Result<Hash, ()> {
		let bytes = util::from_hex(hex.to_string()).map_err(|_| ())?;
		if bytes.len() != Hash::LEN {
			return Err(());
		}
		Ok(Hash::from_vec(&bytes))
	}
}

impl ops::Index<usize> for Hash {
	type Output = u8;

	fn index(&self, idx: usize) -> &u8 {
		&self.0[idx]
	}
}

impl ops::Index<ops::Range<usize>> for Hash {
	type Output = [u8];

	fn index(&self, idx: ops::Range<usize>) -> &[u8] {
		&self.0[idx]
	}
}

impl AsRef<[u8]> for Hash {
	fn as_ref(&self) -> &[u8] {
		&self.0
	}
}

impl Serialize for Hash {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_hex())
	}
}

impl<'de> Deserialize<'de> for Hash {
	fn deserialize<D>(deserializer: D) -> Result<Hash, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Hash::from_hex(&s).map_err(|_| de::Error::custom("invalid hex hash"))
	}
}

/// Serializer that accumulates bytes into a running blake2b state. All
/// commitments in the protocol (block hashes, list roots) go through it so
/// every field is framed the same way everywhere.
pub struct HashWriter {
	state: Blake2b,
}

impl HashWriter {
	/// Builds a new hash writer with an empty state.
	pub fn new() -> HashWriter {
		HashWriter {
			state: Blake2b::new(32),
		}
	}

	/// Append a u8 to the state.
	pub fn write_u8(&mut self, n: u8) {
		self.state.update(&[n]);
	}

	/// Append a u32 to the state, big endian.
	pub fn write_u32(&mut self, n: u32) {
		let mut bytes = Vec::with_capacity(4);
		bytes.write_u32::<BigEndian>(n).unwrap();
		self.state.update(&bytes);
	}

	/// Append a u64 to the state, big endian.
	pub fn write_u64(&mut self, n: u64) {
		let mut bytes = Vec::with_capacity(8);
		bytes.write_u64::<BigEndian>(n).unwrap();
		self.state.update(&bytes);
	}

	/// Append an i64 to the state, big endian.
	pub fn write_i64(&mut self, n: i64) {
		let mut bytes = Vec::with_capacity(8);
		bytes.write_i64::<BigEndian>(n).unwrap();
		self.state.update(&bytes);
	}

	/// Append raw bytes to the state, length-prefixed so that adjacent
	/// variable-size fields cannot alias.
	pub fn write_bytes(&mut self, bytes: &[u8]) {
		self.write_u64(bytes.len() as u64);
		self.state.update(bytes);
	}

	/// Append another hash to the state.
	pub fn write_hash(&mut self, h: &Hash) {
		self.state.update(&h.0);
	}

	/// Consume the writer, producing the final hash.
	pub fn finish(self) -> Hash {
		let result = self.state.finalize();
		Hash::from_vec(result.as_bytes())
	}
}

/// A trait for types that get their canonical hash from writing themselves
/// into a `HashWriter`.
pub trait Hashed {
	/// Write the content of this type into the provided hash writer.
	fn write_hashable(&self, writer: &mut HashWriter);

	/// The canonical hash of this type.
	fn hash(&self) -> Hash {
		let mut writer = HashWriter::new();
		self.write_hashable(&mut writer);
		writer.finish()
	}
}

impl Hashed for [u8] {
	fn write_hashable(&self, writer: &mut HashWriter) {
		writer.write_bytes(self);
	}
}

impl Hashed for Hash {
	fn write_hashable(&self, writer: &mut HashWriter) {
		writer.write_hash(self);
	}
}

/// The root commitment over an ordered list of hashes. An empty list commits
/// to `EMPTY_ROOT`.
pub fn hashes_root(hashes: &[Hash]) -> Hash {
	let mut writer = HashWriter::new();
	writer.write_u64(hashes.len() as u64);
	for h in hashes {
		writer.write_hash(h);
	}
	writer.finish()
}

/// The root commitment over an ordered list of hashable items.
pub fn items_root<T: Hashed>(items: &[T]) -> Hash {
	let hashes = items.iter().map(|item| item.hash()).collect::<Vec<_>>();
	hashes_root(&hashes)
}

lazy_static! {
	/// Root committing to an empty list, used to recognize header commitments
	/// that need no body download.
	pub static ref EMPTY_ROOT: Hash = hashes_root(&[]);
}
