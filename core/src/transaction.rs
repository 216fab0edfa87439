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

//! Executable transactions carried by fast blocks. Execution itself is the
//! VM's concern; the sync engine only moves transactions around and checks
//! their commitment against the enclosing header.

use crate::hash::{HashWriter, Hashed};

/// A single executable transaction. The payload is opaque to the sync
/// engine; the nonce keeps otherwise identical payloads distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
	/// Sender-chosen sequence number.
	pub nonce: u64,
	/// Opaque call data handed to the execution layer.
	pub payload: Vec<u8>,
}

impl Transaction {
	/// Build a transaction from a nonce and raw payload bytes.
	pub fn new(nonce: u64, payload: Vec<u8>) -> Transaction {
		Transaction { nonce, payload }
	}
}

impl Hashed for Transaction {
	fn write_hashable(&self, writer: &mut HashWriter) {
		writer.write_u64(self.nonce);
		writer.write_bytes(&self.payload);
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn nonce_distinguishes() {
		let a = Transaction::new(1, vec![1, 2, 3]);
		let b = Transaction::new(2, vec![1, 2, 3]);
		assert_ne!(a.hash(), b.hash());
	}
}
