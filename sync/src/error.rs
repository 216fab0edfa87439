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

//! Error types for the sync engine. The kinds are stable: each maps to a
//! peer-drop policy applied when a sync cycle finishes.

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Display};

/// Error definition
#[derive(Debug)]
pub struct Error {
	inner: Context<ErrorKind>,
}

/// Sync error definitions
#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
	/// A sync cycle is already running on this downloader.
	#[fail(display = "busy")]
	Busy,
	/// The peer left the registry mid-cycle.
	#[fail(display = "unknown peer")]
	UnknownPeer,
	/// The peer sent a payload of invalid shape.
	#[fail(display = "action from bad peer ignored")]
	BadPeer,
	/// The peer advertised a high difficulty but never delivered.
	#[fail(display = "peer is stalling")]
	StallingPeer,
	/// The registry has no peers to sync from.
	#[fail(display = "no peers to keep download active")]
	NoPeers,
	/// A request stayed unanswered past its deadline.
	#[fail(display = "timeout")]
	Timeout,
	/// A non-empty header request returned zero headers.
	#[fail(display = "empty header set by peer")]
	EmptyHeaderSet,
	/// No peer could provide the advertised block.
	#[fail(display = "no peers available or all tried for download")]
	PeersUnavailable,
	/// The agreed ancestor lies outside the allowed fork window.
	#[fail(display = "retrieved ancestor is invalid")]
	InvalidAncestor,
	/// Delivered headers do not link into a chain.
	#[fail(display = "retrieved hash chain is invalid")]
	InvalidChain,
	/// A block failed validation mid-cycle.
	#[fail(display = "retrieved block is invalid")]
	InvalidBlock,
	/// A body does not match its header commitments.
	#[fail(display = "retrieved block body is invalid")]
	InvalidBody,
	/// A receipt set does not match its header commitment.
	#[fail(display = "retrieved receipt is invalid")]
	InvalidReceipt,
	/// Block fetching cancelled from the outside.
	#[fail(display = "block download canceled (requested)")]
	CancelBlockFetch,
	/// Header fetching cancelled from the outside.
	#[fail(display = "header download canceled (requested)")]
	CancelHeaderFetch,
	/// Body fetching cancelled from the outside.
	#[fail(display = "block body download canceled (requested)")]
	CancelBodyFetch,
	/// Receipt fetching cancelled from the outside.
	#[fail(display = "receipt download canceled (requested)")]
	CancelReceiptFetch,
	/// Header processing cancelled from the outside.
	#[fail(display = "header processing canceled (requested)")]
	CancelHeaderProcessing,
	/// Content processing cancelled from the outside.
	#[fail(display = "content processing canceled (requested)")]
	CancelContentProcessing,
	/// A delivery arrived while no sync was running.
	#[fail(display = "no sync active")]
	NoSyncActive,
}

impl ErrorKind {
	/// Whether a cycle failing with this kind drops the originating peer.
	/// Mid-batch content mismatches do not: the offender may be any peer in
	/// the request fan-out, not necessarily the sync peer.
	pub fn drops_peer(&self) -> bool {
		match self {
			ErrorKind::BadPeer
			| ErrorKind::StallingPeer
			| ErrorKind::Timeout
			| ErrorKind::EmptyHeaderSet
			| ErrorKind::PeersUnavailable
			| ErrorKind::InvalidAncestor
			| ErrorKind::InvalidChain => true,
			_ => false,
		}
	}

	/// Whether this kind only reports an external cancellation. Cancelled
	/// cycles exit silently, without a failure event.
	pub fn is_cancel(&self) -> bool {
		match self {
			ErrorKind::CancelBlockFetch
			| ErrorKind::CancelHeaderFetch
			| ErrorKind::CancelBodyFetch
			| ErrorKind::CancelReceiptFetch
			| ErrorKind::CancelHeaderProcessing
			| ErrorKind::CancelContentProcessing => true,
			_ => false,
		}
	}
}

impl Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		Display::fmt(&self.inner, f)
	}
}

impl Error {
	/// get kind
	pub fn kind(&self) -> ErrorKind {
		self.inner.get_context().clone()
	}
	/// get cause
	pub fn cause(&self) -> Option<&dyn Fail> {
		self.inner.cause()
	}
	/// get backtrace
	pub fn backtrace(&self) -> Option<&Backtrace> {
		self.inner.backtrace()
	}
}

impl From<ErrorKind> for Error {
	fn from(kind: ErrorKind) -> Error {
		Error {
			inner: Context::new(kind),
		}
	}
}

impl From<Context<ErrorKind>> for Error {
	fn from(inner: Context<ErrorKind>) -> Error {
		Error { inner }
	}
}

impl From<grove_p2p::Error> for Error {
	fn from(error: grove_p2p::Error) -> Error {
		let kind = match error {
			grove_p2p::Error::Timeout => ErrorKind::Timeout,
			grove_p2p::Error::NotRegistered => ErrorKind::UnknownPeer,
			_ => ErrorKind::BadPeer,
		};
		Error {
			inner: Context::new(kind),
		}
	}
}
