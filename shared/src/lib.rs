// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

mod peer;
mod piece;
#[cfg(any(test, feature = "test-utils"))]
pub mod testutil;

pub use peer::peer_ser;
pub use piece::*;

/// Opaque reference to the chain state a node answered a query against.
/// Obtained from `get_chain_head` and passed back into state queries.
pub type TipSetToken = Vec<u8>;
