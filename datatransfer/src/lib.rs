// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The markets drive bulk payload movement through an external transfer
//! engine. This crate carries the engine's observable surface: channel
//! identities, typed vouchers riding on channels, the event families the
//! engine emits, and the manager operations the deal handlers call.

mod errors;
#[cfg(any(test, feature = "test-utils"))]
pub mod testutil;
mod types;

pub use errors::Error;
pub use types::{ChannelEvent, ChannelId, DataTransfer, Event, Voucher};
