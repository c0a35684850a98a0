// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Records which deals and sectors hold each piece, and where payload
//! blocks sit inside pieces, so retrievals can locate and unseal data.

mod store;
mod types;

pub use store::DsPieceStore;
pub use types::{BlockLocation, CidInfo, DealInfo, PieceBlockLocation, PieceInfo};

use cid::Cid;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("piece not found")]
    NotFound,
    #[error("datastore: {0}")]
    Db(#[from] db::Error),
    #[error("encoding piece metadata: {0}")]
    Encoding(String),
}

impl From<fvm_ipld_encoding::Error> for Error {
    fn from(e: fvm_ipld_encoding::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

/// Piece metadata operations shared by both markets.
pub trait PieceStore: Send + Sync {
    /// Records that a deal stores the given piece.
    fn add_deal_for_piece(&self, piece_cid: &Cid, deal_info: DealInfo) -> Result<(), Error>;

    /// Records where payload blocks sit inside a piece. Locations already
    /// present are left untouched.
    fn add_piece_block_locations(
        &self,
        piece_cid: &Cid,
        block_locations: &HashMap<Cid, BlockLocation>,
    ) -> Result<(), Error>;

    fn get_piece_info(&self, piece_cid: &Cid) -> Result<PieceInfo, Error>;

    fn get_cid_info(&self, payload_cid: &Cid) -> Result<CidInfo, Error>;
}
