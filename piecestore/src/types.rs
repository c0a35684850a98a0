// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::Cbor;
use fvm_shared::deal::DealID;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::sector::SectorNumber;

/// Metadata about a piece a provider may be storing, so that given a piece
/// cid during retrieval the provider can determine how to unseal it.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct PieceInfo {
    pub piece_cid: Cid,
    pub deals: Vec<DealInfo>,
}

impl Cbor for PieceInfo {}

/// One deal whose sector holds the piece.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealInfo {
    pub deal_id: DealID,
    pub sector_id: SectorNumber,
    pub offset: PaddedPieceSize,
    pub length: PaddedPieceSize,
}

/// Where a payload block sits relative to the start of its piece.
#[derive(Clone, Copy, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct BlockLocation {
    pub rel_offset: u64,
    pub block_size: u64,
}

/// A block location together with the piece holding the block.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct PieceBlockLocation {
    pub piece_cid: Cid,
    pub location: BlockLocation,
}

/// Every known placement of one payload cid across pieces.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct CidInfo {
    pub cid: Cid,
    pub piece_block_locations: Vec<PieceBlockLocation>,
}

impl Cbor for CidInfo {}
