// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::nodes::{NodeError, StorageProviderNode};
use crate::types::ClientDealProposal;
use cid::Cid;
use filestore::FileStore;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{from_slice, Cbor};
use fvm_shared::piece::{PaddedPieceSize, UnpaddedPieceSize};
use piecestore::BlockLocation;
use shared::TipSetToken;
use std::collections::HashMap;
use std::io::Read;

/// Checks the client signature over the proposal's canonical CBOR.
pub async fn verify_proposal(
    node: &dyn StorageProviderNode,
    signed: &ClientDealProposal,
    tok: &TipSetToken,
) -> Result<(), String> {
    let bz = signed
        .proposal
        .marshal_cbor()
        .map_err(|e| e.to_string())?;
    let verified = node
        .verify_signature(
            &signed.client_signature,
            &signed.proposal.client,
            &bz,
            tok,
        )
        .await
        .map_err(|e: NodeError| e.to_string())?;
    if !verified {
        return Err("could not verify signature".to_string());
    }
    Ok(())
}

/// The smallest valid unpadded piece size holding `size` payload bytes.
pub fn padded_size(size: u64) -> UnpaddedPieceSize {
    let mut bound = PaddedPieceSize(128);
    while bound.unpadded().0 < size {
        bound = PaddedPieceSize(bound.0 * 2);
    }
    bound.unpadded()
}

/// Extends the payload with zeros up to a valid unpadded piece size.
pub fn pad_reader(
    reader: Box<dyn Read + Send>,
    size: u64,
) -> (Box<dyn Read + Send>, UnpaddedPieceSize) {
    let target = padded_size(size);
    let padded = reader.chain(std::io::repeat(0).take(target.0 - size));
    (Box::new(padded), target)
}

/// One payload block's position, as staged by the transfer verifier.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct BlockMetadata {
    pub cid: Cid,
    pub rel_offset: u64,
    pub block_size: u64,
}

/// Reads the staged block-location metadata written during data
/// verification.
pub fn load_block_locations(
    fs: &FileStore,
    metadata_path: &filestore::Path,
) -> Result<HashMap<Cid, BlockLocation>, String> {
    let mut file = fs.open(metadata_path).map_err(|e| e.to_string())?;
    let mut bz = Vec::new();
    file.read_to_end(&mut bz).map_err(|e| e.to_string())?;
    let entries: Vec<BlockMetadata> = from_slice(&bz).map_err(|e| e.to_string())?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            (
                entry.cid,
                BlockLocation {
                    rel_offset: entry.rel_offset,
                    block_size: entry.block_size,
                },
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_sizes_are_valid_unpadded_pieces() {
        assert_eq!(padded_size(0).0, 127);
        assert_eq!(padded_size(127).0, 127);
        assert_eq!(padded_size(128).0, 254);
        assert_eq!(padded_size(1000).0, 1016);
        // every result passes chain validation once padded
        for size in [1u64, 127, 128, 1000, 1 << 20] {
            padded_size(size).padded().validate().unwrap();
        }
    }

    #[test]
    fn pad_reader_fills_with_zeros() {
        let payload = vec![1u8; 100];
        let (mut reader, target) = pad_reader(Box::new(std::io::Cursor::new(payload)), 100);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out.len() as u64, target.0);
        assert_eq!(target.0, 127);
        assert!(out[100..].iter().all(|b| *b == 0));
    }
}
