// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::multihash::Multihash;
use cid::{Cid, Version};
use fvm_shared::commcid::{FIL_COMMITMENT_UNSEALED, SHA2_256_TRUNC254_PADDED};
use thiserror::Error;

const COMMITMENT_BYTES_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommCidError {
    #[error("not a piece commitment cid")]
    WrongPrefix,
    #[error("commitments must be 32 bytes long")]
    InvalidCommitmentLength,
    #[error("could not wrap commitment hash")]
    InvalidHash,
}

/// Returns true if the cid carries the piece commitment prefix
/// (fil-commitment-unsealed codec over a padded sha2-256 hash).
pub fn is_piece_cid(c: &Cid) -> bool {
    c.version() == Version::V1
        && c.codec() == FIL_COMMITMENT_UNSEALED
        && c.hash().code() == SHA2_256_TRUNC254_PADDED
        && c.hash().size() as usize == COMMITMENT_BYTES_LEN
}

/// Wraps a raw unsealed-sector commitment into a piece cid.
pub fn piece_commitment_to_cid(commitment: &[u8]) -> Result<Cid, CommCidError> {
    if commitment.len() != COMMITMENT_BYTES_LEN {
        return Err(CommCidError::InvalidCommitmentLength);
    }
    let mh = Multihash::wrap(SHA2_256_TRUNC254_PADDED, commitment)
        .map_err(|_| CommCidError::InvalidHash)?;
    Ok(Cid::new_v1(FIL_COMMITMENT_UNSEALED, mh))
}

/// Extracts the raw commitment from a piece cid, checking the prefix.
pub fn cid_to_piece_commitment(c: &Cid) -> Result<[u8; COMMITMENT_BYTES_LEN], CommCidError> {
    if !is_piece_cid(c) {
        return Err(CommCidError::WrongPrefix);
    }
    let mut out = [0u8; COMMITMENT_BYTES_LEN];
    out.copy_from_slice(c.hash().digest());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvm_ipld_encoding::DAG_CBOR;
    use multihash::{Code, MultihashDigest};

    #[test]
    fn piece_cid_round_trip() {
        let comm = [7u8; 32];
        let c = piece_commitment_to_cid(&comm).unwrap();
        assert!(is_piece_cid(&c));
        assert_eq!(cid_to_piece_commitment(&c).unwrap(), comm);
    }

    #[test]
    fn rejects_wrong_prefix() {
        let c = Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(b"not a commitment"));
        assert!(!is_piece_cid(&c));
        assert_eq!(
            cid_to_piece_commitment(&c).unwrap_err(),
            CommCidError::WrongPrefix
        );
    }

    #[test]
    fn rejects_short_commitment() {
        assert_eq!(
            piece_commitment_to_cid(&[0u8; 16]).unwrap_err(),
            CommCidError::InvalidCommitmentLength
        );
    }
}
