// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Fixture generators used by the market crates' tests.

use cid::Cid;
use multihash::{Code, MultihashDigest};
use fvm_ipld_encoding::DAG_CBOR;
use fvm_shared::address::Address;
use fvm_shared::crypto::signature::Signature;
use libp2p_identity::{Keypair, PeerId};
use rand::Rng;

/// A cid over random bytes, usable as a payload root.
pub fn random_cid() -> Cid {
    let mut data = [0u8; 32];
    rand::thread_rng().fill(&mut data);
    Cid::new_v1(DAG_CBOR, Code::Blake2b256.digest(&data))
}

/// A cid with the piece commitment prefix over a random commitment.
pub fn random_piece_cid() -> Cid {
    let mut comm = [0u8; 32];
    rand::thread_rng().fill(&mut comm);
    crate::piece_commitment_to_cid(&comm).unwrap()
}

pub fn random_peer() -> PeerId {
    Keypair::generate_ed25519().public().to_peer_id()
}

pub fn random_actor_address() -> Address {
    let mut data = [0u8; 16];
    rand::thread_rng().fill(&mut data);
    Address::new_actor(&data)
}

/// A structurally valid (never verifiable) bls signature.
pub fn dummy_signature() -> Signature {
    Signature::new_bls(vec![0u8; 96])
}
