// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Deal record schema migrations. Version 0 records predate resumable
//! transfers: they carry no transfer channel id and no fast-retrieval flag.

use crate::types::{ClientDeal, ClientDealProposal, DataRef, MinerDeal, StorageDealStatus};
use cid::Cid;
use datatransfer::ChannelId;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::Cbor;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::SectorNumber;
use libp2p_identity::PeerId;
use shared::peer_ser;
use statemachine::{Error, Migrations};

#[derive(Serialize_tuple, Deserialize_tuple)]
struct MinerDealV0 {
    client_deal_proposal: ClientDealProposal,
    proposal_cid: Cid,
    add_funds_cid: Option<Cid>,
    publish_cid: Option<Cid>,
    #[serde(with = "peer_ser")]
    client: PeerId,
    state: StorageDealStatus,
    piece_path: filestore::Path,
    metadata_path: filestore::Path,
    message: String,
    data_ref: DataRef,
    funds_reserved: TokenAmount,
    available_for_retrieval: bool,
    deal_id: DealID,
    sector_number: SectorNumber,
    store_id: Option<u64>,
}

impl Cbor for MinerDealV0 {}

#[derive(Serialize_tuple, Deserialize_tuple)]
struct ClientDealV0 {
    client_deal_proposal: ClientDealProposal,
    proposal_cid: Cid,
    add_funds_cid: Option<Cid>,
    state: StorageDealStatus,
    #[serde(with = "peer_ser")]
    miner: PeerId,
    miner_worker: fvm_shared::address::Address,
    deal_id: DealID,
    data_ref: DataRef,
    message: String,
    publish_message: Option<Cid>,
    funds_reserved: TokenAmount,
    store_id: Option<u64>,
}

impl Cbor for ClientDealV0 {}

fn miner_deal_v0_to_v1(bz: &[u8]) -> Result<Vec<u8>, Error> {
    let old = MinerDealV0::unmarshal_cbor(bz)?;
    let new = MinerDeal {
        client_deal_proposal: old.client_deal_proposal,
        proposal_cid: old.proposal_cid,
        add_funds_cid: old.add_funds_cid,
        publish_cid: old.publish_cid,
        client: old.client,
        state: old.state,
        piece_path: old.piece_path,
        metadata_path: old.metadata_path,
        message: old.message,
        data_ref: old.data_ref,
        funds_reserved: old.funds_reserved,
        available_for_retrieval: old.available_for_retrieval,
        deal_id: old.deal_id,
        transfer_channel_id: None::<ChannelId>,
        sector_number: old.sector_number,
        store_id: old.store_id,
        fast_retrieval: false,
    };
    Ok(new.marshal_cbor()?)
}

fn client_deal_v0_to_v1(bz: &[u8]) -> Result<Vec<u8>, Error> {
    let old = ClientDealV0::unmarshal_cbor(bz)?;
    let new = ClientDeal {
        client_deal_proposal: old.client_deal_proposal,
        proposal_cid: old.proposal_cid,
        add_funds_cid: old.add_funds_cid,
        state: old.state,
        miner: old.miner,
        miner_worker: old.miner_worker,
        deal_id: old.deal_id,
        data_ref: old.data_ref,
        message: old.message,
        publish_message: old.publish_message,
        funds_reserved: old.funds_reserved,
        transfer_channel_id: None::<ChannelId>,
        fast_retrieval: false,
        store_id: old.store_id,
    };
    Ok(new.marshal_cbor()?)
}

/// Migrations for the provider deal namespace.
pub fn provider_migrations() -> Migrations {
    Migrations::new(vec![miner_deal_v0_to_v1])
}

/// Migrations for the client deal namespace.
pub fn client_migrations() -> Migrations {
    Migrations::new(vec![client_deal_v0_to_v1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DealProposal;
    use db::{MemoryDB, Store};
    use fvm_shared::address::Address;
    use fvm_shared::piece::PaddedPieceSize;
    use shared::testutil::{dummy_signature, random_peer, random_piece_cid};

    fn v0_record() -> MinerDealV0 {
        let proposal = DealProposal {
            piece_cid: random_piece_cid(),
            piece_size: PaddedPieceSize(2048),
            verified_deal: false,
            client: Address::new_id(100),
            provider: Address::new_id(200),
            label: String::new(),
            start_epoch: 10,
            end_epoch: 200,
            storage_price_per_epoch: TokenAmount::from_atto(1),
            provider_collateral: TokenAmount::from_atto(1),
            client_collateral: TokenAmount::from_atto(1),
        };
        MinerDealV0 {
            proposal_cid: proposal.cid().unwrap(),
            client_deal_proposal: ClientDealProposal {
                proposal,
                client_signature: dummy_signature(),
            },
            add_funds_cid: None,
            publish_cid: None,
            client: random_peer(),
            state: StorageDealStatus::Transferring,
            piece_path: String::new(),
            metadata_path: String::new(),
            message: String::new(),
            data_ref: DataRef {
                transfer_type: crate::types::TT_GRAPHSYNC.to_string(),
                root: shared::testutil::random_cid(),
                piece_cid: None,
                piece_size: 0,
            },
            funds_reserved: TokenAmount::from_atto(0),
            available_for_retrieval: false,
            deal_id: 0,
            sector_number: 0,
            store_id: Some(4),
        }
    }

    #[test]
    fn miner_deal_migrates_with_defaults() {
        let db = MemoryDB::default();
        let old = v0_record();
        db.write("/deals/provider/a", old.marshal_cbor().unwrap())
            .unwrap();

        provider_migrations()
            .migrate(&db, "/deals/provider")
            .unwrap();

        let bz = db.read("/deals/provider/a").unwrap().unwrap();
        let new = MinerDeal::unmarshal_cbor(&bz).unwrap();
        assert_eq!(new.state, StorageDealStatus::Transferring);
        assert_eq!(new.transfer_channel_id, None);
        assert!(!new.fast_retrieval);
        assert_eq!(new.store_id, Some(4));
    }
}
