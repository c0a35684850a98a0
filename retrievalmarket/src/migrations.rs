// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Retrieval deal schema migrations. Version 0 records predate the
//! protocol split: they carry no legacy flag and are marked legacy on
//! upgrade.

use crate::types::{
    ClientDealState, DealPayment, DealProposal, DealStatus, PaymentInfo, ProviderDealState,
};
use cid::Cid;
use datatransfer::ChannelId;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::Cbor;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use libp2p_identity::PeerId;
use shared::peer_ser;
use statemachine::{Error, Migrations};

#[derive(Serialize_tuple, Deserialize_tuple)]
struct ClientDealStateV0 {
    proposal: DealProposal,
    status: DealStatus,
    #[serde(with = "peer_ser")]
    sender: PeerId,
    client_wallet: Address,
    miner_wallet: Address,
    total_funds: TokenAmount,
    payment_info: Option<PaymentInfo>,
    total_received: u64,
    message: String,
    bytes_paid_for: u64,
    current_interval: u64,
    payment_requested: TokenAmount,
    funds_spent: TokenAmount,
    unseal_funds_paid: TokenAmount,
    wait_msg_cid: Option<Cid>,
    all_blocks_received: bool,
    last_payment_requested: bool,
    channel_id: Option<ChannelId>,
    store_id: Option<u64>,
}

impl Cbor for ClientDealStateV0 {}

#[derive(Serialize_tuple, Deserialize_tuple)]
struct ProviderDealStateV0 {
    proposal: DealProposal,
    status: DealStatus,
    #[serde(with = "peer_ser")]
    receiver: PeerId,
    channel_id: Option<ChannelId>,
    piece_info: Option<piecestore::PieceInfo>,
    total_sent: u64,
    funds_received: TokenAmount,
    payment_owed: TokenAmount,
    pending_payment: Option<DealPayment>,
    message: String,
    current_interval: u64,
    all_blocks_sent: bool,
}

impl Cbor for ProviderDealStateV0 {}

fn client_deal_v0_to_v1(bz: &[u8]) -> Result<Vec<u8>, Error> {
    let old = ClientDealStateV0::unmarshal_cbor(bz)?;
    let new = ClientDealState {
        proposal: old.proposal,
        status: old.status,
        sender: old.sender,
        client_wallet: old.client_wallet,
        miner_wallet: old.miner_wallet,
        total_funds: old.total_funds,
        payment_info: old.payment_info,
        total_received: old.total_received,
        message: old.message,
        bytes_paid_for: old.bytes_paid_for,
        current_interval: old.current_interval,
        payment_requested: old.payment_requested,
        funds_spent: old.funds_spent,
        unseal_funds_paid: old.unseal_funds_paid,
        wait_msg_cid: old.wait_msg_cid,
        all_blocks_received: old.all_blocks_received,
        last_payment_requested: old.last_payment_requested,
        channel_id: old.channel_id,
        legacy_protocol: true,
        store_id: old.store_id,
    };
    Ok(new.marshal_cbor()?)
}

fn provider_deal_v0_to_v1(bz: &[u8]) -> Result<Vec<u8>, Error> {
    let old = ProviderDealStateV0::unmarshal_cbor(bz)?;
    let new = ProviderDealState {
        proposal: old.proposal,
        status: old.status,
        receiver: old.receiver,
        channel_id: old.channel_id,
        piece_info: old.piece_info,
        total_sent: old.total_sent,
        funds_received: old.funds_received,
        payment_owed: old.payment_owed,
        pending_payment: old.pending_payment,
        message: old.message,
        current_interval: old.current_interval,
        all_blocks_sent: old.all_blocks_sent,
        legacy_protocol: true,
    };
    Ok(new.marshal_cbor()?)
}

/// Migrations for the retrieval client namespace.
pub fn client_migrations() -> Migrations {
    Migrations::new(vec![client_deal_v0_to_v1])
}

/// Migrations for the retrieval provider namespace.
pub fn provider_migrations() -> Migrations {
    Migrations::new(vec![provider_deal_v0_to_v1])
}
