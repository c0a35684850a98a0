// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use datatransfer::ChannelId;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::{strict_bytes, Cbor, RawBytes};
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::econ::TokenAmount;
use libp2p_identity::PeerId;
use serde_repr::{Deserialize_repr, Serialize_repr};
use shared::peer_ser;
use std::fmt;

/// Locally assigned identifier for one retrieval deal, unique per client.
pub type DealId = u64;

/// Voucher type identifiers on the data-transfer channel.
pub const DEAL_PROPOSAL_TYPE: &str = "RetrievalDealProposal/1";
pub const DEAL_PAYMENT_TYPE: &str = "RetrievalDealPayment/1";
pub const DEAL_RESPONSE_TYPE: &str = "RetrievalDealResponse/1";

pub const DEFAULT_PAYMENT_INTERVAL: u64 = 1 << 20;
pub const DEFAULT_PAYMENT_INTERVAL_INCREASE: u64 = 1 << 20;

/// Lifecycle states shared by both sides of a retrieval deal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u64)]
pub enum DealStatus {
    New = 0,
    RetryLegacy,
    WaitForAcceptance,
    WaitForAcceptanceLegacy,
    Accepted,
    PaymentChannelCreating,
    PaymentChannelAddingFunds,
    PaymentChannelAllocatingLane,
    Ongoing,
    FundsNeeded,
    FundsNeededLastPayment,
    SendFunds,
    SendFundsLastPayment,
    CheckFunds,
    InsufficientFunds,
    BlocksComplete,
    Finalizing,
    CheckComplete,
    Failing,
    Completed,
    Errored,
    Rejected,
    Cancelling,
    Cancelled,
    DealNotFound,
    // provider-side states
    DealReceived,
    Unsealing,
    Unsealed,
    FundsNeededUnseal,
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DealStatus{:?}", self)
    }
}

/// Negotiated pricing and pacing for one retrieval.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct Params {
    /// Serialized selector narrowing the payload, all blocks when unset.
    pub selector: Option<RawBytes>,
    pub piece_cid: Option<Cid>,
    pub price_per_byte: TokenAmount,
    /// Bytes the provider sends before demanding payment.
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
    pub unseal_price: TokenAmount,
}

impl Cbor for Params {}

impl Params {
    /// Total charge for `bytes` of payload plus unsealing.
    pub fn total_payment(&self, bytes: u64) -> TokenAmount {
        TokenAmount::from_atto(
            self.price_per_byte.atto() * bytes + self.unseal_price.atto(),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealProposal {
    pub payload_cid: Cid,
    pub id: DealId,
    pub params: Params,
}

impl Cbor for DealProposal {}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealResponse {
    pub status: DealStatus,
    pub id: DealId,
    pub payment_owed: TokenAmount,
    pub message: String,
}

impl Cbor for DealResponse {}

/// A signed payment-channel voucher, redeemable by the provider against a
/// lane of the channel.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct SignedVoucher {
    /// Min epoch before which the voucher cannot be redeemed.
    pub time_lock_min: ChainEpoch,
    /// Max epoch beyond which the voucher cannot be redeemed, 0 for none.
    pub time_lock_max: ChainEpoch,
    #[serde(with = "strict_bytes")]
    pub secret_pre_image: Vec<u8>,
    /// Lane the voucher redeems into.
    pub lane: u64,
    /// Prevents redemption of stale vouchers on a lane.
    pub nonce: u64,
    /// Cumulative amount redeemable on the lane.
    pub amount: TokenAmount,
    pub min_settle_height: ChainEpoch,
    pub signature: Option<Signature>,
}

impl Cbor for SignedVoucher {}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealPayment {
    pub id: DealId,
    pub payment_channel: Address,
    pub payment_voucher: SignedVoucher,
}

impl Cbor for DealPayment {}

/// The channel and lane a deal pays through.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct PaymentInfo {
    pub pay_ch: Address,
    pub lane: u64,
}

impl Cbor for PaymentInfo {}

/// A provider known to hold a payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrievalPeer {
    pub address: Address,
    pub id: PeerId,
}

/// Client-side runtime record of one retrieval deal.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct ClientDealState {
    pub proposal: DealProposal,
    pub status: DealStatus,
    #[serde(with = "peer_ser")]
    pub sender: PeerId,
    pub client_wallet: Address,
    pub miner_wallet: Address,
    /// Upper bound the client is willing to spend on this retrieval.
    pub total_funds: TokenAmount,
    pub payment_info: Option<PaymentInfo>,
    pub total_received: u64,
    pub message: String,
    pub bytes_paid_for: u64,
    pub current_interval: u64,
    pub payment_requested: TokenAmount,
    pub funds_spent: TokenAmount,
    pub unseal_funds_paid: TokenAmount,
    /// Chain message being waited on during channel setup.
    pub wait_msg_cid: Option<Cid>,
    pub all_blocks_received: bool,
    pub last_payment_requested: bool,
    pub channel_id: Option<ChannelId>,
    pub legacy_protocol: bool,
    pub store_id: Option<u64>,
}

impl Cbor for ClientDealState {}

impl ClientDealState {
    pub fn params(&self) -> &Params {
        &self.proposal.params
    }
}

/// Identifies a provider-side deal: retrieval deal ids are only unique per
/// client.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProviderDealIdentifier {
    pub receiver: PeerId,
    pub deal_id: DealId,
}

impl fmt::Display for ProviderDealIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.receiver, self.deal_id)
    }
}

/// Provider-side runtime record of one retrieval deal.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct ProviderDealState {
    pub proposal: DealProposal,
    pub status: DealStatus,
    #[serde(with = "peer_ser")]
    pub receiver: PeerId,
    pub channel_id: Option<ChannelId>,
    /// Piece holding the payload, resolved on admission.
    pub piece_info: Option<piecestore::PieceInfo>,
    pub total_sent: u64,
    pub funds_received: TokenAmount,
    pub payment_owed: TokenAmount,
    /// Voucher received but not yet redeemed.
    pub pending_payment: Option<DealPayment>,
    pub message: String,
    pub current_interval: u64,
    pub all_blocks_sent: bool,
    pub legacy_protocol: bool,
}

impl Cbor for ProviderDealState {}

impl ProviderDealState {
    pub fn identifier(&self) -> ProviderDealIdentifier {
        ProviderDealIdentifier {
            receiver: self.receiver,
            deal_id: self.proposal.id,
        }
    }

    pub fn params(&self) -> &Params {
        &self.proposal.params
    }
}

/// The provider's advertised retrieval pricing.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct Ask {
    pub price_per_byte: TokenAmount,
    pub unseal_price: TokenAmount,
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
}

impl Cbor for Ask {}

impl Default for Ask {
    fn default() -> Self {
        Ask {
            price_per_byte: TokenAmount::from_atto(0),
            unseal_price: TokenAmount::from_atto(0),
            payment_interval: DEFAULT_PAYMENT_INTERVAL,
            payment_interval_increase: DEFAULT_PAYMENT_INTERVAL_INCREASE,
        }
    }
}

/// Availability answer on the query protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u64)]
pub enum QueryResponseStatus {
    Available = 0,
    Unavailable,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u64)]
pub enum QueryItemStatus {
    Available = 0,
    Unavailable,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct QueryParams {
    /// Restricts the query to one piece when the payload appears in many.
    pub piece_cid: Option<Cid>,
}

impl Cbor for QueryParams {}
