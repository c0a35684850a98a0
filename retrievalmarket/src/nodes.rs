// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Chain node interface of the retrieval market: payment channels on the
//! client side, unsealing and voucher redemption on the provider side.

use crate::types::SignedVoucher;
use async_trait::async_trait;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::sector::SectorNumber;
use shared::TipSetToken;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct NodeError(pub String);

impl NodeError {
    pub fn new(msg: impl Into<String>) -> Self {
        NodeError(msg.into())
    }
}

/// Failure creating a payment voucher.
#[derive(Debug, Error)]
pub enum VoucherError {
    /// The channel lacks funds; carries how much is missing.
    #[error("insufficient funds in payment channel, shortfall {0}")]
    Shortfall(TokenAmount),
    #[error("{0}")]
    Other(String),
}

/// Funds state of one payment channel.
#[derive(Clone, Debug, Default)]
pub struct ChannelAvailableFunds {
    /// Funds confirmed on chain.
    pub confirmed_amt: TokenAmount,
    /// Funds awaiting confirmation.
    pub pending_amt: TokenAmount,
    /// Message to wait on for the pending funds, when any are in flight.
    pub pending_wait_sentinel: Option<Cid>,
    /// Funds already redeemed by vouchers.
    pub voucher_redeemed_amt: TokenAmount,
}

#[async_trait]
pub trait RetrievalClientNode: Send + Sync {
    async fn get_chain_head(&self) -> Result<(TipSetToken, ChainEpoch), NodeError>;

    /// Ensures a payment channel from `client` to `miner` holds at least
    /// `funds`, creating it or topping it up. Returns the channel address
    /// when it already exists and the cid of any in-flight chain message.
    async fn get_or_create_payment_channel(
        &self,
        client: &Address,
        miner: &Address,
        funds: &TokenAmount,
    ) -> Result<(Option<Address>, Option<Cid>), NodeError>;

    /// Resolves with the channel address once the create or add-funds
    /// message lands.
    async fn wait_for_payment_channel_ready(&self, message_cid: &Cid)
        -> Result<Address, NodeError>;

    /// Allocates the next lane on the channel.
    async fn allocate_lane(&self, payment_channel: &Address) -> Result<u64, NodeError>;

    /// Creates and signs a voucher for the cumulative `amount` on `lane`.
    async fn create_payment_voucher(
        &self,
        payment_channel: &Address,
        amount: &TokenAmount,
        lane: u64,
    ) -> Result<SignedVoucher, VoucherError>;

    async fn check_available_funds(
        &self,
        payment_channel: &Address,
    ) -> Result<ChannelAvailableFunds, NodeError>;
}

#[async_trait]
pub trait RetrievalProviderNode: Send + Sync {
    async fn get_chain_head(&self) -> Result<(TipSetToken, ChainEpoch), NodeError>;

    async fn get_miner_worker_address(
        &self,
        miner: &Address,
        tok: &TipSetToken,
    ) -> Result<Address, NodeError>;

    /// Unseals the piece region holding the payload.
    async fn unseal_sector(
        &self,
        sector_id: SectorNumber,
        offset: PaddedPieceSize,
        length: PaddedPieceSize,
    ) -> Result<(), NodeError>;

    /// Stores a received voucher, returning the amount it adds on top of
    /// what previous vouchers already covered.
    async fn save_payment_voucher(
        &self,
        payment_channel: &Address,
        voucher: &SignedVoucher,
        expected: &TokenAmount,
    ) -> Result<TokenAmount, NodeError>;
}
