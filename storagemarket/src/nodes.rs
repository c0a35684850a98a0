// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Interface of the chain node backing a market participant. Signatures,
//! balances and message execution are all opaque operations behind these
//! traits; the deal machines only consume their results.

use crate::types::{Balance, ClientDeal, MinerDeal};
use async_trait::async_trait;
use cid::Cid;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::address::Address;
use fvm_shared::bigint::BigInt;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::error::ExitCode;
use fvm_shared::piece::{PaddedPieceSize, UnpaddedPieceSize};
use fvm_shared::sector::SectorNumber;
use shared::TipSetToken;
use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct NodeError(pub String);

impl NodeError {
    pub fn new(msg: impl Into<String>) -> Self {
        NodeError(msg.into())
    }
}

/// Result of a chain message the machine waited on.
#[derive(Clone, Debug)]
pub struct MessageReceipt {
    pub exit_code: ExitCode,
    pub return_data: RawBytes,
}

/// Terminal outcome of a published deal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DealCompletion {
    Expired,
    Slashed(ChainEpoch),
}

/// Outcome of waiting for the deal's sector to be pre-committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PreCommitStatus {
    PreCommitted(SectorNumber),
    /// The pre-commit was missed (or the node restarted late) and the deal
    /// is already active.
    AlreadyActive,
}

/// Where the piece landed in a sector after handoff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackingResult {
    pub sector_number: SectorNumber,
    pub offset: PaddedPieceSize,
    pub size: PaddedPieceSize,
}

/// Node operations shared by both sides of the storage market.
#[async_trait]
pub trait StorageCommon: Send + Sync {
    async fn get_chain_head(&self) -> Result<(TipSetToken, ChainEpoch), NodeError>;

    async fn verify_signature(
        &self,
        signature: &Signature,
        signer: &Address,
        plaintext: &[u8],
        tok: &TipSetToken,
    ) -> Result<bool, NodeError>;

    async fn sign_bytes(&self, signer: &Address, data: &[u8]) -> Result<Signature, NodeError>;

    async fn get_balance(&self, addr: &Address, tok: &TipSetToken) -> Result<Balance, NodeError>;

    /// Ensures `amount` is reserved in the market escrow for `addr`, paying
    /// from `wallet` if a top-up is needed. Returns the cid of the add-funds
    /// message when one was sent, `None` when the reservation was already
    /// satisfied.
    async fn reserve_funds(
        &self,
        wallet: &Address,
        addr: &Address,
        amount: &TokenAmount,
    ) -> Result<Option<Cid>, NodeError>;

    /// Returns previously reserved funds. Idempotent.
    async fn release_funds(&self, addr: &Address, amount: &TokenAmount) -> Result<(), NodeError>;

    /// Resolves once the message lands on chain, with its receipt.
    async fn wait_for_message(&self, message_cid: &Cid) -> Result<MessageReceipt, NodeError>;
}

/// Node operations only the provider side needs.
#[async_trait]
pub trait StorageProviderNode: StorageCommon {
    async fn get_miner_worker_address(
        &self,
        miner: &Address,
        tok: &TipSetToken,
    ) -> Result<Address, NodeError>;

    /// Remaining verified-deal quota of a client, `None` if the client is
    /// not verified.
    async fn get_data_cap(
        &self,
        addr: &Address,
        tok: &TipSetToken,
    ) -> Result<Option<BigInt>, NodeError>;

    async fn deal_provider_collateral_bounds(
        &self,
        size: PaddedPieceSize,
        verified: bool,
    ) -> Result<(TokenAmount, TokenAmount), NodeError>;

    /// Sends the on-chain publish message for the deal.
    async fn publish_deals(&self, deal: &MinerDeal) -> Result<Cid, NodeError>;

    /// Hands the padded piece over for sealing.
    async fn on_deal_complete(
        &self,
        deal: &MinerDeal,
        piece_size: UnpaddedPieceSize,
        piece_data: Box<dyn Read + Send>,
    ) -> Result<PackingResult, NodeError>;

    async fn wait_for_deal_sector_pre_commit(
        &self,
        provider: &Address,
        deal_id: DealID,
    ) -> Result<PreCommitStatus, NodeError>;

    async fn wait_for_deal_sector_commit(
        &self,
        provider: &Address,
        deal_id: DealID,
        sector_number: SectorNumber,
    ) -> Result<(), NodeError>;

    async fn wait_for_deal_completion(&self, deal_id: DealID)
        -> Result<DealCompletion, NodeError>;
}

/// Node operations only the client side needs.
#[async_trait]
pub trait StorageClientNode: StorageCommon {
    /// Checks the provider's publish message and returns the deal id it
    /// allocated for this proposal.
    async fn validate_published_deal(&self, deal: &ClientDeal) -> Result<DealID, NodeError>;

    async fn wait_for_deal_sector_commit(
        &self,
        provider: &Address,
        deal_id: DealID,
    ) -> Result<(), NodeError>;

    async fn wait_for_deal_completion(&self, deal_id: DealID)
        -> Result<DealCompletion, NodeError>;
}
