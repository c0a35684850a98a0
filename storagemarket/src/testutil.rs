// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! A configurable fake chain node for exercising the deal machines.

use crate::nodes::{
    DealCompletion, MessageReceipt, NodeError, PackingResult, PreCommitStatus, StorageClientNode,
    StorageCommon, StorageProviderNode,
};
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
use num_traits::Zero;
use parking_lot::Mutex;
use shared::TipSetToken;
use std::io::Read;

pub const TEST_TIPSET_TOKEN: &[u8] = &[1, 2, 3];

/// Fake node whose behavior is steered through public fields. The defaults
/// let a deal complete every handler without errors.
pub struct TestNode {
    pub height: ChainEpoch,
    pub chain_head_error: Option<String>,
    pub verify_signature_fails: bool,
    pub client_market_balance: TokenAmount,
    pub get_balance_error: Option<String>,
    pub data_cap: Option<BigInt>,
    pub get_data_cap_error: Option<String>,
    pub collateral_bounds: (TokenAmount, TokenAmount),
    pub miner_worker: Address,
    pub miner_worker_error: Option<String>,
    pub reserve_funds_cid: Option<Cid>,
    pub reserve_funds_error: Option<String>,
    pub release_funds_error: Option<String>,
    pub wait_for_message_error: Option<String>,
    pub wait_for_message_exit_code: ExitCode,
    pub wait_for_message_return: Vec<u8>,
    pub publish_deals_cid: Option<Cid>,
    pub publish_deals_error: Option<String>,
    pub on_deal_complete_error: Option<String>,
    pub packing_result: PackingResult,
    pub pre_commit_status: PreCommitStatus,
    pub pre_commit_error: Option<String>,
    pub sector_commit_error: Option<String>,
    pub deal_completion: DealCompletion,
    pub deal_completion_error: Option<String>,
    pub validate_published_deal_id: DealID,
    pub validate_published_error: Option<String>,

    pub reserved: Mutex<Vec<(Address, TokenAmount)>>,
    pub released: Mutex<Vec<(Address, TokenAmount)>>,
    pub waited_messages: Mutex<Vec<Cid>>,
    pub published: Mutex<Vec<Cid>>,
    pub handed_off_bytes: Mutex<u64>,
}

impl Default for TestNode {
    fn default() -> Self {
        TestNode {
            height: 50,
            chain_head_error: None,
            verify_signature_fails: false,
            client_market_balance: TokenAmount::from_atto(5_760_000_000u64),
            get_balance_error: None,
            data_cap: None,
            get_data_cap_error: None,
            collateral_bounds: (
                TokenAmount::zero(),
                TokenAmount::from_atto(BigInt::from(u64::MAX)),
            ),
            miner_worker: Address::new_id(99),
            miner_worker_error: None,
            reserve_funds_cid: None,
            reserve_funds_error: None,
            release_funds_error: None,
            wait_for_message_error: None,
            wait_for_message_exit_code: ExitCode::OK,
            wait_for_message_return: Vec::new(),
            publish_deals_cid: None,
            publish_deals_error: None,
            on_deal_complete_error: None,
            packing_result: PackingResult {
                sector_number: 42,
                offset: PaddedPieceSize(0),
                size: PaddedPieceSize(1 << 20),
            },
            pre_commit_status: PreCommitStatus::PreCommitted(42),
            pre_commit_error: None,
            sector_commit_error: None,
            deal_completion: DealCompletion::Expired,
            deal_completion_error: None,
            validate_published_deal_id: 1,
            validate_published_error: None,
            reserved: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            waited_messages: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            handed_off_bytes: Mutex::new(0),
        }
    }
}

fn fail<T>(error: &Option<String>) -> Result<(), NodeError> {
    match error {
        Some(msg) => Err(NodeError::new(msg.clone())),
        None => Ok(()),
    }
}

#[async_trait]
impl StorageCommon for TestNode {
    async fn get_chain_head(&self) -> Result<(TipSetToken, ChainEpoch), NodeError> {
        fail(&self.chain_head_error)?;
        Ok((TEST_TIPSET_TOKEN.to_vec(), self.height))
    }

    async fn verify_signature(
        &self,
        _signature: &Signature,
        _signer: &Address,
        _plaintext: &[u8],
        _tok: &TipSetToken,
    ) -> Result<bool, NodeError> {
        Ok(!self.verify_signature_fails)
    }

    async fn sign_bytes(&self, _signer: &Address, _data: &[u8]) -> Result<Signature, NodeError> {
        Ok(Signature::new_bls(vec![0u8; 96]))
    }

    async fn get_balance(&self, _addr: &Address, _tok: &TipSetToken) -> Result<Balance, NodeError> {
        fail(&self.get_balance_error)?;
        Ok(Balance {
            escrow: self.client_market_balance.clone(),
            locked: TokenAmount::zero(),
        })
    }

    async fn reserve_funds(
        &self,
        _wallet: &Address,
        addr: &Address,
        amount: &TokenAmount,
    ) -> Result<Option<Cid>, NodeError> {
        fail(&self.reserve_funds_error)?;
        self.reserved.lock().push((*addr, amount.clone()));
        Ok(self.reserve_funds_cid)
    }

    async fn release_funds(&self, addr: &Address, amount: &TokenAmount) -> Result<(), NodeError> {
        fail(&self.release_funds_error)?;
        self.released.lock().push((*addr, amount.clone()));
        Ok(())
    }

    async fn wait_for_message(&self, message_cid: &Cid) -> Result<MessageReceipt, NodeError> {
        self.waited_messages.lock().push(*message_cid);
        fail(&self.wait_for_message_error)?;
        Ok(MessageReceipt {
            exit_code: self.wait_for_message_exit_code,
            return_data: RawBytes::new(self.wait_for_message_return.clone()),
        })
    }
}

#[async_trait]
impl StorageProviderNode for TestNode {
    async fn get_miner_worker_address(
        &self,
        _miner: &Address,
        _tok: &TipSetToken,
    ) -> Result<Address, NodeError> {
        fail(&self.miner_worker_error)?;
        Ok(self.miner_worker)
    }

    async fn get_data_cap(
        &self,
        _addr: &Address,
        _tok: &TipSetToken,
    ) -> Result<Option<BigInt>, NodeError> {
        fail(&self.get_data_cap_error)?;
        Ok(self.data_cap.clone())
    }

    async fn deal_provider_collateral_bounds(
        &self,
        _size: PaddedPieceSize,
        _verified: bool,
    ) -> Result<(TokenAmount, TokenAmount), NodeError> {
        Ok(self.collateral_bounds.clone())
    }

    async fn publish_deals(&self, deal: &MinerDeal) -> Result<Cid, NodeError> {
        fail(&self.publish_deals_error)?;
        self.published.lock().push(deal.proposal_cid);
        Ok(self
            .publish_deals_cid
            .unwrap_or_else(|| shared::testutil::random_cid()))
    }

    async fn on_deal_complete(
        &self,
        _deal: &MinerDeal,
        piece_size: UnpaddedPieceSize,
        mut piece_data: Box<dyn Read + Send>,
    ) -> Result<PackingResult, NodeError> {
        fail(&self.on_deal_complete_error)?;
        let mut sink = Vec::new();
        piece_data
            .read_to_end(&mut sink)
            .map_err(|e| NodeError::new(e.to_string()))?;
        if sink.len() as u64 != piece_size.0 {
            return Err(NodeError::new(format!(
                "piece data length {} does not match declared size {}",
                sink.len(),
                piece_size.0
            )));
        }
        *self.handed_off_bytes.lock() = sink.len() as u64;
        Ok(self.packing_result.clone())
    }

    async fn wait_for_deal_sector_pre_commit(
        &self,
        _provider: &Address,
        _deal_id: DealID,
    ) -> Result<PreCommitStatus, NodeError> {
        fail(&self.pre_commit_error)?;
        Ok(self.pre_commit_status.clone())
    }

    async fn wait_for_deal_sector_commit(
        &self,
        _provider: &Address,
        _deal_id: DealID,
        _sector_number: SectorNumber,
    ) -> Result<(), NodeError> {
        fail(&self.sector_commit_error)
    }

    async fn wait_for_deal_completion(
        &self,
        _deal_id: DealID,
    ) -> Result<DealCompletion, NodeError> {
        fail(&self.deal_completion_error)?;
        Ok(self.deal_completion.clone())
    }
}

#[async_trait]
impl StorageClientNode for TestNode {
    async fn validate_published_deal(&self, _deal: &ClientDeal) -> Result<DealID, NodeError> {
        fail(&self.validate_published_error)?;
        Ok(self.validate_published_deal_id)
    }

    async fn wait_for_deal_sector_commit(
        &self,
        _provider: &Address,
        _deal_id: DealID,
    ) -> Result<(), NodeError> {
        fail(&self.sector_commit_error)
    }

    async fn wait_for_deal_completion(
        &self,
        _deal_id: DealID,
    ) -> Result<DealCompletion, NodeError> {
        fail(&self.deal_completion_error)?;
        Ok(self.deal_completion.clone())
    }
}
