// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Configurable fake nodes for exercising the retrieval machines.

use crate::nodes::{
    ChannelAvailableFunds, NodeError, RetrievalClientNode, RetrievalProviderNode, VoucherError,
};
use crate::types::SignedVoucher;
use async_trait::async_trait;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::sector::SectorNumber;
use num_traits::Zero;
use parking_lot::Mutex;
use shared::TipSetToken;

pub fn make_voucher(lane: u64, nonce: u64, amount: TokenAmount) -> SignedVoucher {
    SignedVoucher {
        time_lock_min: 0,
        time_lock_max: 0,
        secret_pre_image: Vec::new(),
        lane,
        nonce,
        amount,
        min_settle_height: 0,
        signature: None,
    }
}

/// Fake client-side node; defaults set up an existing funded channel.
pub struct TestClientNode {
    pub payment_channel: Address,
    /// Channel address returned immediately, no message to wait on.
    pub channel_ready: bool,
    pub create_message: Option<Cid>,
    pub lane: u64,
    pub voucher_shortfall: Mutex<Option<TokenAmount>>,
    pub available_funds: Mutex<ChannelAvailableFunds>,
    pub check_funds_error: Option<String>,

    pub vouchers_created: Mutex<Vec<(Address, TokenAmount, u64)>>,
    next_nonce: Mutex<u64>,
}

impl Default for TestClientNode {
    fn default() -> Self {
        TestClientNode {
            payment_channel: Address::new_id(777),
            channel_ready: true,
            create_message: None,
            lane: 5,
            voucher_shortfall: Mutex::new(None),
            available_funds: Mutex::new(ChannelAvailableFunds {
                confirmed_amt: TokenAmount::from_atto(u64::MAX),
                pending_amt: TokenAmount::zero(),
                pending_wait_sentinel: None,
                voucher_redeemed_amt: TokenAmount::zero(),
            }),
            check_funds_error: None,
            vouchers_created: Mutex::new(Vec::new()),
            next_nonce: Mutex::new(0),
        }
    }
}

#[async_trait]
impl RetrievalClientNode for TestClientNode {
    async fn get_chain_head(&self) -> Result<(TipSetToken, ChainEpoch), NodeError> {
        Ok((vec![1, 2, 3], 50))
    }

    async fn get_or_create_payment_channel(
        &self,
        _client: &Address,
        _miner: &Address,
        _funds: &TokenAmount,
    ) -> Result<(Option<Address>, Option<Cid>), NodeError> {
        if self.channel_ready {
            Ok((Some(self.payment_channel), None))
        } else {
            Ok((None, self.create_message))
        }
    }

    async fn wait_for_payment_channel_ready(
        &self,
        _message_cid: &Cid,
    ) -> Result<Address, NodeError> {
        Ok(self.payment_channel)
    }

    async fn allocate_lane(&self, _payment_channel: &Address) -> Result<u64, NodeError> {
        Ok(self.lane)
    }

    async fn create_payment_voucher(
        &self,
        payment_channel: &Address,
        amount: &TokenAmount,
        lane: u64,
    ) -> Result<SignedVoucher, VoucherError> {
        if let Some(shortfall) = self.voucher_shortfall.lock().clone() {
            return Err(VoucherError::Shortfall(shortfall));
        }
        self.vouchers_created
            .lock()
            .push((*payment_channel, amount.clone(), lane));
        let mut nonce = self.next_nonce.lock();
        *nonce += 1;
        Ok(make_voucher(lane, *nonce, amount.clone()))
    }

    async fn check_available_funds(
        &self,
        _payment_channel: &Address,
    ) -> Result<ChannelAvailableFunds, NodeError> {
        match &self.check_funds_error {
            Some(e) => Err(NodeError::new(e.clone())),
            None => Ok(self.available_funds.lock().clone()),
        }
    }
}

/// Fake provider-side node.
pub struct TestProviderNode {
    pub unseal_error: Option<String>,
    pub save_voucher_error: Option<String>,
    /// Override for the amount a saved voucher adds; defaults to what was
    /// expected.
    pub voucher_amount_received: Option<TokenAmount>,

    pub unsealed: Mutex<Vec<(SectorNumber, PaddedPieceSize, PaddedPieceSize)>>,
    pub vouchers_saved: Mutex<Vec<(Address, SignedVoucher)>>,
}

impl Default for TestProviderNode {
    fn default() -> Self {
        TestProviderNode {
            unseal_error: None,
            save_voucher_error: None,
            voucher_amount_received: None,
            unsealed: Mutex::new(Vec::new()),
            vouchers_saved: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RetrievalProviderNode for TestProviderNode {
    async fn get_chain_head(&self) -> Result<(TipSetToken, ChainEpoch), NodeError> {
        Ok((vec![1, 2, 3], 50))
    }

    async fn get_miner_worker_address(
        &self,
        _miner: &Address,
        _tok: &TipSetToken,
    ) -> Result<Address, NodeError> {
        Ok(Address::new_id(99))
    }

    async fn unseal_sector(
        &self,
        sector_id: SectorNumber,
        offset: PaddedPieceSize,
        length: PaddedPieceSize,
    ) -> Result<(), NodeError> {
        if let Some(e) = &self.unseal_error {
            return Err(NodeError::new(e.clone()));
        }
        self.unsealed.lock().push((sector_id, offset, length));
        Ok(())
    }

    async fn save_payment_voucher(
        &self,
        payment_channel: &Address,
        voucher: &SignedVoucher,
        expected: &TokenAmount,
    ) -> Result<TokenAmount, NodeError> {
        if let Some(e) = &self.save_voucher_error {
            return Err(NodeError::new(e.clone()));
        }
        self.vouchers_saved
            .lock()
            .push((*payment_channel, voucher.clone()));
        Ok(self
            .voucher_amount_received
            .clone()
            .unwrap_or_else(|| expected.clone()))
    }
}
