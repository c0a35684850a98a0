// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::types::DealStatus;
use cid::Cid;
use datatransfer::ChannelId;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;

/// Events accepted by the retrieval client machine.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Open,
    WriteDealProposalErrored { message: String },
    DealProposed { channel_id: ChannelId },
    DealRejected { message: String },
    DealNotFound { message: String },
    DealAccepted,
    UnknownResponseReceived { status: DealStatus },
    PaymentChannelErrored { message: String },
    PaymentChannelCreateInitiated { message_cid: Cid },
    PaymentChannelAddingFunds { message_cid: Cid, pay_ch: Address },
    PaymentChannelReady { pay_ch: Address },
    AllocateLaneErrored { message: String },
    LaneAllocated { lane: u64 },
    DataTransferError { message: String },
    LastPaymentRequested { payment_owed: TokenAmount },
    PaymentRequested { payment_owed: TokenAmount },
    UnsealPaymentRequested { payment_owed: TokenAmount },
    AllBlocksReceived,
    BlocksReceived { total_received: u64 },
    SendFunds,
    FundsExpended { shortfall: TokenAmount },
    BadPaymentRequested { message: String },
    CreateVoucherFailed { message: String },
    VoucherShortfall { shortfall: TokenAmount },
    WriteDealPaymentErrored { message: String },
    PaymentSent,
    Complete,
    CompleteVerified,
    EarlyTermination,
    CancelComplete,
    ProviderCancelled,
    Cancel,
    RecheckFunds,
}

/// Events accepted by the retrieval provider machine.
#[derive(Clone, Debug)]
pub enum ProviderEvent {
    Open,
    DealRejected { reason: String },
    DealNotFound { message: String },
    DealAccepted { piece_info: piecestore::PieceInfo },
    UnsealStarted,
    UnsealError { message: String },
    UnsealComplete,
    BeginSending,
    PaymentRequested { amount: TokenAmount },
    LastPaymentRequested { amount: TokenAmount },
    PaymentReceived { payment_channel: Address, voucher: crate::types::SignedVoucher },
    SaveVoucherFailed { message: String },
    PaymentProcessed { amount: TokenAmount },
    /// The voucher covered only part of what was owed; the remainder is
    /// still demanded.
    PartialPaymentProcessed { amount: TokenAmount },
    LastPaymentProcessed { amount: TokenAmount },
    BlocksSent { total_sent: u64 },
    AllBlocksSent,
    SendResponseFailed { message: String },
    Complete,
    Finalized,
    DataTransferErrored { message: String },
    ClientCancelled,
}
