// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::types::StorageDealStatus;
use cid::Cid;
use datatransfer::ChannelId;
use filestore::Path;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::sector::SectorNumber;

/// Events accepted by the provider-side storage deal machine.
#[derive(Clone, Debug)]
pub enum ProviderEvent {
    Open,
    DealRejected { reason: String },
    RejectionSent,
    SendResponseFailed { message: String },
    DealDeciding,
    DataRequested,
    DataTransferInitiated { channel_id: ChannelId },
    DataTransferRestarted { channel_id: ChannelId },
    DataTransferRestartFailed { message: String },
    DataTransferCompleted,
    DataTransferFailed { message: String },
    VerifiedData { piece_path: Path, metadata_path: Path },
    DataVerificationFailed { message: String, piece_path: Path, metadata_path: Path },
    FundsReserved { amount: TokenAmount },
    FundsReleased { amount: TokenAmount },
    FundingInitiated { message_cid: Cid },
    Funded,
    NodeErrored { message: String },
    DealPublishInitiated { message_cid: Cid },
    DealPublished { deal_id: DealID },
    DealPublishError { message: String },
    FileStoreErrored { message: String },
    DealHandoffFailed { message: String },
    PieceStoreErrored { message: String },
    DealHandedOff,
    DealPrecommitFailed { message: String },
    DealPrecommitted { sector_number: SectorNumber },
    DealActivationFailed { message: String },
    DealActivated,
    Finalized,
    DealCompletionFailed { message: String },
    DealSlashed { epoch: ChainEpoch },
    DealExpired,
    Failed,
}

/// Events accepted by the client-side storage deal machine.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    Open,
    FundsReserved { amount: TokenAmount },
    FundsReleased { amount: TokenAmount },
    FundingInitiated { message_cid: Cid },
    EnsureFundsFailed { message: String },
    FundingComplete,
    WriteProposalFailed { message: String },
    ReadResponseFailed { message: String },
    ResponseVerificationFailed,
    ResponseDealDidNotMatch { received: Cid, expected: Cid },
    UnexpectedDealState { status: StorageDealStatus },
    DealProposed,
    DataTransferFailed { message: String },
    DataTransferInitiated { channel_id: ChannelId },
    DataTransferRestarted { channel_id: ChannelId },
    DataTransferRestartFailed { message: String },
    DataTransferComplete,
    DealAccepted { publish_message: Option<Cid> },
    DealRejected { reason: String },
    StatusRequestFailed { message: String },
    DealPublishFailed { message: String },
    DealPublished { deal_id: DealID },
    DealActivationFailed { message: String },
    DealActivated,
    DealCompletionFailed { message: String },
    DealSlashed { epoch: ChainEpoch },
    DealExpired,
    Failed,
}
