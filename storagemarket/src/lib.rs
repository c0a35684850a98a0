// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Off-chain negotiation and lifecycle coordination for storage deals.
//!
//! A client proposes a deal to a remote provider over a typed stream. Both
//! sides then track the deal in a persistent state machine: the provider
//! validates the proposal against its ask, stages the transferred payload,
//! reserves collateral, publishes the deal on chain and follows it through
//! sector activation to expiry; the client mirrors the flow from the other
//! side. External chain and data-transfer events are translated into machine
//! events by the adapters in [`provider`] and [`client`].

mod client;
mod clientstates;
mod events;
mod migrations;
mod network;
mod nodes;
mod provider;
mod providerstates;
mod providerutils;
mod storedask;
#[cfg(any(test, feature = "test-utils"))]
pub mod testutil;
mod types;

pub use client::{ProposeStorageDealParams, StorageClient};
pub use clientstates::{ClientDealEnvironment, ClientDealMachine};
pub use events::{ClientEvent, ProviderEvent};
pub use migrations::{client_migrations, provider_migrations};
pub use network::{
    framing, AskRequest, DealStatusRequest, DealStatusResponse, NetworkError, Proposal, Response,
    SignedResponse, StorageAskStream, StorageDealStatusStream, StorageDealStream,
    StorageMarketNetwork, StorageReceiver, ASK_PROTOCOL_ID, DEAL_PROTOCOL_ID,
    DEAL_STATUS_PROTOCOL_ID, OLD_ASK_PROTOCOL_ID, OLD_DEAL_PROTOCOL_ID,
    OLD_DEAL_STATUS_PROTOCOL_ID, TAG_PRIORITY,
};
pub use nodes::{
    DealCompletion, MessageReceipt, NodeError, PackingResult, PreCommitStatus, StorageClientNode,
    StorageCommon, StorageProviderNode,
};
pub use provider::{DealDecider, PieceIo, StorageProvider};
pub use providerstates::{ProviderDealEnvironment, ProviderDealMachine};
pub use providerutils::{load_block_locations, pad_reader, padded_size, BlockMetadata};
pub use storedask::{
    AskError, StoredAsk, DEFAULT_ASK_DURATION, DEFAULT_MAX_PIECE_SIZE, DEFAULT_MIN_PIECE_SIZE,
    DEFAULT_PRICE, DEFAULT_VERIFIED_PRICE,
};
pub use types::{
    deal_duration_bounds, Balance, ClientDeal, ClientDealProposal, DataRef, DealProposal,
    MinerDeal, PublishStorageDealsReturn, SignedStorageAsk, StorageAsk,
    StorageDataTransferVoucher, StorageDealStatus, StorageProviderInfo, EPOCHS_IN_DAY,
    TT_GRAPHSYNC, TT_MANUAL,
};

/// Maximum byte length of a deal label.
pub const DEAL_MAX_LABEL_SIZE: usize = 256;
