// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Off-chain negotiation and payment tracking for retrieval deals.
//!
//! A client queries a provider for availability over the query protocol,
//! then proposes a retrieval as a voucher on a pull data-transfer channel.
//! Payment flows the other way: the provider charges for unsealing up
//! front and for data in intervals, the client answers each request with a
//! signed payment-channel voucher, and both sides track the exchange in
//! persistent state machines keyed by deal id.

mod askstore;
mod client;
mod clientstates;
mod events;
mod migrations;
mod network;
mod nodes;
mod provider;
mod providerstates;
#[cfg(any(test, feature = "test-utils"))]
pub mod testutil;
mod types;

pub use askstore::AskStore;
pub use client::{RetrievalClient, RetrieveParams};
pub use clientstates::{ClientDealEnvironment, ClientDealMachine};
pub use events::{ClientEvent, ProviderEvent};
pub use migrations::{client_migrations, provider_migrations};
pub use network::{
    NetworkError, Query, QueryResponse, RetrievalMarketNetwork, RetrievalQueryStream,
    RetrievalReceiver, OLD_QUERY_PROTOCOL_ID, QUERY_PROTOCOL_ID,
};
pub use nodes::{
    ChannelAvailableFunds, NodeError, RetrievalClientNode, RetrievalProviderNode, VoucherError,
};
pub use provider::{DealDecider, RetrievalProvider};
pub use providerstates::{ProviderDealEnvironment, ProviderDealMachine};
pub use types::{
    Ask, ClientDealState, DealId, DealPayment, DealProposal, DealResponse, DealStatus, Params,
    PaymentInfo, ProviderDealIdentifier, ProviderDealState, QueryItemStatus, QueryParams,
    QueryResponseStatus, RetrievalPeer, SignedVoucher, DEAL_PAYMENT_TYPE, DEAL_PROPOSAL_TYPE,
    DEAL_RESPONSE_TYPE, DEFAULT_PAYMENT_INTERVAL, DEFAULT_PAYMENT_INTERVAL_INCREASE,
};

/// Resolves which peers are known to hold a payload.
pub trait PeerResolver: Send + Sync {
    fn get_peers(&self, payload_cid: &cid::Cid) -> Result<Vec<RetrievalPeer>, String>;
}
