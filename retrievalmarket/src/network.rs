// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Query protocol of the retrieval market. Deal negotiation itself rides
//! the data-transfer channel as vouchers; only availability queries use a
//! dedicated stream.

use crate::types::{QueryItemStatus, QueryParams, QueryResponseStatus};
use async_trait::async_trait;
use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::Cbor;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use libp2p_identity::PeerId;
use std::sync::Arc;
use thiserror::Error;

pub const QUERY_PROTOCOL_ID: &str = "/fil/retrieval/qry/1.0.0";
pub const OLD_QUERY_PROTOCOL_ID: &str = "/fil/retrieval/qry/0.0.1";

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("stream closed by remote")]
    StreamClosed,
    #[error("encoding message: {0}")]
    Encoding(String),
    #[error("{0}")]
    Other(String),
}

impl From<fvm_ipld_encoding::Error> for NetworkError {
    fn from(e: fvm_ipld_encoding::Error) -> Self {
        NetworkError::Encoding(e.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct Query {
    pub payload_cid: Cid,
    pub params: QueryParams,
}

impl Cbor for Query {}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct QueryResponse {
    pub status: QueryResponseStatus,
    pub piece_cid_found: QueryItemStatus,
    /// Size of the retrievable payload in bytes.
    pub size: u64,
    pub payment_address: Address,
    pub min_price_per_byte: TokenAmount,
    pub max_payment_interval: u64,
    pub max_payment_interval_increase: u64,
    pub message: String,
    pub unseal_price: TokenAmount,
}

impl Cbor for QueryResponse {}

impl QueryResponse {
    /// Total price to retrieve the whole queried payload.
    pub fn min_total_price(&self) -> TokenAmount {
        TokenAmount::from_atto(
            self.min_price_per_byte.atto() * self.size + self.unseal_price.atto(),
        )
    }
}

/// One open stream on the query protocol.
#[async_trait]
pub trait RetrievalQueryStream: Send {
    async fn read_query(&mut self) -> Result<Query, NetworkError>;
    async fn write_query(&mut self, query: Query) -> Result<(), NetworkError>;
    async fn read_query_response(&mut self) -> Result<QueryResponse, NetworkError>;
    async fn write_query_response(&mut self, response: QueryResponse)
        -> Result<(), NetworkError>;
    fn remote_peer(&self) -> PeerId;
    async fn close(&mut self) -> Result<(), NetworkError>;
}

/// Inbound query handler, implemented by the provider.
#[async_trait]
pub trait RetrievalReceiver: Send + Sync {
    async fn handle_query_stream(&self, stream: Box<dyn RetrievalQueryStream>);
}

/// The peer-to-peer transport as the retrieval market sees it.
#[async_trait]
pub trait RetrievalMarketNetwork: Send + Sync {
    async fn new_query_stream(
        &self,
        peer: PeerId,
    ) -> Result<Box<dyn RetrievalQueryStream>, NetworkError>;
    async fn set_delegate(&self, receiver: Arc<dyn RetrievalReceiver>) -> Result<(), NetworkError>;
    async fn stop_handling_requests(&self) -> Result<(), NetworkError>;
    fn id(&self) -> PeerId;
}
