// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Wire surface of the storage market: the typed messages exchanged on the
//! ask, deal and deal-status protocols, and the traits a transport has to
//! provide. Messages travel as varint-length-delimited CBOR frames.

use crate::types::{SignedStorageAsk, StorageDealStatus};
use crate::types::{ClientDealProposal, DataRef};
use async_trait::async_trait;
use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::Cbor;
use fvm_shared::address::Address;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use libp2p_identity::PeerId;
use std::sync::Arc;
use thiserror::Error;

pub const DEAL_PROTOCOL_ID: &str = "/fil/storage/mk/1.1.0";
pub const OLD_DEAL_PROTOCOL_ID: &str = "/fil/storage/mk/1.0.1";
pub const ASK_PROTOCOL_ID: &str = "/fil/storage/ask/1.1.0";
pub const OLD_ASK_PROTOCOL_ID: &str = "/fil/storage/ask/1.0.1";
pub const DEAL_STATUS_PROTOCOL_ID: &str = "/fil/storage/status/1.1.0";
pub const OLD_DEAL_STATUS_PROTOCOL_ID: &str = "/fil/storage/status/1.0.1";

/// Connection-manager priority for deal streams; they should generally be
/// preserved above all else.
pub const TAG_PRIORITY: u32 = 100;

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
pub struct AskRequest {
    pub miner: Address,
}

impl Cbor for AskRequest {}

/// An inbound deal negotiation: the signed terms plus how the payload will
/// arrive.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct Proposal {
    pub deal_proposal: ClientDealProposal,
    pub piece: DataRef,
    pub fast_retrieval: bool,
}

impl Cbor for Proposal {}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct Response {
    pub state: StorageDealStatus,
    /// Rejection reason, if any.
    pub message: String,
    pub proposal: Cid,
    /// Cid of the publish message, sent once the deal reaches publishing.
    pub publish_message: Option<Cid>,
}

impl Cbor for Response {}

/// A response signed by the provider's worker key. The client checks the
/// signature over the CBOR of `response` before acting on it.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct SignedResponse {
    pub response: Response,
    pub signature: Signature,
}

impl Cbor for SignedResponse {}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealStatusRequest {
    pub proposal: Cid,
    pub signature: Signature,
}

impl Cbor for DealStatusRequest {}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealStatusResponse {
    pub state: StorageDealStatus,
    pub message: String,
    pub proposal_cid: Cid,
    pub publish_cid: Option<Cid>,
    pub deal_id: DealID,
    pub signature: Signature,
}

impl Cbor for DealStatusResponse {}

/// One open negotiation stream on the deal protocol.
#[async_trait]
pub trait StorageDealStream: Send {
    async fn read_deal_proposal(&mut self) -> Result<Proposal, NetworkError>;
    async fn write_deal_proposal(&mut self, proposal: Proposal) -> Result<(), NetworkError>;
    /// Reads a signed response along with the raw response bytes the
    /// signature covers.
    async fn read_deal_response(&mut self) -> Result<(SignedResponse, Vec<u8>), NetworkError>;
    async fn write_deal_response(&mut self, response: SignedResponse) -> Result<(), NetworkError>;
    fn remote_peer(&self) -> PeerId;
    async fn close(&mut self) -> Result<(), NetworkError>;
}

/// One open stream on the ask protocol.
#[async_trait]
pub trait StorageAskStream: Send {
    async fn read_ask_request(&mut self) -> Result<AskRequest, NetworkError>;
    async fn write_ask_request(&mut self, request: AskRequest) -> Result<(), NetworkError>;
    async fn read_ask_response(&mut self) -> Result<SignedStorageAsk, NetworkError>;
    async fn write_ask_response(&mut self, response: SignedStorageAsk) -> Result<(), NetworkError>;
    fn remote_peer(&self) -> PeerId;
    async fn close(&mut self) -> Result<(), NetworkError>;
}

/// One open stream on the deal status protocol.
#[async_trait]
pub trait StorageDealStatusStream: Send {
    async fn read_deal_status_request(&mut self) -> Result<DealStatusRequest, NetworkError>;
    async fn write_deal_status_request(
        &mut self,
        request: DealStatusRequest,
    ) -> Result<(), NetworkError>;
    async fn read_deal_status_response(&mut self) -> Result<DealStatusResponse, NetworkError>;
    async fn write_deal_status_response(
        &mut self,
        response: DealStatusResponse,
    ) -> Result<(), NetworkError>;
    fn remote_peer(&self) -> PeerId;
    async fn close(&mut self) -> Result<(), NetworkError>;
}

/// Inbound stream handlers, implemented by the provider.
#[async_trait]
pub trait StorageReceiver: Send + Sync {
    async fn handle_ask_stream(&self, stream: Box<dyn StorageAskStream>);
    async fn handle_deal_stream(&self, stream: Box<dyn StorageDealStream>);
    async fn handle_deal_status_stream(&self, stream: Box<dyn StorageDealStatusStream>);
}

/// The peer-to-peer transport as the market sees it.
#[async_trait]
pub trait StorageMarketNetwork: Send + Sync {
    async fn new_ask_stream(&self, peer: PeerId)
        -> Result<Box<dyn StorageAskStream>, NetworkError>;
    async fn new_deal_stream(
        &self,
        peer: PeerId,
    ) -> Result<Box<dyn StorageDealStream>, NetworkError>;
    async fn new_deal_status_stream(
        &self,
        peer: PeerId,
    ) -> Result<Box<dyn StorageDealStatusStream>, NetworkError>;
    async fn set_delegate(&self, receiver: Arc<dyn StorageReceiver>) -> Result<(), NetworkError>;
    async fn stop_handling_requests(&self) -> Result<(), NetworkError>;
    fn id(&self) -> PeerId;
    /// Pins the connection to `peer` in the connection manager under `tag`
    /// at [`TAG_PRIORITY`].
    fn tag_peer(&self, peer: PeerId, tag: &str);
    fn untag_peer(&self, peer: PeerId, tag: &str);
}

/// Length-delimited CBOR framing shared by stream implementations.
pub mod framing {
    use super::NetworkError;
    use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
    use fvm_ipld_encoding::Cbor;

    const MAX_FRAME_SIZE: u64 = 4 << 20;

    pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), NetworkError>
    where
        W: AsyncWrite + Unpin + Send,
        T: Cbor,
    {
        let bz = message.marshal_cbor()?;
        let mut len_buf = unsigned_varint::encode::u64_buffer();
        let len = unsigned_varint::encode::u64(bz.len() as u64, &mut len_buf);
        writer
            .write_all(len)
            .await
            .map_err(|e| NetworkError::Other(e.to_string()))?;
        writer
            .write_all(&bz)
            .await
            .map_err(|e| NetworkError::Other(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| NetworkError::Other(e.to_string()))?;
        Ok(())
    }

    /// Reads one frame, returning the decoded message and its raw bytes.
    pub async fn read_frame<R, T>(reader: &mut R) -> Result<(T, Vec<u8>), NetworkError>
    where
        R: AsyncRead + Unpin + Send,
        T: Cbor,
    {
        let len = unsigned_varint::aio::read_u64(&mut *reader)
            .await
            .map_err(|_| NetworkError::StreamClosed)?;
        if len > MAX_FRAME_SIZE {
            return Err(NetworkError::Encoding(format!(
                "frame of {} bytes exceeds maximum",
                len
            )));
        }
        let mut bz = vec![0u8; len as usize];
        reader
            .read_exact(&mut bz)
            .await
            .map_err(|_| NetworkError::StreamClosed)?;
        let message = T::unmarshal_cbor(&bz)?;
        Ok((message, bz))
    }

}
