// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::errors::Error;
use async_trait::async_trait;
use cid::Cid;
use flo_stream::Subscriber;
use fvm_ipld_encoding::{Cbor, RawBytes};
use libp2p_identity::PeerId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Identity of one transfer channel between two peers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelId {
    /// Peer that opened the channel.
    pub initiator: PeerId,
    /// Peer the channel was opened to.
    pub responder: PeerId,
    /// Initiator-local sequence number.
    pub id: u64,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.initiator, self.responder, self.id)
    }
}

impl Serialize for ChannelId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (
            serde_bytes::Bytes::new(&self.initiator.to_bytes()),
            serde_bytes::Bytes::new(&self.responder.to_bytes()),
            &self.id,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (initiator, responder, id): (serde_bytes::ByteBuf, serde_bytes::ByteBuf, u64) =
            Deserialize::deserialize(deserializer)?;
        Ok(ChannelId {
            initiator: PeerId::from_bytes(&initiator).map_err(serde::de::Error::custom)?,
            responder: PeerId::from_bytes(&responder).map_err(serde::de::Error::custom)?,
            id,
        })
    }
}

/// A typed CBOR blob exchanged over a transfer channel: deal proposals,
/// payments and responses all ride as vouchers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Voucher {
    pub type_identifier: String,
    pub data: RawBytes,
}

impl Voucher {
    pub fn new<T: Cbor>(type_identifier: &str, payload: &T) -> Result<Self, Error> {
        Ok(Voucher {
            type_identifier: type_identifier.to_string(),
            data: RawBytes::new(payload.marshal_cbor()?),
        })
    }

    pub fn decode<T: Cbor>(&self, type_identifier: &str) -> Result<T, Error> {
        if self.type_identifier != type_identifier {
            return Err(Error::Encoding(format!(
                "voucher is a {}, expected {}",
                self.type_identifier, type_identifier
            )));
        }
        Ok(T::unmarshal_cbor(&self.data)?)
    }
}

/// One observable change on a transfer channel.
#[derive(Clone, Debug)]
pub enum Event {
    Opened,
    Restarted,
    /// Progress; carries the running total of payload bytes received.
    DataReceived { total_received: u64 },
    /// Progress; carries the running total of payload bytes sent.
    DataSent { total_sent: u64 },
    /// A voucher arrived from the remote peer.
    VoucherReceived(Voucher),
    /// A voucher result (response) arrived from the remote peer.
    VoucherResultReceived(Voucher),
    /// All expected payload data has moved; the channel stays open for any
    /// remaining voucher exchange.
    FinishedTransferring,
    Completed,
    Cancelled,
    Errored(String),
}

#[derive(Clone, Debug)]
pub struct ChannelEvent {
    pub channel_id: ChannelId,
    /// The voucher the channel was opened with; identifies which deal the
    /// channel belongs to.
    pub voucher: Voucher,
    pub event: Event,
}

/// Operations the deal machines invoke on the transfer engine. Channel
/// lifecycle is reported back through the subscription stream.
#[async_trait]
pub trait DataTransfer: Send + Sync {
    /// Opens a channel pushing the payload rooted at `root` to `to`.
    async fn open_push_channel(
        &self,
        to: PeerId,
        voucher: Voucher,
        root: Cid,
        selector: Option<RawBytes>,
    ) -> Result<ChannelId, Error>;

    /// Opens a channel pulling the payload rooted at `root` from `to`.
    async fn open_pull_channel(
        &self,
        to: PeerId,
        voucher: Voucher,
        root: Cid,
        selector: Option<RawBytes>,
    ) -> Result<ChannelId, Error>;

    /// Sends an additional voucher on an open channel.
    async fn send_voucher(&self, channel_id: ChannelId, voucher: Voucher) -> Result<(), Error>;

    /// Sends a voucher result (response) on an open channel.
    async fn send_voucher_result(
        &self,
        channel_id: ChannelId,
        voucher: Voucher,
    ) -> Result<(), Error>;

    async fn close_channel(&self, channel_id: ChannelId) -> Result<(), Error>;

    /// Asks the engine to resume an interrupted channel.
    async fn restart_channel(&self, channel_id: ChannelId) -> Result<(), Error>;

    /// Subscribes to channel events. Dropping the subscriber unsubscribes.
    async fn subscribe(&self) -> Subscriber<ChannelEvent>;
}
