// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use datatransfer::ChannelId;
use fvm_ipld_encoding::tuple::*;
use fvm_ipld_encoding::Cbor;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::deal::DealID;
use fvm_shared::econ::TokenAmount;
use fvm_shared::piece::PaddedPieceSize;
use fvm_shared::sector::SectorNumber;
use libp2p_identity::PeerId;
use serde_repr::{Deserialize_repr, Serialize_repr};
use shared::peer_ser;
use std::fmt;

/// Extension restoring the `cid()` helper that `fvm_ipld_encoding::Cbor`
/// exposed prior to 0.3: the CID of a value's DAG-CBOR encoding, hashed
/// with Blake2b-256.
#[allow(deprecated)]
pub trait CborCid: Cbor {
    fn cid(&self) -> Result<Cid, fvm_ipld_encoding::Error> {
        use cid::multihash::MultihashDigest;
        let data = self.marshal_cbor()?;
        let hash = cid::multihash::Code::Blake2b256.digest(&data);
        Ok(Cid::new_v1(fvm_ipld_encoding::DAG_CBOR, hash))
    }
}
#[allow(deprecated)]
impl<T: Cbor> CborCid for T {}

/// Epochs in a day of chain time.
pub const EPOCHS_IN_DAY: ChainEpoch = 2880;

/// Chain-parameterized bounds on deal length.
pub fn deal_duration_bounds(_size: PaddedPieceSize) -> (ChainEpoch, ChainEpoch) {
    (180 * EPOCHS_IN_DAY, 540 * EPOCHS_IN_DAY)
}

/// Transfer type moving the payload through the data-transfer engine.
pub const TT_GRAPHSYNC: &str = "graphsync";
/// Transfer type for out-of-band data delivery (offline deals).
pub const TT_MANUAL: &str = "manual";

/// Lifecycle states shared by both sides of a storage deal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u64)]
pub enum StorageDealStatus {
    Unknown = 0,
    Validating,
    AcceptWait,
    Rejecting,
    WaitingForData,
    Transferring,
    VerifyData,
    ReserveProviderFunds,
    ProviderFunding,
    Publish,
    Publishing,
    Staged,
    AwaitingPreCommit,
    Sealing,
    Finalizing,
    Active,
    Expired,
    Slashed,
    Failing,
    Error,
    // client-side states
    EnsureClientFunds,
    ClientFunding,
    FundsEnsured,
    StartDataTransfer,
    CheckForDealAcceptance,
    ProposalAccepted,
}

impl fmt::Display for StorageDealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageDeal{:?}", self)
    }
}

/// The terms a client signs and a provider validates.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DealProposal {
    pub piece_cid: Cid,
    pub piece_size: PaddedPieceSize,
    pub verified_deal: bool,
    pub client: Address,
    pub provider: Address,

    /// Arbitrary client chosen reference, at most
    /// [`crate::DEAL_MAX_LABEL_SIZE`] bytes.
    pub label: String,

    // Deal payment is linear between the start and end epochs, with total
    // amount storage_price_per_epoch * (end_epoch - start_epoch). The deal
    // must appear in a proven sector no later than start_epoch.
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub storage_price_per_epoch: TokenAmount,

    pub provider_collateral: TokenAmount,
    pub client_collateral: TokenAmount,
}

impl Cbor for DealProposal {}

impl DealProposal {
    pub fn duration(&self) -> ChainEpoch {
        self.end_epoch - self.start_epoch
    }

    pub fn total_storage_fee(&self) -> TokenAmount {
        TokenAmount::from_atto(self.storage_price_per_epoch.atto() * self.duration())
    }

    pub fn client_balance_requirement(&self) -> TokenAmount {
        self.client_collateral.clone() + self.total_storage_fee()
    }

    pub fn provider_balance_requirement(&self) -> &TokenAmount {
        &self.provider_collateral
    }
}

/// A `DealProposal` signed by its client.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct ClientDealProposal {
    pub proposal: DealProposal,
    pub client_signature: Signature,
}

impl Cbor for ClientDealProposal {}

/// Where the deal payload comes from and how it moves.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct DataRef {
    pub transfer_type: String,
    pub root: Cid,
    /// Piece commitment, known up front for offline deals.
    pub piece_cid: Option<Cid>,
    /// Unpadded payload size, when known up front.
    pub piece_size: u64,
}

impl Cbor for DataRef {}

/// Provider-side runtime record of one storage deal.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct MinerDeal {
    pub client_deal_proposal: ClientDealProposal,
    pub proposal_cid: Cid,
    pub add_funds_cid: Option<Cid>,
    pub publish_cid: Option<Cid>,
    #[serde(with = "peer_ser")]
    pub client: PeerId,
    pub state: StorageDealStatus,
    /// Staged piece file, when the payload was written to the filestore.
    pub piece_path: filestore::Path,
    /// Staged block location metadata, when recorded during verification.
    pub metadata_path: filestore::Path,
    /// Free text reason attached to rejections and failures.
    pub message: String,
    pub data_ref: DataRef,
    pub funds_reserved: TokenAmount,
    pub available_for_retrieval: bool,
    pub deal_id: DealID,
    pub transfer_channel_id: Option<ChannelId>,
    pub sector_number: SectorNumber,
    /// Per-deal block store handle, released on cleanup.
    pub store_id: Option<u64>,
    pub fast_retrieval: bool,
}

impl Cbor for MinerDeal {}

impl MinerDeal {
    pub fn proposal(&self) -> &DealProposal {
        &self.client_deal_proposal.proposal
    }
}

/// Client-side runtime record of one storage deal.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct ClientDeal {
    pub client_deal_proposal: ClientDealProposal,
    pub proposal_cid: Cid,
    pub add_funds_cid: Option<Cid>,
    pub state: StorageDealStatus,
    #[serde(with = "peer_ser")]
    pub miner: PeerId,
    pub miner_worker: Address,
    pub deal_id: DealID,
    pub data_ref: DataRef,
    pub message: String,
    /// Cid of the provider's publish message, reported on acceptance.
    pub publish_message: Option<Cid>,
    pub funds_reserved: TokenAmount,
    pub transfer_channel_id: Option<ChannelId>,
    pub fast_retrieval: bool,
    pub store_id: Option<u64>,
}

impl Cbor for ClientDeal {}

impl ClientDeal {
    pub fn proposal(&self) -> &DealProposal {
        &self.client_deal_proposal.proposal
    }
}

/// A provider's advertised pricing schedule.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct StorageAsk {
    /// Price per GiB per epoch for unverified deals.
    pub price: TokenAmount,
    /// Price per GiB per epoch for deals drawing on DataCap.
    pub verified_price: TokenAmount,
    pub min_piece_size: PaddedPieceSize,
    pub max_piece_size: PaddedPieceSize,
    pub miner: Address,
    pub timestamp: ChainEpoch,
    pub expiry: ChainEpoch,
    pub seq_no: u64,
}

impl Cbor for StorageAsk {}

#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct SignedStorageAsk {
    pub ask: StorageAsk,
    pub signature: Signature,
}

impl Cbor for SignedStorageAsk {}

/// What a client knows about a provider before proposing to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageProviderInfo {
    pub address: Address,
    pub worker: Address,
    pub peer_id: PeerId,
}

/// Market actor balance of one account.
#[derive(Clone, Debug, PartialEq)]
pub struct Balance {
    pub escrow: TokenAmount,
    pub locked: TokenAmount,
}

impl Balance {
    pub fn available(&self) -> TokenAmount {
        self.escrow.clone() - self.locked.clone()
    }
}

/// Return payload of the on-chain publish message.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct PublishStorageDealsReturn {
    pub ids: Vec<DealID>,
}

impl Cbor for PublishStorageDealsReturn {}

/// Voucher identifying which deal a data-transfer channel belongs to.
#[derive(Clone, Debug, PartialEq, Serialize_tuple, Deserialize_tuple)]
pub struct StorageDataTransferVoucher {
    pub proposal: Cid,
}

impl Cbor for StorageDataTransferVoucher {}

impl StorageDataTransferVoucher {
    pub const TYPE_IDENTIFIER: &'static str = "StorageDataTransferVoucher";
}
