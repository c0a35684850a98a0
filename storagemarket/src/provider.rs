// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The storage provider: accepts inbound negotiation streams, feeds the
//! provider deal machine, and translates data-transfer engine events into
//! machine events.

use crate::events::ProviderEvent;
use crate::migrations::provider_migrations;
use crate::network::{
    DealStatusRequest, DealStatusResponse, Response, SignedResponse, StorageAskStream,
    StorageDealStatusStream, StorageDealStream, StorageMarketNetwork, StorageReceiver,
};
use crate::nodes::StorageProviderNode;
use crate::providerstates::{ProviderDealEnvironment, ProviderDealMachine};
use crate::storedask::StoredAsk;
use crate::types::{
    MinerDeal, SignedStorageAsk, StorageAsk, StorageDataTransferVoucher, StorageDealStatus,
};
use async_std::sync::Mutex;
use async_std::task;
use async_trait::async_trait;
use cid::Cid;
use datatransfer::{ChannelEvent, ChannelId, DataTransfer, Event};
use db::Store;
use filestore::FileStore;
use flo_stream::Subscriber;
use futures::StreamExt;
use fvm_ipld_encoding::{to_vec, Cbor};
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;
use libp2p_identity::PeerId;
use log::{debug, error, info, warn};
use num_traits::Zero;
use piecestore::PieceStore;
use statemachine::StateGroup;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

const PROVIDER_DEALS_NS: &str = "/deals/provider";

/// Pluggable admission hook, consulted after validation passes.
pub type DealDecider =
    Arc<dyn Fn(&MinerDeal) -> Result<(bool, String), String> + Send + Sync + 'static>;

/// Access to per-deal payload stores and commitment generation, provided by
/// the node's storage subsystem.
#[async_trait]
pub trait PieceIo: Send + Sync {
    /// Regenerates the piece commitment over the transferred payload and
    /// stages block-location metadata, returning its filestore path.
    async fn generate_piece_commitment(
        &self,
        store_id: Option<u64>,
        payload_cid: Cid,
    ) -> Result<(Cid, filestore::Path), String>;

    /// Streams the payload out of the per-deal store along with its size.
    async fn piece_reader(
        &self,
        store_id: Option<u64>,
        payload_cid: Cid,
    ) -> Result<(Box<dyn Read + Send>, u64), String>;

    fn delete_store(&self, store_id: u64) -> Result<(), String>;
}

pub(crate) struct ProviderEnv<DB> {
    actor: Address,
    node: Arc<dyn StorageProviderNode>,
    net: Arc<dyn StorageMarketNetwork>,
    dt: Arc<dyn DataTransfer>,
    piece_io: Arc<dyn PieceIo>,
    fs: Arc<FileStore>,
    piece_store: Arc<dyn PieceStore>,
    stored_ask: StoredAsk<DB>,
    conns: Mutex<HashMap<Cid, Box<dyn StorageDealStream>>>,
    decider: Option<DealDecider>,
}

#[async_trait]
impl<DB: Store + Send + Sync + 'static> ProviderDealEnvironment for ProviderEnv<DB> {
    fn address(&self) -> Address {
        self.actor
    }

    fn node(&self) -> &dyn StorageProviderNode {
        self.node.as_ref()
    }

    async fn ask(&self) -> StorageAsk {
        self.stored_ask.ask().await
    }

    fn file_store(&self) -> &FileStore {
        self.fs.as_ref()
    }

    fn piece_store(&self) -> &dyn PieceStore {
        self.piece_store.as_ref()
    }

    async fn restart_data_transfer(&self, channel_id: ChannelId) -> Result<(), String> {
        self.dt
            .restart_channel(channel_id)
            .await
            .map_err(|e| e.to_string())
    }

    async fn generate_piece_commitment(
        &self,
        store_id: Option<u64>,
        payload_cid: Cid,
    ) -> Result<(Cid, filestore::Path), String> {
        self.piece_io
            .generate_piece_commitment(store_id, payload_cid)
            .await
    }

    async fn piece_reader(
        &self,
        store_id: Option<u64>,
        payload_cid: Cid,
    ) -> Result<(Box<dyn Read + Send>, u64), String> {
        self.piece_io.piece_reader(store_id, payload_cid).await
    }

    fn delete_store(&self, store_id: u64) -> Result<(), String> {
        self.piece_io.delete_store(store_id)
    }

    async fn send_signed_response(&self, response: Response) -> Result<(), String> {
        let signed = self.sign_response(response).await?;
        let proposal_cid = signed.response.proposal;

        let mut conns = self.conns.lock().await;
        let stream = conns
            .get_mut(&proposal_cid)
            .ok_or_else(|| "couldn't send response: no connection to client".to_string())?;
        if let Err(e) = stream.write_deal_response(signed).await {
            // assume the client disconnected
            if let Some(mut stream) = conns.remove(&proposal_cid) {
                let _ = stream.close().await;
            }
            return Err(e.to_string());
        }
        Ok(())
    }

    async fn disconnect(&self, proposal_cid: Cid) -> Result<(), String> {
        if let Some(mut stream) = self.conns.lock().await.remove(&proposal_cid) {
            stream.close().await.map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    async fn run_custom_decision_logic(&self, deal: &MinerDeal) -> Result<(bool, String), String> {
        match &self.decider {
            None => Ok((true, String::new())),
            Some(decider) => decider(deal),
        }
    }

    fn tag_peer(&self, peer: PeerId, tag: &str) {
        self.net.tag_peer(peer, tag);
    }

    fn untag_peer(&self, peer: PeerId, tag: &str) {
        self.net.untag_peer(peer, tag);
    }
}

impl<DB: Store + Send + Sync + 'static> ProviderEnv<DB> {
    async fn sign_response(&self, response: Response) -> Result<SignedResponse, String> {
        let (tok, _) = self
            .node
            .get_chain_head()
            .await
            .map_err(|e| format!("failed to sign response message: {}", e))?;
        let worker = self
            .node
            .get_miner_worker_address(&self.actor, &tok)
            .await
            .map_err(|e| format!("failed to sign response message: {}", e))?;
        let bz = response.marshal_cbor().map_err(|e| e.to_string())?;
        let signature = self
            .node
            .sign_bytes(&worker, &bz)
            .await
            .map_err(|e| format!("failed to sign response message: {}", e))?;
        Ok(SignedResponse {
            response,
            signature,
        })
    }
}

/// The provider side of the storage market.
pub struct StorageProvider<DB: Store + Send + Sync + Clone + 'static> {
    env: Arc<ProviderEnv<DB>>,
    deals: StateGroup<ProviderDealMachine<ProviderEnv<DB>>, DB>,
    net: Arc<dyn StorageMarketNetwork>,
    node: Arc<dyn StorageProviderNode>,
}

impl<DB: Store + Send + Sync + Clone + 'static> StorageProvider<DB> {
    /// Migrates persisted deals, resumes their machines and wires the
    /// data-transfer adapter. Call [`StorageProvider::start`] to begin
    /// accepting inbound streams.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        db: DB,
        actor: Address,
        node: Arc<dyn StorageProviderNode>,
        net: Arc<dyn StorageMarketNetwork>,
        dt: Arc<dyn DataTransfer>,
        piece_io: Arc<dyn PieceIo>,
        fs: Arc<FileStore>,
        piece_store: Arc<dyn PieceStore>,
        decider: Option<DealDecider>,
    ) -> Result<Self, statemachine::Error> {
        provider_migrations().migrate(&db, PROVIDER_DEALS_NS)?;

        let stored_ask = StoredAsk::new(db.clone(), actor, node.clone())
            .await
            .map_err(|e| statemachine::Error::Other(e.to_string()))?;

        let env = Arc::new(ProviderEnv {
            actor,
            node: node.clone(),
            net: net.clone(),
            dt: dt.clone(),
            piece_io,
            fs,
            piece_store,
            stored_ask,
            conns: Mutex::new(HashMap::new()),
            decider,
        });

        let deals = StateGroup::resume(db, PROVIDER_DEALS_NS, env.clone()).await?;

        let events = dt.subscribe().await;
        task::spawn(data_transfer_subscriber(deals.clone(), events));

        Ok(StorageProvider {
            env,
            deals,
            net,
            node,
        })
    }

    /// Begins handling inbound ask, deal and deal-status streams.
    pub async fn start(self: &Arc<Self>) -> Result<(), String> {
        self.net
            .set_delegate(self.clone())
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn stop(&self) -> Result<(), String> {
        self.net
            .stop_handling_requests()
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn get_ask(&self) -> SignedStorageAsk {
        self.env.stored_ask.get().await
    }

    /// Updates the advertised ask; see [`StoredAsk::set`].
    pub async fn set_ask(
        &self,
        price: TokenAmount,
        verified_price: TokenAmount,
        duration: fvm_shared::clock::ChainEpoch,
        min_piece_size: fvm_shared::piece::PaddedPieceSize,
        max_piece_size: fvm_shared::piece::PaddedPieceSize,
    ) -> Result<(), String> {
        self.env
            .stored_ask
            .set(price, verified_price, duration, min_piece_size, max_piece_size)
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn get_deal(&self, proposal_cid: &Cid) -> Result<MinerDeal, statemachine::Error> {
        self.deals.get(proposal_cid).await
    }

    pub async fn list_deals(&self) -> Result<Vec<MinerDeal>, statemachine::Error> {
        self.deals.list().await
    }

    /// Subscribes to `(event, post-state)` notifications for every provider
    /// deal.
    pub async fn subscribe(&self) -> Subscriber<(ProviderEvent, MinerDeal)> {
        self.deals.subscribe().await
    }
}

#[async_trait]
impl<DB: Store + Send + Sync + Clone + 'static> StorageReceiver for StorageProvider<DB> {
    async fn handle_ask_stream(&self, mut stream: Box<dyn StorageAskStream>) {
        let request = match stream.read_ask_request().await {
            Ok(request) => request,
            Err(e) => {
                warn!("reading ask request: {}", e);
                return;
            }
        };
        if request.miner != self.env.actor {
            warn!(
                "storage ask requested for miner {}, serving {}",
                request.miner, self.env.actor
            );
        }
        if let Err(e) = stream.write_ask_response(self.env.stored_ask.get().await).await {
            warn!("writing ask response: {}", e);
        }
        let _ = stream.close().await;
    }

    async fn handle_deal_stream(&self, mut stream: Box<dyn StorageDealStream>) {
        let proposal = match stream.read_deal_proposal().await {
            Ok(proposal) => proposal,
            Err(e) => {
                warn!("reading deal proposal: {}", e);
                return;
            }
        };

        let proposal_cid = match proposal.deal_proposal.cid() {
            Ok(c) => c,
            Err(e) => {
                warn!("deriving proposal cid: {}", e);
                return;
            }
        };

        if self.deals.contains(&proposal_cid).await {
            info!("deal proposal {} is already being tracked", proposal_cid);
            let _ = stream.close().await;
            return;
        }

        let deal = MinerDeal {
            client_deal_proposal: proposal.deal_proposal,
            proposal_cid,
            add_funds_cid: None,
            publish_cid: None,
            client: stream.remote_peer(),
            state: StorageDealStatus::Unknown,
            piece_path: String::new(),
            metadata_path: String::new(),
            message: String::new(),
            data_ref: proposal.piece,
            funds_reserved: TokenAmount::zero(),
            available_for_retrieval: false,
            deal_id: 0,
            transfer_channel_id: None,
            sector_number: 0,
            store_id: None,
            fast_retrieval: proposal.fast_retrieval,
        };

        self.env.conns.lock().await.insert(proposal_cid, stream);

        if let Err(e) = self.deals.begin(deal).await {
            error!("tracking new deal {}: {}", proposal_cid, e);
            return;
        }
        if let Err(e) = self.deals.send(&proposal_cid, ProviderEvent::Open).await {
            error!("opening new deal {}: {}", proposal_cid, e);
        }
    }

    async fn handle_deal_status_stream(&self, mut stream: Box<dyn StorageDealStatusStream>) {
        let request = match stream.read_deal_status_request().await {
            Ok(request) => request,
            Err(e) => {
                warn!("reading deal status request: {}", e);
                return;
            }
        };
        match self.deal_status(&request).await {
            Ok(response) => {
                if let Err(e) = stream.write_deal_status_response(response).await {
                    warn!("writing deal status response: {}", e);
                }
            }
            Err(e) => warn!("deal status request for {}: {}", request.proposal, e),
        }
        let _ = stream.close().await;
    }
}

impl<DB: Store + Send + Sync + Clone + 'static> StorageProvider<DB> {
    async fn deal_status(
        &self,
        request: &DealStatusRequest,
    ) -> Result<DealStatusResponse, String> {
        let deal = self
            .deals
            .get(&request.proposal)
            .await
            .map_err(|e| e.to_string())?;

        // only the deal's client may query its status
        let (tok, _) = self.node.get_chain_head().await.map_err(|e| e.to_string())?;
        let plaintext = request.proposal.to_bytes();
        let verified = self
            .node
            .verify_signature(
                &request.signature,
                &deal.proposal().client,
                &plaintext,
                &tok,
            )
            .await
            .map_err(|e| e.to_string())?;
        if !verified {
            return Err("could not verify deal status request signature".to_string());
        }

        let payload = to_vec(&(
            &deal.state,
            &deal.message,
            &deal.proposal_cid,
            &deal.publish_cid,
            &deal.deal_id,
        ))
        .map_err(|e| e.to_string())?;
        let worker = self
            .node
            .get_miner_worker_address(&self.env.actor, &tok)
            .await
            .map_err(|e| e.to_string())?;
        let signature = self
            .node
            .sign_bytes(&worker, &payload)
            .await
            .map_err(|e| e.to_string())?;

        Ok(DealStatusResponse {
            state: deal.state,
            message: deal.message,
            proposal_cid: deal.proposal_cid,
            publish_cid: deal.publish_cid,
            deal_id: deal.deal_id,
            signature,
        })
    }
}

/// Routes transfer-engine events into the deal machine. Each channel is
/// identified back to its deal through the storage voucher it carries.
async fn data_transfer_subscriber<DB: Store + Send + Sync + 'static>(
    deals: StateGroup<ProviderDealMachine<ProviderEnv<DB>>, DB>,
    mut events: Subscriber<ChannelEvent>,
) {
    while let Some(ChannelEvent {
        channel_id,
        voucher,
        event,
    }) = events.next().await
    {
        let Ok(voucher) =
            voucher.decode::<StorageDataTransferVoucher>(StorageDataTransferVoucher::TYPE_IDENTIFIER)
        else {
            // some other subsystem's channel
            continue;
        };
        let proposal_cid = voucher.proposal;

        let machine_event = match event {
            Event::Opened => ProviderEvent::DataTransferInitiated { channel_id },
            Event::Restarted => ProviderEvent::DataTransferRestarted { channel_id },
            Event::Completed => ProviderEvent::DataTransferCompleted,
            Event::Cancelled => ProviderEvent::DataTransferFailed {
                message: "data transfer cancelled".to_string(),
            },
            Event::Errored(message) => ProviderEvent::DataTransferFailed { message },
            _ => continue,
        };

        if let Err(e) = deals.send(&proposal_cid, machine_event).await {
            debug!(
                "data transfer event for unknown storage deal {}: {}",
                proposal_cid, e
            );
        }
    }
}
