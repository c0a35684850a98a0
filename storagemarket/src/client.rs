// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The storage client: proposes deals, pushes payload data and follows the
//! published deal on chain.

use crate::clientstates::{ClientDealEnvironment, ClientDealMachine};
use crate::events::ClientEvent;
use crate::migrations::client_migrations;
use crate::network::{
    AskRequest, DealStatusRequest, DealStatusResponse, Proposal, SignedResponse,
    StorageMarketNetwork,
};
use crate::nodes::StorageClientNode;
use crate::types::{
    ClientDeal, ClientDealProposal, DataRef, DealProposal, SignedStorageAsk,
    StorageDataTransferVoucher, StorageDealStatus, StorageProviderInfo,
};
use async_std::task;
use async_trait::async_trait;
use cid::Cid;
use datatransfer::{ChannelEvent, ChannelId, DataTransfer, Event, Voucher};
use db::Store;
use flo_stream::Subscriber;
use futures::StreamExt;
use fvm_ipld_encoding::Cbor;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use log::debug;
use num_traits::Zero;
use statemachine::StateGroup;
use std::sync::Arc;

const CLIENT_DEALS_NS: &str = "/deals/client";

struct ClientEnv {
    node: Arc<dyn StorageClientNode>,
    net: Arc<dyn StorageMarketNetwork>,
    dt: Arc<dyn DataTransfer>,
}

#[async_trait]
impl ClientDealEnvironment for ClientEnv {
    fn node(&self) -> &dyn StorageClientNode {
        self.node.as_ref()
    }

    async fn propose_deal(&self, deal: &ClientDeal) -> Result<(SignedResponse, Vec<u8>), String> {
        let mut stream = self
            .net
            .new_deal_stream(deal.miner)
            .await
            .map_err(|e| e.to_string())?;
        let proposal = Proposal {
            deal_proposal: deal.client_deal_proposal.clone(),
            piece: deal.data_ref.clone(),
            fast_retrieval: deal.fast_retrieval,
        };
        if let Err(e) = stream.write_deal_proposal(proposal).await {
            let _ = stream.close().await;
            return Err(e.to_string());
        }
        let response = stream.read_deal_response().await.map_err(|e| e.to_string());
        let _ = stream.close().await;
        response
    }

    async fn open_data_transfer(&self, deal: &ClientDeal) -> Result<ChannelId, String> {
        let voucher = Voucher::new(
            StorageDataTransferVoucher::TYPE_IDENTIFIER,
            &StorageDataTransferVoucher {
                proposal: deal.proposal_cid,
            },
        )
        .map_err(|e| e.to_string())?;
        self.dt
            .open_push_channel(deal.miner, voucher, deal.data_ref.root, None)
            .await
            .map_err(|e| e.to_string())
    }

    async fn restart_data_transfer(&self, channel_id: ChannelId) -> Result<(), String> {
        self.dt
            .restart_channel(channel_id)
            .await
            .map_err(|e| e.to_string())
    }

    async fn get_provider_deal_state(
        &self,
        deal: &ClientDeal,
    ) -> Result<DealStatusResponse, String> {
        let plaintext = deal.proposal_cid.to_bytes();
        let signature = self
            .node
            .sign_bytes(&deal.proposal().client, &plaintext)
            .await
            .map_err(|e| e.to_string())?;

        let mut stream = self
            .net
            .new_deal_status_stream(deal.miner)
            .await
            .map_err(|e| e.to_string())?;
        let request = DealStatusRequest {
            proposal: deal.proposal_cid,
            signature,
        };
        if let Err(e) = stream.write_deal_status_request(request).await {
            let _ = stream.close().await;
            return Err(e.to_string());
        }
        let response = stream
            .read_deal_status_response()
            .await
            .map_err(|e| e.to_string());
        let _ = stream.close().await;
        response
    }
}

/// Terms for a new deal proposal.
pub struct ProposeStorageDealParams {
    pub address: Address,
    pub info: StorageProviderInfo,
    pub data: DataRef,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub price: TokenAmount,
    pub collateral: TokenAmount,
    pub verified_deal: bool,
    pub fast_retrieval: bool,
    pub label: String,
}

/// The client side of the storage market.
pub struct StorageClient<DB: Store + Send + Sync + Clone + 'static> {
    deals: StateGroup<ClientDealMachine<ClientEnv>, DB>,
    node: Arc<dyn StorageClientNode>,
    net: Arc<dyn StorageMarketNetwork>,
}

impl<DB: Store + Send + Sync + Clone + 'static> StorageClient<DB> {
    /// Migrates persisted deals, resumes their machines and wires the
    /// data-transfer adapter.
    pub async fn new(
        db: DB,
        node: Arc<dyn StorageClientNode>,
        net: Arc<dyn StorageMarketNetwork>,
        dt: Arc<dyn DataTransfer>,
    ) -> Result<Self, statemachine::Error> {
        client_migrations().migrate(&db, CLIENT_DEALS_NS)?;

        let env = Arc::new(ClientEnv {
            node: node.clone(),
            net: net.clone(),
            dt: dt.clone(),
        });
        let deals = StateGroup::resume(db, CLIENT_DEALS_NS, env.clone()).await?;

        let events = dt.subscribe().await;
        task::spawn(data_transfer_subscriber(deals.clone(), events));

        Ok(StorageClient { deals, node, net })
    }

    /// Signs and proposes a deal, returning the proposal cid under which the
    /// deal is tracked.
    pub async fn propose_storage_deal(
        &self,
        params: ProposeStorageDealParams,
    ) -> Result<Cid, String> {
        let proposal = DealProposal {
            piece_cid: params
                .data
                .piece_cid
                .ok_or_else(|| "proposal has no piece cid".to_string())?,
            piece_size: crate::providerutils::padded_size(params.data.piece_size).padded(),
            verified_deal: params.verified_deal,
            client: params.address,
            provider: params.info.address,
            label: params.label,
            start_epoch: params.start_epoch,
            end_epoch: params.end_epoch,
            storage_price_per_epoch: params.price,
            provider_collateral: params.collateral,
            client_collateral: TokenAmount::zero(),
        };

        let bz = proposal.marshal_cbor().map_err(|e| e.to_string())?;
        let client_signature = self
            .node
            .sign_bytes(&params.address, &bz)
            .await
            .map_err(|e| e.to_string())?;
        let client_deal_proposal = ClientDealProposal {
            proposal,
            client_signature,
        };
        let proposal_cid = client_deal_proposal.cid().map_err(|e| e.to_string())?;

        let deal = ClientDeal {
            client_deal_proposal,
            proposal_cid,
            add_funds_cid: None,
            state: StorageDealStatus::Unknown,
            miner: params.info.peer_id,
            miner_worker: params.info.worker,
            deal_id: 0,
            data_ref: params.data,
            message: String::new(),
            publish_message: None,
            funds_reserved: TokenAmount::zero(),
            transfer_channel_id: None,
            fast_retrieval: params.fast_retrieval,
            store_id: None,
        };

        self.deals.begin(deal).await.map_err(|e| e.to_string())?;
        self.deals
            .send(&proposal_cid, ClientEvent::Open)
            .await
            .map_err(|e| e.to_string())?;

        Ok(proposal_cid)
    }

    /// Fetches and verifies a provider's signed ask.
    pub async fn get_ask(&self, info: &StorageProviderInfo) -> Result<SignedStorageAsk, String> {
        let mut stream = self
            .net
            .new_ask_stream(info.peer_id)
            .await
            .map_err(|e| e.to_string())?;
        if let Err(e) = stream
            .write_ask_request(AskRequest {
                miner: info.address,
            })
            .await
        {
            let _ = stream.close().await;
            return Err(e.to_string());
        }
        let signed = stream.read_ask_response().await.map_err(|e| e.to_string());
        let _ = stream.close().await;
        let signed = signed?;

        if signed.ask.miner != info.address {
            return Err(format!(
                "ask miner address {} does not match queried provider {}",
                signed.ask.miner, info.address
            ));
        }
        let (tok, _) = self.node.get_chain_head().await.map_err(|e| e.to_string())?;
        let bz = signed.ask.marshal_cbor().map_err(|e| e.to_string())?;
        let verified = self
            .node
            .verify_signature(&signed.signature, &info.worker, &bz, &tok)
            .await
            .map_err(|e| e.to_string())?;
        if !verified {
            return Err("ask signature verification failed".to_string());
        }
        Ok(signed)
    }

    pub async fn get_deal(&self, proposal_cid: &Cid) -> Result<ClientDeal, statemachine::Error> {
        self.deals.get(proposal_cid).await
    }

    pub async fn list_deals(&self) -> Result<Vec<ClientDeal>, statemachine::Error> {
        self.deals.list().await
    }

    /// Subscribes to `(event, post-state)` notifications for every client
    /// deal.
    pub async fn subscribe(&self) -> Subscriber<(ClientEvent, ClientDeal)> {
        self.deals.subscribe().await
    }
}

/// Routes transfer-engine events for client push channels into the machine.
async fn data_transfer_subscriber<DB: Store + Send + Sync + 'static>(
    deals: StateGroup<ClientDealMachine<ClientEnv>, DB>,
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
            continue;
        };
        let proposal_cid = voucher.proposal;

        let machine_event = match event {
            Event::Restarted => ClientEvent::DataTransferRestarted { channel_id },
            Event::Completed => ClientEvent::DataTransferComplete,
            Event::Cancelled => ClientEvent::DataTransferFailed {
                message: "data transfer cancelled".to_string(),
            },
            Event::Errored(message) => ClientEvent::DataTransferFailed { message },
            // the client already learned the channel id when it opened the
            // channel
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
